//! Fan-out of notification events to local sinks.
//!
//! # Architecture
//!
//! ```text
//! Supervisor ──dispatch(event)──► Dispatcher
//!                                    ├── ToastSink      (terminal line)
//!                                    ├── SoundSink      (bell, preference gated)
//!                                    ├── DesktopSink    (OSC 777, permission gated)
//!                                    ├── EventBusSink   (broadcast listeners)
//!                                    └── CallbackSink   (host closures)
//! ```
//!
//! Sinks run one after another in registration order. Each invocation is
//! isolated: an `Err`, a panic, or a timeout is logged and counted, and the
//! next sink still runs. Nothing a sink does reaches the connection state
//! machine.

// Rust guideline compliant 2026-02

pub mod sinks;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::error::ClientError;
use crate::notification::NotificationEvent;

pub use sinks::{
    CallbackSink, DesktopSink, EventBusSink, NotificationPermission, PermissionHandle,
    SoundPreference, SoundSink, ToastSink,
};

/// Default bound on a single sink invocation.
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(5);

/// A consumer of dispatched notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    /// Handle one event.
    async fn deliver(&self, event: &NotificationEvent) -> anyhow::Result<()>;
}

/// Identifier returned on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

struct SinkEntry {
    id: SinkId,
    sink: Arc<dyn NotificationSink>,
    enabled: bool,
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Sinks that handled the event.
    pub delivered: usize,
    /// Sinks that failed, in dispatch order.
    pub failures: Vec<ClientError>,
}

impl DispatchReport {
    /// Whether every targeted sink succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered, failure-isolating sink registry. Cheap to clone; clones share
/// the registry.
#[derive(Clone)]
pub struct Dispatcher {
    sinks: Arc<RwLock<Vec<SinkEntry>>>,
    next_id: Arc<AtomicU64>,
    sink_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        let names: Vec<&str> = sinks.iter().map(|e| e.sink.name()).collect();
        f.debug_struct("Dispatcher")
            .field("sinks", &names)
            .field("sink_timeout", &self.sink_timeout)
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SINK_TIMEOUT)
    }
}

impl Dispatcher {
    /// Create an empty dispatcher bounding each sink call by `sink_timeout`.
    #[must_use]
    pub fn new(sink_timeout: Duration) -> Self {
        Self {
            sinks: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            sink_timeout,
        }
    }

    /// Register a sink at the end of the dispatch order.
    pub fn register(&self, sink: impl NotificationSink + 'static) -> SinkId {
        self.register_arc(Arc::new(sink))
    }

    /// Register a shared sink at the end of the dispatch order.
    pub fn register_arc(&self, sink: Arc<dyn NotificationSink>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        log::debug!("[Dispatch] Registered sink '{}' ({:?})", sink.name(), id);
        self.write().push(SinkEntry {
            id,
            sink,
            enabled: true,
        });
        id
    }

    /// Register a host closure.
    pub fn on_notification<F>(&self, callback: F) -> SinkId
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        self.register(CallbackSink::new("listener", callback))
    }

    /// Remove a sink. Returns `false` if the id is unknown.
    pub fn unregister(&self, id: SinkId) -> bool {
        let mut sinks = self.write();
        let before = sinks.len();
        sinks.retain(|entry| entry.id != id);
        before != sinks.len()
    }

    /// Toggle a sink without changing its position. Returns `false` if the
    /// id is unknown.
    pub fn set_enabled(&self, id: SinkId, enabled: bool) -> bool {
        match self.write().iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Number of registered sinks (enabled or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no sinks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every enabled sink in registration order.
    pub async fn dispatch(&self, event: &NotificationEvent) -> DispatchReport {
        // Snapshot so sinks may (un)register others without deadlocking.
        let targets: Vec<Arc<dyn NotificationSink>> = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| Arc::clone(&entry.sink))
            .collect();

        let mut report = DispatchReport::default();
        for sink in targets {
            match self.deliver_isolated(sink.as_ref(), event).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!("[Dispatch] {e}");
                    report.failures.push(e);
                }
            }
        }

        log::debug!(
            "[Dispatch] '{}' delivered to {} sink(s), {} failure(s)",
            event.kind,
            report.delivered,
            report.failures.len()
        );
        report
    }

    /// Decode a raw payload and dispatch it. Malformed payloads are logged
    /// and dropped; `None` means nothing was dispatched.
    pub async fn dispatch_payload(&self, body: &[u8]) -> Option<DispatchReport> {
        match NotificationEvent::decode(body) {
            Ok(event) => Some(self.dispatch(&event).await),
            Err(e) => {
                log::warn!("[Dispatch] Discarding payload: {e}");
                None
            }
        }
    }

    async fn deliver_isolated(
        &self,
        sink: &dyn NotificationSink,
        event: &NotificationEvent,
    ) -> Result<(), ClientError> {
        let failure = |reason: String| ClientError::Sink {
            sink: sink.name().to_string(),
            reason,
        };

        let guarded = AssertUnwindSafe(sink.deliver(event)).catch_unwind();
        match tokio::time::timeout(self.sink_timeout, guarded).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(failure(format!("{e:#}"))),
            Ok(Err(panic)) => Err(failure(format!("panicked: {}", panic_message(&*panic)))),
            Err(_) => Err(failure(format!(
                "timed out after {}ms",
                self.sink_timeout.as_millis()
            ))),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<SinkEntry>> {
        self.sinks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
