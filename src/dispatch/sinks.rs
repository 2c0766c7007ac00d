//! Built-in notification sinks.
//!
//! - [`ToastSink`]: one timestamped line per event on a writer (stdout by default)
//! - [`SoundSink`]: terminal bell, gated by a shared sound preference
//! - [`DesktopSink`]: OSC 777 desktop notification, gated by permission
//! - [`EventBusSink`]: re-broadcast to in-process subscribers
//! - [`CallbackSink`]: host-provided closure

// Rust guideline compliant 2026-02

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::NotificationSink;
use crate::notification::NotificationEvent;

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

fn write_all(writer: &SharedWriter, bytes: &[u8]) -> anyhow::Result<()> {
    let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
    guard.write_all(bytes)?;
    guard.flush()?;
    Ok(())
}

/// Removes bytes that would terminate or nest an escape sequence.
fn strip_controls(text: &str) -> String {
    text.chars().filter(|c| !c.is_control()).collect()
}

/// Writes `[HH:MM:SS] LEVEL title: message` lines.
pub struct ToastSink {
    writer: SharedWriter,
    timestamps: bool,
}

impl std::fmt::Debug for ToastSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToastSink")
            .field("timestamps", &self.timestamps)
            .finish_non_exhaustive()
    }
}

impl ToastSink {
    /// Toast lines on `writer`.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            timestamps: true,
        }
    }

    /// Toast lines on stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Omit the local-time prefix.
    #[must_use]
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    /// Render one event without the trailing newline.
    #[must_use]
    pub fn render(&self, event: &NotificationEvent) -> String {
        let mut line = String::new();
        if self.timestamps {
            line.push_str(&chrono::Local::now().format("[%H:%M:%S] ").to_string());
        }
        line.push_str(event.level().label());
        match (event.title.is_empty(), event.message.is_empty()) {
            (false, false) => line.push_str(&format!(" {}: {}", event.title, event.message)),
            (false, true) => line.push_str(&format!(" {}", event.title)),
            (true, false) => line.push_str(&format!(" {}", event.message)),
            (true, true) => line.push_str(&format!(" ({})", event.kind)),
        }
        strip_controls(&line)
    }
}

#[async_trait]
impl NotificationSink for ToastSink {
    fn name(&self) -> &str {
        "toast"
    }

    async fn deliver(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        let mut line = self.render(event);
        line.push('\n');
        write_all(&self.writer, line.as_bytes())
    }
}

/// Shared on/off switch for [`SoundSink`]. Clones share the flag.
#[derive(Debug, Clone)]
pub struct SoundPreference(Arc<AtomicBool>);

impl SoundPreference {
    /// Preference starting at `enabled`.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    /// Current value.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Change the preference.
    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }
}

/// Rings the terminal bell while the sound preference is on.
pub struct SoundSink {
    writer: SharedWriter,
    preference: SoundPreference,
}

impl std::fmt::Debug for SoundSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundSink")
            .field("preference", &self.preference)
            .finish_non_exhaustive()
    }
}

impl SoundSink {
    /// Bell on `writer`.
    pub fn new(writer: impl Write + Send + 'static, preference: SoundPreference) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            preference,
        }
    }

    /// Bell on stdout.
    #[must_use]
    pub fn stdout(preference: SoundPreference) -> Self {
        Self::new(std::io::stdout(), preference)
    }
}

#[async_trait]
impl NotificationSink for SoundSink {
    fn name(&self) -> &str {
        "sound"
    }

    async fn deliver(&self, _event: &NotificationEvent) -> anyhow::Result<()> {
        if !self.preference.is_enabled() {
            return Ok(());
        }
        write_all(&self.writer, b"\x07")
    }
}

/// Desktop notification permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPermission {
    /// Not asked yet; nothing is shown.
    Default,
    /// Notifications may be shown.
    Granted,
    /// The user refused.
    Denied,
}

impl NotificationPermission {
    fn to_u8(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::Granted => 1,
            Self::Denied => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Granted,
            2 => Self::Denied,
            _ => Self::Default,
        }
    }
}

/// Shared permission state for [`DesktopSink`]. Clones share the value.
#[derive(Debug, Clone)]
pub struct PermissionHandle(Arc<AtomicU8>);

impl PermissionHandle {
    /// Handle starting at `permission`.
    #[must_use]
    pub fn new(permission: NotificationPermission) -> Self {
        Self(Arc::new(AtomicU8::new(permission.to_u8())))
    }

    /// Current permission.
    #[must_use]
    pub fn get(&self) -> NotificationPermission {
        NotificationPermission::from_u8(self.0.load(Ordering::Relaxed))
    }

    /// Record the user's answer.
    pub fn set(&self, permission: NotificationPermission) {
        self.0.store(permission.to_u8(), Ordering::Relaxed);
    }
}

/// Emits `ESC ] 777 ; notify ; title ; body BEL` when permission is granted.
///
/// Terminals that understand OSC 777 (urxvt, foot, WezTerm, several tmux
/// setups) turn this into a native desktop notification.
pub struct DesktopSink {
    writer: SharedWriter,
    permission: PermissionHandle,
}

impl std::fmt::Debug for DesktopSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesktopSink")
            .field("permission", &self.permission.get())
            .finish_non_exhaustive()
    }
}

impl DesktopSink {
    /// Desktop notifications written to `writer`.
    pub fn new(writer: impl Write + Send + 'static, permission: PermissionHandle) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            permission,
        }
    }

    /// Desktop notifications written to stdout.
    #[must_use]
    pub fn stdout(permission: PermissionHandle) -> Self {
        Self::new(std::io::stdout(), permission)
    }

    /// Encode the escape sequence for `event`.
    #[must_use]
    pub fn encode(event: &NotificationEvent) -> String {
        let title = if event.title.is_empty() {
            &event.kind
        } else {
            &event.title
        };
        // `;` separates OSC fields; only the final field may contain it.
        let title = strip_controls(title).replace(';', ",");
        let body = strip_controls(&event.message);
        format!("\x1b]777;notify;{title};{body}\x07")
    }
}

#[async_trait]
impl NotificationSink for DesktopSink {
    fn name(&self) -> &str {
        "desktop"
    }

    async fn deliver(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        match self.permission.get() {
            NotificationPermission::Granted => {
                write_all(&self.writer, Self::encode(event).as_bytes())
            }
            other => {
                log::trace!("[Dispatch] Desktop notification suppressed ({other:?})");
                Ok(())
            }
        }
    }
}

/// Re-broadcasts events to any number of in-process listeners.
#[derive(Debug, Clone)]
pub struct EventBusSink {
    tx: broadcast::Sender<NotificationEvent>,
}

impl EventBusSink {
    /// Bus buffering up to `capacity` events per lagging subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New listener. Only events dispatched after this call are received.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for EventBusSink {
    fn name(&self) -> &str {
        "event-bus"
    }

    async fn deliver(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        // No listeners is not a failure.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Wraps a host closure.
pub struct CallbackSink {
    name: String,
    callback: Box<dyn Fn(&NotificationEvent) + Send + Sync>,
}

impl std::fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSink")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl CallbackSink {
    /// Named closure sink.
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl NotificationSink for CallbackSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        (self.callback)(event);
        Ok(())
    }
}
