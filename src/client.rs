//! Host-facing notification client.
//!
//! [`NotificationClient`] is the single object an embedding application
//! holds. It owns the dispatcher and, while connected, one supervisor task.
//!
//! ```ignore
//! let client = NotificationClient::new(options, connector, credentials);
//! client.add_sink(ToastSink::stdout());
//! client.on_notification(|event| println!("{}", event.title));
//! let user = client.connect().await?;
//! // ...
//! client.disconnect().await;
//! ```

// Rust guideline compliant 2026-02

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::credentials::CredentialSource;
use crate::dispatch::{
    DispatchReport, Dispatcher, EventBusSink, NotificationSink, SinkId, DEFAULT_SINK_TIMEOUT,
};
use crate::error::ClientError;
use crate::notification::NotificationEvent;
use crate::supervisor::{
    destination_for, lookup_identity, ConnectionState, SessionSnapshot, Supervisor,
    SupervisorSettings,
};
use crate::token::UserId;
use crate::transport::Connector;

/// Client construction options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Connection parameters.
    pub supervisor: SupervisorSettings,
    /// `false` on platforms that rely on push delivery only: `connect()`
    /// validates the credential but never opens a transport.
    pub live_transport_supported: bool,
    /// Bound on a single sink invocation.
    pub sink_timeout: Duration,
    /// Per-listener buffer of the event bus.
    pub event_bus_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            supervisor: SupervisorSettings::default(),
            live_transport_supported: true,
            sink_timeout: DEFAULT_SINK_TIMEOUT,
            event_bus_capacity: 64,
        }
    }
}

/// Active connection: the supervisor task (absent in push-only mode) and
/// the token that stops it.
struct Running {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Running {
    fn is_alive(&self) -> bool {
        match &self.task {
            Some(task) => !task.is_finished(),
            None => !self.cancel.is_cancelled(),
        }
    }

    /// Cancel the supervisor and wait for its teardown.
    async fn stop(self) {
        self.cancel.cancel();
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                log::error!("[Client] Supervisor task ended abnormally: {e}");
            }
        }
    }
}

/// Real-time notification client.
pub struct NotificationClient {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    dispatcher: Dispatcher,
    bus: EventBusSink,
    state: Arc<watch::Sender<SessionSnapshot>>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for NotificationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationClient")
            .field("state", &self.state())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl NotificationClient {
    /// Create a disconnected client. The event bus is registered as the
    /// first sink.
    pub fn new(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let dispatcher = Dispatcher::new(options.sink_timeout);
        let bus = EventBusSink::new(options.event_bus_capacity);
        dispatcher.register(bus.clone());
        let (state, _) = watch::channel(SessionSnapshot::default());

        Self {
            options,
            connector,
            credentials,
            dispatcher,
            bus,
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    /// Start delivering notifications for the stored credential.
    ///
    /// Returns once the supervisor is running; the handshake completes in
    /// the background. The credential is read on every call: while a session
    /// for the same user is running this returns that user, and a credential
    /// naming a different user restarts the session.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidCredential`] if no credential is stored or it
    /// does not name a usable user. A stopped client stays `Disconnected`;
    /// a running one is left alone.
    pub async fn connect(&self) -> Result<UserId, ClientError> {
        let mut running = self.running.lock().await;

        let identity = lookup_identity(Arc::clone(&self.credentials))
            .await
            .and_then(|(_, user_id)| {
                destination_for(&self.options.supervisor.destination, &user_id).map(|_| user_id)
            });
        let alive = running.as_ref().is_some_and(Running::is_alive);
        let user_id = match identity {
            Ok(user_id) => user_id,
            Err(e) if alive => {
                log::warn!("[Client] Cannot connect: {e}; keeping the running session");
                return Err(e);
            }
            Err(e) => {
                log::warn!("[Client] Cannot connect: {e}");
                self.state.send_modify(|s| {
                    s.state = ConnectionState::Disconnected;
                    s.last_error = Some(e.clone());
                });
                return Err(e);
            }
        };

        if alive {
            let current = self.state.borrow().user_id.clone();
            if current.as_ref() == Some(&user_id) {
                return Ok(user_id);
            }
            log::info!("[Client] Credential now names user {user_id}, restarting session");
            if let Some(previous) = running.take() {
                previous.stop().await;
            }
        }

        let cancel = CancellationToken::new();

        if !self.options.live_transport_supported {
            log::info!("[Client] Live transport disabled, awaiting pushed notifications");
            self.state.send_replace(SessionSnapshot {
                state: ConnectionState::Connected,
                user_id: Some(user_id.clone()),
                ..SessionSnapshot::default()
            });
            *running = Some(Running { cancel, task: None });
            return Ok(user_id);
        }

        self.state.send_replace(SessionSnapshot {
            state: ConnectionState::Connecting,
            user_id: Some(user_id.clone()),
            ..SessionSnapshot::default()
        });

        let supervisor = Supervisor::new(
            self.options.supervisor.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.credentials),
            self.dispatcher.clone(),
            Arc::clone(&self.state),
            cancel.clone(),
        );
        let task = tokio::spawn(supervisor.run());
        log::info!("[Client] Connecting as user {user_id}");

        *running = Some(Running {
            cancel,
            task: Some(task),
        });
        Ok(user_id)
    }

    /// Stop delivering: tear down the session, cancel every timer and move
    /// to `Closed`. Safe to call repeatedly or before `connect()`.
    pub async fn disconnect(&self) {
        let mut running = self.running.lock().await;

        if let Some(previous) = running.take() {
            previous.stop().await;
            log::info!("[Client] Disconnected");
        }

        self.state.send_modify(|s| {
            s.state = ConnectionState::Closed;
            s.retry_in = None;
            s.subscription = None;
            s.transport = None;
        });
    }

    /// Register a closure invoked for every event.
    pub fn on_notification<F>(&self, callback: F) -> SinkId
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on_notification(callback)
    }

    /// Register a sink at the end of the dispatch order.
    pub fn add_sink(&self, sink: impl NotificationSink + 'static) -> SinkId {
        self.dispatcher.register(sink)
    }

    /// Remove a sink. Returns `false` if the id is unknown.
    pub fn remove_sink(&self, id: SinkId) -> bool {
        self.dispatcher.unregister(id)
    }

    /// Enable or disable a sink. Returns `false` if the id is unknown.
    pub fn set_sink_enabled(&self, id: SinkId, enabled: bool) -> bool {
        self.dispatcher.set_enabled(id, enabled)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().state
    }

    /// Full session view.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver observing every session transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Listener on the application event bus.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<NotificationEvent> {
        self.bus.subscribe()
    }

    /// Dispatch a payload received out of band (OS push delivery).
    /// Malformed payloads are logged and dropped.
    pub async fn deliver_push(&self, payload: &[u8]) -> Option<DispatchReport> {
        self.dispatcher.dispatch_payload(payload).await
    }
}

impl Drop for NotificationClient {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::SharedCredential;
    use crate::transport::{channel, TransportConnection, TransportIo, TransportKind};
    use async_trait::async_trait;

    /// Connector whose transports never open.
    #[derive(Debug, Default)]
    struct Silent(std::sync::Mutex<Vec<TransportIo>>);

    #[async_trait]
    impl Connector for Silent {
        async fn open(&self, _url: &str) -> anyhow::Result<TransportConnection> {
            let (conn, io) = channel(TransportKind::Memory);
            self.0.lock().unwrap().push(io);
            Ok(conn)
        }
    }

    fn client(token: Option<&str>, live: bool) -> NotificationClient {
        let credentials = SharedCredential::default();
        if let Some(token) = token {
            credentials.set(token);
        }
        NotificationClient::new(
            ClientOptions {
                live_transport_supported: live,
                ..ClientOptions::default()
            },
            Arc::new(Silent::default()),
            Arc::new(credentials),
        )
    }

    #[tokio::test]
    async fn test_connect_without_credential_stays_disconnected() {
        let client = client(None, true);
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidCredential(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_with_garbage_credential() {
        let client = client(Some("not-a-token"), true);
        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = client(Some("h.eyJ1c2VySWQiOjQyfQ.s"), true);
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);

        let user = client.connect().await.unwrap();
        assert_eq!(user.as_str(), "42");
        assert_eq!(client.state(), ConnectionState::Connecting);
        // A second connect while running reuses the session.
        assert_eq!(client.connect().await.unwrap(), user);

        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_accepts_user_id_outside_destination_charset() {
        // {"sub":"auth0|12345"}
        let client = client(Some("h.eyJzdWIiOiJhdXRoMHwxMjM0NSJ9.s"), true);
        let user = client.connect().await.unwrap();
        assert_eq!(user.as_str(), "auth0|12345");
        assert_eq!(client.state(), ConnectionState::Connecting);
        client.disconnect().await;
    }

    /// Yield until the supervisor has asked for `count` transports.
    async fn wait_for_opens(connector: &Silent, count: usize) {
        while connector.0.lock().unwrap().len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_rereads_rotated_credential() {
        let credentials = SharedCredential::default();
        credentials.set("h.eyJ1c2VySWQiOjQyfQ.s");
        let connector = Arc::new(Silent::default());
        let client = NotificationClient::new(
            ClientOptions::default(),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(credentials.clone()),
        );
        assert_eq!(client.connect().await.unwrap().as_str(), "42");
        wait_for_opens(&connector, 1).await;

        // {"userId":7}
        credentials.set("h.eyJ1c2VySWQiOjd9.s");
        assert_eq!(client.connect().await.unwrap().as_str(), "7");
        wait_for_opens(&connector, 2).await;
        let snapshot = client.snapshot();
        assert_eq!(snapshot.user_id.map(|u| u.to_string()).as_deref(), Some("7"));
        assert_eq!(snapshot.state, ConnectionState::Connecting);

        // Losing the credential does not tear down the running session.
        credentials.clear();
        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Connecting);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_push_only_mode() {
        let client = client(Some("h.eyJ1c2VySWQiOjQyfQ.s"), false);
        let mut events = client.events();

        client.connect().await.unwrap();
        let snapshot = client.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.transport, None);

        let report = client
            .deliver_push(br#"{"type":"X","title":"T","message":"M"}"#)
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(events.recv().await.unwrap().title, "T");

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
