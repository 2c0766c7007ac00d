//! Connection supervisor.
//!
//! A single tokio task owns the live session and drives this state machine:
//!
//! ```text
//!                connect()
//!  Disconnected ──────────► Connecting ──handshake + subscribe──► Connected
//!       ▲                     ▲    │                                  │
//!       │ credential gone     │    │ failure / timeout                │ close, ERROR,
//!       └─────────────────────┤    ▼                                  │ liveness failure
//!                             └── ReconnectWait ◄─────────────────────┘
//!
//!  any state ──disconnect()──► Closed
//! ```
//!
//! Only one transport exists at a time: the previous session is unsubscribed,
//! disconnected and dropped before the reconnect timer is armed. Retries are
//! unbounded. Nothing inside the loop can fail the host: sink and parse errors
//! are handled by the dispatcher, connection errors become a retry.

// Rust guideline compliant 2026-02

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::credentials::CredentialSource;
use crate::dispatch::Dispatcher;
use crate::error::ClientError;
use crate::stomp::{
    AckMode, ConnectOptions, Frame, HeartBeat, SessionEvent, StompSession, SubscriptionHandle,
};
use crate::token::{resolve_user_id, UserId};
use crate::transport::{Connector, TransportKind};

/// Default fixed reconnect delay.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Default liveness check period.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

/// Default per-user destination.
pub const DEFAULT_DESTINATION: &str = "/user/queue/notifications";

/// Placeholder replaced by the resolved user id in destination templates.
pub const USER_ID_PLACEHOLDER: &str = "{user_id}";

/// Lifecycle state of the notification connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session and no retry scheduled.
    Disconnected,
    /// Opening the transport and performing the handshake.
    Connecting,
    /// Subscribed and receiving events.
    Connected,
    /// Waiting for the reconnect timer.
    ReconnectWait,
    /// Shut down by `disconnect()`.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ReconnectWait => "reconnect_wait",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Observable view of the session, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current state.
    pub state: ConnectionState,
    /// User the session belongs to, once resolved.
    pub user_id: Option<UserId>,
    /// Failed cycles since the last successful connect.
    pub reconnect_attempts: u32,
    /// Delay of the pending reconnect timer (only in `ReconnectWait`).
    pub retry_in: Option<Duration>,
    /// Active subscription (only in `Connected`).
    pub subscription: Option<SubscriptionHandle>,
    /// Transport in use (only in `Connected`).
    pub transport: Option<TransportKind>,
    /// Most recent failure.
    pub last_error: Option<ClientError>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            user_id: None,
            reconnect_attempts: 0,
            retry_in: None,
            subscription: None,
            transport: None,
            last_error: None,
        }
    }
}

/// Delay between reconnect attempts. Both variants retry forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay every time.
    Fixed(Duration),
    /// Doubles per failed attempt, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        initial: Duration,
        /// Upper bound.
        max: Duration,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(20);
                initial.saturating_mul(1_u32 << shift).min(max)
            }
        }
    }
}

/// Connection parameters for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Server endpoint base (`http(s)://…`).
    pub server_url: String,
    /// STOMP virtual host.
    pub host: String,
    /// Destination template, see [`destination_for`].
    pub destination: String,
    /// Subscription acknowledgement mode.
    pub ack: AckMode,
    /// Proposed heartbeat intervals.
    pub heartbeat: HeartBeat,
    /// Bound on transport open plus handshake.
    pub handshake_timeout: Duration,
    /// Retry schedule.
    pub reconnect: ReconnectPolicy,
    /// Liveness check period.
    pub liveness_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        let heartbeat = HeartBeat::from_millis(10_000, 10_000);
        Self {
            server_url: "http://localhost:8080/ws".to_string(),
            host: "localhost".to_string(),
            destination: DEFAULT_DESTINATION.to_string(),
            ack: AckMode::Auto,
            heartbeat,
            handshake_timeout: default_handshake_timeout(heartbeat),
            reconnect: ReconnectPolicy::default(),
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
        }
    }
}

/// Handshake timeout derived from proposed heartbeats: twice the larger
/// interval, or 10 s when heartbeats are disabled.
#[must_use]
pub fn default_handshake_timeout(heartbeat: HeartBeat) -> Duration {
    let longest = heartbeat.outgoing.max(heartbeat.incoming);
    if longest.is_zero() {
        Duration::from_secs(10)
    } else {
        longest * 2
    }
}

/// Derive the subscription destination for `user`.
///
/// A `{user_id}` placeholder is replaced with the id, which must then stay
/// within `[A-Za-z0-9._@-]` so it cannot name another user's channel.
/// Templates without it must live under `/user/`, where the broker resolves
/// the queue for the authenticated principal; any id is fine there.
///
/// # Errors
///
/// [`ClientError::InvalidCredential`] when a substituted id contains other
/// characters or the template is not user-scoped.
pub fn destination_for(template: &str, user: &UserId) -> Result<String, ClientError> {
    let id = user.as_str();

    if template.contains(USER_ID_PLACEHOLDER) {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-'));
        if !safe {
            return Err(ClientError::InvalidCredential(format!(
                "user id '{id}' cannot name a destination"
            )));
        }
        Ok(template.replace(USER_ID_PLACEHOLDER, id))
    } else if template.starts_with("/user/") {
        Ok(template.to_string())
    } else {
        Err(ClientError::InvalidCredential(format!(
            "destination '{template}' is not scoped to a user"
        )))
    }
}

/// Read and resolve the current credential.
///
/// # Errors
///
/// [`ClientError::InvalidCredential`] when no credential is stored or it
/// does not resolve to a user id.
pub fn current_identity(
    credentials: &dyn CredentialSource,
) -> Result<(String, UserId), ClientError> {
    let credential = credentials
        .current()
        .ok_or_else(|| ClientError::InvalidCredential("no credential stored".to_string()))?;
    let user_id = resolve_user_id(&credential)?;
    Ok((credential, user_id))
}

/// [`current_identity`] on the blocking pool; keyring backends may block.
pub async fn lookup_identity(
    credentials: Arc<dyn CredentialSource>,
) -> Result<(String, UserId), ClientError> {
    tokio::task::spawn_blocking(move || current_identity(credentials.as_ref()))
        .await
        .unwrap_or_else(|e| {
            Err(ClientError::InvalidCredential(format!(
                "credential lookup failed: {e}"
            )))
        })
}

/// Why the serve loop returned.
enum ServeExit {
    Cancelled,
    Lost(ClientError),
}

/// Owner of the live session. Consumed by [`Supervisor::run`].
pub struct Supervisor {
    settings: SupervisorSettings,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    dispatcher: Dispatcher,
    state: Arc<watch::Sender<SessionSnapshot>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("server_url", &self.settings.server_url)
            .field("destination", &self.settings.destination)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Assemble a supervisor. Nothing happens until [`Self::run`].
    #[must_use]
    pub fn new(
        settings: SupervisorSettings,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
        dispatcher: Dispatcher,
        state: Arc<watch::Sender<SessionSnapshot>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            connector,
            credentials,
            dispatcher,
            state,
            cancel,
        }
    }

    /// Run until cancelled or until the credential disappears.
    pub async fn run(self) {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.publish(|s| {
                s.state = ConnectionState::Connecting;
                s.reconnect_attempts = attempt;
                s.retry_in = None;
            });

            // Rotation: the host may have replaced or removed the credential.
            let identity = lookup_identity(Arc::clone(&self.credentials)).await;
            let (credential, user_id) = match identity {
                Ok(identity) => identity,
                Err(e) => {
                    log::error!("[Supervisor] {e}; giving up until connect() is called again");
                    self.publish(|s| {
                        s.state = ConnectionState::Disconnected;
                        s.last_error = Some(e);
                    });
                    return;
                }
            };
            let destination = match destination_for(&self.settings.destination, &user_id) {
                Ok(destination) => destination,
                Err(e) => {
                    log::error!("[Supervisor] {e}");
                    self.publish(|s| {
                        s.state = ConnectionState::Disconnected;
                        s.last_error = Some(e);
                    });
                    return;
                }
            };
            self.publish(|s| s.user_id = Some(user_id.clone()));

            let established = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = self.establish(&credential, &destination) => result,
            };

            let failure = match established {
                Ok((mut session, subscription)) => {
                    if attempt > 0 {
                        log::info!("[Supervisor] Reconnected after {attempt} failed attempt(s)");
                    }
                    attempt = 0;
                    self.publish(|s| {
                        s.state = ConnectionState::Connected;
                        s.reconnect_attempts = 0;
                        s.subscription = Some(subscription.clone());
                        s.transport = Some(session.transport_kind());
                        s.last_error = None;
                    });

                    let exit = self.serve(&mut session, &subscription).await;
                    teardown(&mut session, &subscription);
                    self.publish(|s| {
                        s.subscription = None;
                        s.transport = None;
                    });

                    match exit {
                        ServeExit::Cancelled => break,
                        ServeExit::Lost(e) => e,
                    }
                }
                Err(e) => e,
            };

            attempt = attempt.saturating_add(1);
            let delay = self.settings.reconnect.delay(attempt);
            log::warn!(
                "[Supervisor] {failure}; reconnecting in {}ms (attempt {attempt})",
                delay.as_millis()
            );
            self.publish(|s| {
                s.state = ConnectionState::ReconnectWait;
                s.reconnect_attempts = attempt;
                s.retry_in = Some(delay);
                s.last_error = Some(failure);
            });

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        log::info!("[Supervisor] Shutdown requested, supervisor stopped");
        self.publish(|s| {
            s.state = ConnectionState::Closed;
            s.retry_in = None;
            s.subscription = None;
            s.transport = None;
        });
    }

    /// Open a transport, complete the handshake and subscribe.
    async fn establish(
        &self,
        credential: &str,
        destination: &str,
    ) -> Result<(StompSession, SubscriptionHandle), ClientError> {
        let deadline = Instant::now() + self.settings.handshake_timeout;
        let url = &self.settings.server_url;
        log::info!("[Supervisor] Connecting to {url}");

        let transport = tokio::time::timeout_at(deadline, self.connector.open(url))
            .await
            .map_err(|_| ClientError::HandshakeTimeout)?
            .map_err(|e| ClientError::TransportClosed(format!("{e:#}")))?;

        // Opening the transport spent part of the budget.
        let options = ConnectOptions {
            host: self.settings.host.clone(),
            heartbeat: self.settings.heartbeat,
            timeout: deadline.saturating_duration_since(Instant::now()),
            headers: vec![(
                "Authorization".to_string(),
                format!("Bearer {credential}"),
            )],
        };
        let mut session = StompSession::connect(transport, &options).await?;
        let subscription = session.subscribe(destination, self.settings.ack);
        log::info!(
            "[Supervisor] Connected over {}, subscribed to {}",
            session.transport_kind(),
            destination
        );
        Ok((session, subscription))
    }

    /// Pump events until the session is lost or cancellation.
    async fn serve(
        &self,
        session: &mut StompSession,
        subscription: &SubscriptionHandle,
    ) -> ServeExit {
        let period = self.settings.liveness_interval;
        let mut liveness = tokio::time::interval_at(Instant::now() + period, period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outgoing = session.heartbeat().outgoing;
        let mut heartbeat = (!outgoing.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(Instant::now() + outgoing, outgoing);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return ServeExit::Cancelled,
                event = session.next_event() => match event {
                    SessionEvent::Message(frame) => {
                        self.handle_message(session, subscription, &frame).await;
                    }
                    SessionEvent::Receipt(id) => log::debug!("[Supervisor] Receipt {id}"),
                    SessionEvent::ServerError(message) => {
                        return ServeExit::Lost(ClientError::ServerError(message));
                    }
                    SessionEvent::Closed(reason) => {
                        return ServeExit::Lost(ClientError::TransportClosed(reason));
                    }
                },
                () = tick(heartbeat.as_mut()) => session.send_heartbeat(),
                _ = liveness.tick() => {
                    if let Err(e) = check_liveness(session) {
                        return ServeExit::Lost(e);
                    }
                    log::trace!("[Supervisor] Liveness check passed");
                }
            }
        }
    }

    async fn handle_message(
        &self,
        session: &StompSession,
        subscription: &SubscriptionHandle,
        frame: &Frame,
    ) {
        if let Some(id) = frame.get_header("subscription") {
            if id != subscription.id {
                log::warn!("[Supervisor] Dropping MESSAGE for unknown subscription {id}");
                return;
            }
        }

        self.dispatcher.dispatch_payload(&frame.body).await;

        if subscription.ack.requires_ack() {
            session.ack(frame);
        }
    }

    fn publish(&self, update: impl FnOnce(&mut SessionSnapshot)) {
        self.state.send_modify(update);
    }
}

/// Verify the session is still usable.
fn check_liveness(session: &StompSession) -> Result<(), ClientError> {
    if !session.is_transport_open() {
        return Err(ClientError::LivenessFailure(
            "transport no longer open".to_string(),
        ));
    }
    if !session.is_connected() {
        return Err(ClientError::LivenessFailure(
            "session no longer connected".to_string(),
        ));
    }
    if session.heartbeat_overdue(Instant::now()) {
        return Err(ClientError::LivenessFailure(format!(
            "no data from server for over {}ms",
            (session.heartbeat().incoming * 2).as_millis()
        )));
    }
    Ok(())
}

/// Unsubscribe and close. Both are no-ops on a dead transport.
fn teardown(session: &mut StompSession, subscription: &SubscriptionHandle) {
    session.unsubscribe(subscription);
    session.disconnect();
    log::debug!("[Supervisor] Session torn down");
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::SharedCredential;
    use crate::transport::{channel, TransportConnection, TransportIo, TransportKind};

    fn user(id: &str) -> UserId {
        resolve_user_id(&format!(
            "h.{}.s",
            base64::Engine::encode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                format!(r#"{{"userId":"{id}"}}"#)
            )
        ))
        .unwrap()
    }

    #[test]
    fn test_fixed_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(3));
        assert_eq!(policy.delay(500), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_policy_caps() {
        let policy = ReconnectPolicy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(5), Duration::from_secs(16));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_default_handshake_timeout() {
        assert_eq!(
            default_handshake_timeout(HeartBeat::from_millis(10_000, 4_000)),
            Duration::from_secs(20)
        );
        assert_eq!(
            default_handshake_timeout(HeartBeat::DISABLED),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_destination_for() {
        let alice = user("alice@example.com");
        assert_eq!(
            destination_for(DEFAULT_DESTINATION, &alice).unwrap(),
            "/user/queue/notifications"
        );
        assert_eq!(
            destination_for("/topic/users.{user_id}", &alice).unwrap(),
            "/topic/users.alice@example.com"
        );
        assert!(matches!(
            destination_for("/topic/all", &alice),
            Err(ClientError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_destination_rejects_path_injection() {
        let evil = user("42/../../other");
        assert!(matches!(
            destination_for("/topic/users.{user_id}", &evil),
            Err(ClientError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_user_scoped_destination_accepts_any_user_id() {
        let credentials = SharedCredential::default();
        // {"sub":"auth0|12345"}
        credentials.set("h.eyJzdWIiOiJhdXRoMHwxMjM0NSJ9.s");
        let (_, user_id) = current_identity(&credentials).unwrap();
        assert_eq!(user_id.as_str(), "auth0|12345");

        assert_eq!(
            destination_for(DEFAULT_DESTINATION, &user_id).unwrap(),
            "/user/queue/notifications"
        );
        assert!(matches!(
            destination_for("/topic/users.{user_id}", &user_id),
            Err(ClientError::InvalidCredential(_))
        ));
    }

    /// Connector that takes `delay` to open and never answers CONNECT.
    #[derive(Debug)]
    struct SlowConnector {
        delay: Duration,
        servers: std::sync::Mutex<Vec<TransportIo>>,
    }

    #[async_trait::async_trait]
    impl Connector for SlowConnector {
        async fn open(&self, _url: &str) -> anyhow::Result<TransportConnection> {
            tokio::time::sleep(self.delay).await;
            let (conn, io) = channel(TransportKind::Memory);
            io.emit_open();
            self.servers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(io);
            Ok(conn)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_and_handshake_share_one_deadline() {
        let settings = SupervisorSettings {
            handshake_timeout: Duration::from_secs(20),
            ..SupervisorSettings::default()
        };
        let supervisor = Supervisor::new(
            settings,
            Arc::new(SlowConnector {
                delay: Duration::from_secs(15),
                servers: std::sync::Mutex::new(Vec::new()),
            }),
            Arc::new(SharedCredential::default()),
            Dispatcher::default(),
            Arc::new(watch::channel(SessionSnapshot::default()).0),
            CancellationToken::new(),
        );

        let started = Instant::now();
        let result = supervisor
            .establish("h.eyJ1c2VySWQiOjQyfQ.s", DEFAULT_DESTINATION)
            .await;
        assert!(matches!(result, Err(ClientError::HandshakeTimeout)));
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn test_current_identity() {
        let credentials = SharedCredential::default();
        assert!(matches!(
            current_identity(&credentials),
            Err(ClientError::InvalidCredential(_))
        ));
        credentials.set("h.eyJ1c2VySWQiOjQyfQ.s");
        let (credential, user_id) = current_identity(&credentials).unwrap();
        assert_eq!(credential, "h.eyJ1c2VySWQiOjQyfQ.s");
        assert_eq!(user_id.as_str(), "42");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::ReconnectWait.to_string(), "reconnect_wait");
        assert_eq!(SessionSnapshot::default().state, ConnectionState::Disconnected);
    }
}
