//! Error taxonomy for the notification client.
//!
//! Only [`ClientError::InvalidCredential`] is ever returned to the host
//! application. Every other variant is produced and absorbed inside the
//! supervisor: transient failures drive a reconnect, per-frame and per-sink
//! failures are logged and dropped.

/// Errors produced by the notification client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The stored credential is absent, malformed, or carries no user id.
    InvalidCredential(String),
    /// No CONNECTED frame arrived within the handshake timeout.
    HandshakeTimeout,
    /// The transport closed (or could not be opened).
    TransportClosed(String),
    /// The periodic liveness check found a half-open connection.
    LivenessFailure(String),
    /// The server sent a STOMP ERROR frame.
    ServerError(String),
    /// A single frame could not be parsed.
    FrameParse(String),
    /// A sink failed while handling an event.
    Sink {
        /// Name of the failing sink.
        sink: String,
        /// Failure description.
        reason: String,
    },
}

impl ClientError {
    /// Returns `true` for failures that drive an automatic reconnect.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout
                | Self::TransportClosed(_)
                | Self::LivenessFailure(_)
                | Self::ServerError(_)
        )
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCredential(msg) => write!(f, "Invalid credential: {msg}"),
            Self::HandshakeTimeout => write!(f, "Handshake timed out"),
            Self::TransportClosed(reason) => write!(f, "Transport closed: {reason}"),
            Self::LivenessFailure(reason) => write!(f, "Liveness check failed: {reason}"),
            Self::ServerError(msg) => write!(f, "Server error: {msg}"),
            Self::FrameParse(msg) => write!(f, "Frame parse error: {msg}"),
            Self::Sink { sink, reason } => write!(f, "Sink '{sink}' failed: {reason}"),
        }
    }
}

impl std::error::Error for ClientError {}
