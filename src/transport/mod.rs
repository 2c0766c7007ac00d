//! Physical full-duplex channel to the notification server.
//!
//! A transport is a pair of in-process queues. The consumer side,
//! [`TransportConnection`], is what the STOMP session talks to. The
//! driver side, [`TransportIo`], is held by whatever moves bytes: the
//! WebSocket task, the long-poll task, or a fake server in tests.
//!
//! ```text
//!   StompSession                          driver task
//!        │ send(frame) ──► TransportCommand ──► socket / POST xhr_send
//!        │ recv()      ◄── TransportEvent   ◄── socket / POST xhr
//! ```
//!
//! Events are delivered strictly in the order the driver emits them.
//! Sending on a closed connection is a silent no-op because callers may
//! race a teardown.

// Rust guideline compliant 2026-02

pub mod polling;
pub mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use polling::PollingConnector;
pub use websocket::WebSocketConnector;

/// Event raised by a transport driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel is open and ready for frames.
    Open,
    /// One raw frame from the server.
    Frame(Bytes),
    /// The channel closed; no further events follow.
    Closed(String),
}

/// Command sent from the connection to its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Write one frame to the server.
    Send(Bytes),
    /// Close the channel.
    Close,
}

/// Which transport carries the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Native WebSocket.
    #[default]
    WebSocket,
    /// HTTP long-poll emulation of a socket.
    Polling,
    /// In-process test double.
    Memory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::Polling => write!(f, "polling"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Consumer side of a transport.
#[derive(Debug)]
pub struct TransportConnection {
    kind: TransportKind,
    command_tx: mpsc::UnboundedSender<TransportCommand>,
    event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    open: Arc<AtomicBool>,
    closed: bool,
}

/// Driver side of a transport.
#[derive(Debug)]
pub struct TransportIo {
    command_rx: mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    open: Arc<AtomicBool>,
}

/// Create a connected (consumer, driver) pair.
#[must_use]
pub fn channel(kind: TransportKind) -> (TransportConnection, TransportIo) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(false));

    (
        TransportConnection {
            kind,
            command_tx,
            event_rx,
            open: Arc::clone(&open),
            closed: false,
        },
        TransportIo {
            command_rx,
            event_tx,
            open,
        },
    )
}

impl TransportConnection {
    /// Transport carrying this connection.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Queue a frame for the server. No-op once the connection is closed.
    pub fn send(&self, frame: impl Into<Bytes>) {
        if self.closed || !self.is_open() {
            log::trace!("[Transport] Dropping send on closed {} connection", self.kind);
            return;
        }
        let _ = self.command_tx.send(TransportCommand::Send(frame.into()));
    }

    /// Close the connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.open.store(false, Ordering::SeqCst);
        let _ = self.command_tx.send(TransportCommand::Close);
    }

    /// Whether the driver reports the channel open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed && self.open.load(Ordering::SeqCst)
    }

    /// Receive the next event. Returns `None` once the driver is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.event_rx.recv().await
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl TransportIo {
    /// Report the channel open.
    pub fn emit_open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let _ = self.event_tx.send(TransportEvent::Open);
    }

    /// Deliver one frame to the consumer.
    pub fn emit_frame(&self, frame: impl Into<Bytes>) {
        let _ = self.event_tx.send(TransportEvent::Frame(frame.into()));
    }

    /// Report the channel closed.
    pub fn emit_closed(&self, reason: impl Into<String>) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(TransportEvent::Closed(reason.into()));
    }

    /// Wait for the next command. `None` means the consumer was dropped.
    pub async fn recv_command(&mut self) -> Option<TransportCommand> {
        self.command_rx.recv().await
    }

    /// Non-blocking variant of [`Self::recv_command`].
    pub fn try_recv_command(&mut self) -> Option<TransportCommand> {
        self.command_rx.try_recv().ok()
    }

    /// Whether the consumer has gone away.
    #[must_use]
    pub fn is_consumer_gone(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// Opens transports. Injected into the supervisor so tests can substitute
/// an in-process server.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Open a transport to `url` (an `http(s)` endpoint base).
    ///
    /// The returned connection may not be open yet; wait for
    /// [`TransportEvent::Open`].
    async fn open(&self, url: &str) -> Result<TransportConnection>;
}

/// Transport selection preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// WebSocket first, long-poll when the WebSocket handshake fails.
    #[default]
    Auto,
    /// WebSocket only.
    WebSocket,
    /// Long-poll only.
    Polling,
}

impl std::str::FromStr for TransportPreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "polling" | "xhr" => Ok(Self::Polling),
            other => anyhow::bail!("unknown transport preference: {other}"),
        }
    }
}

/// Connector honouring a [`TransportPreference`].
#[derive(Debug, Default)]
pub struct AutoConnector {
    preference: TransportPreference,
    websocket: WebSocketConnector,
    polling: PollingConnector,
}

impl AutoConnector {
    /// Create a connector for the given preference.
    #[must_use]
    pub fn new(preference: TransportPreference) -> Self {
        Self {
            preference,
            websocket: WebSocketConnector::default(),
            polling: PollingConnector::default(),
        }
    }

    /// Bound the WebSocket attempt; in `Auto` mode expiry falls through to
    /// long-polling.
    #[must_use]
    pub fn with_websocket_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.websocket = WebSocketConnector::new(timeout);
        self
    }
}

#[async_trait]
impl Connector for AutoConnector {
    async fn open(&self, url: &str) -> Result<TransportConnection> {
        match self.preference {
            TransportPreference::WebSocket => self.websocket.open(url).await,
            TransportPreference::Polling => self.polling.open(url).await,
            TransportPreference::Auto => match self.websocket.open(url).await {
                Ok(conn) => Ok(conn),
                Err(e) => {
                    log::info!(
                        "[Transport] WebSocket unavailable ({e:#}), falling back to long-poll"
                    );
                    self.polling.open(url).await
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (mut conn, io) = channel(TransportKind::Memory);
        io.emit_open();
        io.emit_frame(Bytes::from_static(b"one"));
        io.emit_frame(Bytes::from_static(b"two"));
        io.emit_closed("bye");

        assert_eq!(conn.recv().await, Some(TransportEvent::Open));
        assert_eq!(
            conn.recv().await,
            Some(TransportEvent::Frame(Bytes::from_static(b"one")))
        );
        assert_eq!(
            conn.recv().await,
            Some(TransportEvent::Frame(Bytes::from_static(b"two")))
        );
        assert_eq!(conn.recv().await, Some(TransportEvent::Closed("bye".into())));
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_send_before_open_and_after_close_is_noop() {
        let (mut conn, mut io) = channel(TransportKind::Memory);
        conn.send(Bytes::from_static(b"early"));
        assert!(io.try_recv_command().is_none());

        io.emit_open();
        conn.send(Bytes::from_static(b"frame"));
        assert_eq!(
            io.recv_command().await,
            Some(TransportCommand::Send(Bytes::from_static(b"frame")))
        );

        conn.close();
        conn.close();
        conn.send(Bytes::from_static(b"late"));
        assert_eq!(io.recv_command().await, Some(TransportCommand::Close));
        assert!(io.try_recv_command().is_none());
    }

    #[tokio::test]
    async fn test_drop_closes_driver() {
        let (conn, mut io) = channel(TransportKind::Memory);
        io.emit_open();
        drop(conn);
        assert_eq!(io.recv_command().await, Some(TransportCommand::Close));
        assert_eq!(io.recv_command().await, None);
        assert!(io.is_consumer_gone());
    }

    #[test]
    fn test_preference_parse() {
        assert_eq!(
            "WebSocket".parse::<TransportPreference>().unwrap(),
            TransportPreference::WebSocket
        );
        assert_eq!(
            "xhr".parse::<TransportPreference>().unwrap(),
            TransportPreference::Polling
        );
        assert!("carrier-pigeon".parse::<TransportPreference>().is_err());
    }
}
