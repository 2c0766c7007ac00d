//! STOMP session layered on a [`TransportConnection`].
//!
//! # Protocol
//!
//! 1. Wait for the transport to report `Open`
//! 2. Send CONNECT with `accept-version`, `host`, `heart-beat` and any extra
//!    headers (the bearer credential travels here)
//! 3. Resolve on CONNECTED; an ERROR frame, a transport close, or the
//!    handshake timeout fail the attempt
//! 4. SUBSCRIBE / UNSUBSCRIBE / ACK on demand; MESSAGE, RECEIPT and ERROR
//!    frames surface through [`StompSession::next_event`]
//!
//! The session never retries. ERROR frames end the session and are handed to
//! the caller as [`SessionEvent::ServerError`].

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::frame::{decode, Command, Decoded, Frame, HEARTBEAT};
use crate::error::ClientError;
use crate::transport::{TransportConnection, TransportEvent, TransportKind};

/// Protocol versions offered in CONNECT.
const ACCEPT_VERSION: &str = "1.1,1.2";

/// Heartbeat intervals. Zero disables a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat {
    /// How often this side sends.
    pub outgoing: Duration,
    /// How often this side expects to receive.
    pub incoming: Duration,
}

impl HeartBeat {
    /// No heartbeats in either direction.
    pub const DISABLED: Self = Self {
        outgoing: Duration::ZERO,
        incoming: Duration::ZERO,
    };

    /// Build from millisecond values.
    #[must_use]
    pub fn from_millis(outgoing: u64, incoming: u64) -> Self {
        Self {
            outgoing: Duration::from_millis(outgoing),
            incoming: Duration::from_millis(incoming),
        }
    }

    /// `heart-beat` header value (`<outgoing>,<incoming>` in ms).
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing.as_millis(), self.incoming.as_millis())
    }

    /// Parse a `heart-beat` header value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (out, inc) = value.split_once(',')?;
        Some(Self::from_millis(
            out.trim().parse().ok()?,
            inc.trim().parse().ok()?,
        ))
    }

    /// Negotiate the effective client intervals from the client proposal and
    /// the server's CONNECTED header.
    #[must_use]
    pub fn negotiate(client: Self, server: Self) -> Self {
        let pick = |a: Duration, b: Duration| {
            if a.is_zero() || b.is_zero() {
                Duration::ZERO
            } else {
                a.max(b)
            }
        };
        Self {
            outgoing: pick(client.outgoing, server.incoming),
            incoming: pick(client.incoming, server.outgoing),
        }
    }
}

/// Subscription acknowledgement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// Server considers messages acknowledged on delivery.
    #[default]
    Auto,
    /// Cumulative ACK.
    Client,
    /// Per-message ACK.
    ClientIndividual,
}

impl AckMode {
    /// `ack` header value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Client => "client",
            Self::ClientIndividual => "client-individual",
        }
    }

    /// Whether messages on this subscription need an ACK frame.
    #[must_use]
    pub fn requires_ack(self) -> bool {
        !matches!(self, Self::Auto)
    }
}

impl std::str::FromStr for AckMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "client" => Ok(Self::Client),
            "client-individual" => Ok(Self::ClientIndividual),
            other => anyhow::bail!("unknown ack mode: {other}"),
        }
    }
}

/// Handshake parameters.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Virtual host (`host` header).
    pub host: String,
    /// Proposed heartbeat intervals.
    pub heartbeat: HeartBeat,
    /// Bound on the CONNECT/CONNECTED exchange. Callers that open the
    /// transport themselves pass what is left of their budget.
    pub timeout: Duration,
    /// Extra CONNECT headers.
    pub headers: Vec<(String, String)>,
}

/// Live subscription returned by [`StompSession::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// Locally generated subscription id.
    pub id: String,
    /// Subscribed destination.
    pub destination: String,
    /// Acknowledgement mode.
    pub ack: AckMode,
}

/// Event surfaced by an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// MESSAGE frame.
    Message(Frame),
    /// RECEIPT frame with its `receipt-id`.
    Receipt(String),
    /// ERROR frame; the session is over.
    ServerError(String),
    /// Transport closed; the session is over.
    Closed(String),
}

/// Established STOMP session.
#[derive(Debug)]
pub struct StompSession {
    transport: TransportConnection,
    heartbeat: HeartBeat,
    version: String,
    server: Option<String>,
    next_subscription: u64,
    connected: bool,
    last_received: Instant,
    pending: VecDeque<SessionEvent>,
}

impl StompSession {
    /// Perform the handshake on `transport`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::HandshakeTimeout`] if no CONNECTED frame arrives in time
    /// - [`ClientError::ServerError`] if the server answers with ERROR
    /// - [`ClientError::TransportClosed`] if the transport closes first
    pub async fn connect(
        transport: TransportConnection,
        options: &ConnectOptions,
    ) -> Result<Self, ClientError> {
        tokio::time::timeout(options.timeout, Self::handshake(transport, options))
            .await
            .map_err(|_| ClientError::HandshakeTimeout)?
    }

    async fn handshake(
        mut transport: TransportConnection,
        options: &ConnectOptions,
    ) -> Result<Self, ClientError> {
        loop {
            let event = transport
                .recv()
                .await
                .unwrap_or_else(|| TransportEvent::Closed("transport dropped".to_string()));

            match event {
                TransportEvent::Open => {
                    let mut frame = Frame::new(Command::Connect)
                        .header("accept-version", ACCEPT_VERSION)
                        .header("host", options.host.clone())
                        .header("heart-beat", options.heartbeat.header_value());
                    for (name, value) in &options.headers {
                        frame = frame.header(name.clone(), value.clone());
                    }
                    log::debug!("[Stomp] Sending CONNECT over {}", transport.kind());
                    transport.send(frame.encode());
                }
                TransportEvent::Frame(bytes) => {
                    let mut items = decode(&bytes).into_iter();
                    while let Some(item) = items.next() {
                        match item {
                            Ok(Decoded::Heartbeat) => {}
                            Ok(Decoded::Frame(frame)) if frame.command == Command::Connected => {
                                let mut session = Self::established(transport, options, &frame);
                                for rest in items {
                                    session.absorb(rest);
                                }
                                return Ok(session);
                            }
                            Ok(Decoded::Frame(frame)) if frame.command == Command::Error => {
                                return Err(ClientError::ServerError(error_message(&frame)));
                            }
                            Ok(Decoded::Frame(frame)) => {
                                log::debug!("[Stomp] Ignoring {} before CONNECTED", frame.command);
                            }
                            Err(e) => log::warn!("[Stomp] Dropping unparseable frame: {e}"),
                        }
                    }
                }
                TransportEvent::Closed(reason) => return Err(ClientError::TransportClosed(reason)),
            }
        }
    }

    fn established(transport: TransportConnection, options: &ConnectOptions, frame: &Frame) -> Self {
        let server_heartbeat = frame
            .get_header("heart-beat")
            .and_then(HeartBeat::parse)
            .unwrap_or(HeartBeat::DISABLED);
        let heartbeat = HeartBeat::negotiate(options.heartbeat, server_heartbeat);
        let version = frame.get_header("version").unwrap_or("1.0").to_string();
        let server = frame.get_header("server").map(str::to_string);

        log::info!(
            "[Stomp] Connected (version={}, server={}, heart-beat out={}ms in={}ms)",
            version,
            server.as_deref().unwrap_or("unknown"),
            heartbeat.outgoing.as_millis(),
            heartbeat.incoming.as_millis()
        );

        Self {
            transport,
            heartbeat,
            version,
            server,
            next_subscription: 0,
            connected: true,
            last_received: Instant::now(),
            pending: VecDeque::new(),
        }
    }

    /// Negotiated heartbeat intervals.
    #[must_use]
    pub fn heartbeat(&self) -> HeartBeat {
        self.heartbeat
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Server identification from CONNECTED, if any.
    #[must_use]
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Transport carrying the session.
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Whether the transport reports itself open.
    #[must_use]
    pub fn is_transport_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Whether the session is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected && self.transport.is_open()
    }

    /// Whether the server has been silent for more than twice the negotiated
    /// incoming heartbeat interval.
    #[must_use]
    pub fn heartbeat_overdue(&self, now: Instant) -> bool {
        !self.heartbeat.incoming.is_zero()
            && now.saturating_duration_since(self.last_received) > self.heartbeat.incoming * 2
    }

    /// Subscribe to `destination`.
    pub fn subscribe(&mut self, destination: &str, ack: AckMode) -> SubscriptionHandle {
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;

        let frame = Frame::new(Command::Subscribe)
            .header("id", id.clone())
            .header("destination", destination)
            .header("ack", ack.as_str());
        self.transport.send(frame.encode());
        log::debug!("[Stomp] Subscribed {} to {}", id, destination);

        SubscriptionHandle {
            id,
            destination: destination.to_string(),
            ack,
        }
    }

    /// Cancel a subscription. No-op once the transport is closed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let frame = Frame::new(Command::Unsubscribe).header("id", handle.id.clone());
        self.transport.send(frame.encode());
        log::debug!("[Stomp] Unsubscribed {}", handle.id);
    }

    /// Acknowledge a MESSAGE frame.
    ///
    /// STOMP 1.2 servers send an `ack` header naming the id to acknowledge;
    /// 1.1 servers are acknowledged by `message-id` and `subscription`.
    pub fn ack(&self, message: &Frame) {
        let frame = if let Some(ack_id) = message.get_header("ack") {
            Frame::new(Command::Ack).header("id", ack_id)
        } else if let Some(message_id) = message.get_header("message-id") {
            let mut frame = Frame::new(Command::Ack).header("message-id", message_id);
            if let Some(subscription) = message.get_header("subscription") {
                frame = frame.header("subscription", subscription);
            }
            frame
        } else {
            log::warn!("[Stomp] Cannot ACK message without ack or message-id header");
            return;
        };
        self.transport.send(frame.encode());
    }

    /// Send a heartbeat EOL.
    pub fn send_heartbeat(&self) {
        self.transport.send(HEARTBEAT);
    }

    /// Send DISCONNECT (best effort) and close the transport.
    pub fn disconnect(&mut self) {
        if self.connected {
            self.transport.send(Frame::new(Command::Disconnect).encode());
        }
        self.connected = false;
        self.transport.close();
    }

    /// Wait for the next session event.
    ///
    /// Heartbeats and unparseable frames are consumed internally. Cancel
    /// safe: decoded frames are queued before the next suspension point.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }

            match self.transport.recv().await {
                Some(TransportEvent::Open) => {}
                Some(TransportEvent::Frame(bytes)) => {
                    self.last_received = Instant::now();
                    for item in decode(&bytes) {
                        self.absorb(item);
                    }
                }
                Some(TransportEvent::Closed(reason)) => {
                    self.connected = false;
                    return SessionEvent::Closed(reason);
                }
                None => {
                    self.connected = false;
                    return SessionEvent::Closed("transport dropped".to_string());
                }
            }
        }
    }

    fn absorb(&mut self, item: Result<Decoded, super::frame::FrameError>) {
        match item {
            Ok(Decoded::Heartbeat) => log::trace!("[Stomp] Heartbeat received"),
            Ok(Decoded::Frame(frame)) => match frame.command {
                Command::Message => self.pending.push_back(SessionEvent::Message(frame)),
                Command::Receipt => {
                    let id = frame.get_header("receipt-id").unwrap_or_default().to_string();
                    self.pending.push_back(SessionEvent::Receipt(id));
                }
                Command::Error => {
                    self.connected = false;
                    self.pending
                        .push_back(SessionEvent::ServerError(error_message(&frame)));
                }
                other => log::debug!("[Stomp] Ignoring unexpected {} frame", other),
            },
            Err(e) => log::warn!("[Stomp] Dropping unparseable frame: {e}"),
        }
    }
}

fn error_message(frame: &Frame) -> String {
    frame
        .get_header("message")
        .map(str::to_string)
        .or_else(|| frame.body_str().map(|b| b.trim().to_string()))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "unspecified server error".to_string())
}
