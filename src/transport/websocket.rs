//! WebSocket transport.
//!
//! `tokio-tungstenite` client plus a driver task that pumps the socket into
//! a [`TransportIo`].
//!
//! The configured server URL is an `http(s)` endpoint base (the same one the
//! long-poll fallback uses). The raw WebSocket lives at `<base>/websocket`
//! with the scheme swapped to `ws(s)`.

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use super::{channel, Connector, TransportCommand, TransportConnection, TransportIo, TransportKind};

/// Client socket, plain or TLS.
pub type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Upgrade offer; the broker picks the highest STOMP version it speaks.
const STOMP_SUBPROTOCOLS: &str = "v12.stomp, v11.stomp";

/// Default bound on the TCP connect plus upgrade.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a STOMP-flavoured WebSocket at `url`, giving up after `limit`.
///
/// A peer that accepts TCP but never answers the upgrade counts as a failed
/// connect, so callers can move on to another transport.
pub async fn connect(url: &str, limit: Duration) -> Result<WsStream> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;
    request.headers_mut().insert(
        tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL,
        tungstenite::http::HeaderValue::from_static(STOMP_SUBPROTOCOLS),
    );

    let upgrade = tokio_tungstenite::connect_async(request);
    let (socket, response) = tokio::time::timeout(limit, upgrade)
        .await
        .map_err(|_| anyhow::anyhow!("no upgrade response within {}ms", limit.as_millis()))?
        .context("WebSocket upgrade failed")?;

    match response.headers().get(tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL) {
        Some(protocol) => log::debug!("[WebSocket] Broker chose {protocol:?}"),
        None => log::debug!("[WebSocket] Broker did not pick a subprotocol"),
    }
    Ok(socket)
}

/// Raw WebSocket endpoint under the configured `http(s)` server URL.
///
/// `https` maps to `wss`, `http` to `ws`; `ws(s)` URLs are kept. The
/// `/websocket` suffix is appended once.
#[must_use]
pub fn websocket_url(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    let base = match trimmed.split_once("://") {
        Some(("https", rest)) => format!("wss://{rest}"),
        Some(("http", rest)) => format!("ws://{rest}"),
        _ => trimmed.to_string(),
    };
    if base.ends_with("/websocket") {
        base
    } else {
        format!("{base}/websocket")
    }
}

/// Opens WebSocket transports.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl WebSocketConnector {
    /// Connector whose upgrade attempts give up after `connect_timeout`.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<TransportConnection> {
        let ws_url = websocket_url(url);
        log::info!("[WebSocket] Connecting to {}", ws_url);

        let socket = connect(&ws_url, self.connect_timeout).await?;
        log::info!("[WebSocket] Connected");

        let (conn, io) = channel(TransportKind::WebSocket);
        io.emit_open();
        tokio::spawn(run_socket(io, socket));
        Ok(conn)
    }
}

/// Pump frames between the socket and the transport queues until either
/// side goes away.
async fn run_socket(mut io: TransportIo, socket: WsStream) {
    let (mut sink, mut stream) = socket.split();

    let reason = loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => io.emit_frame(Bytes::from(text.to_string())),
                Some(Ok(Message::Binary(data))) => io.emit_frame(Bytes::from(data.to_vec())),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        break format!("pong failed: {e}");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    log::info!("[WebSocket] Closed by server (code={code})");
                    break if reason.is_empty() { format!("closed by server ({code})") } else { reason };
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    log::warn!("[WebSocket] Read error: {e}");
                    break format!("read error: {e}");
                }
                None => break "stream ended".to_string(),
            },

            command = io.recv_command() => match command {
                Some(TransportCommand::Send(frame)) => {
                    // STOMP frames are text; anything else goes out as binary.
                    let message = match String::from_utf8(frame.to_vec()) {
                        Ok(text) => Message::Text(text.into()),
                        Err(e) => Message::Binary(e.into_bytes().into()),
                    };
                    if let Err(e) = sink.send(message).await {
                        log::warn!("[WebSocket] Write error: {e}");
                        break format!("write error: {e}");
                    }
                }
                Some(TransportCommand::Close) | None => {
                    log::debug!("[WebSocket] Closing on request");
                    let _ = sink.close().await;
                    break "closed by client".to_string();
                }
            },
        }
    };

    io.emit_closed(reason);
}
