//! HTTP long-poll transport (SockJS xhr-polling framing).
//!
//! Used when a WebSocket cannot be established. The session lives at
//! `<base>/<server_id>/<session_id>` and is driven by two endpoints:
//!
//! - `POST …/xhr` - long poll; the body is one framing message
//! - `POST …/xhr_send` - JSON array of outgoing frames
//!
//! Framing messages returned by the poll:
//!
//! | Prefix | Meaning                                   |
//! |--------|-------------------------------------------|
//! | `o`    | session open                              |
//! | `h`    | server heartbeat                          |
//! | `a`    | JSON array of string frames               |
//! | `c`    | close, `[code, "reason"]`                 |

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;

use super::{channel, Connector, TransportCommand, TransportConnection, TransportIo, TransportKind};

/// Upper bound on a single long-poll request. Servers hold polls for ~25s.
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the initial open poll.
const OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// One decoded framing message from a poll response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollFrame {
    /// `o` - session opened.
    Open,
    /// `h` - heartbeat.
    Heartbeat,
    /// `a[...]` - data frames.
    Messages(Vec<String>),
    /// `c[code,"reason"]` - session closed.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Parse one poll response body.
///
/// Returns `None` for bodies that do not follow the framing.
#[must_use]
pub fn parse_poll_body(body: &str) -> Option<PollFrame> {
    let body = body.trim_end_matches('\n');
    let (prefix, rest) = body.split_at_checked(1)?;
    match prefix {
        "o" if rest.is_empty() => Some(PollFrame::Open),
        "h" if rest.is_empty() => Some(PollFrame::Heartbeat),
        "a" => serde_json::from_str::<Vec<String>>(rest)
            .ok()
            .map(PollFrame::Messages),
        "c" => {
            let (code, reason) = serde_json::from_str::<(u16, String)>(rest).ok()?;
            Some(PollFrame::Close { code, reason })
        }
        _ => None,
    }
}

/// Build a fresh session URL under `base`.
#[must_use]
pub fn session_url(base: &str) -> String {
    let server_id: u16 = rand::rng().random_range(0..1000);
    let session_id = uuid::Uuid::new_v4().simple();
    format!(
        "{}/{:03}/{}",
        base.trim_end_matches('/'),
        server_id,
        session_id
    )
}

/// Opens long-poll transports.
#[derive(Debug, Clone, Default)]
pub struct PollingConnector {
    client: reqwest::Client,
}

impl PollingConnector {
    /// Use a specific HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for PollingConnector {
    async fn open(&self, url: &str) -> Result<TransportConnection> {
        let session = session_url(url);
        log::info!("[Polling] Opening session {}", session);

        let body = poll(&self.client, &session, OPEN_TIMEOUT).await?;
        match parse_poll_body(&body) {
            Some(PollFrame::Open) => {}
            Some(PollFrame::Close { code, reason }) => {
                anyhow::bail!("server refused session ({code}): {reason}")
            }
            _ => anyhow::bail!("unexpected open response: {}", truncate(&body, 80)),
        }
        log::info!("[Polling] Session open");

        let (conn, io) = channel(TransportKind::Polling);
        io.emit_open();
        tokio::spawn(run_session(self.client.clone(), session, io));
        Ok(conn)
    }
}

async fn poll(client: &reqwest::Client, session: &str, timeout: Duration) -> Result<String> {
    let response = client
        .post(format!("{session}/xhr"))
        .timeout(timeout)
        .send()
        .await
        .context("long-poll request failed")?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("long-poll returned HTTP {status}");
    }
    response.text().await.context("long-poll body read failed")
}

async fn send(client: &reqwest::Client, session: &str, frames: &[String]) -> Result<()> {
    let response = client
        .post(format!("{session}/xhr_send"))
        .header("Content-Type", "text/plain;charset=UTF-8")
        .body(serde_json::to_string(frames)?)
        .send()
        .await
        .context("xhr_send request failed")?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("xhr_send returned HTTP {status}");
    }
    Ok(())
}

/// Drive one polling session until it closes.
///
/// The poll loop and the send loop run concurrently; the poll loop
/// forwards its results through an internal queue so the select below is
/// the only place touching `io`.
async fn run_session(client: reqwest::Client, session: String, mut io: TransportIo) {
    let (poll_tx, mut poll_rx) = mpsc::channel::<Result<String>>(1);
    let poller = {
        let client = client.clone();
        let session = session.clone();
        tokio::spawn(async move {
            loop {
                let result = poll(&client, &session, POLL_TIMEOUT).await;
                let failed = result.is_err();
                if poll_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        })
    };

    let reason = loop {
        tokio::select! {
            result = poll_rx.recv() => match result {
                Some(Ok(body)) => match parse_poll_body(&body) {
                    Some(PollFrame::Messages(frames)) => {
                        for frame in frames {
                            io.emit_frame(frame);
                        }
                    }
                    Some(PollFrame::Heartbeat | PollFrame::Open) => {}
                    Some(PollFrame::Close { code, reason }) => {
                        log::info!("[Polling] Closed by server ({code}): {reason}");
                        break reason;
                    }
                    None => {
                        log::warn!("[Polling] Ignoring unrecognised poll body: {}", truncate(&body, 80));
                    }
                },
                Some(Err(e)) => {
                    log::warn!("[Polling] {e:#}");
                    break format!("{e:#}");
                }
                None => break "poller stopped".to_string(),
            },

            command = io.recv_command() => match command {
                Some(TransportCommand::Send(frame)) => {
                    let mut frames = vec![String::from_utf8_lossy(&frame).into_owned()];
                    let mut close_requested = false;
                    while let Some(next) = io.try_recv_command() {
                        match next {
                            TransportCommand::Send(more) => {
                                frames.push(String::from_utf8_lossy(&more).into_owned());
                            }
                            TransportCommand::Close => {
                                close_requested = true;
                                break;
                            }
                        }
                    }
                    if let Err(e) = send(&client, &session, &frames).await {
                        log::warn!("[Polling] {e:#}");
                        break format!("{e:#}");
                    }
                    if close_requested {
                        break "closed by client".to_string();
                    }
                }
                Some(TransportCommand::Close) | None => break "closed by client".to_string(),
            },
        }
    };

    poller.abort();
    io.emit_closed(reason);
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_poll_body() {
        assert_eq!(parse_poll_body("o\n"), Some(PollFrame::Open));
        assert_eq!(parse_poll_body("h\n"), Some(PollFrame::Heartbeat));
        assert_eq!(
            parse_poll_body("a[\"CONNECTED\\n\\n\\u0000\",\"x\"]\n"),
            Some(PollFrame::Messages(vec![
                "CONNECTED\n\n\0".to_string(),
                "x".to_string()
            ]))
        );
        assert_eq!(
            parse_poll_body("c[3000,\"Go away!\"]\n"),
            Some(PollFrame::Close {
                code: 3000,
                reason: "Go away!".to_string()
            })
        );
    }

    #[test]
    fn test_parse_poll_body_rejects_garbage() {
        assert_eq!(parse_poll_body(""), None);
        assert_eq!(parse_poll_body("oops"), None);
        assert_eq!(parse_poll_body("a{not-an-array}"), None);
        assert_eq!(parse_poll_body("c[\"bad\"]"), None);
    }

    #[test]
    fn test_session_url_shape() {
        let url = session_url("http://localhost:8080/ws/");
        let rest = url.strip_prefix("http://localhost:8080/ws/").unwrap();
        let parts: Vec<&str> = rest.split('/').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 3);
        assert!(parts[0].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[1].len(), 32);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
