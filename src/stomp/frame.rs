//! STOMP frame codec.
//!
//! Wire grammar:
//!
//! ```text
//! COMMAND EOL
//! (header ":" value EOL)*
//! EOL
//! BODY NUL
//! ```
//!
//! `EOL` is `\n` or `\r\n`. A bare `EOL` outside a frame is a heartbeat.
//! One transport message may carry several frames and heartbeats, so
//! [`decode`] returns a list. A `content-length` header, when present,
//! takes precedence over scanning for the NUL terminator.

use bytes::Bytes;

/// STOMP command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client handshake.
    Connect,
    /// Alternative client handshake (STOMP 1.2).
    Stomp,
    /// Server handshake reply.
    Connected,
    /// Open a subscription.
    Subscribe,
    /// Close a subscription.
    Unsubscribe,
    /// Server push on a subscription.
    Message,
    /// Acknowledge a message.
    Ack,
    /// Reject a message.
    Nack,
    /// Client send to a destination.
    Send,
    /// Graceful client shutdown.
    Disconnect,
    /// Server receipt.
    Receipt,
    /// Server error; the server closes the connection after sending it.
    Error,
}

impl Command {
    /// Wire name of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Send => "SEND",
            Self::Disconnect => "DISCONNECT",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

impl std::str::FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "MESSAGE" => Self::Message,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "SEND" => Self::Send,
            "DISCONNECT" => Self::Disconnect,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// No blank line separating headers from body.
    MissingBlankLine,
    /// Command line is not a known STOMP command.
    UnknownCommand(String),
    /// Header line without a `:` separator.
    MalformedHeader(String),
    /// Invalid escape sequence in a header.
    InvalidEscape(String),
    /// `content-length` is not a number or exceeds the data.
    BadContentLength(String),
    /// Command or headers are not UTF-8.
    NotUtf8,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingBlankLine => write!(f, "missing blank line after headers"),
            Self::UnknownCommand(cmd) => write!(f, "unknown command: {cmd:?}"),
            Self::MalformedHeader(line) => write!(f, "malformed header: {line:?}"),
            Self::InvalidEscape(value) => write!(f, "invalid header escape in {value:?}"),
            Self::BadContentLength(value) => write!(f, "bad content-length: {value}"),
            Self::NotUtf8 => write!(f, "frame head is not UTF-8"),
        }
    }
}

impl std::error::Error for FrameError {}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order.
    pub headers: Vec<(String, String)>,
    /// Frame body.
    pub body: Bytes,
}

/// One item decoded from a transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A bare EOL.
    Heartbeat,
    /// A full frame.
    Frame(Frame),
}

impl Frame {
    /// Create a frame with no headers and an empty body.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`. Repeated headers keep the first value.
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8 text, if valid.
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Serialize to wire bytes, NUL terminated.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let escape = self.command.escapes_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

/// Wire bytes of a heartbeat.
pub const HEARTBEAT: &[u8] = b"\n";

/// Decode every frame and heartbeat contained in `data`.
///
/// Each malformed frame yields an `Err` entry and decoding resumes after its
/// NUL terminator; a malformed trailing frame ends decoding.
#[must_use]
pub fn decode(data: &[u8]) -> Vec<Result<Decoded, FrameError>> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let rest = &data[pos..];
        if rest[0] == b'\n' {
            out.push(Ok(Decoded::Heartbeat));
            pos += 1;
            continue;
        }
        if rest.starts_with(b"\r\n") {
            out.push(Ok(Decoded::Heartbeat));
            pos += 2;
            continue;
        }
        // Stray NULs between frames carry no information.
        if rest[0] == 0 {
            pos += 1;
            continue;
        }

        match decode_one(rest) {
            Ok((frame, consumed)) => {
                out.push(Ok(Decoded::Frame(frame)));
                pos += consumed;
            }
            Err(e) => {
                out.push(Err(e));
                match rest.iter().position(|&b| b == 0) {
                    Some(nul) => pos += nul + 1,
                    None => break,
                }
            }
        }
    }

    out
}

/// Decode one frame at the start of `data`, returning it and the number of
/// bytes consumed (including the NUL terminator when present).
fn decode_one(data: &[u8]) -> Result<(Frame, usize), FrameError> {
    // Headers never contain NUL, so the blank line must precede the first one.
    let head_region = match data.iter().position(|&b| b == 0) {
        Some(nul) => &data[..nul],
        None => data,
    };
    let (head_end, body_start) = find_blank_line(head_region).ok_or(FrameError::MissingBlankLine)?;

    let head = std::str::from_utf8(&data[..head_end]).map_err(|_| FrameError::NotUtf8)?;
    let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

    let command: Command = lines.next().unwrap_or_default().parse()?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let frame_body = &data[body_start..];
    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| v.trim().parse::<usize>().map_err(|_| FrameError::BadContentLength(v.clone())))
        .transpose()?;

    let (body, consumed) = match content_length {
        Some(len) => {
            if len > frame_body.len() {
                return Err(FrameError::BadContentLength(format!(
                    "{len} exceeds {} available bytes",
                    frame_body.len()
                )));
            }
            let terminator = usize::from(frame_body.get(len) == Some(&0));
            (&frame_body[..len], body_start + len + terminator)
        }
        None => match frame_body.iter().position(|&b| b == 0) {
            Some(nul) => (&frame_body[..nul], body_start + nul + 1),
            None => (frame_body, data.len()),
        },
    };

    Ok((
        Frame {
            command,
            headers,
            body: Bytes::copy_from_slice(body),
        },
        consumed,
    ))
}

/// Locate the blank line ending the head: returns (head length, body offset).
fn find_blank_line(data: &[u8]) -> Option<(usize, usize)> {
    let mut idx = 0;
    while let Some(offset) = data[idx..].iter().position(|&b| b == b'\n') {
        let nl = idx + offset;
        let next = &data[nl + 1..];
        if next.first() == Some(&b'\n') {
            return Some((nl, nl + 2));
        }
        if next.starts_with(b"\r\n") {
            return Some((nl, nl + 3));
        }
        idx = nl + 1;
    }
    None
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}
