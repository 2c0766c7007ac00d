//! Inventory Notifier - real-time notification delivery client.
//!
//! Keeps one authenticated connection to the inventory server, subscribes to
//! the signed-in user's private queue, and hands every pushed event to local
//! sinks (toast line, bell, desktop notification, in-process listeners).
//! Network flaps, half-open sockets and credential rotation are absorbed by a
//! supervisor that reconnects on a fixed schedule.
//!
//! # Architecture
//!
//! ```text
//! credentials ─► token ─► supervisor ─► transport ─► stomp ─► dispatch ─► sinks
//! ```
//!
//! # Modules
//!
//! - [`token`] - user id extraction from bearer credentials
//! - [`credentials`] - where the credential is read from (env, keyring, host)
//! - [`transport`] - WebSocket and HTTP long-poll byte channels
//! - [`stomp`] - frame codec and session (handshake, subscribe, heartbeats)
//! - [`supervisor`] - connection state machine with reconnect and liveness
//! - [`dispatch`] - ordered, failure-isolated fan-out to sinks
//! - [`client`] - [`NotificationClient`], the host-facing facade
//! - [`config`] - configuration loading/saving

pub mod client;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod notification;
pub mod stomp;
pub mod supervisor;
pub mod token;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientOptions, NotificationClient};
pub use config::Config;
pub use credentials::{CredentialSource, SharedCredential};
pub use dispatch::{DispatchReport, Dispatcher, NotificationSink, SinkId};
pub use error::ClientError;
pub use notification::{Level, NotificationEvent};
pub use supervisor::{ConnectionState, ReconnectPolicy, SessionSnapshot};
pub use token::{resolve_user_id, UserId};
pub use transport::{AutoConnector, Connector, TransportKind, TransportPreference};
