//! STOMP messaging subprotocol.
//!
//! - [`frame`] - wire codec (`COMMAND\nheader:value\n\nBODY\0`)
//! - [`session`] - handshake, subscriptions, acknowledgements, heartbeats

pub mod frame;
pub mod session;

pub use frame::{Command, Decoded, Frame, FrameError};
pub use session::{
    AckMode, ConnectOptions, HeartBeat, SessionEvent, StompSession, SubscriptionHandle,
};
