//! canary-transport — framed point-to-point messaging between nodes.
//!
//! # Architecture
//!
//! - [`message`] — the closed set of protocol messages and their validation
//! - [`codec`] — `u32` length prefix + JSON [`Envelope`] frames
//! - [`tcp`] — persistent per-peer links with reconnect backoff
//! - [`local`] — in-process network for tests, with crash and link cutting
//!
//! Sending never blocks: [`Transport::send`] either queues the message or
//! reports [`TransportError::PeerUnreachable`]. Inbound envelopes land in the
//! node's inbox channel, where a single task processes them in order.

pub mod backoff;
pub mod codec;
pub mod error;
pub mod local;
pub mod message;
pub mod tcp;

pub use error::TransportError;
pub use local::{LocalNetwork, LocalTransport};
pub use message::{Envelope, Message, TxKnowledge};
pub use tcp::{TcpConfig, TcpTransport};

/// Best-effort delivery of protocol messages to configured peers.
pub trait Transport: Send + Sync {
    /// Queue `message` for `to`. Never blocks the caller.
    fn send(&self, to: &str, message: Message) -> Result<(), TransportError>;
}
