use thiserror::Error;

use canary_state::NodeId;

/// Errors raised while framing or delivering peer messages.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    PeerUnreachable(NodeId),

    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind listener: {0}")]
    Bind(String),
}
