use thiserror::Error;

use canary_state::StateError;
use canary_transport::TransportError;

/// Errors surfaced by the node engine and its handle.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transaction {0} is already in flight")]
    RolloutInFlight(String),

    #[error("transaction log unavailable: {0}")]
    LogUnavailable(String),

    #[error("node diverged from its peers: {0}")]
    Diverged(String),

    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("node engine stopped")]
    Stopped,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type NodeResult<T> = Result<T, NodeError>;
