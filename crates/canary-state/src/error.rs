use thiserror::Error;

/// Errors from the routing state model and the transaction log.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open transaction log: {0}")]
    Open(String),

    #[error("log write error: {0}")]
    Write(String),

    #[error("log read error: {0}")]
    Read(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    #[error("log entry out of order at offset {offset}: {reason}")]
    OutOfOrder { offset: u64, reason: String },
}

pub type StateResult<T> = Result<T, StateError>;
