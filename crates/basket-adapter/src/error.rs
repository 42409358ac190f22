//! Adapter error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Adapter {0} has no outbound channel bound")]
    NotBound(String),

    #[error("Adapter {0} outbound channel closed")]
    ChannelClosed(String),

    #[error("Adapter {name} rejected message: {reason}")]
    Rejected { name: String, reason: String },
}

pub type AdapterResult<T> = Result<T, AdapterError>;
