//! Error types for basket-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid security id: {0}")]
    InvalidSecurityId(String),

    #[error("Invalid transaction id: {0}")]
    InvalidTransactionId(String),

    #[error("Unknown data kind: {0}")]
    UnknownDataKind(String),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
