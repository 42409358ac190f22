//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] basket_core::CoreError),

    #[error("Routing error: {0}")]
    Routing(#[from] basket_routing::RoutingError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] basket_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
