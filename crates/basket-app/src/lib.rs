//! Simulated basket router.
//!
//! Wires a `BasketRouter` in front of simulated backends described in a
//! TOML file, connects them, plays a startup request script and then
//! publishes market data until stopped.

pub mod app;
pub mod config;
pub mod error;

pub use app::{Application, RunSummary};
pub use config::{AdapterConfig, AppConfig, RequestConfig, RoutesConfig, SecurityRouteConfig};
pub use error::{AppError, AppResult};
