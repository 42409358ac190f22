//! Basket simulator - Entry Point
//!
//! Routes a scripted request set across simulated backends.

use anyhow::Result;
use basket_app::{AppConfig, Application};
use clap::Parser;
use tracing::info;

/// Basket router in front of simulated backends
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via BASKET_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Stop after this many milliseconds (overrides run_duration_ms)
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Print Prometheus metrics on exit
    #[arg(long)]
    metrics_dump: bool,

    /// Print the run summary as JSON on exit
    #[arg(long)]
    summary_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    basket_telemetry::init_logging()?;

    info!("Starting basket-sim v{}", env!("CARGO_PKG_VERSION"));

    // Config path: CLI arg > BASKET_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("BASKET_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");

    let mut config = AppConfig::from_file(&config_path)?;
    if let Some(duration) = args.duration_ms {
        config.run_duration_ms = Some(duration);
    }
    info!(
        adapters = config.adapters.len(),
        requests = config.requests.len(),
        "Configuration loaded"
    );

    let app = Application::new(config)?;
    let summary = app.run().await?;

    if args.metrics_dump {
        println!("{}", basket_telemetry::Metrics::render()?);
    }
    if args.summary_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(())
}
