//! Router configuration.

use basket_adapter::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Skip latency and extra pipeline stages. Heartbeat and offline stay.
    #[serde(default)]
    pub ignore_extra_adapters: bool,
    /// Wrap backends in the offline buffering stage. Default: true.
    #[serde(default = "default_true")]
    pub support_offline: bool,
    /// Wrap backends in the order latency stage. Default: true.
    #[serde(default = "default_true")]
    pub latency_tracking: bool,
    /// Heartbeat for backends without an explicit setting. Default: true.
    #[serde(default = "default_true")]
    pub heartbeat_enabled: bool,
    /// Idle time before a backend is pinged (ms). Default: 30,000.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Time a ping may go unanswered (ms). Default: 10,000.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Report the basket connected as soon as one backend is. Default: true.
    #[serde(default = "default_true")]
    pub connect_event_on_first_adapter: bool,
    /// Drop buffered messages on reset. Default: true.
    #[serde(default = "default_true")]
    pub clear_pending_on_reset: bool,
    /// Pin portfolios and securities to the backend that reported them.
    #[serde(default)]
    pub learn_routes_from_replies: bool,
    /// Retired child ids remembered for dropping late data. Default: 100,000.
    #[serde(default = "default_retired_id_capacity")]
    pub retired_id_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_retired_id_capacity() -> usize {
    100_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            ignore_extra_adapters: false,
            support_offline: default_true(),
            latency_tracking: default_true(),
            heartbeat_enabled: default_true(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            connect_event_on_first_adapter: default_true(),
            clear_pending_on_reset: default_true(),
            learn_routes_from_replies: false,
            retired_id_capacity: default_retired_id_capacity(),
        }
    }
}

impl RouterConfig {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            support_offline: self.support_offline,
            latency_tracking: self.latency_tracking,
            ignore_extra_adapters: self.ignore_extra_adapters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: RouterConfig = toml::from_str("").unwrap();
        assert!(config.support_offline);
        assert!(config.heartbeat_enabled);
        assert!(!config.ignore_extra_adapters);
        assert!(!config.learn_routes_from_replies);
        assert_eq!(config.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn test_pipeline_config_mapping() {
        let config = RouterConfig {
            ignore_extra_adapters: true,
            heartbeat_timeout_ms: 500,
            ..Default::default()
        };
        let pipeline = config.pipeline_config();
        assert!(pipeline.ignore_extra_adapters);
        assert_eq!(pipeline.heartbeat_timeout, Duration::from_millis(500));
    }
}
