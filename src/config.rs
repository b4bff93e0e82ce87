//! Orchestrator configuration.

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub server: ServerConfigSection,
    pub store: StoreConfigSection,
    pub health: HealthConfigSection,
    pub retry: RetryConfigSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigSection {
    pub bind_address: String,
    /// Bound capacity of each worker's outbound frame queue (spec §5 backpressure).
    pub outbound_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfigSection {
    pub sled_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfigSection {
    /// Assignment Engine / Health Loop tick period, seconds (spec §4.F, §4.H default 5s).
    pub tick_interval_secs: u64,
    /// Heartbeat silence before a worker is marked `not_responding` (spec §4.H default 30s).
    pub heartbeat_stale_secs: i64,
    /// Further silence before a worker is marked `offline` (spec §4.H default 60s).
    pub heartbeat_offline_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfigSection {
    /// Retry budget before cooldown reset (spec §4.G, §8 I4: inclusive upper bound 5).
    pub max_retries: u32,
    /// Cooldown applied after the retry budget is exhausted, seconds (spec §4.G default 30s).
    pub reset_cooldown_secs: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            server: ServerConfigSection {
                bind_address: "0.0.0.0:8080".to_string(),
                outbound_queue_capacity: 32,
            },
            store: StoreConfigSection {
                sled_path: "./data/orchestrator.sled".to_string(),
            },
            health: HealthConfigSection {
                tick_interval_secs: 5,
                heartbeat_stale_secs: 30,
                heartbeat_offline_secs: 60,
            },
            retry: RetryConfigSection {
                max_retries: 5,
                reset_cooldown_secs: 30,
            },
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file, falling back to defaults for any section not present.
    pub fn from_file(path: &str) -> OrchestratorResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(|e| {
                OrchestratorError::ConfigError(format!("failed to seed defaults: {e}"))
            })?)
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|e| OrchestratorError::ConfigError(format!("failed to read {path}: {e}")))?;

        settings
            .try_deserialize()
            .map_err(|e| OrchestratorError::ConfigError(format!("failed to parse {path}: {e}")))
    }

    /// Load from `ORCHESTRATOR_CONFIG` env var if set, otherwise defaults.
    pub fn from_env_or_default() -> OrchestratorResult<Self> {
        match std::env::var("ORCHESTRATOR_CONFIG") {
            Ok(path) => Self::from_file(&path),
            Err(_) => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.health.tick_interval_secs, 5);
        assert_eq!(cfg.health.heartbeat_stale_secs, 30);
        assert_eq!(cfg.health.heartbeat_offline_secs, 60);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.reset_cooldown_secs, 30);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = OrchestratorConfig::from_file("/nonexistent/path.toml").unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigError(_)));
    }
}
