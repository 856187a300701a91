use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "/etc/softib/config.toml";

const DEFAULT_SCHED_TIMEOUT_MS: u64 = 500;
const DEFAULT_SCHED_HORIZON_MS: u64 = 1000;
const DEFAULT_RETRY_CNT: u8 = 7;
const DEFAULT_RNR_RETRY: u8 = 7;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("parse error: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Fabric-wide tunables. All fields have working defaults; a TOML file
/// may override any subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Physical ports per emulated device.
    pub ports_per_device: u8,
    /// Local-ack timeout before a waiting request is retransmitted.
    pub sched_timeout_ms: u64,
    /// Scheduling horizon; a QP with no work due inside it leaves the
    /// scheduler index.
    pub sched_horizon_ms: u64,
    /// Default transport retry count for new QPs.
    pub retry_cnt: u8,
    /// Default RNR retry count for new QPs (7 means infinite).
    pub rnr_retry: u8,
    /// Error-injection behaviors.
    pub behaviors: Behaviors,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            ports_per_device: 2,
            sched_timeout_ms: DEFAULT_SCHED_TIMEOUT_MS,
            sched_horizon_ms: DEFAULT_SCHED_HORIZON_MS,
            retry_cnt: DEFAULT_RETRY_CNT,
            rnr_retry: DEFAULT_RNR_RETRY,
            behaviors: Behaviors::default(),
        }
    }
}

impl FabricConfig {
    pub(crate) fn sched_timeout(&self) -> Duration {
        Duration::from_millis(self.sched_timeout_ms)
    }

    pub(crate) fn sched_horizon(&self) -> Duration {
        Duration::from_millis(self.sched_horizon_ms)
    }
}

/// Registry of opt-in misbehaviors used by fault-injection tests.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Behaviors {
    /// Fill undefined attributes of error work completions with random
    /// garbage instead of zeroes.
    pub corrupt_invalid_wc_attrs: bool,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the configuration from the default path.
    pub fn load_default() -> Result<FabricConfig, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads the configuration from the specified path.
    pub fn load_from_path(path: &str) -> Result<FabricConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: FabricConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = FabricConfig::default();
        assert_eq!(config.ports_per_device, 2);
        assert_eq!(config.retry_cnt, 7);
        assert!(!config.behaviors.corrupt_invalid_wc_attrs);
    }

    #[test]
    fn partial_toml_overrides() {
        let config: FabricConfig = toml::from_str("sched_timeout_ms = 20\n").unwrap();
        assert_eq!(config.sched_timeout(), Duration::from_millis(20));
        assert_eq!(config.ports_per_device, 2);
    }
}
