//! Runtime configuration for the relay.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Endpoint;

pub const DEFAULT_HOSTNAME: &str = "report.pskreporter.info";
pub const DEFAULT_PORT: u16 = 4739;
pub const DEFAULT_TEST_PORT: u16 = 14739;
pub const DEFAULT_SEND_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_TIME_REFRESH_MS: u64 = 500;
pub const DEFAULT_BUS_ADDRESS: u8 = 0x2A;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Report to the test port instead of the production one.
    pub test_mode: bool,
    pub hostname: String,
    pub port: u16,
    pub test_port: u16,
    /// Period of the automatic send request.
    pub send_interval_secs: u64,
    /// Period of the time-of-day refresh.
    pub time_refresh_ms: u64,
    /// Slave address on the peripheral bus.
    pub bus_address: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            test_mode: false,
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            test_port: DEFAULT_TEST_PORT,
            send_interval_secs: DEFAULT_SEND_INTERVAL_SECS,
            time_refresh_ms: DEFAULT_TIME_REFRESH_MS,
            bus_address: DEFAULT_BUS_ADDRESS,
        }
    }
}

impl RelayConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("send_interval_secs"));
        }
        if self.time_refresh_ms == 0 {
            return Err(ConfigError::ZeroInterval("time_refresh_ms"));
        }
        Ok(())
    }

    /// Where reports go, according to `test_mode`.
    pub fn endpoint(&self) -> Endpoint {
        let port = if self.test_mode {
            self.test_port
        } else {
            self.port
        };
        Endpoint::new(self.hostname.clone(), port)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }

    pub fn time_refresh(&self) -> Duration {
        Duration::from_millis(self.time_refresh_ms)
    }
}
