//! RPC connection broker configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and timeout settings for calls into the helper's RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Delay between attempts while the endpoint is still coming up
    #[serde(default = "BrokerConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Per-request timeout
    #[serde(default = "BrokerConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl BrokerConfig {
    fn default_retry_delay_ms() -> u64 {
        1_000
    }

    fn default_request_timeout_secs() -> u64 {
        30
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_delay_ms == 0 {
            return Err(anyhow!("retry_delay_ms must be greater than zero"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than zero"));
        }
        Ok(())
    }

    pub fn testing() -> Self {
        Self {
            retry_delay_ms: 100,
            request_timeout_secs: 5,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: Self::default_retry_delay_ms(),
            request_timeout_secs: Self::default_request_timeout_secs(),
        }
    }
}
