//! Cross-process lease timing

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing knobs for the store-backed lease lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Interval between lock polls, renewals and the post-write settle window
    #[serde(default = "LeaseConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a lease outlives its last renewal
    #[serde(default = "LeaseConfig::default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    /// Interval between stale-lock sweeps
    #[serde(default = "LeaseConfig::default_stale_check_interval_ms")]
    pub stale_check_interval_ms: u64,
}

impl LeaseConfig {
    fn default_poll_interval_ms() -> u64 {
        150
    }

    fn default_lease_timeout_ms() -> u64 {
        60_000
    }

    fn default_stale_check_interval_ms() -> u64 {
        30_000
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_millis(self.stale_check_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than zero"));
        }
        if self.stale_check_interval_ms == 0 {
            return Err(anyhow!("stale_check_interval_ms must be greater than zero"));
        }
        if self.lease_timeout_ms < self.poll_interval_ms {
            return Err(anyhow!(
                "lease_timeout_ms ({}) must not be shorter than poll_interval_ms ({})",
                self.lease_timeout_ms,
                self.poll_interval_ms
            ));
        }
        Ok(())
    }

    /// Shorter lease so abandoned locks clear quickly in tests.
    pub fn testing() -> Self {
        Self {
            poll_interval_ms: 50,
            lease_timeout_ms: 5_000,
            stale_check_interval_ms: 1_000,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            lease_timeout_ms: Self::default_lease_timeout_ms(),
            stale_check_interval_ms: Self::default_stale_check_interval_ms(),
        }
    }
}
