//! Shared state store configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Location of the key/value store shared by every editor-window process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one file per key
    #[serde(default = "StoreConfig::default_state_dir")]
    pub state_dir: PathBuf,
}

impl StoreConfig {
    fn default_state_dir() -> PathBuf {
        crate::default_runtime_root().join("state")
    }

    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(anyhow!("state_dir must not be empty"));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
        }
    }
}
