//! Helper binary installation

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Installer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Manually installed helper binary; disables downloads when set
    #[serde(default)]
    pub local_app_path: Option<PathBuf>,

    /// Directory downloaded binaries are written to
    #[serde(default = "InstallerConfig::default_install_dir")]
    pub install_dir: PathBuf,

    /// Minimum time between update probes of an installed binary
    #[serde(default = "InstallerConfig::default_update_check_interval_secs")]
    pub update_check_interval_secs: u64,

    /// Upper bound for a single download
    #[serde(default = "InstallerConfig::default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl InstallerConfig {
    fn default_install_dir() -> PathBuf {
        crate::default_runtime_root().join("bin")
    }

    fn default_update_check_interval_secs() -> u64 {
        600
    }

    fn default_download_timeout_secs() -> u64 {
        300
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_timeout_secs == 0 {
            return Err(anyhow!("download_timeout_secs must be greater than zero"));
        }
        if let Some(ref path) = self.local_app_path {
            if path.as_os_str().is_empty() {
                return Err(anyhow!("local_app_path must not be empty when set"));
            }
        }
        Ok(())
    }
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            local_app_path: None,
            install_dir: Self::default_install_dir(),
            update_check_interval_secs: Self::default_update_check_interval_secs(),
            download_timeout_secs: Self::default_download_timeout_secs(),
        }
    }
}
