//! Helper process launch configuration
//!
//! Everything here ends up in the spawned process's environment; the helper
//! reads no command-line arguments.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Ask the helper to open tunnels for running workspaces on startup
    #[serde(default = "SupervisorConfig::default_auto_tunnel")]
    pub auto_tunnel: bool,

    /// Verbose helper logging
    #[serde(default)]
    pub verbose: bool,

    /// Helper exits after this much idle time (helper default when unset)
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Editor URI scheme used to build the auth callback URL
    #[serde(default = "SupervisorConfig::default_uri_scheme")]
    pub uri_scheme: String,

    /// Authority (extension id) of the auth callback URL
    #[serde(default = "SupervisorConfig::default_callback_authority")]
    pub callback_authority: String,

    /// Directory receiving the helper's stdout/stderr log
    #[serde(default = "SupervisorConfig::default_log_dir")]
    pub log_dir: PathBuf,

    /// A process still running after this window counts as launched
    #[serde(default = "SupervisorConfig::default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

impl SupervisorConfig {
    fn default_auto_tunnel() -> bool {
        true
    }

    fn default_uri_scheme() -> String {
        "vscode".to_string()
    }

    fn default_callback_authority() -> String {
        "localapp.companion".to_string()
    }

    fn default_log_dir() -> PathBuf {
        crate::default_runtime_root().join("logs")
    }

    fn default_startup_grace_ms() -> u64 {
        500
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Callback URL the helper redirects to after browser authentication.
    pub fn auth_redirect_url(&self) -> String {
        format!(
            "{}://{}/complete-auth",
            self.uri_scheme, self.callback_authority
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.uri_scheme.trim().is_empty() {
            return Err(anyhow!("uri_scheme must not be empty"));
        }
        if self.callback_authority.trim().is_empty() {
            return Err(anyhow!("callback_authority must not be empty"));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(anyhow!("idle_timeout_secs must be greater than zero when set"));
        }
        Ok(())
    }

    pub fn testing() -> Self {
        Self {
            startup_grace_ms: 200,
            ..Self::default()
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auto_tunnel: Self::default_auto_tunnel(),
            verbose: false,
            idle_timeout_secs: None,
            uri_scheme: Self::default_uri_scheme(),
            callback_authority: Self::default_callback_authority(),
            log_dir: Self::default_log_dir(),
            startup_grace_ms: Self::default_startup_grace_ms(),
        }
    }
}
