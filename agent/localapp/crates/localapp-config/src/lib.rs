//! Unified configuration for the localapp coordination core
//!
//! A single `Config` value drives every component of the core: the shared
//! state store location, lease timing, the installer, the process supervisor,
//! the RPC connection broker and logging.
//!
//! Configuration can be loaded from:
//! - Programmatic defaults (`Config::development()`, `Config::testing()`)
//! - A TOML file (`LOCALAPP_CONFIG_FILE`, or `./localapp.toml` when present)
//! - Environment variables (`LOCALAPP_` prefix, `__` between nested keys)
//!
//! # Example
//!
//! ```rust,no_run
//! use localapp_config::Config;
//!
//! # fn main() -> anyhow::Result<()> {
//! // LOCALAPP_LEASE__POLL_INTERVAL_MS=200 overrides lease.poll_interval_ms
//! let config = Config::from_env()?;
//! println!("state dir: {}", config.store.state_dir.display());
//! println!("lease poll: {:?}", config.lease.poll_interval());
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod broker;
pub mod installer;
pub mod lease;
pub mod store;
pub mod supervisor;

pub use broker::BrokerConfig;
pub use installer::InstallerConfig;
pub use lease::LeaseConfig;
pub use store::StoreConfig;
pub use supervisor::SupervisorConfig;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_FILE_ENV: &str = "LOCALAPP_CONFIG_FILE";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "LOCALAPP_";

/// Configuration file picked up from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "localapp.toml";

/// Configuration builder for programmatic construction
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    state_dir: Option<PathBuf>,
    local_app_path: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
    log_level: Option<String>,
    environment: Option<ConfigEnvironment>,
}

/// Configuration environment profiles
#[derive(Debug, Clone, Copy)]
pub enum ConfigEnvironment {
    Development,
    Testing,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shared state directory
    pub fn with_state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(path.into());
        self
    }

    /// Pin the helper binary to a manually installed path
    pub fn with_local_app_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_app_path = Some(path.into());
        self
    }

    /// Set the lease poll interval in milliseconds
    pub fn with_poll_interval_ms(mut self, millis: u64) -> Self {
        self.poll_interval_ms = Some(millis);
        self
    }

    /// Set log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Set environment profile
    pub fn for_environment(mut self, env: ConfigEnvironment) -> Self {
        self.environment = Some(env);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        let mut config = match self.environment.unwrap_or(ConfigEnvironment::Development) {
            ConfigEnvironment::Development => Config::development(),
            ConfigEnvironment::Testing => Config::testing(),
        };

        if let Some(path) = self.state_dir {
            config.store.state_dir = path;
        }
        if let Some(path) = self.local_app_path {
            config.installer.local_app_path = Some(path);
        }
        if let Some(millis) = self.poll_interval_ms {
            config.lease.poll_interval_ms = millis;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        config
    }
}

/// Unified localapp configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Shared state store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Cross-process lease timing
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Helper binary installation
    #[serde(default)]
    pub installer: InstallerConfig,

    /// Helper process launch
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// RPC connection broker
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json_format: bool,

    /// Log file path (optional, stderr otherwise)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    /// Level names accepted by the `EnvFilter` directive.
    pub const LEVELS: [&'static str; 5] = ["error", "warn", "info", "debug", "trace"];

    /// Reject unknown levels and log files whose directory is missing.
    pub fn validate(&self) -> Result<()> {
        if !Self::LEVELS.contains(&self.level.as_str()) {
            return Err(anyhow!(
                "unknown log level `{}` (expected one of {})",
                self.level,
                Self::LEVELS.join("/")
            ));
        }

        let missing_dir = self
            .log_file
            .as_deref()
            .and_then(Path::parent)
            .filter(|dir| !dir.as_os_str().is_empty() && !dir.exists());
        if let Some(dir) = missing_dir {
            return Err(anyhow!("log directory {} does not exist", dir.display()));
        }

        Ok(())
    }

    /// Verbose console logging for local development.
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            log_file: None,
        }
    }

    /// Quiet logging profile used in automated tests.
    pub fn testing() -> Self {
        Self {
            level: "warn".to_string(),
            json_format: false,
            log_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json_format: false,
            log_file: None,
        }
    }
}

impl Config {
    /// Create a new configuration builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Defaults for an interactive editor session.
    pub fn development() -> Self {
        Self {
            store: StoreConfig::default(),
            lease: LeaseConfig::default(),
            installer: InstallerConfig::default(),
            supervisor: SupervisorConfig::default(),
            broker: BrokerConfig::default(),
            logging: LoggingConfig::development(),
        }
    }

    /// Short intervals and quiet logs for automated tests.
    pub fn testing() -> Self {
        Self {
            store: StoreConfig::default(),
            lease: LeaseConfig::testing(),
            installer: InstallerConfig::default(),
            supervisor: SupervisorConfig::testing(),
            broker: BrokerConfig::testing(),
            logging: LoggingConfig::testing(),
        }
    }

    /// Load configuration from defaults, an optional TOML file and the
    /// environment, in increasing order of precedence.
    ///
    /// Environment variables use the pattern `LOCALAPP_<SECTION>__<SETTING>`,
    /// for example `LOCALAPP_LEASE__POLL_INTERVAL_MS` or
    /// `LOCALAPP_INSTALLER__LOCAL_APP_PATH`.
    pub fn from_env() -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Toml},
            Figment,
        };

        let mut figment = Figment::from(Serialized::defaults(Config::development()));

        if let Some(config_path) = std::env::var_os(CONFIG_FILE_ENV) {
            let path = PathBuf::from(&config_path);
            if !path.exists() {
                return Err(anyhow!(
                    "Configuration file specified by {} does not exist: {}",
                    CONFIG_FILE_ENV,
                    path.display()
                ));
            }
            figment = figment.merge(Toml::file(path));
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment
            .extract()
            .context("Failed to load configuration from environment")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.store
            .validate()
            .context("Store configuration validation failed")?;
        self.lease
            .validate()
            .context("Lease configuration validation failed")?;
        self.installer
            .validate()
            .context("Installer configuration validation failed")?;
        self.supervisor
            .validate()
            .context("Supervisor configuration validation failed")?;
        self.broker
            .validate()
            .context("Broker configuration validation failed")?;
        self.logging
            .validate()
            .context("Logging configuration validation failed")?;
        Ok(())
    }
}

/// Root directory for files the core creates under the system temp dir.
pub(crate) fn default_runtime_root() -> PathBuf {
    std::env::temp_dir().join("localapp")
}


#[cfg(test)]
mod config_builder_tests;
