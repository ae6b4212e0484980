//! Tests for ConfigBuilder functionality

use super::*;
use std::path::PathBuf;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_creation() {
        let builder = ConfigBuilder::new();
        assert!(builder.state_dir.is_none());
        assert!(builder.local_app_path.is_none());
        assert!(builder.poll_interval_ms.is_none());
        assert!(builder.log_level.is_none());
        assert!(builder.environment.is_none());
    }

    #[test]
    fn test_config_builder_state_dir() {
        let path = PathBuf::from("/tmp/localapp-state");
        let config = ConfigBuilder::new().with_state_dir(path.clone()).build();
        assert_eq!(config.store.state_dir, path);
    }

    #[test]
    fn test_config_builder_local_app_path() {
        let path = PathBuf::from("/opt/companion/companion");
        let config = Config::builder().with_local_app_path(path.clone()).build();
        assert_eq!(config.installer.local_app_path, Some(path));
    }

    #[test]
    fn test_config_builder_defaults_to_development() {
        let config = ConfigBuilder::new().build();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.lease.poll_interval_ms, 150);
    }

    #[test]
    fn test_config_builder_testing_profile_with_overrides() {
        let config = ConfigBuilder::new()
            .for_environment(ConfigEnvironment::Testing)
            .with_poll_interval_ms(25)
            .with_log_level("error")
            .build();

        assert_eq!(config.lease.poll_interval_ms, 25);
        assert_eq!(config.lease.lease_timeout_ms, 5_000);
        assert_eq!(config.logging.level, "error");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_rejects_zero_poll_interval_on_validate() {
        let config = ConfigBuilder::new().with_poll_interval_ms(0).build();
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("poll_interval_ms"));
    }
}
