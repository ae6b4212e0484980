//! Error types for localapp logging

use thiserror::Error;

/// Result type for logging operations
pub type LoggingResult<T> = Result<T, LoggingError>;

/// Errors that can occur while installing the subscriber
#[derive(Error, Debug)]
pub enum LoggingError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Log file could not be opened
    #[error("Log file error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&str> for LoggingError {
    fn from(s: &str) -> Self {
        LoggingError::Config(s.to_string())
    }
}

impl From<String> for LoggingError {
    fn from(s: String) -> Self {
        LoggingError::Config(s)
    }
}
