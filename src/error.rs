//! Error types for the robot movement interface runtime

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Connection fault: {0}")]
    ConnectionFault(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Event loop is not running")]
    EventLoopStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DriverError {
    pub fn is_unknown_target(&self) -> bool {
        matches!(self, DriverError::UnknownTarget(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, DriverError::Configuration(_))
    }
}
