//! Error types for the beacon pipeline library

use thiserror::Error;

/// Result type alias for pipeline setup operations
pub type Result<T> = std::result::Result<T, BeaconError>;

/// Errors returned while building or configuring a pipeline
#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Runtime initialization failed: {0}")]
    RuntimeError(String),

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("Pipeline already has an active byte source")]
    SourceAttached,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl BeaconError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        Self::RuntimeError(msg.into())
    }
}

/// Failure of the byte source feeding the acquisition thread
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Transport I/O failure: {0}")]
    Io(String),

    #[error("Connect failed after {attempts} attempts: {reason}")]
    ConnectFailed { attempts: u32, reason: String },
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Failure of a single pose query
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoseError {
    #[error("Pose unavailable: {0}")]
    Unavailable(String),

    #[error("Pose query timed out")]
    Timeout,

    #[error("Pose contains non-finite values")]
    Invalid,
}
