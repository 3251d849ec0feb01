use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShaprError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Redis connection error: {0}")]
    RedisConnectionError(#[from] redis::RedisError),

    #[error("Redis command error: {0}")]
    RedisCommandError(String),

    #[error("Script execution error: {0}")]
    ScriptExecutionError(String),

    #[error("Store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("File system error: {0}")]
    FileSystemError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ShaprError {
    /// Backend failures the traffic layer absorbs: callers proceed with a
    /// default instead of surfacing the error.
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            ShaprError::RedisConnectionError(_)
                | ShaprError::RedisCommandError(_)
                | ShaprError::ScriptExecutionError(_)
                | ShaprError::StoreTimeout(_)
                | ShaprError::StoreUnavailable(_)
        )
    }

    /// Failures that mean the remote store is gone, not just slow.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            ShaprError::RedisConnectionError(err) => {
                err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_timeout()
            }
            ShaprError::StoreUnavailable(_) => true,
            _ => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ShaprError::ConfigurationError(_) => "configuration",
            ShaprError::InvalidPolicy(_) => "invalid_policy",
            ShaprError::RedisConnectionError(_) => "connection",
            ShaprError::RedisCommandError(_) => "command",
            ShaprError::ScriptExecutionError(_) => "script",
            ShaprError::StoreTimeout(_) => "timeout",
            ShaprError::StoreUnavailable(_) => "unavailable",
            ShaprError::SerializationError(_) => "serialization",
            ShaprError::FileSystemError(_) => "filesystem",
            ShaprError::JsonError(_) => "json",
            ShaprError::InternalError(_) => "internal",
        }
    }
}

/// Result type alias for traffic shaping operations
pub type Result<T> = std::result::Result<T, ShaprError>;
