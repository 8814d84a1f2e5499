//! Error types for the dispatch domain.

use thiserror::Error;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors that can occur in the dispatch engine.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Redis queue error.
    #[error("Queue error: {0}")]
    Queue(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Template rendering error.
    #[error("Template rendering error: {0}")]
    Template(String),

    /// Email provider error.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Recipient list failed validation.
    #[error("Invalid recipients: {0}")]
    InvalidRecipients(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        DispatchError::Queue(err.to_string())
    }
}

impl From<core_config::ConfigError> for DispatchError {
    fn from(err: core_config::ConfigError) -> Self {
        DispatchError::Config(err.to_string())
    }
}

impl DispatchError {
    /// Check if this is a Redis connection error that warrants backoff
    /// rather than an immediate retry of the loop iteration.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Queue(s) | Self::Internal(s) => {
                let lower = s.to_lowercase();
                lower.contains("connection")
                    || lower.contains("disconnected")
                    || lower.contains("broken pipe")
                    || lower.contains("reset by peer")
                    || lower.contains("refused")
                    || lower.contains("eof")
                    || lower.contains("io error")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatchError::Provider("smtp handshake failed".to_string());
        assert_eq!(err.to_string(), "Provider error: smtp handshake failed");
    }

    #[test]
    fn test_is_connection_error() {
        let err = DispatchError::Queue("connection refused".to_string());
        assert!(err.is_connection_error());

        let err = DispatchError::Queue("broken pipe while reading".to_string());
        assert!(err.is_connection_error());

        let err = DispatchError::Template("missing variable".to_string());
        assert!(!err.is_connection_error());
    }
}
