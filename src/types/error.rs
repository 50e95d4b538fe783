//! Error types for Tally

/// Main error type for Tally operations
#[derive(Debug, thiserror::Error)]
pub enum TallyError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid value for key {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TallyError {
    /// Whether this error comes from shared infrastructure (transport, timeout)
    /// rather than from the data or the caller.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::Nats(_) | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

impl From<async_nats::Error> for TallyError {
    fn from(err: async_nats::Error) -> Self {
        Self::Nats(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TallyError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}

/// Result type alias for Tally operations
pub type Result<T> = std::result::Result<T, TallyError>;
