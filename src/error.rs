//! Replicore Error Types

use thiserror::Error;

/// Result type alias for replicore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Replicore error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Oplog errors
    #[error("Oplog start missing: {0}")]
    OplogStartMissing(String),

    // Sync source errors
    #[error("Invalid sync source: {0}")]
    InvalidSyncSource(String),

    // Initial sync errors
    #[error("Initial sync failure: {0}")]
    InitialSyncFailure(String),

    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    // Cancellation: delivered to the callbacks of a canceled subtask
    #[error("Callback canceled")]
    CallbackCanceled,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // API misuse
    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    // Parsing errors
    #[error("Failed to parse: {0}")]
    FailedToParse(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Scheduling errors
    #[error("Executor error: {0}")]
    Executor(String),
}

impl Error {
    /// Check if this error is a cancellation, treated as a clean exit
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::CallbackCanceled)
    }

    /// Check if this error is a network failure
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Check if this error is worth retrying against another sync source
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::InvalidSyncSource(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::CallbackCanceled.is_canceled());
        assert!(!Error::Network("down".into()).is_canceled());
        assert!(Error::Network("down".into()).is_retryable());
        assert!(Error::InvalidSyncSource("none".into()).is_retryable());
        assert!(!Error::InitialSyncFailure("clone".into()).is_retryable());
    }
}
