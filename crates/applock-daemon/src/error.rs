//! Error types for the AppLock daemon

use thiserror::Error;

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Errors that can occur in the daemon
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] applock_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential store error
    #[error("Credential error: {0}")]
    Credential(String),

    /// No credential has been set up yet
    #[error("No credential set - configure a PIN or pattern first")]
    CredentialNotSet,

    /// Foreground source error
    #[error("Foreground source error: {0}")]
    Source(String),

    /// IPC error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The enforcer task is gone
    #[error("Enforcer is not running")]
    EnforcerStopped,
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::Serialization(e.to_string())
    }
}
