/// Error type shared by the sync layer
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handler for {kind} failed: {reason}")]
    Handler { kind: String, reason: String },

    #[error("No handler registered for {0}")]
    NoHandler(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Device is offline")]
    Offline,

    #[error("User is not signed in")]
    Unauthenticated,
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
