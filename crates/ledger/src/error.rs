//! Error types for the ledger crate

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading, saving, or locking state
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// State content could not be understood
    #[error("state file {} is corrupt: {message}", .path.display())]
    Corrupt {
        /// Location of the offending state
        path: PathBuf,
        /// What was wrong with it
        message: String,
    },

    /// Another writer holds the lock
    #[error("state {} is locked by {holder}", .path.display())]
    Locked {
        /// Path of the lock file
        path: PathBuf,
        /// Contents of the lock file (pid and acquisition time)
        holder: String,
    },

    /// Failed to serialize state
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Failed to move the temporary file into place
    #[error("failed to persist state to {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No record exists for the key
    #[error("no state record for {0}")]
    UnknownRecord(String),
}

impl Error {
    /// Whether the error means the persisted state cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;
