//! Error types for KV engines.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur in a KV engine.
#[derive(Debug, Error)]
pub enum KvError {
    /// I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the engine directory lock.
    #[error("engine directory locked: {path}")]
    Locked {
        /// The locked directory.
        path: String,
    },

    /// On-disk data failed validation.
    #[error("corrupt table data: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },
}

impl KvError {
    /// Creates a corruption error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}
