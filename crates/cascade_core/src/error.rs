//! Error types for the object store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
///
/// Only identifier, registration, and permission errors surface through
/// public operations; load, write, and indexing failures are logged and
/// absorbed so the background pipeline stays live, with write failures
/// additionally reported through the class's db-failure signal.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The identifier is malformed: zero, or a string that parses as a
    /// positive number (which must be supplied as a number).
    #[error("bad entity id: {id}")]
    BadId {
        /// The rejected identifier text.
        id: String,
    },

    /// A class with this name is already registered.
    #[error("class already registered: {name}")]
    AlreadyRegistered {
        /// The duplicate name.
        name: String,
    },

    /// A named source class has not been registered.
    #[error("unknown class: {name}")]
    UnknownClass {
        /// The missing name.
        name: String,
    },

    /// A permission check rejected the call.
    #[error("access denied by '{check}': {diagnostic}")]
    AccessDenied {
        /// Name of the failing permission check.
        check: String,
        /// The check's diagnostic.
        diagnostic: String,
    },

    /// KV engine error.
    #[error("kv engine error: {0}")]
    Kv(#[from] cascade_kv::KvError),

    /// I/O error (reading a transform source file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key codec error.
    #[error("key codec error: {0}")]
    Codec(#[from] cascade_codec::CodecError),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A row failed to load after one retry.
    #[error("load failed for {class}/{id}: {message}")]
    LoadFailed {
        /// Class name.
        class: String,
        /// Entity id text.
        id: String,
        /// Description of the failure.
        message: String,
    },

    /// Persisted bytes failed validation.
    #[error("corrupt row data: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },
}

impl StoreError {
    /// Creates a bad-id error.
    pub fn bad_id(id: impl Into<String>) -> Self {
        Self::BadId { id: id.into() }
    }

    /// Creates an already-registered error.
    pub fn already_registered(name: impl Into<String>) -> Self {
        Self::AlreadyRegistered { name: name.into() }
    }

    /// Creates an unknown-class error.
    pub fn unknown_class(name: impl Into<String>) -> Self {
        Self::UnknownClass { name: name.into() }
    }

    /// Creates an access-denied error.
    pub fn access_denied(check: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self::AccessDenied {
            check: check.into(),
            diagnostic: diagnostic.into(),
        }
    }

    /// Creates a load-failed error.
    pub fn load_failed(
        class: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::LoadFailed {
            class: class.into(),
            id: id.into(),
            message: message.into(),
        }
    }

    /// Creates a corrupt-row error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}
