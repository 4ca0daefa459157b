//! Error types for session store operations.

use crate::backend::BackendError;

/// Error type for session store operations.
///
/// A missing key is never an error: lookups surface it as `Ok(None)` and
/// removals treat it as success.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The store configuration is malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backing store connection could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A session record could not be encoded. No request was sent.
    #[error("Failed to serialize session: {0}")]
    Serialization(#[source] serde_json::Error),

    /// The stored bytes under `key` are not a valid session record.
    #[error("Failed to deserialize session '{key}': {source}")]
    Deserialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The backing store reported a failure.
    #[error("Storage error: {0}")]
    Storage(#[from] BackendError),

    /// The backend does not support the requested capability.
    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Check if this error came from the backing store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    /// Check if this is an encoding failure on the way out.
    pub fn is_serialization(&self) -> bool {
        matches!(self, Error::Serialization(_))
    }

    /// Check if this is a decoding failure on the way in.
    pub fn is_deserialization(&self) -> bool {
        matches!(self, Error::Deserialization { .. })
    }

    /// Check if the connection to the backing store failed.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

/// Result type for session store operations.
pub type Result<T> = std::result::Result<T, Error>;
