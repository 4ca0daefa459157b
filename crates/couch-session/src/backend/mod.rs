//! Key-value backends the session store writes through.
//!
//! The store never talks to a database directly. It goes through
//! [`KvBackend`], which exposes the handful of document operations a session
//! adapter needs. Two implementations ship with the crate:
//!
//! - [`QueryBackend`]: a Couchbase cluster reached through its query service
//! - [`MemoryBackend`]: an in-process map with per-key expiry

mod memory;
mod query;

pub use memory::{MemoryBackend, StoredEntry};
pub use query::QueryBackend;

use async_trait::async_trait;

/// Classification of a backend failure.
///
/// The store uses the kind to decide whether a failure is a real error or
/// just a missing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The key does not exist.
    NotFound,
    /// Temporary failure (node unavailable, connection refused, 503).
    Transient,
    /// The operation timed out.
    Timeout,
    /// Credentials were rejected.
    Auth,
    /// The backend does not implement the operation.
    Unsupported,
    /// Any other failure.
    Other,
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendErrorKind::NotFound => "not found",
            BackendErrorKind::Transient => "transient",
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::Auth => "auth",
            BackendErrorKind::Unsupported => "unsupported",
            BackendErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Error reported by a [`KvBackend`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    /// What class of failure this is.
    pub kind: BackendErrorKind,
    /// Human-readable detail from the backend.
    pub message: String,
}

impl BackendError {
    /// Create a new backend error.
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(key: &str) -> Self {
        Self::new(BackendErrorKind::NotFound, format!("key '{}' does not exist", key))
    }

    pub fn unsupported(operation: &str) -> Self {
        Self::new(
            BackendErrorKind::Unsupported,
            format!("{} is not supported", operation),
        )
    }

    /// Check if the key was missing.
    pub fn is_not_found(&self) -> bool {
        self.kind == BackendErrorKind::NotFound
    }

    /// Check if the failure is temporary.
    pub fn is_transient(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A raw key/value pair returned by a prefix scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

/// Document operations required by the session store.
///
/// Values are encoded session documents. Expiry is in seconds; `0` means the
/// document never expires.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Verify the backend is reachable and the target bucket exists.
    ///
    /// Called once by the store when it owns the connection.
    async fn connect(&self) -> BackendResult<()> {
        Ok(())
    }

    /// Fetch the value stored under `key`, or `None` if it is absent.
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// Insert or overwrite `key` unconditionally.
    async fn upsert(&self, key: &str, value: &str, expiry_secs: u64) -> BackendResult<()>;

    /// Reset the expiry of an existing key.
    ///
    /// Returns a `NotFound` error if the key is absent.
    async fn touch(&self, key: &str, expiry_secs: u64) -> BackendResult<()>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn remove(&self, key: &str) -> BackendResult<()>;

    /// Return every entry whose key starts with `prefix`.
    ///
    /// Optional capability; backends without ad-hoc queries keep the default.
    async fn scan_prefix(&self, _prefix: &str) -> BackendResult<Vec<KvEntry>> {
        Err(BackendError::unsupported("scan_prefix"))
    }

    /// Short name used in log output.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_kind() {
        let err = BackendError::not_found("sess:abc");
        assert_eq!(err.to_string(), "not found: key 'sess:abc' does not exist");
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_unsupported_error() {
        let err = BackendError::unsupported("scan_prefix");
        assert_eq!(err.kind, BackendErrorKind::Unsupported);
        assert!(err.message.contains("scan_prefix"));
    }
}
