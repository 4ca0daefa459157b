//! Couchbase-backed session store.
//!
//! This crate persists web sessions in a Couchbase bucket instead of process
//! memory:
//! - `get`/`set`/`destroy`/`touch` with a configurable key prefix
//! - TTL derived from the store override, the cookie `maxAge`, or one day
//! - Touch policy that avoids rewriting fresh sessions on every request
//! - Optional `all`/`length`/`clear` on backends with prefix scans
//!
//! # Example
//!
//! ```rust,ignore
//! use couch_session::{CouchbaseStore, SessionRecord, StoreConfig};
//!
//! let config = StoreConfig::new()
//!     .with_hosts(["10.0.0.1:8093"])
//!     .with_credentials("sessions", "secret")
//!     .with_bucket("sessions");
//!
//! let store = CouchbaseStore::new(config)?;
//! store.wait_connected().await?;
//!
//! let session = SessionRecord::from_value(serde_json::json!({
//!     "cookie": { "maxAge": 2000 },
//!     "name": "cm",
//! }))?;
//! store.set("abc", &session).await?;
//! let loaded: Option<SessionRecord> = store.get("abc").await?;
//! ```

pub mod backend;
mod config;
mod connection;
mod error;
mod record;
mod store;
mod ttl;

pub use backend::{
    BackendError, BackendErrorKind, BackendResult, KvBackend, KvEntry, MemoryBackend,
    QueryBackend, StoredEntry,
};
pub use config::{StoreConfig, DEFAULT_BUCKET, DEFAULT_HOST, DEFAULT_PREFIX, DEFAULT_TIMEOUT_MS};
pub use connection::ConnectionState;
pub use error::{Error, Result};
pub use record::{decode, encode, Cookie, SessionRecord};
pub use store::{CouchbaseStore, SessionStore};
pub use ttl::{resolve_ttl, TouchAction, TouchPolicy, ONE_DAY_SECS};
