//! The session store adapter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backend::{BackendError, BackendErrorKind, KvBackend, KvEntry, QueryBackend};
use crate::config::StoreConfig;
use crate::connection::{self, ConnectionState};
use crate::error::{Error, Result};
use crate::record::{self, SessionRecord};
use crate::ttl::{resolve_ttl, TouchAction, TouchPolicy};

/// Store contract expected by the session middleware.
///
/// Each call resolves exactly once with either a value or an error. A
/// missing session is `Ok(None)` from `get` and success from `destroy`.
#[async_trait]
pub trait SessionStore<D = Map<String, Value>>: Send + Sync
where
    D: Send + Sync + 'static,
{
    /// Load the session for `sid`.
    async fn get(&self, sid: &str) -> Result<Option<SessionRecord<D>>>;

    /// Write the session for `sid`, replacing whatever was stored.
    async fn set(&self, sid: &str, session: &SessionRecord<D>) -> Result<()>;

    /// Remove the session for `sid`.
    async fn destroy(&self, sid: &str) -> Result<()>;

    /// Extend the lifetime of an unchanged session.
    async fn touch(&self, sid: &str, session: &SessionRecord<D>) -> Result<()>;

    /// Load every stored session.
    async fn all(&self) -> Result<Vec<SessionRecord<D>>> {
        Err(Error::Unsupported("all"))
    }

    /// Count stored sessions.
    async fn length(&self) -> Result<usize> {
        Err(Error::Unsupported("length"))
    }

    /// Remove every stored session.
    async fn clear(&self) -> Result<()> {
        Err(Error::Unsupported("clear"))
    }
}

/// Session store backed by a Couchbase bucket (or any [`KvBackend`]).
///
/// Every session id is stored under `prefix + sid`. The store keeps no
/// session state between calls; concurrent writes to the same id are
/// last-write-wins.
pub struct CouchbaseStore {
    backend: Arc<dyn KvBackend>,
    owns_connection: bool,
    prefix: String,
    ttl: Option<u64>,
    touch_policy: TouchPolicy,
    state: watch::Receiver<ConnectionState>,
    connect_task: Option<JoinHandle<()>>,
}

impl CouchbaseStore {
    /// Create a store that opens its own connection to the configured
    /// cluster.
    ///
    /// Returns immediately. The connection outcome is published through
    /// [`connection_events`](Self::connection_events). Must be called from
    /// within a tokio runtime.
    pub fn new(config: StoreConfig) -> Result<Self> {
        let backend = QueryBackend::new(&config)?;
        Self::with_owned_backend(config, Arc::new(backend))
    }

    /// Create a store that owns `backend` and verifies it in the background.
    pub fn with_owned_backend(config: StoreConfig, backend: Arc<dyn KvBackend>) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Config("session store must be created inside a tokio runtime".to_string())
        })?;

        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let probe = Arc::clone(&backend);
        let connect_task = runtime.spawn(async move {
            let state = match probe.connect().await {
                Ok(()) => {
                    info!(backend = probe.name(), "Session store connected");
                    ConnectionState::Connected
                }
                Err(e) => {
                    warn!(backend = probe.name(), error = %e, "Session store failed to connect");
                    ConnectionState::Disconnected(e.to_string())
                }
            };
            let _ = tx.send(state);
        });

        Ok(Self::build(config, backend, true, rx, Some(connect_task)))
    }

    /// Wrap a connection owned by the caller.
    ///
    /// The store does not probe or manage it and reports
    /// [`ConnectionState::Connected`] from the start.
    pub fn with_external_backend(config: StoreConfig, backend: Arc<dyn KvBackend>) -> Self {
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        Self::build(config, backend, false, rx, None)
    }

    fn build(
        config: StoreConfig,
        backend: Arc<dyn KvBackend>,
        owns_connection: bool,
        state: watch::Receiver<ConnectionState>,
        connect_task: Option<JoinHandle<()>>,
    ) -> Self {
        debug!(
            backend = backend.name(),
            prefix = %config.prefix,
            ttl = ?config.ttl_override(),
            owns_connection,
            "Session store created"
        );
        Self {
            ttl: config.ttl_override(),
            touch_policy: config.touch_policy,
            prefix: config.prefix,
            backend,
            owns_connection,
            state,
            connect_task,
        }
    }

    /// Key prefix applied to every session id.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the store opened (and owns) its connection.
    pub fn owns_connection(&self) -> bool {
        self.owns_connection
    }

    /// The backend this store writes through.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Subscribe to connection state changes.
    pub fn connection_events(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Wait for the initial connection attempt to finish.
    pub async fn wait_connected(&self) -> Result<()> {
        connection::wait_for(self.connection_events()).await
    }

    /// Storage key for a session id.
    pub fn storage_key(&self, sid: &str) -> String {
        format!("{}{}", self.prefix, sid)
    }

    /// Expiry in seconds that a write of `session` would use.
    pub fn ttl_for<D>(&self, session: &SessionRecord<D>) -> u64 {
        resolve_ttl(self.ttl, session.cookie.max_age)
    }

    /// Load the session for `sid`.
    ///
    /// Missing keys and transient backend failures both resolve to `None`.
    pub async fn get<D: DeserializeOwned>(&self, sid: &str) -> Result<Option<SessionRecord<D>>> {
        let key = self.storage_key(sid);
        debug!(key = %key, "GET");

        let raw = match self.backend.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) if e.is_transient() => {
                warn!(key = %key, error = %e, "Transient failure reading session, treating as absent");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        trace!(key = %key, data = %raw, "GOT");
        record::decode(&key, &raw).map(Some)
    }

    /// Write `session` under `sid` with a fresh `lastModified`.
    ///
    /// Encoding happens before any request is sent; an unencodable session
    /// fails with [`Error::Serialization`] and leaves the stored value alone.
    pub async fn set<D: Serialize>(&self, sid: &str, session: &SessionRecord<D>) -> Result<()> {
        let key = self.storage_key(sid);
        let ttl = self.ttl_for(session);
        let encoded = record::encode(session, Utc::now())?;

        debug!(key = %key, ttl, "SETEX");
        self.backend.upsert(&key, &encoded, ttl).await?;
        trace!(key = %key, "Session set complete");
        Ok(())
    }

    /// Refresh the expiry of `sid`.
    ///
    /// Depending on the touch policy this either rewrites the whole record
    /// with a new `lastModified` or only resets the expiry. A key that has
    /// disappeared is recreated from `session`.
    pub async fn touch<D: Serialize>(&self, sid: &str, session: &SessionRecord<D>) -> Result<()> {
        let key = self.storage_key(sid);
        let ttl = self.ttl_for(session);
        let now = Utc::now();

        match self.touch_policy.decide(session.last_modified, ttl, now) {
            TouchAction::Rewrite => {
                let encoded = record::encode(session, now)?;
                debug!(key = %key, ttl, "SETEX (touch)");
                self.backend.upsert(&key, &encoded, ttl).await?;
            }
            TouchAction::RefreshExpiry => {
                debug!(key = %key, ttl, "EXPIRE");
                match self.backend.touch(&key, ttl).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(key = %key, "Session missing on touch, rewriting");
                        let encoded = record::encode(session, now)?;
                        self.backend.upsert(&key, &encoded, ttl).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Remove `sid`. Removing a missing session succeeds.
    pub async fn destroy(&self, sid: &str) -> Result<()> {
        let key = self.storage_key(sid);
        debug!(key = %key, "DEL");
        match self.backend.remove(&key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every session stored under this store's prefix.
    ///
    /// Returns decoded records, not raw rows. Requires a backend with
    /// prefix scans; fails with [`Error::Unsupported`] otherwise.
    pub async fn all<D: DeserializeOwned>(&self) -> Result<Vec<SessionRecord<D>>> {
        self.scan("all")
            .await?
            .into_iter()
            .map(|entry| record::decode(&entry.key, &entry.value))
            .collect()
    }

    /// Count sessions stored under this store's prefix.
    pub async fn length(&self) -> Result<usize> {
        Ok(self.scan("length").await?.len())
    }

    /// Remove every session stored under this store's prefix.
    pub async fn clear(&self) -> Result<()> {
        let entries = self.scan("clear").await?;
        debug!(prefix = %self.prefix, count = entries.len(), "Clearing sessions");
        for entry in entries {
            match self.backend.remove(&entry.key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn scan(&self, operation: &'static str) -> Result<Vec<KvEntry>> {
        debug!(prefix = %self.prefix, operation, "SCAN");
        self.backend
            .scan_prefix(&self.prefix)
            .await
            .map_err(|e| unsupported_or_storage(e, operation))
    }
}

fn unsupported_or_storage(err: BackendError, operation: &'static str) -> Error {
    if err.kind == BackendErrorKind::Unsupported {
        Error::Unsupported(operation)
    } else {
        Error::Storage(err)
    }
}

impl Drop for CouchbaseStore {
    fn drop(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl<D> SessionStore<D> for CouchbaseStore
where
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, sid: &str) -> Result<Option<SessionRecord<D>>> {
        CouchbaseStore::get(self, sid).await
    }

    async fn set(&self, sid: &str, session: &SessionRecord<D>) -> Result<()> {
        CouchbaseStore::set(self, sid, session).await
    }

    async fn destroy(&self, sid: &str) -> Result<()> {
        CouchbaseStore::destroy(self, sid).await
    }

    async fn touch(&self, sid: &str, session: &SessionRecord<D>) -> Result<()> {
        CouchbaseStore::touch(self, sid, session).await
    }

    async fn all(&self) -> Result<Vec<SessionRecord<D>>> {
        CouchbaseStore::all(self).await
    }

    async fn length(&self) -> Result<usize> {
        CouchbaseStore::length(self).await
    }

    async fn clear(&self) -> Result<()> {
        CouchbaseStore::clear(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, MemoryBackend};
    use crate::record::Cookie;
    use serde_json::json;

    fn store_with(config: StoreConfig) -> (CouchbaseStore, MemoryBackend) {
        let backend = MemoryBackend::new();
        let store = CouchbaseStore::with_external_backend(config, Arc::new(backend.clone()));
        (store, backend)
    }

    fn session(max_age: Option<i64>) -> SessionRecord {
        let mut data = Map::new();
        data.insert("name".to_string(), json!("cm"));
        SessionRecord::new(
            Cookie {
                max_age,
                extra: Map::new(),
            },
            data,
        )
    }

    /// Backend whose reads always fail with the given kind.
    struct FailingBackend(BackendErrorKind);

    #[async_trait]
    impl KvBackend for FailingBackend {
        async fn connect(&self) -> BackendResult<()> {
            Err(BackendError::new(self.0, "connect refused"))
        }
        async fn get(&self, _key: &str) -> BackendResult<Option<String>> {
            Err(BackendError::new(self.0, "get failed"))
        }
        async fn upsert(&self, _key: &str, _value: &str, _expiry: u64) -> BackendResult<()> {
            Err(BackendError::new(self.0, "upsert failed"))
        }
        async fn touch(&self, _key: &str, _expiry: u64) -> BackendResult<()> {
            Err(BackendError::new(self.0, "touch failed"))
        }
        async fn remove(&self, _key: &str) -> BackendResult<()> {
            Err(BackendError::new(self.0, "remove failed"))
        }
        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_storage_key_uses_prefix() {
        let (store, _) = store_with(StoreConfig::new());
        assert_eq!(store.storage_key("abc"), "sess:abc");

        let (store, _) = store_with(StoreConfig::new().with_prefix("app:"));
        assert_eq!(store.storage_key("abc"), "app:abc");
    }

    #[test]
    fn test_ttl_precedence() {
        let (store, _) = store_with(StoreConfig::new());
        assert_eq!(store.ttl_for(&session(Some(2_000))), 2);
        assert_eq!(store.ttl_for(&session(None)), 86_400);

        let (store, _) = store_with(StoreConfig::new().with_ttl(30));
        assert_eq!(store.ttl_for(&session(Some(2_000))), 30);
    }

    #[tokio::test]
    async fn test_set_writes_prefixed_key_with_ttl() {
        let (store, backend) = store_with(StoreConfig::new());
        store.set("abc", &session(Some(2_000))).await.unwrap();

        let entry = backend.entry("sess:abc").unwrap();
        assert_eq!(entry.expiry_secs, 2);
        let doc: Value = serde_json::from_str(&entry.value).unwrap();
        assert_eq!(doc["cookie"], json!({"maxAge": 2000}));
        assert_eq!(doc["name"], json!("cm"));
        assert!(doc["lastModified"].is_i64());
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (store, _) = store_with(StoreConfig::new());
        let found: Option<SessionRecord> = store.get("nope").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_get_corrupt_value_is_deserialization_error() {
        let (store, backend) = store_with(StoreConfig::new());
        backend.insert_raw("sess:bad", "not json", 0);

        let err = store.get::<Map<String, Value>>("bad").await.unwrap_err();
        assert!(err.is_deserialization());
    }

    #[tokio::test]
    async fn test_get_transient_failure_is_none() {
        let store = CouchbaseStore::with_external_backend(
            StoreConfig::new(),
            Arc::new(FailingBackend(BackendErrorKind::Transient)),
        );
        let found: Option<SessionRecord> = store.get("abc").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_get_hard_failure_is_storage_error() {
        let store = CouchbaseStore::with_external_backend(
            StoreConfig::new(),
            Arc::new(FailingBackend(BackendErrorKind::Timeout)),
        );
        let err = store.get::<Map<String, Value>>("abc").await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn test_destroy_not_found_is_ok() {
        let store = CouchbaseStore::with_external_backend(
            StoreConfig::new(),
            Arc::new(FailingBackend(BackendErrorKind::NotFound)),
        );
        store.destroy("abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_storage_failure_surfaces() {
        let store = CouchbaseStore::with_external_backend(
            StoreConfig::new(),
            Arc::new(FailingBackend(BackendErrorKind::Other)),
        );
        let err = store.set("abc", &session(Some(1_000))).await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn test_touch_missing_key_recreates() {
        let (store, backend) = store_with(StoreConfig::new());
        let mut fresh = session(Some(10_000));
        fresh.last_modified = Some(Utc::now());

        store.touch("gone", &fresh).await.unwrap();

        let entry = backend.entry("sess:gone").unwrap();
        assert_eq!(entry.expiry_secs, 10);
    }

    #[tokio::test]
    async fn test_all_unsupported_without_scan() {
        let store = CouchbaseStore::with_external_backend(
            StoreConfig::new(),
            Arc::new(FailingBackend(BackendErrorKind::Other)),
        );
        let err = store.all::<Map<String, Value>>().await.unwrap_err();
        assert!(matches!(err, Error::Unsupported("all")));
    }

    #[tokio::test]
    async fn test_external_backend_is_connected() {
        let (store, _) = store_with(StoreConfig::new());
        assert!(!store.owns_connection());
        assert!(store.connection_state().is_connected());
        store.wait_connected().await.unwrap();
    }

    #[tokio::test]
    async fn test_owned_backend_reports_connect_failure() {
        let store = CouchbaseStore::with_owned_backend(
            StoreConfig::new(),
            Arc::new(FailingBackend(BackendErrorKind::Transient)),
        )
        .unwrap();
        assert!(store.owns_connection());

        let err = store.wait_connected().await.unwrap_err();
        assert!(err.is_connection());
        assert!(matches!(
            store.connection_state(),
            ConnectionState::Disconnected(_)
        ));
    }

    #[test]
    fn test_owned_backend_requires_runtime() {
        let result =
            CouchbaseStore::with_owned_backend(StoreConfig::new(), Arc::new(MemoryBackend::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
