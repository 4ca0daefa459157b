//! In-process backend with per-key expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{BackendError, BackendResult, KvBackend, KvEntry};

/// A value held by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Encoded session document.
    pub value: String,
    /// Expiry in seconds as last sent by the store (0 = never).
    pub expiry_secs: u64,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: String, expiry_secs: u64) -> Self {
        let mut entry = Self {
            value,
            expiry_secs: 0,
            expires_at: None,
        };
        entry.set_expiry(expiry_secs);
        entry
    }

    fn set_expiry(&mut self, expiry_secs: u64) {
        self.expiry_secs = expiry_secs;
        self.expires_at = (expiry_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(expiry_secs));
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Key-value backend kept entirely in memory.
///
/// Clones share the same map, so a test can keep a handle for inspection
/// while the store owns another. Expired keys are dropped when read and
/// swept on every write and scan.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the live entry under `key` without touching it.
    pub fn entry(&self, key: &str) -> Option<StoredEntry> {
        let entries = self.entries.lock();
        entries.get(key).filter(|e| !e.is_expired()).cloned()
    }

    /// Store a raw value, bypassing session encoding.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>, expiry_secs: u64) {
        self.entries
            .lock()
            .insert(key.into(), StoredEntry::new(value.into(), expiry_secs));
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().values().filter(|e| !e.is_expired()).count()
    }

    /// Check if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn purge_expired(entries: &mut HashMap<String, StoredEntry>) {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired());
    let purged = before - entries.len();
    if purged > 0 {
        trace!(purged, "Swept expired entries");
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                trace!(key = %key, "Entry expired, dropping");
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn upsert(&self, key: &str, value: &str, expiry_secs: u64) -> BackendResult<()> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries);
        entries.insert(key.to_string(), StoredEntry::new(value.to_string(), expiry_secs));
        Ok(())
    }

    async fn touch(&self, key: &str, expiry_secs: u64) -> BackendResult<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.set_expiry(expiry_secs);
                Ok(())
            }
            Some(_) => {
                entries.remove(key);
                Err(BackendError::not_found(key))
            }
            None => Err(BackendError::not_found(key)),
        }
    }

    async fn remove(&self, key: &str) -> BackendResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> BackendResult<Vec<KvEntry>> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries);
        let mut found: Vec<KvEntry> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KvEntry {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let backend = MemoryBackend::new();
        backend.upsert("k", "v1", 0).await.unwrap();
        backend.upsert("k", "v2", 10).await.unwrap();

        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(backend.entry("k").unwrap().expiry_secs, 10);
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let backend = MemoryBackend::new();
        backend.remove("missing").await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let backend = MemoryBackend::new();
        backend.upsert("short", "v", 2).await.unwrap();
        backend.upsert("forever", "v", 0).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(backend.get("short").await.unwrap(), None);
        assert!(backend.get("forever").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_extends_expiry() {
        let backend = MemoryBackend::new();
        backend.upsert("k", "v", 2).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        backend.touch("k", 5).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(backend.get("k").await.unwrap().is_some());
        assert_eq!(backend.entry("k").unwrap().expiry_secs, 5);
    }

    #[tokio::test]
    async fn test_touch_missing_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend.touch("missing", 5).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let backend = MemoryBackend::new();
        backend.insert_raw("sess:b", "2", 0);
        backend.insert_raw("sess:a", "1", 0);
        backend.insert_raw("other:c", "3", 0);

        let found = backend.scan_prefix("sess:").await.unwrap();
        let keys: Vec<&str> = found.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["sess:a", "sess:b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_swept() {
        let backend = MemoryBackend::new();
        for i in 0..1000 {
            backend.upsert(&format!("sess:{i}"), "v", 1).await.unwrap();
        }
        backend.upsert("sess:keep", "v", 0).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(backend.scan_prefix("sess:").await.unwrap().len(), 1);
        assert_eq!(backend.entries.lock().len(), 1);

        backend.upsert("sess:new", "v", 1).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        backend.upsert("sess:newer", "v", 1).await.unwrap();

        assert_eq!(backend.entries.lock().len(), 2);
        assert_eq!(backend.len(), 2);
    }
}
