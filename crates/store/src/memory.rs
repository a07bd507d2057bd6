//! In-process store for tests and explicit degraded mode.
//!
//! Not suitable for multi-instance deployments: values are visible only
//! within the owning process. The admission path refuses to use this
//! backend unless `SAFETY_DEGRADED_MODE` is set.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{KvStore, StoreError};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Thread-safe in-memory key-value store with TTL support.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    /// When true, every operation errors — used to exercise fail-closed paths.
    failing: RwLock<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            failing: RwLock::new(false),
        }
    }

    /// Simulate the backing store going away (tests only).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.write().expect("failing lock poisoned") = failing;
    }

    fn check_failing(&self) -> Result<(), StoreError> {
        if *self.failing.read().expect("failing lock poisoned") {
            return Err(StoreError::Unreachable("memory store disabled".to_string()));
        }
        Ok(())
    }

    /// Read a live (unexpired) value, evicting it lazily if expired.
    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let entries = self.entries.read().expect("entries lock poisoned");
            match entries.get(key) {
                Some(e) if !e.is_expired(now) => return Some(e.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: evict under the write lock.
        let mut entries = self.entries.write().expect("entries lock poisoned");
        if let Some(e) = entries.get(key) {
            if e.is_expired(now) {
                entries.remove(key);
            } else {
                return Some(e.value.clone());
            }
        }
        None
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_failing()?;
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_failing()?;
        let mut entries = self.entries.write().expect("entries lock poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.check_failing()?;
        let now = Instant::now();
        let mut entries = self.entries.write().expect("entries lock poisoned");
        let current = entries.get(key).filter(|e| !e.is_expired(now)).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.check_failing()?;
        let now = Instant::now();
        let mut entries = self.entries.write().expect("entries lock poisoned");
        if entries.get(key).map(|e| !e.is_expired(now)).unwrap_or(false) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_failing()?;
        self.entries
            .write()
            .expect("entries lock poisoned")
            .remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_failing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cas_semantics() {
        let store = MemoryStore::new();
        // CAS on absent key with expected=None creates it.
        assert!(store.compare_and_swap("k", None, "v1", None).await.unwrap());
        // Stale expectation fails.
        assert!(!store.compare_and_swap("k", Some("old"), "v2", None).await.unwrap());
        // Matching expectation swaps.
        assert!(store.compare_and_swap("k", Some("v1"), "v2", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "first", None).await.unwrap());
        assert!(!store.set_if_absent("k", "second", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(store.ping().await.is_err());
        assert!(store.get("k").await.is_err());
        store.set_failing(false);
        assert!(store.ping().await.is_ok());
    }
}
