//! Shared key-value store abstraction.
//!
//! All subject-keyed mutable state (risk scores, token buckets, canaries,
//! suspensions, idempotency keys) lives behind [`KvStore`] so distributed
//! serving instances observe the same values. The in-process [`MemoryStore`]
//! exists for tests and explicit degraded mode only; production deployments
//! use the Redis backend (`store-redis` feature).

pub mod error;
pub mod memory;
#[cfg(feature = "store-redis")]
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "store-redis")]
pub use redis_store::RedisStore;

/// Atomic key-value operations with optional TTL.
///
/// Every mutation is atomic at the store; concurrent writers coordinate via
/// [`compare_and_swap`](KvStore::compare_and_swap). Any error from these
/// methods means the backing store is unreachable or degraded — callers on
/// the admission path must fail closed, never fall through.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch the value for `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally set `key`, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically replace `key` only if its current value equals `expected`
    /// (`None` = key absent). Returns `true` when the swap applied.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Set `key` only if absent. Returns `true` when the key was written.
    /// Used for idempotency markers.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Remove `key` if present.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Cheap reachability probe for the fail-closed admission gate.
    async fn ping(&self) -> Result<(), StoreError>;
}
