//! Shared store client interface
//!
//! The admission layer keeps every cross-instance counter and lock in a remote
//! key-value store. [`SharedStore`] is the set of primitives it needs from that
//! store (similar to the Redis command surface). The server crate ships a Redis
//! implementation; [`MemoryStore`] is the in-process one used for single-node
//! deployments and tests.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreResult;

mod fault;
mod memory;

pub use fault::FaultInjectingStore;
pub use memory::{MemoryStore, MemoryStoreBuilder};


/// Remaining lifetime of a key, as reported by `PTTL`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist
    Missing,
    /// The key exists without an expiry
    Persistent,
    /// The key expires after the given duration
    Expires(Duration),
}

impl KeyTtl {
    /// The expiry to re-apply when restoring a key, `None` for persistent keys
    pub fn as_expiry(self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(ttl) => Some(ttl),
            KeyTtl::Missing | KeyTtl::Persistent => None,
        }
    }
}

/// Store primitives required by the admission layer
///
/// Sorted-set scores are integer milliseconds since the Unix epoch.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Get a string value
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Get several string values in one round-trip
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// Set a string value, replacing any expiry with `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set a string value only if the key is absent
    ///
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete a key of any type
    ///
    /// Returns `true` when a key was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Remaining lifetime of a key
    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// Set an expiry on an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomically increment a counter, starting its expiry when it is created
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// Add a member to a sorted set
    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()>;

    /// Members with scores in `[min, max]`, ascending, at most `limit` of them
    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> StoreResult<Vec<(String, i64)>>;

    /// Remove members with scores in `[min, max]`, returning how many were removed
    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64>;

    /// Number of members in a sorted set
    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Add a member to a set, returning `true` if it was not already present
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member from a set, returning `true` if it was present
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Whether a member belongs to a set
    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// All members of a set
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;
}
