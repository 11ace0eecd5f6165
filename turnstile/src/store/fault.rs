use super::{KeyTtl, SharedStore};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Store wrapper that can be switched into a simulated outage
///
/// While failing, every primitive returns [`StoreError::Unavailable`] without
/// touching the wrapped store. Used for outage drills and tests of the
/// fail-open / fail-closed paths.
pub struct FaultInjectingStore<S> {
    inner: S,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl<S: SharedStore> FaultInjectingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }

    /// Number of primitives invoked so far, failed or not
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn gate(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_failing() {
            Err(StoreError::Unavailable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: SharedStore> SharedStore for FaultInjectingStore<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.gate()?;
        self.inner.get(key).await
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        self.gate()?;
        self.inner.mget(keys).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.gate()?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.gate()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.gate()?;
        self.inner.delete(key).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        self.gate()?;
        self.inner.ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.gate()?;
        self.inner.expire(key, ttl).await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.gate()?;
        self.inner.incr_with_expiry(key, ttl).await
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        self.gate()?;
        self.inner.zadd(key, score, member).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> StoreResult<Vec<(String, i64)>> {
        self.gate()?;
        self.inner.zrange_by_score(key, min, max, limit).await
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.gate()?;
        self.inner.zrem_range_by_score(key, min, max).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.gate()?;
        self.inner.zcard(key).await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.gate()?;
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.gate()?;
        self.inner.srem(key, member).await
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.gate()?;
        self.inner.sismember(key, member).await
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.gate()?;
        self.inner.smembers(key).await
    }
}
