use super::{KeyTtl, SharedStore};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

#[cfg(feature = "ahash")]
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
#[cfg(not(feature = "ahash"))]
use std::collections::{HashMap, HashSet};

// Configuration constants
const DEFAULT_CAPACITY: usize = 1000;
const CAPACITY_OVERHEAD_FACTOR: f64 = 1.3;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// In-process implementation of [`SharedStore`]
///
/// Keys expire lazily when touched and are swept in bulk at a fixed interval,
/// so memory stays bounded even for identifiers that never come back.
///
/// State lives in this process only. Use it for single-instance deployments,
/// development, and tests; multi-instance fleets need the Redis-backed store.
///
/// # Example
///
/// ```
/// use turnstile::store::{MemoryStore, SharedStore};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::builder()
///     .capacity(10_000)
///     .cleanup_interval(Duration::from_secs(30))
///     .build();
///
/// assert!(store.set_if_absent("lock", "owner", Duration::from_secs(5)).await.unwrap());
/// assert!(!store.set_if_absent("lock", "other", Duration::from_secs(5)).await.unwrap());
/// # });
/// ```
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

/// Builder for configuring a [`MemoryStore`]
pub struct MemoryStoreBuilder {
    capacity: usize,
    cleanup_interval: Duration,
}

struct Inner {
    data: HashMap<String, Entry>,
    next_cleanup: Instant,
    cleanup_interval: Duration,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Str(String),
    Set(HashSet<String>),
    SortedSet(SortedSet),
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: &str) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove_range(&mut self, min: i64, max: i64) -> u64 {
        let doomed: Vec<(i64, String)> = self
            .ordered
            .iter()
            .filter(|(score, _)| *score >= min && *score <= max)
            .cloned()
            .collect();
        for (score, member) in &doomed {
            self.ordered.remove(&(*score, member.clone()));
            self.scores.remove(member);
        }
        doomed.len() as u64
    }
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

impl MemoryStore {
    /// Create a new MemoryStore with default configuration
    ///
    /// Uses a default capacity of 1000 keys and a sweep interval of 60 seconds.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a new builder for configuring a MemoryStore
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder {
            capacity: DEFAULT_CAPACITY,
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }

    /// Number of live (unexpired) keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner.data.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `op` against the live entry for `key`, dropping it first if expired
    fn with_entry<T>(&self, key: &str, op: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.maybe_sweep(now);
        op(live(&mut inner.data, key, now))
    }

    fn with_data<T>(&self, op: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T) -> T {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.maybe_sweep(now);
        op(&mut inner.data, now)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreBuilder {
    /// Expected number of keys; the map pre-allocates 30% above this
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// How often expired keys are swept in bulk
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn build(self) -> MemoryStore {
        MemoryStore {
            inner: Mutex::new(Inner {
                data: HashMap::with_capacity(
                    (self.capacity as f64 * CAPACITY_OVERHEAD_FACTOR) as usize,
                ),
                next_cleanup: Instant::now() + self.cleanup_interval,
                cleanup_interval: self.cleanup_interval,
            }),
        }
    }
}

impl Inner {
    fn maybe_sweep(&mut self, now: Instant) {
        if now < self.next_cleanup {
            return;
        }
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(now));
        self.next_cleanup = now + self.cleanup_interval;
        let evicted = before - self.data.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.data.len(), "swept expired keys");
        }
    }
}

/// Remove `key` if the collection it holds became empty (Redis semantics)
fn drop_if_empty(data: &mut HashMap<String, Entry>, key: &str) {
    let empty = match data.get(key).map(|e| &e.value) {
        Some(Value::Set(set)) => set.is_empty(),
        Some(Value::SortedSet(zset)) => zset.ordered.is_empty(),
        _ => false,
    };
    if empty {
        data.remove(key);
    }
}

fn purge_expired(data: &mut HashMap<String, Entry>, key: &str, now: Instant) {
    if data.get(key).is_some_and(|e| e.is_expired(now)) {
        data.remove(key);
    }
}

/// Fetch a live entry, removing it first if it has expired
fn live<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    purge_expired(data, key, now);
    data.get_mut(key)
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_entry(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        Ok(self.with_data(|data, now| {
            keys.iter()
                .map(|key| match live(data, key, now) {
                    Some(Entry {
                        value: Value::Str(s),
                        ..
                    }) => Some(s.clone()),
                    // MGET reports non-string keys as nil
                    _ => None,
                })
                .collect()
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.with_data(|data, now| {
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            );
        });
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        Ok(self.with_data(|data, now| {
            if live(data, key, now).is_some() {
                return false;
            }
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(now + ttl),
                },
            );
            true
        }))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.with_data(|data, now| {
            let existed = live(data, key, now).is_some();
            data.remove(key);
            existed
        }))
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        Ok(self.with_data(|data, now| match live(data, key, now) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        Ok(self.with_data(|data, now| match live(data, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }))
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.with_data(|data, now| match live(data, key, now) {
            None => {
                data.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str("1".to_string()),
                        expires_at: Some(now + ttl),
                    },
                );
                Ok(1)
            }
            Some(entry) => {
                let Value::Str(raw) = &mut entry.value else {
                    return Err(wrong_type(key));
                };
                let current: i64 = raw.parse().map_err(|_| {
                    StoreError::Command("value is not an integer or out of range".to_string())
                })?;
                let next = current.checked_add(1).ok_or_else(|| {
                    StoreError::Command("increment would overflow".to_string())
                })?;
                *raw = next.to_string();
                if entry.expires_at.is_none() {
                    entry.expires_at = Some(now + ttl);
                }
                Ok(next)
            }
        })
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        self.with_data(|data, now| {
            purge_expired(data, key, now);
            let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::SortedSet(SortedSet::default()),
                expires_at: None,
            });
            let Value::SortedSet(zset) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            zset.insert(score, member);
            Ok(())
        })
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> StoreResult<Vec<(String, i64)>> {
        self.with_entry(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::SortedSet(zset),
                ..
            }) => Ok(zset
                .ordered
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .take(limit)
                .map(|(score, member)| (member.clone(), *score))
                .collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.with_data(|data, now| {
            let removed = match live(data, key, now) {
                None => return Ok(0),
                Some(Entry {
                    value: Value::SortedSet(zset),
                    ..
                }) => zset.remove_range(min, max),
                Some(_) => return Err(wrong_type(key)),
            };
            drop_if_empty(data, key);
            Ok(removed)
        })
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.with_entry(key, |entry| match entry {
            None => Ok(0),
            Some(Entry {
                value: Value::SortedSet(zset),
                ..
            }) => Ok(zset.ordered.len() as u64),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.with_data(|data, now| {
            purge_expired(data, key, now);
            let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Set(HashSet::default()),
                expires_at: None,
            });
            let Value::Set(set) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            Ok(set.insert(member.to_string()))
        })
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.with_data(|data, now| {
            let removed = match live(data, key, now) {
                None => return Ok(false),
                Some(Entry {
                    value: Value::Set(set),
                    ..
                }) => set.remove(member),
                Some(_) => return Err(wrong_type(key)),
            };
            drop_if_empty(data, key);
            Ok(removed)
        })
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.with_entry(key, |entry| match entry {
            None => Ok(false),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.with_entry(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        })
    }
}
