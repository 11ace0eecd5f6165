//! Compensating transactions over a [`SharedStore`]
//!
//! The store has no multi-key transactions, so [`TransactionContext`] records
//! the prior state of every key it touches and keeps a stack of undo actions.
//! A failed unit of work is unwound in reverse order of application; undo
//! failures are logged and skipped so the rest of the stack still runs.
//!
//! There is no isolation: a concurrent writer can interleave with the tracked
//! writes, and a rollback restores the snapshot taken before this context's own
//! write, overwriting anything written in between.
//!
//! ```
//! use std::sync::Arc;
//! use turnstile::store::{MemoryStore, SharedStore};
//! use turnstile::transaction::with_transaction;
//! use turnstile::TransactionError;
//!
//! # tokio_test::block_on(async {
//! let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
//!
//! let result: Result<(), TransactionError> = with_transaction(store.clone(), |tx| {
//!     Box::pin(async move {
//!         tx.set("a", "1", None).await?;
//!         tx.add_to_set("index", "a").await?;
//!         Err(TransactionError::Finished)
//!     })
//! })
//! .await;
//!
//! assert!(result.is_err());
//! assert_eq!(store.get("a").await.unwrap(), None);
//! # });
//! ```

use crate::error::TransactionError;
use crate::store::SharedStore;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// A write that was applied through a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedOp {
    Set { key: String },
    Delete { key: String },
    AddToSet { key: String, member: String },
    RemoveFromSet { key: String, member: String },
}

/// Undo action restoring the state a write replaced
#[derive(Debug, Clone)]
enum Compensation {
    /// Put back a string value with its original expiry
    Restore {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    /// The key did not exist before
    Delete { key: String },
    /// The member was present; put it back and restore the set's expiry
    AddMember {
        key: String,
        member: String,
        ttl: Option<Duration>,
    },
    /// The member was absent
    RemoveMember { key: String, member: String },
    /// The write changed nothing
    Nothing,
}

impl Compensation {
    async fn apply(&self, store: &dyn SharedStore) -> Result<(), TransactionError> {
        match self {
            Compensation::Restore { key, value, ttl } => store.set(key, value, *ttl).await?,
            Compensation::Delete { key } => {
                store.delete(key).await?;
            }
            Compensation::AddMember { key, member, ttl } => {
                store.sadd(key, member).await?;
                if let Some(ttl) = ttl {
                    store.expire(key, *ttl).await?;
                }
            }
            Compensation::RemoveMember { key, member } => {
                store.srem(key, member).await?;
            }
            Compensation::Nothing => {}
        }
        Ok(())
    }
}

/// How a rollback went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollbackReport {
    /// Undo actions that ran successfully
    pub compensated: usize,
    /// Undo actions that failed and were skipped
    pub failed: usize,
}

/// Tracked writes for one unit of work
///
/// Consumed by [`commit`](Self::commit) or [`rollback`](Self::rollback). A
/// context dropped with pending undo actions (its task was cancelled) rolls
/// back on a background task when a tokio runtime is available.
pub struct TransactionContext {
    store: Arc<dyn SharedStore>,
    applied: Vec<AppliedOp>,
    compensations: Vec<Compensation>,
    finished: bool,
}

impl TransactionContext {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            applied: Vec::new(),
            compensations: Vec::new(),
            finished: false,
        }
    }

    /// Writes applied so far, in order
    pub fn applied(&self) -> &[AppliedOp] {
        &self.applied
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Set a string value
    pub async fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let undo = self.snapshot_value(key).await?;
        self.compensations.push(undo);
        self.store.set(key, value, ttl).await?;
        self.applied.push(AppliedOp::Set {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Delete a string key, returning whether it existed
    pub async fn delete(&mut self, key: &str) -> Result<bool, TransactionError> {
        self.ensure_open()?;
        let undo = match self.snapshot_value(key).await? {
            // Deleting an absent key changes nothing
            Compensation::Delete { .. } => Compensation::Nothing,
            restore => restore,
        };
        self.compensations.push(undo);
        let existed = self.store.delete(key).await?;
        self.applied.push(AppliedOp::Delete {
            key: key.to_string(),
        });
        Ok(existed)
    }

    /// Add a member to a set, returning whether it was newly added
    pub async fn add_to_set(&mut self, key: &str, member: &str) -> Result<bool, TransactionError> {
        self.ensure_open()?;
        let present = self.store.sismember(key, member).await?;
        self.compensations.push(if present {
            Compensation::Nothing
        } else {
            Compensation::RemoveMember {
                key: key.to_string(),
                member: member.to_string(),
            }
        });
        let added = self.store.sadd(key, member).await?;
        self.applied.push(AppliedOp::AddToSet {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(added)
    }

    /// Remove a member from a set, returning whether it was present
    pub async fn remove_from_set(&mut self, key: &str, member: &str) -> Result<bool, TransactionError> {
        self.ensure_open()?;
        let present = self.store.sismember(key, member).await?;
        let undo = if present {
            // Removing the last member drops the key and its expiry with it
            let ttl = self.store.ttl(key).await?;
            Compensation::AddMember {
                key: key.to_string(),
                member: member.to_string(),
                ttl: ttl.as_expiry(),
            }
        } else {
            Compensation::Nothing
        };
        self.compensations.push(undo);
        let removed = self.store.srem(key, member).await?;
        self.applied.push(AppliedOp::RemoveFromSet {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(removed)
    }

    /// Keep every write and discard the undo stack
    pub fn commit(mut self) -> usize {
        self.finished = true;
        self.compensations.clear();
        tracing::debug!(writes = self.applied.len(), "transaction committed");
        self.applied.len()
    }

    /// Undo every write, most recent first
    pub async fn rollback(mut self) -> RollbackReport {
        self.finished = true;
        let compensations = std::mem::take(&mut self.compensations);
        let report = run_compensations(self.store.as_ref(), compensations).await;
        tracing::debug!(
            compensated = report.compensated,
            failed = report.failed,
            "transaction rolled back"
        );
        report
    }

    fn ensure_open(&self) -> Result<(), TransactionError> {
        if self.finished {
            Err(TransactionError::Finished)
        } else {
            Ok(())
        }
    }

    async fn snapshot_value(&self, key: &str) -> Result<Compensation, TransactionError> {
        let prior = self.store.get(key).await?;
        Ok(match prior {
            Some(value) => {
                let ttl = self.store.ttl(key).await?;
                Compensation::Restore {
                    key: key.to_string(),
                    value,
                    ttl: ttl.as_expiry(),
                }
            }
            None => Compensation::Delete {
                key: key.to_string(),
            },
        })
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.finished || self.compensations.is_empty() {
            return;
        }

        let compensations = std::mem::take(&mut self.compensations);
        let pending = compensations.len();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(pending, "transaction dropped before finishing, rolling back in background");
                let store = self.store.clone();
                handle.spawn(async move {
                    run_compensations(store.as_ref(), compensations).await;
                });
            }
            Err(_) => {
                tracing::error!(pending, "transaction dropped outside a runtime, writes were not rolled back");
            }
        }
    }
}

async fn run_compensations(store: &dyn SharedStore, mut compensations: Vec<Compensation>) -> RollbackReport {
    let mut report = RollbackReport::default();
    while let Some(undo) = compensations.pop() {
        match undo.apply(store).await {
            Ok(()) => report.compensated += 1,
            Err(err) => {
                report.failed += 1;
                tracing::error!(error = %err, undo = ?undo, "compensating action failed");
            }
        }
    }
    report
}

/// Run `work` with a fresh [`TransactionContext`], committing on `Ok` and
/// rolling back on `Err`
///
/// The error from `work` is returned unchanged after the rollback.
pub async fn with_transaction<T, E, F>(store: Arc<dyn SharedStore>, work: F) -> Result<T, E>
where
    F: for<'a> FnOnce(&'a mut TransactionContext) -> BoxFuture<'a, Result<T, E>>,
{
    let mut tx = TransactionContext::new(store);
    match work(&mut tx).await {
        Ok(value) => {
            tx.commit();
            Ok(value)
        }
        Err(err) => {
            let report = tx.rollback().await;
            if report.failed > 0 {
                tracing::warn!(failed = report.failed, "rollback incomplete");
            }
            Err(err)
        }
    }
}
