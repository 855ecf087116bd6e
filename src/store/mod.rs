//! Store backends for batches.
//!
//! `BatchStore` is the single seam between the batch facade and a concrete
//! key-value store. Each backend implements the atomic operations as
//! indivisible units:
//!
//! - `redis_store`: Lua scripts executed server-side via `EVALSHA`
//! - `slate_store`: an embedded SlateDB instance, each operation serialized and
//!   committed as one write batch
//!
//! A backend is chosen once when the store is opened; callers never branch on
//! the backend per call.

mod redis_store;
mod scripts;
mod slate_store;

pub use redis_store::RedisStore;
pub use scripts::{AtomicOp, ScriptCache};
pub use slate_store::SlateStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::keys::BatchKeys;
use crate::ledger::{LedgerEntry, PendingJobId};
use crate::settings::{Backend, StoreConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error("invalid store config: {0}")]
    InvalidConfig(String),
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub(crate) fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Register the batch and append `messages` to its queue. With
    /// `remember_unique`, payloads already live in the unique set (or repeated
    /// earlier in `messages`) are dropped and the survivors are added to the
    /// set. Returns how many messages were appended.
    async fn merge_enqueue(
        &self,
        keys: &BatchKeys,
        messages: &[Bytes],
        remember_unique: bool,
    ) -> Result<usize, StoreError>;

    /// Pop up to `limit` messages from the head and forget them in the unique set.
    async fn pluck(&self, keys: &BatchKeys, limit: usize) -> Result<Vec<Bytes>, StoreError>;

    /// Move up to `limit` head messages into the `job` list and record the job
    /// in the ledger at `now_ms`. Nothing is recorded when the queue is empty.
    async fn reliable_pluck(
        &self,
        keys: &BatchKeys,
        job: &PendingJobId,
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<Bytes>, StoreError>;

    /// Drop the job list and its ledger entry. Returns whether anything existed.
    async fn acknowledge(&self, keys: &BatchKeys, job: &PendingJobId) -> Result<bool, StoreError>;

    /// Return a pending job's messages to the queue tail and drop its ledger
    /// entry. In unique mode a payload that is already live is discarded
    /// instead, and a requeued copy is added to the unique set so it is live
    /// again. Returns false if the job had already left the ledger.
    async fn requeue(
        &self,
        keys: &BatchKeys,
        job: &PendingJobId,
        unique: bool,
    ) -> Result<bool, StoreError>;

    /// Ledger entries ordered by creation time; with `before_ms`, only those
    /// created strictly before it.
    async fn pending_entries(
        &self,
        keys: &BatchKeys,
        before_ms: Option<i64>,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn pending_messages(&self, job: &PendingJobId) -> Result<Vec<Bytes>, StoreError>;

    async fn queue_len(&self, keys: &BatchKeys) -> Result<u64, StoreError>;

    /// Up to `limit` messages from the head, without removing them.
    async fn peek(&self, keys: &BatchKeys, limit: usize) -> Result<Vec<Bytes>, StoreError>;

    async fn is_live(&self, keys: &BatchKeys, payload: &[u8]) -> Result<bool, StoreError>;

    async fn unique_len(&self, keys: &BatchKeys) -> Result<u64, StoreError>;

    async fn batches(&self, batches_key: &str) -> Result<Vec<String>, StoreError>;

    /// Drop the queue, unique set, last run time and index entry. Pending jobs
    /// and the ledger are left alone.
    async fn delete_batch(&self, keys: &BatchKeys) -> Result<(), StoreError>;

    /// Set the lock at `lock_key` only if absent (or expired). Never blocks.
    async fn try_lock(&self, lock_key: &str, ttl: Duration, now_ms: i64)
    -> Result<bool, StoreError>;

    async fn last_run(&self, keys: &BatchKeys) -> Result<Option<i64>, StoreError>;

    async fn set_last_run(&self, keys: &BatchKeys, at_ms: i64) -> Result<(), StoreError>;
}

/// Open the backend named by the config.
pub async fn open_store(cfg: &StoreConfig) -> Result<Arc<dyn BatchStore>, StoreError> {
    match cfg.backend {
        Backend::Redis => {
            let store = RedisStore::connect(&cfg.url).await?;
            Ok(Arc::new(store))
        }
        Backend::Fs | Backend::Memory | Backend::S3 | Backend::Url => {
            let store = SlateStore::open(cfg).await?;
            Ok(Arc::new(store))
        }
    }
}
