//! The batch facade: the operation surface producers, consumers and sweepers
//! call. It derives keys, reads the clock and delegates to a `BatchStore`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::keys::{BatchKeys, KeyError, Keyspace};
use crate::ledger::{LedgerEntry, PendingJob, PendingJobId, expiry_cutoff_ms};
use crate::metrics::Metrics;
use crate::settings::AppConfig;
use crate::store::{BatchStore, StoreError, open_store};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Named FIFO batches on a shared store.
///
/// Holds no queue state of its own; any number of `Batcher`s in any number of
/// processes may share one store.
pub struct Batcher {
    store: Arc<dyn BatchStore>,
    keyspace: Keyspace,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
}

impl Batcher {
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        Self {
            store,
            keyspace: Keyspace::default(),
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Open the configured store under the configured namespace.
    pub async fn open(cfg: &AppConfig) -> Result<Self, BatchError> {
        let store = open_store(&cfg.store).await?;
        debug!(backend = store.kind(), namespace = %cfg.namespace, "opened batch store");
        Ok(Self::new(store).with_keyspace(Keyspace::new(cfg.namespace.clone())))
    }

    pub fn with_keyspace(mut self, keyspace: Keyspace) -> Self {
        self.keyspace = keyspace;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn BatchStore> {
        &self.store
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn keys(&self, name: &str) -> Result<BatchKeys, BatchError> {
        Ok(self.keyspace.batch(name)?)
    }

    /// Append one message. Returns false when `remember_unique` collapsed it
    /// into an equal payload that is already waiting.
    pub async fn push(
        &self,
        name: &str,
        payload: impl Into<Bytes>,
        remember_unique: bool,
    ) -> Result<bool, BatchError> {
        let appended = self
            .push_many(name, [payload.into()], remember_unique)
            .await?;
        Ok(appended == 1)
    }

    /// Append messages in order, registering the batch. With
    /// `remember_unique`, payloads that are already live (or repeated within
    /// this call) are dropped. Returns how many were appended.
    pub async fn push_many<I, P>(
        &self,
        name: &str,
        payloads: I,
        remember_unique: bool,
    ) -> Result<usize, BatchError>
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        let keys = self.keys(name)?;
        let messages: Vec<Bytes> = payloads.into_iter().map(Into::into).collect();
        if messages.is_empty() {
            return Ok(0);
        }
        let accepted = self
            .store
            .merge_enqueue(&keys, &messages, remember_unique)
            .await?;
        debug!(
            batch = %name,
            offered = messages.len(),
            accepted,
            remember_unique,
            "enqueued messages"
        );
        if let Some(m) = &self.metrics {
            m.record_enqueue(name, messages.len(), accepted);
        }
        Ok(accepted)
    }

    /// Remove up to `limit` messages from the head. Once this returns, the
    /// messages exist only in the caller's hands.
    pub async fn pluck(&self, name: &str, limit: usize) -> Result<Vec<Bytes>, BatchError> {
        let keys = self.keys(name)?;
        let messages = self.store.pluck(&keys, limit).await?;
        debug!(batch = %name, limit, count = messages.len(), "plucked messages");
        if let Some(m) = &self.metrics {
            m.record_pluck(name, "plain", messages.len());
        }
        Ok(messages)
    }

    /// Move up to `limit` messages into a new pending job tracked by the
    /// ledger. Returns `None`, creating no job and no ledger entry, when the
    /// queue is empty.
    pub async fn reliable_pluck(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Option<PendingJob>, BatchError> {
        let keys = self.keys(name)?;
        if limit == 0 {
            return Ok(None);
        }
        let id = PendingJobId::new(self.keyspace.pending_job_key(name));
        let now_ms = self.clock.now_ms();
        let messages = self
            .store
            .reliable_pluck(&keys, &id, limit, now_ms)
            .await?;
        if let Some(m) = &self.metrics {
            m.record_pluck(name, "reliable", messages.len());
        }
        if messages.is_empty() {
            debug!(batch = %name, "reliable pluck found an empty queue");
            return Ok(None);
        }
        debug!(batch = %name, job = %id, count = messages.len(), "created pending job");
        Ok(Some(PendingJob { id, messages }))
    }

    /// Drop a pending job and its ledger entry. Unknown, already handled, or
    /// foreign job ids are a no-op. Returns whether anything was removed.
    pub async fn acknowledge(&self, name: &str, job: &PendingJobId) -> Result<bool, BatchError> {
        let keys = self.keys(name)?;
        if !keys.owns_pending_job(job.as_str()) {
            debug!(batch = %name, job = %job, "ignoring acknowledge for a job of another batch");
            return Ok(false);
        }
        let removed = self.store.acknowledge(&keys, job).await?;
        debug!(batch = %name, job = %job, removed, "acknowledged pending job");
        if removed {
            if let Some(m) = &self.metrics {
                m.record_acknowledge(name);
            }
        }
        Ok(removed)
    }

    /// Return every pending job created strictly before `now - ttl` to the
    /// queue. In unique mode a message whose payload is live again is
    /// discarded instead. Returns the ids requeued by this call.
    ///
    /// Liveness is judged by payload bytes alone: a payload pushed without
    /// the uniqueness flag is never in the unique set, so it never blocks a
    /// requeued copy, while a later unique push of the same bytes does.
    pub async fn requeue_expired(
        &self,
        name: &str,
        unique: bool,
        ttl: Duration,
    ) -> Result<Vec<PendingJobId>, BatchError> {
        let keys = self.keys(name)?;
        let cutoff = expiry_cutoff_ms(self.clock.now_ms(), ttl);
        let expired = self.store.pending_entries(&keys, Some(cutoff)).await?;

        let mut requeued = Vec::with_capacity(expired.len());
        for entry in expired {
            // false when an acknowledge or another sweeper got there first
            if self.store.requeue(&keys, &entry.id, unique).await? {
                requeued.push(entry.id);
            }
        }

        if !requeued.is_empty() {
            info!(
                batch = %name,
                jobs = requeued.len(),
                unique,
                ttl_secs = ttl.as_secs(),
                "requeued expired pending jobs"
            );
            if let Some(m) = &self.metrics {
                m.record_requeue(name, requeued.len());
            }
        }
        Ok(requeued)
    }

    /// The batch's ledger, oldest first.
    pub async fn pending_jobs(&self, name: &str) -> Result<Vec<LedgerEntry>, BatchError> {
        let keys = self.keys(name)?;
        Ok(self.store.pending_entries(&keys, None).await?)
    }

    /// Messages held by a pending job; empty once it is resolved.
    pub async fn pending_messages(
        &self,
        name: &str,
        job: &PendingJobId,
    ) -> Result<Vec<Bytes>, BatchError> {
        let keys = self.keys(name)?;
        if !keys.owns_pending_job(job.as_str()) {
            return Ok(Vec::new());
        }
        Ok(self.store.pending_messages(job).await?)
    }

    /// Number of messages waiting in the queue.
    pub async fn size(&self, name: &str) -> Result<u64, BatchError> {
        let keys = self.keys(name)?;
        Ok(self.store.queue_len(&keys).await?)
    }

    /// Up to `limit` waiting messages from the head, left in place.
    pub async fn peek(&self, name: &str, limit: usize) -> Result<Vec<Bytes>, BatchError> {
        let keys = self.keys(name)?;
        Ok(self.store.peek(&keys, limit).await?)
    }

    /// Whether `payload` is waiting under the uniqueness policy.
    pub async fn is_live(&self, name: &str, payload: impl AsRef<[u8]>) -> Result<bool, BatchError> {
        let keys = self.keys(name)?;
        Ok(self.store.is_live(&keys, payload.as_ref()).await?)
    }

    pub async fn unique_count(&self, name: &str) -> Result<u64, BatchError> {
        let keys = self.keys(name)?;
        Ok(self.store.unique_len(&keys).await?)
    }

    /// Every batch name ever pushed to and not deleted, sorted.
    pub async fn batches(&self) -> Result<Vec<String>, BatchError> {
        Ok(self.store.batches(&self.keyspace.batches_key()).await?)
    }

    /// Drop the queue, unique set, last run time and index entry.
    ///
    /// Outstanding pending jobs are not touched. Their ledger entries survive
    /// and an expiry sweep will still requeue them, which re-creates the queue
    /// without re-registering the batch in the index.
    pub async fn delete_batch(&self, name: &str) -> Result<(), BatchError> {
        let keys = self.keys(name)?;
        self.store.delete_batch(&keys).await?;
        debug!(batch = %name, "deleted batch");
        Ok(())
    }

    /// Take the batch's advisory flush lock for `ttl` if nobody holds it.
    /// Never blocks and is never renewed; `false` means skip this cycle.
    pub async fn try_lock(&self, name: &str, ttl: Duration) -> Result<bool, BatchError> {
        let keys = self.keys(name)?;
        Ok(self
            .store
            .try_lock(&keys.lock, ttl, self.clock.now_ms())
            .await?)
    }

    /// Like `try_lock`, on the lock expiry sweeps use.
    pub async fn try_sweep_lock(&self, name: &str, ttl: Duration) -> Result<bool, BatchError> {
        let keys = self.keys(name)?;
        Ok(self
            .store
            .try_lock(&keys.sweep_lock, ttl, self.clock.now_ms())
            .await?)
    }

    /// Last execution time in epoch milliseconds, if ever set.
    pub async fn last_run(&self, name: &str) -> Result<Option<i64>, BatchError> {
        let keys = self.keys(name)?;
        Ok(self.store.last_run(&keys).await?)
    }

    pub async fn set_last_run(&self, name: &str, at_ms: i64) -> Result<(), BatchError> {
        let keys = self.keys(name)?;
        Ok(self.store.set_last_run(&keys, at_ms).await?)
    }
}
