//! Keyspace derivation for batches.
//!
//! Every store key used by a batch is derived here from the batch name and a
//! namespace prefix. Names are used verbatim as key components.

use thiserror::Error;
use uuid::Uuid;

/// Default namespace prefix for all batch keys.
pub const DEFAULT_NAMESPACE: &str = "batching";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("batch name must not be empty")]
    EmptyBatchName,
}

/// All keys belonging to one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchKeys {
    pub name: String,
    pub batches: String,
    pub queue: String,
    pub unique: String,
    pub pending: String,
    pub lock: String,
    pub sweep_lock: String,
    pub last_run: String,
}

/// Derives store keys under a fixed namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    namespace: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn ns(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// The set of every known batch name
    pub fn batches_key(&self) -> String {
        self.ns("batches")
    }

    /// The FIFO list holding a batch's waiting messages
    pub fn queue_key(&self, name: &str) -> String {
        self.ns(name)
    }

    /// The set of payloads currently waiting under the uniqueness policy
    pub fn unique_key(&self, name: &str) -> String {
        self.ns(&format!("{}:unique_messages", name))
    }

    /// Sorted set of pending job keys scored by creation time (epoch ms)
    pub fn pending_key(&self, name: &str) -> String {
        self.ns(&format!("{}:pending_jobs", name))
    }

    pub fn lock_key(&self, name: &str) -> String {
        self.ns(&format!("lock:{}", name))
    }

    /// Held by an expiry sweep; separate from the flush lock
    pub fn sweep_lock_key(&self, name: &str) -> String {
        self.ns(&format!("sweep_lock:{}", name))
    }

    pub fn last_run_key(&self, name: &str) -> String {
        self.ns(&format!("last_execution_time:{}", name))
    }

    /// A fresh pending job key: `<ns>:<name>:<32 hex chars>`.
    pub fn pending_job_key(&self, name: &str) -> String {
        self.ns(&format!("{}:{}", name, Uuid::new_v4().simple()))
    }

    /// Derive every key for `name`, rejecting empty names.
    pub fn batch(&self, name: &str) -> Result<BatchKeys, KeyError> {
        if name.is_empty() {
            return Err(KeyError::EmptyBatchName);
        }
        Ok(BatchKeys {
            name: name.to_string(),
            batches: self.batches_key(),
            queue: self.queue_key(name),
            unique: self.unique_key(name),
            pending: self.pending_key(name),
            lock: self.lock_key(name),
            sweep_lock: self.sweep_lock_key(name),
            last_run: self.last_run_key(name),
        })
    }
}

impl BatchKeys {
    /// Check that a pending job key was derived for this batch.
    pub fn owns_pending_job(&self, job_key: &str) -> bool {
        job_key
            .strip_prefix(self.queue.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .is_some_and(|suffix| suffix.len() == 32 && suffix.bytes().all(|b| b.is_ascii_hexdigit()))
    }
}
