//! Pending job ledger types.
//!
//! A reliable pluck relocates messages into a pending job list and records the
//! job in the batch's ledger, scored by creation time. The job then ends in
//! exactly one of two terminal states: acknowledged by the consumer, or
//! requeued by an expiry sweep once it is older than the sweep's TTL.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

/// Store key of a pending job list. Doubles as the job's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingJobId(String);

impl PendingJobId {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PendingJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PendingJobId {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for PendingJobId {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl AsRef<str> for PendingJobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Messages handed to a consumer by a reliable pluck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub id: PendingJobId,
    pub messages: Vec<Bytes>,
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: PendingJobId,
    pub created_at_ms: i64,
}

impl LedgerEntry {
    /// Strictly older than `now - ttl`.
    pub fn is_expired(&self, now_ms: i64, ttl: Duration) -> bool {
        self.created_at_ms < expiry_cutoff_ms(now_ms, ttl)
    }
}

/// Entries created strictly before the returned instant are expired.
pub fn expiry_cutoff_ms(now_ms: i64, ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(ttl_ms)
}
