//! Embedded backend on SlateDB.
//!
//! Lists, sets and sorted sets are laid out over ordered byte keys. Logical
//! keys are length-prefixed so that no key's prefix covers another's records:
//!
//! - `list/<len>/<key>/<seq:020>` holds a list item; `list_meta/<len>/<key>`
//!   holds the head and tail sequence numbers (items live in `[head, tail)`)
//! - `set/<len>/<key>/<member>` marks set membership
//! - `zset/<len>/<key>/<score:020>/<member>` orders a sorted set by score, with
//!   `zscore/<len>/<key>/<member>` as the reverse index
//! - `str/<len>/<key>` holds a plain value
//!
//! Mutations are serialized by one async mutex and each commits as a single
//! `WriteBatch`, so no reader ever observes a partial operation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use slatedb::object_store::ObjectStore;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::memory::InMemory;
use slatedb::{Db, DbIterator, WriteBatch};
use tokio::sync::Mutex;
use tracing::debug;

use crate::keys::BatchKeys;
use crate::ledger::{LedgerEntry, PendingJobId};
use crate::settings::{Backend, StoreConfig};
use crate::store::{BatchStore, StoreError};

const MARKER: &[u8] = b"1";
const SCORE_WIDTH: usize = 20;

fn scoped(kind: &str, key: &str) -> String {
    format!("{}/{}/{}/", kind, key.len(), key)
}

fn list_item_key(key: &str, seq: u64) -> Vec<u8> {
    format!("{}{:020}", scoped("list", key), seq).into_bytes()
}

fn list_meta_key(key: &str) -> Vec<u8> {
    format!("list_meta/{}/{}", key.len(), key).into_bytes()
}

fn set_prefix(key: &str) -> Vec<u8> {
    scoped("set", key).into_bytes()
}

fn set_member_key(key: &str, member: &[u8]) -> Vec<u8> {
    let mut k = set_prefix(key);
    k.extend_from_slice(member);
    k
}

fn zset_prefix(key: &str) -> Vec<u8> {
    scoped("zset", key).into_bytes()
}

fn zset_entry_key(key: &str, score: i64, member: &str) -> Vec<u8> {
    format!("{}{:020}/{}", scoped("zset", key), score.max(0), member).into_bytes()
}

fn zscore_key(key: &str, member: &str) -> Vec<u8> {
    format!("{}{}", scoped("zscore", key), member).into_bytes()
}

fn str_key(key: &str) -> Vec<u8> {
    format!("str/{}/{}", key.len(), key).into_bytes()
}

/// Exclusive upper bound covering every key under `prefix`. Prefixes end in
/// `/`, so bumping the last byte never overflows.
fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    if let Some(last) = end.last_mut() {
        *last += 1;
    }
    end
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ListMeta {
    head: u64,
    tail: u64,
}

impl ListMeta {
    fn len(&self) -> u64 {
        self.tail - self.head
    }

    fn decode(key: &str, raw: &[u8]) -> Result<Self, StoreError> {
        if raw.len() != 16 {
            return Err(StoreError::corrupt(
                key,
                format!("list meta has {} bytes, want 16", raw.len()),
            ));
        }
        let mut head = [0u8; 8];
        let mut tail = [0u8; 8];
        head.copy_from_slice(&raw[..8]);
        tail.copy_from_slice(&raw[8..]);
        let meta = Self {
            head: u64::from_be_bytes(head),
            tail: u64::from_be_bytes(tail),
        };
        if meta.tail < meta.head {
            return Err(StoreError::corrupt(key, "list tail before head"));
        }
        Ok(meta)
    }

    fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.head.to_be_bytes());
        out[8..].copy_from_slice(&self.tail.to_be_bytes());
        out
    }
}

fn parse_i64(key: &str, raw: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| StoreError::corrupt(key, "not an integer"))
}

/// The SlateDB path and object store for `cfg`. `fs` roots are created if
/// missing and canonicalized; `s3` and `url` are resolved by SlateDB.
fn object_store_for(cfg: &StoreConfig) -> Result<(String, Arc<dyn ObjectStore>), StoreError> {
    match cfg.backend {
        Backend::Memory => Ok((cfg.url.clone(), Arc::new(InMemory::new()))),
        Backend::Fs => {
            let root = std::fs::create_dir_all(&cfg.url)
                .and_then(|()| std::fs::canonicalize(&cfg.url))
                .map_err(|e| StoreError::InvalidConfig(format!("fs root {}: {}", cfg.url, e)))?;
            let fs = LocalFileSystem::new_with_prefix(&root)
                .map_err(|e| StoreError::InvalidConfig(format!("fs root {}: {}", cfg.url, e)))?;
            Ok((root.to_string_lossy().into_owned(), Arc::new(fs)))
        }
        Backend::S3 | Backend::Url => Ok((cfg.url.clone(), Db::resolve_object_store(&cfg.url)?)),
        Backend::Redis => Err(StoreError::InvalidConfig(
            "redis is not a slatedb backend".to_string(),
        )),
    }
}

/// SlateDB-backed store. One process owns a SlateDB path at a time.
pub struct SlateStore {
    db: Arc<Db>,
    write_lock: Mutex<()>,
}

impl SlateStore {
    pub async fn open(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let (path, object_store) = object_store_for(cfg)?;
        let mut db_builder = slatedb::DbBuilder::new(path.as_str(), object_store);
        if let Some(flush_ms) = cfg.flush_interval_ms {
            let settings = slatedb::config::Settings {
                flush_interval: Some(Duration::from_millis(flush_ms)),
                ..Default::default()
            };
            db_builder = db_builder.with_settings(settings);
        }
        let db = db_builder.build().await?;
        debug!(path = %path, backend = ?cfg.backend, "opened slatedb store");
        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.db.close().await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        self.scan_range(prefix.to_vec(), prefix_upper_bound(prefix))
            .await
    }

    async fn scan_range(
        &self,
        start: Vec<u8>,
        end: Vec<u8>,
    ) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(start..end).await?;
        let mut out = Vec::new();
        while let Some(kv) = iter.next().await? {
            out.push((kv.key, kv.value));
        }
        Ok(out)
    }

    async fn list_meta(&self, key: &str) -> Result<ListMeta, StoreError> {
        match self.db.get(list_meta_key(key)).await? {
            Some(raw) => ListMeta::decode(key, &raw),
            None => Ok(ListMeta::default()),
        }
    }

    /// Items with sequence numbers in `[from, to)`.
    async fn list_items(&self, key: &str, from: u64, to: u64) -> Result<Vec<Bytes>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let rows = self
            .scan_range(list_item_key(key, from), list_item_key(key, to))
            .await?;
        if rows.len() as u64 != to - from {
            return Err(StoreError::corrupt(
                key,
                format!("expected {} list items, found {}", to - from, rows.len()),
            ));
        }
        Ok(rows.into_iter().map(|(_, value)| value).collect())
    }

    fn put_list_meta(batch: &mut WriteBatch, key: &str, meta: ListMeta) {
        if meta.len() == 0 {
            batch.delete(list_meta_key(key));
        } else {
            batch.put(list_meta_key(key), meta.encode());
        }
    }

    fn delete_list_items(batch: &mut WriteBatch, key: &str, meta: ListMeta) {
        for seq in meta.head..meta.tail {
            batch.delete(list_item_key(key, seq));
        }
    }

    async fn set_contains(&self, key: &str, member: &[u8]) -> Result<bool, StoreError> {
        Ok(self.db.get(set_member_key(key, member)).await?.is_some())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        match self.db.get(zscore_key(key, member)).await? {
            Some(raw) => Ok(Some(parse_i64(key, &raw)?)),
            None => Ok(None),
        }
    }

    fn delete_zset_entry(batch: &mut WriteBatch, key: &str, member: &str, score: i64) {
        batch.delete(zset_entry_key(key, score, member));
        batch.delete(zscore_key(key, member));
    }

    /// Shared by both pluck flavors: stage removal of up to `limit` head items
    /// and their unique set entries into `batch`.
    async fn take_head(
        &self,
        batch: &mut WriteBatch,
        keys: &BatchKeys,
        limit: usize,
    ) -> Result<Vec<Bytes>, StoreError> {
        let mut meta = self.list_meta(&keys.queue).await?;
        let count = (limit as u64).min(meta.len());
        if count == 0 {
            return Ok(Vec::new());
        }
        let values = self
            .list_items(&keys.queue, meta.head, meta.head + count)
            .await?;
        for seq in meta.head..meta.head + count {
            batch.delete(list_item_key(&keys.queue, seq));
        }
        for value in &values {
            batch.delete(set_member_key(&keys.unique, value));
        }
        meta.head += count;
        Self::put_list_meta(batch, &keys.queue, meta);
        Ok(values)
    }
}

#[async_trait]
impl BatchStore for SlateStore {
    fn kind(&self) -> &'static str {
        "slatedb"
    }

    async fn merge_enqueue(
        &self,
        keys: &BatchKeys,
        messages: &[Bytes],
        remember_unique: bool,
    ) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut accepted: Vec<&Bytes> = Vec::with_capacity(messages.len());
        if remember_unique {
            let mut seen: HashSet<&[u8]> = HashSet::new();
            for message in messages {
                if !seen.insert(&message[..]) {
                    continue;
                }
                if self.set_contains(&keys.unique, message).await? {
                    continue;
                }
                accepted.push(message);
            }
        } else {
            accepted.extend(messages.iter());
        }

        let mut batch = WriteBatch::new();
        batch.put(set_member_key(&keys.batches, keys.name.as_bytes()), MARKER);
        if !accepted.is_empty() {
            let mut meta = self.list_meta(&keys.queue).await?;
            for message in &accepted {
                batch.put(list_item_key(&keys.queue, meta.tail), &message[..]);
                meta.tail += 1;
                if remember_unique {
                    batch.put(set_member_key(&keys.unique, message), MARKER);
                }
            }
            Self::put_list_meta(&mut batch, &keys.queue, meta);
        }
        self.db.write(batch).await?;
        Ok(accepted.len())
    }

    async fn pluck(&self, keys: &BatchKeys, limit: usize) -> Result<Vec<Bytes>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut batch = WriteBatch::new();
        let values = self.take_head(&mut batch, keys, limit).await?;
        if !values.is_empty() {
            self.db.write(batch).await?;
        }
        Ok(values)
    }

    async fn reliable_pluck(
        &self,
        keys: &BatchKeys,
        job: &PendingJobId,
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<Bytes>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut batch = WriteBatch::new();
        let values = self.take_head(&mut batch, keys, limit).await?;
        if values.is_empty() {
            return Ok(values);
        }

        let job_key = job.as_str();
        for (seq, value) in values.iter().enumerate() {
            batch.put(list_item_key(job_key, seq as u64), &value[..]);
        }
        let job_meta = ListMeta {
            head: 0,
            tail: values.len() as u64,
        };
        Self::put_list_meta(&mut batch, job_key, job_meta);
        batch.put(zset_entry_key(&keys.pending, now_ms, job_key), MARKER);
        batch.put(
            zscore_key(&keys.pending, job_key),
            now_ms.max(0).to_string(),
        );
        self.db.write(batch).await?;
        Ok(values)
    }

    async fn acknowledge(&self, keys: &BatchKeys, job: &PendingJobId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let job_key = job.as_str();
        let job_meta = self.list_meta(job_key).await?;
        let score = self.zscore(&keys.pending, job_key).await?;
        if job_meta.len() == 0 && score.is_none() {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        Self::delete_list_items(&mut batch, job_key, job_meta);
        batch.delete(list_meta_key(job_key));
        if let Some(score) = score {
            Self::delete_zset_entry(&mut batch, &keys.pending, job_key, score);
        }
        self.db.write(batch).await?;
        Ok(true)
    }

    async fn requeue(
        &self,
        keys: &BatchKeys,
        job: &PendingJobId,
        unique: bool,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let job_key = job.as_str();
        let Some(score) = self.zscore(&keys.pending, job_key).await? else {
            return Ok(false);
        };

        let job_meta = self.list_meta(job_key).await?;
        let items = self.list_items(job_key, job_meta.head, job_meta.tail).await?;
        let mut queue_meta = self.list_meta(&keys.queue).await?;

        let mut batch = WriteBatch::new();
        let mut live: HashSet<Bytes> = HashSet::new();
        for item in items {
            if unique {
                if live.contains(&item) || self.set_contains(&keys.unique, &item).await? {
                    continue;
                }
                batch.put(set_member_key(&keys.unique, &item), MARKER);
                live.insert(item.clone());
            }
            batch.put(list_item_key(&keys.queue, queue_meta.tail), &item[..]);
            queue_meta.tail += 1;
        }
        Self::put_list_meta(&mut batch, &keys.queue, queue_meta);
        Self::delete_list_items(&mut batch, job_key, job_meta);
        batch.delete(list_meta_key(job_key));
        Self::delete_zset_entry(&mut batch, &keys.pending, job_key, score);
        self.db.write(batch).await?;
        Ok(true)
    }

    async fn pending_entries(
        &self,
        keys: &BatchKeys,
        before_ms: Option<i64>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let prefix = zset_prefix(&keys.pending);
        let end = match before_ms {
            Some(ms) if ms <= 0 => return Ok(Vec::new()),
            Some(ms) => format!("{}{:020}", scoped("zset", &keys.pending), ms).into_bytes(),
            None => prefix_upper_bound(&prefix),
        };
        let rows = self.scan_range(prefix.clone(), end).await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (raw_key, _) in rows {
            let rest = std::str::from_utf8(&raw_key[prefix.len()..])
                .map_err(|e| StoreError::corrupt(keys.pending.clone(), e.to_string()))?;
            let (score, member) = match (rest.get(..SCORE_WIDTH), rest.get(SCORE_WIDTH + 1..)) {
                (Some(score), Some(member)) => (score, member),
                _ => {
                    return Err(StoreError::corrupt(
                        keys.pending.clone(),
                        format!("malformed ledger key {rest}"),
                    ));
                }
            };
            entries.push(LedgerEntry {
                id: PendingJobId::from(member),
                created_at_ms: parse_i64(&keys.pending, score.as_bytes())?,
            });
        }
        Ok(entries)
    }

    async fn pending_messages(&self, job: &PendingJobId) -> Result<Vec<Bytes>, StoreError> {
        let meta = self.list_meta(job.as_str()).await?;
        self.list_items(job.as_str(), meta.head, meta.tail).await
    }

    async fn queue_len(&self, keys: &BatchKeys) -> Result<u64, StoreError> {
        Ok(self.list_meta(&keys.queue).await?.len())
    }

    async fn peek(&self, keys: &BatchKeys, limit: usize) -> Result<Vec<Bytes>, StoreError> {
        let meta = self.list_meta(&keys.queue).await?;
        let count = (limit as u64).min(meta.len());
        self.list_items(&keys.queue, meta.head, meta.head + count)
            .await
    }

    async fn is_live(&self, keys: &BatchKeys, payload: &[u8]) -> Result<bool, StoreError> {
        self.set_contains(&keys.unique, payload).await
    }

    async fn unique_len(&self, keys: &BatchKeys) -> Result<u64, StoreError> {
        Ok(self.scan_prefix(&set_prefix(&keys.unique)).await?.len() as u64)
    }

    async fn batches(&self, batches_key: &str) -> Result<Vec<String>, StoreError> {
        let prefix = set_prefix(batches_key);
        let rows = self.scan_prefix(&prefix).await?;
        rows.into_iter()
            .map(|(raw_key, _)| {
                String::from_utf8(raw_key[prefix.len()..].to_vec())
                    .map_err(|e| StoreError::corrupt(batches_key, e.to_string()))
            })
            .collect()
    }

    async fn delete_batch(&self, keys: &BatchKeys) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let queue_meta = self.list_meta(&keys.queue).await?;
        let unique_rows = self.scan_prefix(&set_prefix(&keys.unique)).await?;

        let mut batch = WriteBatch::new();
        Self::delete_list_items(&mut batch, &keys.queue, queue_meta);
        batch.delete(list_meta_key(&keys.queue));
        for (raw_key, _) in unique_rows {
            batch.delete(raw_key);
        }
        batch.delete(str_key(&keys.last_run));
        batch.delete(set_member_key(&keys.batches, keys.name.as_bytes()));
        self.db.write(batch).await?;
        Ok(())
    }

    async fn try_lock(
        &self,
        lock_key: &str,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        if let Some(raw) = self.db.get(str_key(lock_key)).await? {
            let expires_at_ms = parse_i64(lock_key, &raw)?;
            if expires_at_ms > now_ms {
                return Ok(false);
            }
        }
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        let mut batch = WriteBatch::new();
        batch.put(
            str_key(lock_key),
            now_ms.saturating_add(ttl_ms).to_string(),
        );
        self.db.write(batch).await?;
        Ok(true)
    }

    async fn last_run(&self, keys: &BatchKeys) -> Result<Option<i64>, StoreError> {
        match self.db.get(str_key(&keys.last_run)).await? {
            Some(raw) => Ok(Some(parse_i64(&keys.last_run, &raw)?)),
            None => Ok(None),
        }
    }

    async fn set_last_run(&self, keys: &BatchKeys, at_ms: i64) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.put(str_key(&keys.last_run), at_ms.to_string());
        self.db.write(batch).await?;
        Ok(())
    }
}
