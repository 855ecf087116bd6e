use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, FromRedisValue};
use tracing::debug;

use crate::keys::BatchKeys;
use crate::ledger::{LedgerEntry, PendingJobId};
use crate::store::scripts::{AtomicOp, ScriptCache};
use crate::store::{BatchStore, StoreError};

/// Redis backend. Requires Redis 6.2 or newer (`LMOVE`, `LPOP` with count).
pub struct RedisStore {
    conn: ConnectionManager,
    scripts: ScriptCache,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!(url = %url, "connected to redis");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scripts: ScriptCache::new(),
        }
    }

    pub fn scripts(&self) -> &ScriptCache {
        &self.scripts
    }

    async fn script_sha(
        &self,
        op: AtomicOp,
        conn: &mut ConnectionManager,
    ) -> Result<String, StoreError> {
        if let Some(sha) = self.scripts.get(op) {
            return Ok(sha);
        }
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(op.source())
            .query_async(conn)
            .await?;
        debug!(script = op.name(), sha = %sha, "loaded script");
        self.scripts.insert(op, sha.clone());
        Ok(sha)
    }

    fn evalsha(sha: &str, keys: &[&str], args: &[&[u8]]) -> redis::Cmd {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len());
        for key in keys {
            cmd.arg(*key);
        }
        for arg in args {
            cmd.arg(*arg);
        }
        cmd
    }

    /// Run a script by handle, reloading it once if the server has forgotten
    /// it (e.g. after a restart or `SCRIPT FLUSH`).
    async fn eval<T: FromRedisValue>(
        &self,
        op: AtomicOp,
        keys: &[&str],
        args: &[&[u8]],
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        let sha = self.script_sha(op, &mut conn).await?;
        let first: redis::RedisResult<T> =
            Self::evalsha(&sha, keys, args).query_async(&mut conn).await;
        match first {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                debug!(script = op.name(), "script unknown to server, reloading");
                self.scripts.invalidate(op);
                let sha = self.script_sha(op, &mut conn).await?;
                let value: T = Self::evalsha(&sha, keys, args)
                    .query_async(&mut conn)
                    .await?;
                Ok(value)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn into_bytes(values: Vec<Vec<u8>>) -> Vec<Bytes> {
    values.into_iter().map(Bytes::from).collect()
}

fn flag(value: bool) -> &'static [u8] {
    if value { b"1" } else { b"0" }
}

#[async_trait]
impl BatchStore for RedisStore {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn merge_enqueue(
        &self,
        keys: &BatchKeys,
        messages: &[Bytes],
        remember_unique: bool,
    ) -> Result<usize, StoreError> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(messages.len() + 2);
        args.push(keys.name.as_bytes());
        args.push(flag(remember_unique));
        args.extend(messages.iter().map(|m| m.as_ref()));
        let accepted: usize = self
            .eval(
                AtomicOp::MergeEnqueue,
                &[&keys.batches, &keys.queue, &keys.unique],
                &args,
            )
            .await?;
        Ok(accepted)
    }

    async fn pluck(&self, keys: &BatchKeys, limit: usize) -> Result<Vec<Bytes>, StoreError> {
        let limit = limit.to_string();
        let values: Vec<Vec<u8>> = self
            .eval(
                AtomicOp::Pluck,
                &[&keys.queue, &keys.unique],
                &[limit.as_bytes()],
            )
            .await?;
        Ok(into_bytes(values))
    }

    async fn reliable_pluck(
        &self,
        keys: &BatchKeys,
        job: &PendingJobId,
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<Bytes>, StoreError> {
        let limit = limit.to_string();
        let now = now_ms.to_string();
        let values: Vec<Vec<u8>> = self
            .eval(
                AtomicOp::ReliablePluck,
                &[&keys.queue, &keys.unique, &keys.pending, job.as_str()],
                &[limit.as_bytes(), now.as_bytes()],
            )
            .await?;
        Ok(into_bytes(values))
    }

    async fn acknowledge(&self, keys: &BatchKeys, job: &PendingJobId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let (deleted, removed): (i64, i64) = redis::pipe()
            .atomic()
            .del(job.as_str())
            .zrem(&keys.pending, job.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0 || removed > 0)
    }

    async fn requeue(
        &self,
        keys: &BatchKeys,
        job: &PendingJobId,
        unique: bool,
    ) -> Result<bool, StoreError> {
        let requeued: i64 = self
            .eval(
                AtomicOp::Requeue,
                &[job.as_str(), &keys.queue, &keys.pending, &keys.unique],
                &[flag(unique)],
            )
            .await?;
        Ok(requeued == 1)
    }

    async fn pending_entries(
        &self,
        keys: &BatchKeys,
        before_ms: Option<i64>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let max = match before_ms {
            Some(ms) => format!("({}", ms),
            None => "+inf".to_string(),
        };
        let rows: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(&keys.pending)
            .arg("-inf")
            .arg(max)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, score)| LedgerEntry {
                id: PendingJobId::from(id),
                created_at_ms: score as i64,
            })
            .collect())
    }

    async fn pending_messages(&self, job: &PendingJobId) -> Result<Vec<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let values: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(job.as_str())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(into_bytes(values))
    }

    async fn queue_len(&self, keys: &BatchKeys) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("LLEN")
            .arg(&keys.queue)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn peek(&self, keys: &BatchKeys, limit: usize) -> Result<Vec<Bytes>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = i64::try_from(limit - 1).unwrap_or(i64::MAX);
        let values: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(&keys.queue)
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(into_bytes(values))
    }

    async fn is_live(&self, keys: &BatchKeys, payload: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let member: bool = redis::cmd("SISMEMBER")
            .arg(&keys.unique)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(member)
    }

    async fn unique_len(&self, keys: &BatchKeys) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("SCARD")
            .arg(&keys.unique)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn batches(&self, batches_key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(batches_key)
            .query_async(&mut conn)
            .await?;
        names.sort();
        Ok(names)
    }

    async fn delete_batch(&self, keys: &BatchKeys) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(&keys.last_run)
            .ignore()
            .del(&keys.queue)
            .ignore()
            .del(&keys.unique)
            .ignore()
            .srem(&keys.batches, &keys.name)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_lock(
        &self,
        lock_key: &str,
        ttl: Duration,
        _now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key)
            .arg("true")
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn last_run(&self, keys: &BatchKeys) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(&keys.last_run)
            .query_async(&mut conn)
            .await?;
        raw.map(|s| {
            s.parse::<i64>()
                .map_err(|e| StoreError::corrupt(keys.last_run.clone(), e.to_string()))
        })
        .transpose()
    }

    async fn set_last_run(&self, keys: &BatchKeys, at_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(&keys.last_run)
            .arg(at_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
