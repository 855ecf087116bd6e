//! Tests against a live Redis. They are ignored by default; run them with
//! `BATCHQ_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.
//! Each test uses its own namespace.

mod test_helpers;

use std::time::Duration;

use batchq::store::{AtomicOp, RedisStore};
use redis::AsyncCommands;

use test_helpers::*;

/// Rewrite a ledger score to pretend the job was created `by` earlier.
async fn age_pending_job(batcher: &batchq::Batcher, name: &str, job: &str, by: Duration) {
    let url = redis_url();
    let client = redis::Client::open(url).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let pending = batcher.keyspace().pending_key(name);
    let score: f64 = conn.zscore(&pending, job).await.unwrap();
    let _: () = conn
        .zadd(&pending, job, score - by.as_millis() as f64)
        .await
        .unwrap();
}

#[batchq::test]
#[ignore = "needs a Redis server, see module docs"]
async fn redis_fifo_and_uniqueness() {
    let batcher = open_redis_batcher().await;

    assert_eq!(
        batcher.push_many("b", ["a", "b", "a", "c"], true).await.unwrap(),
        3
    );
    assert!(!batcher.push("b", "b", true).await.unwrap());
    assert_eq!(batcher.unique_count("b").await.unwrap(), 3);
    assert_eq!(strings(&batcher.pluck("b", 2).await.unwrap()), ["a", "b"]);
    assert!(!batcher.is_live("b", "a").await.unwrap());
    assert_eq!(batcher.size("b").await.unwrap(), 1);
    assert_eq!(batcher.batches().await.unwrap(), ["b"]);
}

#[batchq::test]
#[ignore = "needs a Redis server, see module docs"]
async fn redis_expired_job_returns_to_queue() {
    let batcher = open_redis_batcher().await;
    let ttl = Duration::from_secs(500);

    batcher.push("b", "A", false).await.unwrap();
    batcher.push("b", "B", false).await.unwrap();
    let job = batcher.reliable_pluck("b", 2).await.unwrap().unwrap();
    assert_eq!(strings(&job.messages), ["A", "B"]);
    assert_eq!(batcher.pending_jobs("b").await.unwrap().len(), 1);
    assert!(batcher.requeue_expired("b", false, ttl).await.unwrap().is_empty());

    age_pending_job(&batcher, "b", job.id.as_str(), Duration::from_secs(1_000)).await;
    let requeued = batcher.requeue_expired("b", false, ttl).await.unwrap();

    assert_eq!(requeued, vec![job.id]);
    assert_eq!(strings(&batcher.peek("b", 10).await.unwrap()), ["A", "B"]);
    assert!(batcher.pending_jobs("b").await.unwrap().is_empty());
}

#[batchq::test]
#[ignore = "needs a Redis server, see module docs"]
async fn redis_unique_requeue_suppression() {
    let batcher = open_redis_batcher().await;
    let ttl = Duration::from_secs(500);

    batcher.push("b", "X", true).await.unwrap();
    batcher.push("b", "X", true).await.unwrap();
    let job = batcher.reliable_pluck("b", 1).await.unwrap().unwrap();
    assert_eq!(batcher.unique_count("b").await.unwrap(), 0);
    batcher.push("b", "X", true).await.unwrap();

    age_pending_job(&batcher, "b", job.id.as_str(), Duration::from_secs(1_000)).await;
    let requeued = batcher.requeue_expired("b", true, ttl).await.unwrap();

    assert_eq!(requeued, vec![job.id]);
    assert_eq!(strings(&batcher.peek("b", 10).await.unwrap()), ["X"]);
}

#[batchq::test]
#[ignore = "needs a Redis server, see module docs"]
async fn redis_empty_reliable_pluck_creates_no_job() {
    let batcher = open_redis_batcher().await;

    assert!(batcher.pluck("b", 10).await.unwrap().is_empty());
    assert!(batcher.reliable_pluck("b", 10).await.unwrap().is_none());
    assert!(batcher.pending_jobs("b").await.unwrap().is_empty());
}

#[batchq::test]
#[ignore = "needs a Redis server, see module docs"]
async fn redis_pluck_with_unbounded_limit_drains_queue() {
    let batcher = open_redis_batcher().await;

    batcher.push_many("b", ["1", "2", "3"], true).await.unwrap();
    assert_eq!(
        strings(&batcher.pluck("b", usize::MAX).await.unwrap()),
        ["1", "2", "3"]
    );
    assert_eq!(batcher.unique_count("b").await.unwrap(), 0);
    assert!(batcher.pluck("b", usize::MAX).await.unwrap().is_empty());

    batcher.push_many("b", ["4", "5"], false).await.unwrap();
    let job = batcher
        .reliable_pluck("b", usize::MAX)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(strings(&job.messages), ["4", "5"]);
    assert_eq!(batcher.size("b").await.unwrap(), 0);
}

#[batchq::test]
#[ignore = "needs a Redis server, see module docs"]
async fn redis_ack_lock_and_last_run() {
    let batcher = open_redis_batcher().await;

    batcher.push("b", "x", false).await.unwrap();
    let job = batcher.reliable_pluck("b", 1).await.unwrap().unwrap();
    assert!(batcher.acknowledge("b", &job.id).await.unwrap());
    assert!(!batcher.acknowledge("b", &job.id).await.unwrap());

    let ttl = Duration::from_millis(200);
    assert!(batcher.try_lock("b", ttl).await.unwrap());
    assert!(!batcher.try_lock("b", ttl).await.unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(batcher.try_lock("b", ttl).await.unwrap());

    batcher.set_last_run("b", T0_MS).await.unwrap();
    assert_eq!(batcher.last_run("b").await.unwrap(), Some(T0_MS));

    batcher.delete_batch("b").await.unwrap();
    assert!(batcher.batches().await.unwrap().is_empty());
    assert_eq!(batcher.last_run("b").await.unwrap(), None);
}

#[batchq::test]
#[ignore = "needs a Redis server, see module docs"]
async fn redis_reloads_flushed_scripts() {
    let url = redis_url();
    let store = RedisStore::connect(&url).await.unwrap();
    let keys = batchq::keys::Keyspace::new(format!(
        "batchq-test-{}",
        uuid::Uuid::new_v4().simple()
    ))
    .batch("b")
    .unwrap();

    use batchq::store::BatchStore;
    store
        .merge_enqueue(&keys, &[bytes::Bytes::from_static(b"1")], false)
        .await
        .unwrap();
    assert!(store.scripts().get(AtomicOp::MergeEnqueue).is_some());

    // Drop every script server-side; the cached handle is now stale
    let client = redis::Client::open(url).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = redis::cmd("SCRIPT")
        .arg("FLUSH")
        .query_async(&mut conn)
        .await
        .unwrap();

    let accepted = store
        .merge_enqueue(&keys, &[bytes::Bytes::from_static(b"2")], false)
        .await
        .unwrap();
    assert_eq!(accepted, 1);
    assert_eq!(store.queue_len(&keys).await.unwrap(), 2);
}
