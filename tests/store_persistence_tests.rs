mod test_helpers;

use std::sync::Arc;
use std::time::Duration;

use batchq::Batcher;
use batchq::clock::ManualClock;
use batchq::store::{BatchStore, SlateStore, StoreError};

use test_helpers::*;

#[batchq::test]
async fn queue_and_ledger_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = fs_store_config(&tmp);
    let clock = ManualClock::new(T0_MS);

    let job_id = {
        let store = Arc::new(SlateStore::open(&cfg).await.expect("open"));
        let batcher = Batcher::new(store.clone()).with_clock(clock.clone());
        batcher.push_many("b", ["1", "2", "3"], true).await.unwrap();
        batcher.set_last_run("b", T0_MS).await.unwrap();
        let job = batcher.reliable_pluck("b", 1).await.unwrap().unwrap();
        store.close().await.expect("close");
        job.id
    };

    let store = Arc::new(SlateStore::open(&cfg).await.expect("reopen"));
    let batcher = Batcher::new(store.clone()).with_clock(clock.clone());

    assert_eq!(batcher.batches().await.unwrap(), ["b"]);
    assert_eq!(strings(&batcher.peek("b", 10).await.unwrap()), ["2", "3"]);
    assert!(batcher.is_live("b", "2").await.unwrap());
    assert_eq!(batcher.last_run("b").await.unwrap(), Some(T0_MS));

    let ledger = batcher.pending_jobs("b").await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].id, job_id);
    assert_eq!(ledger[0].created_at_ms, T0_MS);

    clock.advance(Duration::from_secs(3_601));
    let requeued = batcher
        .requeue_expired("b", true, Duration::from_secs(3_600))
        .await
        .unwrap();
    assert_eq!(requeued, vec![job_id]);
    assert_eq!(strings(&batcher.peek("b", 10).await.unwrap()), ["2", "3", "1"]);
    store.close().await.expect("close");
}

#[batchq::test]
async fn queue_keeps_order_past_many_plucks() {
    let (_tmp, store) = open_temp_store().await;
    let batcher = Batcher::new(store.clone());

    for round in 0..5 {
        let msgs: Vec<String> = (0..20).map(|i| format!("r{round}-{i:02}")).collect();
        batcher.push_many("b", msgs, false).await.unwrap();
        let head = batcher.pluck("b", 15).await.unwrap();
        assert_eq!(head.len(), 15);
    }
    assert_eq!(batcher.size("b").await.unwrap(), 25);

    let rest = strings(&batcher.pluck("b", 100).await.unwrap());
    let mut sorted = rest.clone();
    sorted.sort();
    assert_eq!(rest, sorted);
    store.close().await.expect("close");
}

#[batchq::test]
async fn slate_store_reports_its_kind() {
    let (_tmp, store) = open_temp_store().await;
    assert_eq!(store.kind(), "slatedb");
    store.close().await.expect("close");
}

#[batchq::test]
async fn corrupt_last_run_is_reported() {
    let (_tmp, store) = open_temp_store().await;
    let batcher = Batcher::new(store.clone());
    batcher.set_last_run("b", 7).await.unwrap();

    // Overwrite every stored string value with garbage
    let mut iter = store
        .db()
        .scan::<Vec<u8>, _>(b"str/".to_vec()..b"str0".to_vec())
        .await
        .unwrap();
    let mut keys = Vec::new();
    while let Some(kv) = iter.next().await.unwrap() {
        keys.push(kv.key);
    }
    assert_eq!(keys.len(), 1);
    store.db().put(&keys[0], b"not-a-number").await.unwrap();

    let err = batcher.last_run("b").await.unwrap_err();
    assert!(matches!(
        err,
        batchq::BatchError::Store(StoreError::Corrupt { .. })
    ));
    store.close().await.expect("close");
}

#[batchq::test]
async fn slate_store_rejects_redis_backend() {
    let cfg = batchq::settings::StoreConfig {
        backend: batchq::settings::Backend::Redis,
        url: "redis://127.0.0.1:6379".to_string(),
        flush_interval_ms: None,
    };
    let err = SlateStore::open(&cfg).await.err().expect("redis is not slatedb");
    assert!(matches!(err, StoreError::InvalidConfig(_)), "got {:?}", err);
}

#[batchq::test]
async fn fs_store_creates_missing_root() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("nested").join("data");
    let cfg = batchq::settings::StoreConfig {
        backend: batchq::settings::Backend::Fs,
        url: root.to_string_lossy().to_string(),
        flush_interval_ms: Some(10),
    };

    let store = SlateStore::open(&cfg).await.expect("open");
    assert!(root.is_dir());
    store.close().await.expect("close");
}
