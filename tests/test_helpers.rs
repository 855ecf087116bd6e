#![allow(dead_code)]

use std::sync::Arc;

use batchq::Batcher;
use batchq::clock::ManualClock;
use batchq::settings::{Backend, StoreConfig};
use batchq::store::{BatchStore, RedisStore, SlateStore};

/// Fixed starting point for manual clocks: 2023-11-14T22:13:20Z
pub const T0_MS: i64 = 1_700_000_000_000;

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

pub fn memory_store_config() -> StoreConfig {
    StoreConfig {
        backend: Backend::Memory,
        url: "batchq-test".to_string(),
        flush_interval_ms: Some(10),
    }
}

pub fn fs_store_config(dir: &tempfile::TempDir) -> StoreConfig {
    StoreConfig {
        backend: Backend::Fs,
        url: dir.path().to_string_lossy().to_string(),
        // Use fast flush interval for tests to speed them up
        flush_interval_ms: Some(10),
    }
}

/// A batcher over a fresh in-memory SlateDB with a manual clock at `T0_MS`.
pub async fn open_memory_batcher() -> (Arc<ManualClock>, Batcher) {
    let store = SlateStore::open(&memory_store_config())
        .await
        .expect("open memory store");
    let clock = ManualClock::new(T0_MS);
    let batcher = Batcher::new(Arc::new(store)).with_clock(clock.clone());
    (clock, batcher)
}

/// A batcher over a SlateDB in a temp directory. Keep the `TempDir` alive
/// for as long as the store is used.
pub async fn open_temp_store() -> (tempfile::TempDir, Arc<SlateStore>) {
    let tmp = tempfile::tempdir().unwrap();
    let store = SlateStore::open(&fs_store_config(&tmp))
        .await
        .expect("open fs store");
    (tmp, Arc::new(store))
}

/// Redis url for the ignored live-server tests, read from
/// `BATCHQ_TEST_REDIS_URL`.
pub fn redis_url() -> String {
    std::env::var("BATCHQ_TEST_REDIS_URL")
        .ok()
        .filter(|url| !url.is_empty())
        .expect("set BATCHQ_TEST_REDIS_URL to run the redis tests")
}

/// A Redis-backed batcher under a namespace unique to this call, so tests
/// can share one server without clearing it.
pub async fn open_redis_batcher() -> Batcher {
    let store = RedisStore::connect(&redis_url())
        .await
        .expect("connect to redis");
    let namespace = format!("batchq-test-{}", uuid::Uuid::new_v4().simple());
    let store: Arc<dyn BatchStore> = Arc::new(store);
    Batcher::new(store).with_keyspace(batchq::keys::Keyspace::new(namespace))
}

pub fn strings(messages: &[bytes::Bytes]) -> Vec<String> {
    messages
        .iter()
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .collect()
}
