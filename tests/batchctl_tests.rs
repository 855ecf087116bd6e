//! Integration tests for the batchctl library.
//!
//! These tests call batchctl functions directly against an in-memory store
//! and check what they print.

mod test_helpers;

use std::time::Duration;

use batchq::Batcher;
use batchq::batchctl::{self, GlobalOptions};
use batchq::clock::ManualClock;

use test_helpers::*;

fn text() -> GlobalOptions {
    GlobalOptions { json: false }
}

fn json() -> GlobalOptions {
    GlobalOptions { json: true }
}

fn run_output(output: Vec<u8>) -> String {
    String::from_utf8(output).expect("utf8 output")
}

async fn seeded() -> (std::sync::Arc<ManualClock>, Batcher) {
    let (clock, batcher) = open_memory_batcher().await;
    batcher.push_many("orders", ["a", "b", "c"], false).await.unwrap();
    (clock, batcher)
}

#[batchq::test]
async fn batchctl_push_reports_collapsed_messages() -> anyhow::Result<()> {
    let (_clock, batcher) = open_memory_batcher().await;
    let messages = vec!["x".to_string(), "x".to_string(), "y".to_string()];

    let mut output = Vec::new();
    batchctl::push(&batcher, &text(), &mut output, "b", &messages, true).await?;
    assert_eq!(run_output(output), "appended 2 of 3 message(s) to b\n");

    let mut output = Vec::new();
    batchctl::push(&batcher, &json(), &mut output, "b", &messages, true).await?;
    let parsed: serde_json::Value = serde_json::from_str(run_output(output).trim())?;
    assert_eq!(parsed["offered"], 3);
    assert_eq!(parsed["appended"], 0);
    Ok(())
}

#[batchq::test]
async fn batchctl_pluck_prints_one_message_per_line() -> anyhow::Result<()> {
    let (_clock, batcher) = seeded().await;

    let mut output = Vec::new();
    batchctl::pluck(&batcher, &text(), &mut output, "orders", 2).await?;
    assert_eq!(run_output(output), "a\nb\n");

    let mut output = Vec::new();
    batchctl::pluck(&batcher, &json(), &mut output, "orders", 10).await?;
    let parsed: serde_json::Value = serde_json::from_str(run_output(output).trim())?;
    assert_eq!(parsed["messages"], serde_json::json!(["c"]));
    Ok(())
}

#[batchq::test]
async fn batchctl_reliable_pluck_then_ack() -> anyhow::Result<()> {
    let (_clock, batcher) = seeded().await;

    let mut output = Vec::new();
    batchctl::reliable_pluck(&batcher, &json(), &mut output, "orders", 2).await?;
    let parsed: serde_json::Value = serde_json::from_str(run_output(output).trim())?;
    assert_eq!(parsed["messages"], serde_json::json!(["a", "b"]));
    let job = parsed["job"].as_str().expect("job id").to_string();

    let mut output = Vec::new();
    batchctl::pending(&batcher, &text(), &mut output, "orders").await?;
    let stdout = run_output(output);
    assert!(stdout.contains(&job), "pending should list job: {}", stdout);
    assert!(stdout.contains("1700000000s"), "pending should show age: {}", stdout);

    let mut output = Vec::new();
    batchctl::ack(&batcher, &text(), &mut output, "orders", &job).await?;
    assert_eq!(run_output(output), format!("acknowledged {}\n", job));

    let mut output = Vec::new();
    batchctl::ack(&batcher, &text(), &mut output, "orders", &job).await?;
    assert!(run_output(output).starts_with("no pending job"));

    let mut output = Vec::new();
    batchctl::pending(&batcher, &text(), &mut output, "orders").await?;
    assert_eq!(run_output(output), "no pending jobs for orders\n");
    Ok(())
}

#[batchq::test]
async fn batchctl_reliable_pluck_on_empty_batch() -> anyhow::Result<()> {
    let (_clock, batcher) = open_memory_batcher().await;

    let mut output = Vec::new();
    batchctl::reliable_pluck(&batcher, &text(), &mut output, "empty", 5).await?;
    assert_eq!(run_output(output), "no messages waiting in empty\n");

    let mut output = Vec::new();
    batchctl::reliable_pluck(&batcher, &json(), &mut output, "empty", 5).await?;
    let parsed: serde_json::Value = serde_json::from_str(run_output(output).trim())?;
    assert!(parsed["job"].is_null());
    Ok(())
}

#[batchq::test]
async fn batchctl_requeue_lists_expired_jobs() -> anyhow::Result<()> {
    let (clock, batcher) = seeded().await;
    let job = batcher.reliable_pluck("orders", 3).await?.unwrap();
    clock.advance(Duration::from_secs(61));

    let mut output = Vec::new();
    batchctl::requeue(
        &batcher,
        &text(),
        &mut output,
        "orders",
        false,
        Duration::from_secs(60),
    )
    .await?;
    assert_eq!(
        run_output(output),
        format!("requeued 1 expired job(s)\n  {}\n", job.id)
    );

    let mut output = Vec::new();
    batchctl::size(&batcher, &text(), &mut output, "orders").await?;
    assert_eq!(run_output(output), "3\n");
    Ok(())
}

#[batchq::test]
async fn batchctl_batches_and_delete() -> anyhow::Result<()> {
    let (_clock, batcher) = seeded().await;
    batcher.push("audit", "z", false).await?;

    let mut output = Vec::new();
    batchctl::batches(&batcher, &text(), &mut output).await?;
    assert_eq!(run_output(output), "audit\norders\n");

    let mut output = Vec::new();
    batchctl::delete(&batcher, &text(), &mut output, "orders").await?;
    assert_eq!(run_output(output), "deleted orders\n");

    let mut output = Vec::new();
    batchctl::batches(&batcher, &json(), &mut output).await?;
    let parsed: serde_json::Value = serde_json::from_str(run_output(output).trim())?;
    assert_eq!(parsed["batches"], serde_json::json!(["audit"]));
    Ok(())
}

#[batchq::test]
async fn batchctl_lock_and_last_run() -> anyhow::Result<()> {
    let (_clock, batcher) = seeded().await;
    let ttl = Duration::from_millis(500);

    let mut output = Vec::new();
    batchctl::lock(&batcher, &text(), &mut output, "orders", ttl).await?;
    assert_eq!(run_output(output), "lock acquired for 500ms\n");

    let mut output = Vec::new();
    batchctl::lock(&batcher, &json(), &mut output, "orders", ttl).await?;
    let parsed: serde_json::Value = serde_json::from_str(run_output(output).trim())?;
    assert_eq!(parsed["acquired"], false);

    let mut output = Vec::new();
    batchctl::last_run(&batcher, &text(), &mut output, "orders", None).await?;
    assert_eq!(run_output(output), "never\n");

    let mut output = Vec::new();
    batchctl::last_run(&batcher, &json(), &mut output, "orders", Some(T0_MS)).await?;
    let parsed: serde_json::Value = serde_json::from_str(run_output(output).trim())?;
    assert_eq!(parsed["last_run_ms"], T0_MS);
    Ok(())
}
