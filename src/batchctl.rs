//! Batch administration CLI library.
//!
//! Backs the `batchctl` binary; every command writes to any `io::Write` so
//! tests can drive the same code against an in-memory store.

use std::io::Write;
use std::time::Duration;

use bytes::Bytes;

use crate::batch::Batcher;
use crate::ledger::PendingJobId;

/// Options that apply to all batchctl commands
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Output in JSON format instead of human-readable lines
    pub json: bool,
}

fn render(payload: &Bytes) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

fn write_messages<W: Write>(out: &mut W, messages: &[Bytes]) -> anyhow::Result<()> {
    for message in messages {
        writeln!(out, "{}", render(message))?;
    }
    Ok(())
}

/// Format a timestamp in milliseconds as `<secs>s (<ms>ms)`
fn format_timestamp_ms(ms: i64) -> String {
    format!("{}s ({}ms)", ms.div_euclid(1000), ms)
}

pub async fn push<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
    name: &str,
    payloads: &[String],
    unique: bool,
) -> anyhow::Result<()> {
    let appended = batcher
        .push_many(name, payloads.iter().cloned(), unique)
        .await?;
    if opts.json {
        let json = serde_json::json!({
            "batch": name,
            "offered": payloads.len(),
            "appended": appended,
        });
        writeln!(out, "{}", json)?;
    } else {
        writeln!(
            out,
            "appended {} of {} message(s) to {}",
            appended,
            payloads.len(),
            name
        )?;
    }
    Ok(())
}

pub async fn pluck<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
    name: &str,
    limit: usize,
) -> anyhow::Result<()> {
    let messages = batcher.pluck(name, limit).await?;
    if opts.json {
        let json = serde_json::json!({
            "batch": name,
            "messages": messages.iter().map(render).collect::<Vec<_>>(),
        });
        writeln!(out, "{}", json)?;
    } else {
        write_messages(out, &messages)?;
    }
    Ok(())
}

pub async fn reliable_pluck<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
    name: &str,
    limit: usize,
) -> anyhow::Result<()> {
    let job = batcher.reliable_pluck(name, limit).await?;
    if opts.json {
        let json = match &job {
            Some(job) => serde_json::json!({
                "batch": name,
                "job": job.id.as_str(),
                "messages": job.messages.iter().map(render).collect::<Vec<_>>(),
            }),
            None => serde_json::json!({
                "batch": name,
                "job": null,
                "messages": [],
            }),
        };
        writeln!(out, "{}", json)?;
    } else {
        match job {
            Some(job) => {
                writeln!(out, "job {}", job.id)?;
                write_messages(out, &job.messages)?;
            }
            None => writeln!(out, "no messages waiting in {}", name)?,
        }
    }
    Ok(())
}

pub async fn ack<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
    name: &str,
    job: &str,
) -> anyhow::Result<()> {
    let removed = batcher.acknowledge(name, &PendingJobId::from(job)).await?;
    if opts.json {
        let json = serde_json::json!({ "batch": name, "job": job, "removed": removed });
        writeln!(out, "{}", json)?;
    } else if removed {
        writeln!(out, "acknowledged {}", job)?;
    } else {
        writeln!(out, "no pending job {} (already resolved?)", job)?;
    }
    Ok(())
}

pub async fn requeue<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
    name: &str,
    unique: bool,
    ttl: Duration,
) -> anyhow::Result<()> {
    let jobs = batcher.requeue_expired(name, unique, ttl).await?;
    if opts.json {
        let json = serde_json::json!({
            "batch": name,
            "requeued": jobs.iter().map(PendingJobId::as_str).collect::<Vec<_>>(),
        });
        writeln!(out, "{}", json)?;
    } else {
        writeln!(out, "requeued {} expired job(s)", jobs.len())?;
        for job in jobs {
            writeln!(out, "  {}", job)?;
        }
    }
    Ok(())
}

pub async fn size<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
    name: &str,
) -> anyhow::Result<()> {
    let size = batcher.size(name).await?;
    if opts.json {
        writeln!(out, "{}", serde_json::json!({ "batch": name, "size": size }))?;
    } else {
        writeln!(out, "{}", size)?;
    }
    Ok(())
}

pub async fn batches<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
) -> anyhow::Result<()> {
    let names = batcher.batches().await?;
    if opts.json {
        writeln!(out, "{}", serde_json::json!({ "batches": names }))?;
    } else {
        for name in names {
            writeln!(out, "{}", name)?;
        }
    }
    Ok(())
}

pub async fn pending<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
    name: &str,
) -> anyhow::Result<()> {
    let entries = batcher.pending_jobs(name).await?;
    if opts.json {
        let rows: Vec<_> = entries
            .iter()
            .map(|e| serde_json::json!({ "job": e.id.as_str(), "created_at_ms": e.created_at_ms }))
            .collect();
        writeln!(out, "{}", serde_json::json!({ "batch": name, "pending": rows }))?;
    } else if entries.is_empty() {
        writeln!(out, "no pending jobs for {}", name)?;
    } else {
        for entry in entries {
            writeln!(
                out,
                "{}  created {}",
                entry.id,
                format_timestamp_ms(entry.created_at_ms)
            )?;
        }
    }
    Ok(())
}

pub async fn delete<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
    name: &str,
) -> anyhow::Result<()> {
    batcher.delete_batch(name).await?;
    if opts.json {
        writeln!(out, "{}", serde_json::json!({ "batch": name, "deleted": true }))?;
    } else {
        writeln!(out, "deleted {}", name)?;
    }
    Ok(())
}

pub async fn lock<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
    name: &str,
    ttl: Duration,
) -> anyhow::Result<()> {
    let acquired = batcher.try_lock(name, ttl).await?;
    if opts.json {
        writeln!(out, "{}", serde_json::json!({ "batch": name, "acquired": acquired }))?;
    } else if acquired {
        writeln!(out, "lock acquired for {}ms", ttl.as_millis())?;
    } else {
        writeln!(out, "lock held elsewhere")?;
    }
    Ok(())
}

/// Print the last run time, or set it first when `set_ms` is given.
pub async fn last_run<W: Write>(
    batcher: &Batcher,
    opts: &GlobalOptions,
    out: &mut W,
    name: &str,
    set_ms: Option<i64>,
) -> anyhow::Result<()> {
    if let Some(ms) = set_ms {
        batcher.set_last_run(name, ms).await?;
    }
    let last = batcher.last_run(name).await?;
    if opts.json {
        writeln!(out, "{}", serde_json::json!({ "batch": name, "last_run_ms": last }))?;
    } else {
        match last {
            Some(ms) => writeln!(out, "{}", format_timestamp_ms(ms))?,
            None => writeln!(out, "never")?,
        }
    }
    Ok(())
}
