//! Periodic expiry sweep across every known batch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::{BatchError, Batcher};
use crate::ledger::PendingJobId;
use crate::settings::SweeperConfig;

/// Outcome of one pass over every batch.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Batches swept
    pub swept: usize,
    /// Batches skipped because another sweeper held their sweep lock
    pub skipped: usize,
    pub requeued: Vec<(String, Vec<PendingJobId>)>,
    pub failed: Vec<String>,
}

impl SweepReport {
    pub fn requeued_jobs(&self) -> usize {
        self.requeued.iter().map(|(_, jobs)| jobs.len()).sum()
    }
}

/// Requeues expired pending jobs for every batch in the index, once on
/// demand or on a fixed interval in the background.
pub struct Supervisor {
    batcher: Arc<Batcher>,
    config: SweeperConfig,
    lock_ttl: Duration,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Supervisor {
    pub fn new(batcher: Arc<Batcher>, config: SweeperConfig, lock_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            batcher,
            config,
            lock_ttl,
            running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sweep every known batch once. A batch that fails is logged and left
    /// for the next pass; only failing to list the batches is an error.
    pub async fn sweep_once(&self) -> Result<SweepReport, BatchError> {
        let started = Instant::now();
        let ttl = self.config.pending_ttl();
        let mut report = SweepReport::default();

        for name in self.batcher.batches().await? {
            match self.batcher.try_sweep_lock(&name, self.lock_ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(batch = %name, "sweep lock held elsewhere, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(batch = %name, error = %e, "failed to take sweep lock");
                    self.record_failure(&mut report, name);
                    continue;
                }
            }

            match self
                .batcher
                .requeue_expired(&name, self.config.unique, ttl)
                .await
            {
                Ok(jobs) => {
                    report.swept += 1;
                    if !jobs.is_empty() {
                        report.requeued.push((name, jobs));
                    }
                }
                Err(e) => {
                    warn!(batch = %name, error = %e, "expiry sweep failed");
                    self.record_failure(&mut report, name);
                }
            }
        }

        if let Some(m) = self.batcher.metrics() {
            m.record_sweep_duration(started.elapsed().as_secs_f64());
        }
        debug!(
            swept = report.swept,
            skipped = report.skipped,
            failed = report.failed.len(),
            requeued = report.requeued_jobs(),
            "sweep finished"
        );
        Ok(report)
    }

    fn record_failure(&self, report: &mut SweepReport, name: String) {
        if let Some(m) = self.batcher.metrics() {
            m.record_sweep_failure();
        }
        report.failed.push(name);
    }

    /// Start the background sweep loop. Returns `None` if already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }

        let sup = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(
                interval_ms = sup.config.interval_ms,
                pending_ttl_secs = sup.config.pending_ttl_secs,
                unique = sup.config.unique,
                "sweeper started"
            );
            loop {
                if !sup.running.load(Ordering::SeqCst) {
                    break;
                }

                if let Err(e) = sup.sweep_once().await {
                    warn!(error = %e, "failed to list batches for sweep");
                    if let Some(m) = sup.batcher.metrics() {
                        m.record_sweep_failure();
                    }
                }

                // Sleep with early wakeup on stop
                let delay = tokio::time::sleep(sup.config.interval());
                tokio::pin!(delay);
                tokio::select! {
                    _ = &mut delay => {}
                    _ = sup.notify.notified() => {}
                }
            }
            info!("sweeper stopped");
        });
        Some(handle)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }
}
