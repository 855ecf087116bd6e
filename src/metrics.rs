//! Prometheus metrics for batch queues.
//!
//! Initialize once at startup and hand clones to the `Batcher` and
//! `Supervisor`:
//! ```ignore
//! let metrics = batchq::metrics::init()?;
//! let batcher = Batcher::open(&cfg).await?.with_metrics(metrics.clone());
//! ```
//!
//! Serve them with `run_metrics_server(addr, metrics, shutdown_rx)`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
    core::Collector,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Buckets for sweep durations (in seconds)
const SWEEP_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    messages_enqueued: CounterVec,
    messages_collapsed: CounterVec,
    messages_plucked: CounterVec,
    pending_acknowledged: CounterVec,
    pending_requeued: CounterVec,

    sweep_failures: Counter,
    sweep_duration: Histogram,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a merge-enqueue: `accepted` appended, `offered - accepted`
    /// collapsed against live payloads.
    pub fn record_enqueue(&self, batch: &str, offered: usize, accepted: usize) {
        self.messages_enqueued
            .with_label_values(&[batch])
            .inc_by(accepted as f64);
        let collapsed = offered.saturating_sub(accepted);
        if collapsed > 0 {
            self.messages_collapsed
                .with_label_values(&[batch])
                .inc_by(collapsed as f64);
        }
    }

    /// `mode` is "plain" or "reliable".
    pub fn record_pluck(&self, batch: &str, mode: &str, count: usize) {
        self.messages_plucked
            .with_label_values(&[batch, mode])
            .inc_by(count as f64);
    }

    pub fn record_acknowledge(&self, batch: &str) {
        self.pending_acknowledged.with_label_values(&[batch]).inc();
    }

    pub fn record_requeue(&self, batch: &str, jobs: usize) {
        self.pending_requeued
            .with_label_values(&[batch])
            .inc_by(jobs as f64);
    }

    pub fn record_sweep_failure(&self) {
        self.sweep_failures.inc();
    }

    pub fn record_sweep_duration(&self, secs: f64) {
        self.sweep_duration.observe(secs);
    }

    /// Current value of the enqueued counter, mostly for tests.
    pub fn enqueued_total(&self, batch: &str) -> f64 {
        self.messages_enqueued.with_label_values(&[batch]).get()
    }

    pub fn requeued_total(&self, batch: &str) -> f64 {
        self.pending_requeued.with_label_values(&[batch]).get()
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Build a fresh registry with every batch queue instrument.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let messages_enqueued = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "batchq_messages_enqueued_total",
                "Messages appended to a batch queue",
            ),
            &["batch"],
        )?,
    );

    let messages_collapsed = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "batchq_messages_collapsed_total",
                "Messages dropped at enqueue because an equal payload was already live",
            ),
            &["batch"],
        )?,
    );

    let messages_plucked = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "batchq_messages_plucked_total",
                "Messages removed from a batch queue by a consumer",
            ),
            &["batch", "mode"],
        )?,
    );

    let pending_acknowledged = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "batchq_pending_acknowledged_total",
                "Pending jobs acknowledged by consumers",
            ),
            &["batch"],
        )?,
    );

    let pending_requeued = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "batchq_pending_requeued_total",
                "Expired pending jobs returned to their queue",
            ),
            &["batch"],
        )?,
    );

    let sweep_failures = register(
        &registry,
        Counter::new(
            "batchq_sweep_failures_total",
            "Batches whose expiry sweep failed",
        )?,
    );

    let sweep_duration = register(
        &registry,
        Histogram::with_opts(
            HistogramOpts::new(
                "batchq_sweep_duration_seconds",
                "Time spent sweeping every known batch once",
            )
            .buckets(SWEEP_BUCKETS.to_vec()),
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        messages_enqueued,
        messages_collapsed,
        messages_plucked,
        pending_acknowledged,
        pending_requeued,
        sweep_failures,
        sweep_duration,
    })
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Router serving `/metrics` from `metrics`' registry.
pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Run the Prometheus metrics HTTP server until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
