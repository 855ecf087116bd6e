use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::batch::Batcher;
use crate::metrics;
use crate::settings::AppConfig;
use crate::supervisor::Supervisor;

/// Start a sweeper node from a config file.
pub async fn start_from_config_path(path: &Path) -> anyhow::Result<NodeHandle> {
    let cfg = AppConfig::load(Some(path))?;
    start(&cfg).await
}

/// Open the store, serve metrics if configured and start the sweeper if
/// enabled. Returns the handles so callers can await or stop them.
pub async fn start(cfg: &AppConfig) -> anyhow::Result<NodeHandle> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut batcher = Batcher::open(cfg).await?;

    let metrics_server = match cfg.metrics.addr.as_deref() {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            let m = metrics::init()?;
            batcher = batcher.with_metrics(m.clone());
            let shutdown_rx = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                if let Err(e) = metrics::run_metrics_server(addr, m, shutdown_rx).await {
                    warn!(error = %e, "metrics server exited");
                }
            }))
        }
        None => None,
    };

    let batcher = Arc::new(batcher);
    let supervisor = Supervisor::new(batcher.clone(), cfg.sweeper.clone(), cfg.lock.ttl());
    let sweeper = if cfg.sweeper.enabled {
        supervisor.start()
    } else {
        info!("sweeper disabled by config");
        None
    };

    Ok(NodeHandle {
        batcher,
        supervisor,
        sweeper,
        metrics_server,
        shutdown: shutdown_tx,
    })
}

pub struct NodeHandle {
    pub batcher: Arc<Batcher>,
    pub supervisor: Arc<Supervisor>,
    pub sweeper: Option<JoinHandle<()>>,
    pub metrics_server: Option<JoinHandle<()>>,
    pub shutdown: broadcast::Sender<()>,
}

impl NodeHandle {
    pub async fn shutdown(self) {
        self.supervisor.stop();
        let _ = self.shutdown.send(());
        if let Some(sweeper) = self.sweeper {
            let _ = sweeper.await;
        }
        if let Some(server) = self.metrics_server {
            let _ = server.await;
        }
    }
}
