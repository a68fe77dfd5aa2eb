//! Node mode — runs one consensus node over TCP.
//!
//! In this mode, the daemon:
//! 1. Loads the node configuration and applies command-line overrides
//! 2. Binds the TCP transport and recovers the engine from its log
//! 3. Optionally probes the model server and reports health windows
//! 4. Optionally coordinates a sequence of canary stages
//! 5. On Ctrl-C, stops every task and exits

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use canary_node::{NodeConfig, NodeEngine, NodeHandle};
use canary_state::Decision;
use canary_transport::{TcpConfig, TcpTransport};

use crate::health_probe;

const INBOX_DEPTH: usize = 1024;

/// Command-line values that replace fields of the config file.
pub struct Overrides {
    pub node_id: Option<String>,
    pub listen: Option<String>,
    pub data_dir: Option<PathBuf>,
}

/// Optional work the daemon does besides running the node.
pub struct Driver {
    pub stages: Vec<f64>,
    pub stage_interval: u64,
    pub probe_addr: Option<String>,
    pub health_window: u64,
}

fn load_config(path: &Path, overrides: Overrides) -> anyhow::Result<NodeConfig> {
    let mut config = NodeConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(node_id) = overrides.node_id {
        config.node_id = node_id;
    }
    if let Some(listen) = overrides.listen {
        config.listen_addr = listen;
    }
    if let Some(data_dir) = overrides.data_dir {
        config.data_dir = data_dir;
    }
    config.validate()?;
    Ok(config)
}

/// Run the node until Ctrl-C.
pub async fn run_node(path: &Path, overrides: Overrides, driver: Driver) -> anyhow::Result<()> {
    let config = load_config(path, overrides)?;
    info!(
        node_id = %config.node_id,
        listen = %config.listen_addr,
        peers = ?config.peers,
        "canary node starting"
    );
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Transport ────────────────────────────────────────────────
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_DEPTH);
    let transport = TcpTransport::bind(
        &config.node_id,
        &config.listen_addr,
        &config.peers,
        TcpConfig::default(),
        inbox_tx,
        shutdown_rx.clone(),
    )
    .await?;
    info!(addr = %transport.local_addr(), "transport listening");

    // ── Engine ───────────────────────────────────────────────────
    let node_id = config.node_id.clone();
    let engine = NodeEngine::open(config, Arc::new(transport))?;
    let (handle, engine_task) = engine.spawn(inbox_rx, shutdown_rx.clone());
    let view = handle.view();
    info!(
        %node_id,
        version = view.current.version,
        weights = ?view.current.weights,
        phase = ?view.phase,
        "node engine running"
    );

    // ── Health probe ─────────────────────────────────────────────
    let probe_task = driver.probe_addr.clone().map(|addr| {
        let handle = handle.clone();
        let shutdown = shutdown_rx.clone();
        let window = Duration::from_secs(driver.health_window.max(1));
        tokio::spawn(async move {
            health_probe::run_probe(&node_id, &addr, window, handle, shutdown).await;
        })
    });

    // ── Rollout stages ───────────────────────────────────────────
    let stage_task = (!driver.stages.is_empty()).then(|| {
        let handle = handle.clone();
        let shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(driver.stage_interval);
        tokio::spawn(run_stages(handle, driver.stages, interval, shutdown))
    });

    // ── Wait for shutdown ────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Some(task) = stage_task {
        let _ = task.await;
    }
    if let Some(task) = probe_task {
        let _ = task.await;
    }
    let _ = engine_task.await;

    info!("canary node stopped");
    Ok(())
}

/// Coordinate each stage in turn; stop at the first abort.
async fn run_stages(
    handle: NodeHandle,
    stages: Vec<f64>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    for share in stages {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }

        info!(share, "starting canary stage");
        match handle.stage_canary(share).await {
            Ok(report) if report.outcome == Decision::Commit => {
                info!(
                    txid = %report.txid,
                    version = report.version,
                    weights = ?report.state.weights,
                    "canary stage committed"
                );
            }
            Ok(report) => {
                warn!(
                    txid = %report.txid,
                    version = report.version,
                    reasons = ?report.abort_reasons,
                    "canary stage aborted, holding rollout"
                );
                return;
            }
            Err(e) => {
                error!(share, error = %e, "canary stage failed");
                return;
            }
        }
    }
    info!("all canary stages committed");
}
