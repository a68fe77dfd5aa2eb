//! Model-server probe feeding the node's health gate.
//!
//! Connects to the probe address every [`PROBE_INTERVAL`], records the
//! connect latency (a failed or timed-out connect counts as an error), and
//! reports one snapshot per sampling window.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use canary_node::{HealthWindow, NodeHandle};

const PROBE_INTERVAL: Duration = Duration::from_millis(500);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe `address` until shutdown, reporting a snapshot every `window`.
pub async fn run_probe(
    node_id: &str,
    address: &str,
    window: Duration,
    handle: NodeHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut samples = HealthWindow::new(node_id);
    let mut probe = tokio::time::interval(PROBE_INTERVAL);
    let mut roll = tokio::time::interval_at(Instant::now() + window, window);
    debug!(%address, ?window, "health probe starting");

    loop {
        tokio::select! {
            _ = probe.tick() => {
                let (latency, failed) = probe_once(address).await;
                samples.record(latency, failed);
            }
            _ = roll.tick() => {
                let snapshot = samples.roll();
                debug!(
                    window_id = snapshot.window_id,
                    p95_ms = snapshot.p95_ms,
                    error_rate = snapshot.error_rate,
                    "health window closed"
                );
                if handle.report_health(snapshot).await.is_err() {
                    warn!("node engine stopped, ending health probe");
                    break;
                }
            }
            _ = shutdown.changed() => {
                debug!("health probe shutting down");
                break;
            }
        }
    }
}

async fn probe_once(address: &str) -> (Duration, bool) {
    let started = Instant::now();
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(_)) => (started.elapsed(), false),
        Ok(Err(e)) => {
            debug!(%address, error = %e, "health probe connect failed");
            (started.elapsed(), true)
        }
        Err(_) => {
            debug!(%address, "health probe timed out");
            (PROBE_TIMEOUT, true)
        }
    }
}
