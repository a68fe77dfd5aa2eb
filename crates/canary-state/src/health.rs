use serde::{Deserialize, Serialize};

use crate::routing::NodeId;

/// Point-in-time health measurement for one node.
///
/// Overwritten every sampling window and exchanged between peers; it feeds
/// the health gate and is never written to the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub node_id: NodeId,
    /// 95th percentile latency in milliseconds.
    pub p95_ms: f64,
    /// Fraction of failed requests (0.0–1.0).
    pub error_rate: f64,
    pub window_id: u64,
}

impl HealthSnapshot {
    /// Snapshot for a node that has not measured anything yet.
    pub fn idle(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            p95_ms: 0.0,
            error_rate: 0.0,
            window_id: 0,
        }
    }

    /// Whether both measurements are finite and within their domains.
    pub fn is_well_formed(&self) -> bool {
        self.p95_ms.is_finite()
            && self.p95_ms >= 0.0
            && self.error_rate.is_finite()
            && (0.0..=1.0).contains(&self.error_rate)
    }
}
