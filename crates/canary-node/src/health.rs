//! Health gate and sampling windows.
//!
//! A participant consults the [`HealthGate`] with its latest
//! [`HealthSnapshot`] when a proposal arrives. Snapshots come from whatever
//! serves traffic, either pushed ready-made or built from raw request
//! samples with a [`HealthWindow`].

use std::time::Duration;

use canary_state::{Decision, HealthSnapshot};

use crate::config::HealthThresholds;

/// Outcome of checking a snapshot against the thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct GateVerdict {
    pub decision: Decision,
    pub reason: String,
}

/// Compares p95 latency and error rate against configured limits.
#[derive(Debug, Clone)]
pub struct HealthGate {
    thresholds: HealthThresholds,
}

impl HealthGate {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    /// NaN, infinite or out-of-range measurements vote ABORT.
    pub fn evaluate(&self, snapshot: &HealthSnapshot) -> GateVerdict {
        if !snapshot.is_well_formed() {
            return GateVerdict {
                decision: Decision::Abort,
                reason: format!(
                    "health unmeasurable: p95 {}ms, error rate {}",
                    snapshot.p95_ms, snapshot.error_rate
                ),
            };
        }

        let mut violations = Vec::new();

        if snapshot.p95_ms > self.thresholds.max_p95_ms {
            violations.push(format!(
                "p95 latency {:.1}ms exceeds {:.1}ms",
                snapshot.p95_ms, self.thresholds.max_p95_ms
            ));
        }
        if snapshot.error_rate > self.thresholds.max_error_rate {
            violations.push(format!(
                "error rate {:.2}% exceeds {:.2}%",
                snapshot.error_rate * 100.0,
                self.thresholds.max_error_rate * 100.0
            ));
        }

        if violations.is_empty() {
            GateVerdict {
                decision: Decision::Commit,
                reason: "health gates met".to_string(),
            }
        } else {
            GateVerdict {
                decision: Decision::Abort,
                reason: violations.join("; "),
            }
        }
    }
}

/// Accumulates request samples and rolls them into snapshots.
#[derive(Debug)]
pub struct HealthWindow {
    node_id: String,
    window_id: u64,
    latencies_ms: Vec<f64>,
    errors: u64,
}

impl HealthWindow {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            window_id: 0,
            latencies_ms: Vec::new(),
            errors: 0,
        }
    }

    /// Record one served request.
    pub fn record(&mut self, latency: Duration, is_error: bool) {
        self.latencies_ms.push(latency.as_secs_f64() * 1000.0);
        if is_error {
            self.errors += 1;
        }
    }

    /// Number of requests in the open window.
    pub fn len(&self) -> usize {
        self.latencies_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latencies_ms.is_empty()
    }

    /// Close the current window and start the next one.
    pub fn roll(&mut self) -> HealthSnapshot {
        self.window_id += 1;
        let requests = self.latencies_ms.len();
        let error_rate = if requests == 0 {
            0.0
        } else {
            self.errors as f64 / requests as f64
        };
        self.latencies_ms.sort_by(f64::total_cmp);
        let snapshot = HealthSnapshot {
            node_id: self.node_id.clone(),
            p95_ms: percentile(&self.latencies_ms, 0.95),
            error_rate,
            window_id: self.window_id,
        };
        self.latencies_ms.clear();
        self.errors = 0;
        snapshot
    }
}

/// Nearest-rank percentile over sorted samples; 0.0 when empty.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (sorted.len() as f64 * p).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(p95_ms: f64, error_rate: f64) -> HealthSnapshot {
        HealthSnapshot {
            node_id: "node-b".into(),
            p95_ms,
            error_rate,
            window_id: 1,
        }
    }

    #[test]
    fn healthy_snapshot_votes_commit() {
        let gate = HealthGate::new(HealthThresholds::default());
        let verdict = gate.evaluate(&snapshot(120.0, 0.01));
        assert_eq!(verdict.decision, Decision::Commit);
        assert_eq!(verdict.reason, "health gates met");
    }

    #[test]
    fn thresholds_are_inclusive() {
        let gate = HealthGate::new(HealthThresholds::default());
        assert_eq!(gate.evaluate(&snapshot(200.0, 0.05)).decision, Decision::Commit);
    }

    #[test]
    fn high_error_rate_votes_abort() {
        let gate = HealthGate::new(HealthThresholds::default());
        let verdict = gate.evaluate(&snapshot(120.0, 0.07));
        assert_eq!(verdict.decision, Decision::Abort);
        assert_eq!(verdict.reason, "error rate 7.00% exceeds 5.00%");
    }

    #[test]
    fn every_violation_is_reported() {
        let gate = HealthGate::new(HealthThresholds::default());
        let verdict = gate.evaluate(&snapshot(250.0, 0.2));
        assert_eq!(verdict.decision, Decision::Abort);
        assert!(verdict.reason.contains("p95 latency 250.0ms"));
        assert!(verdict.reason.contains("error rate 20.00%"));
    }

    #[test]
    fn unmeasurable_snapshot_votes_abort() {
        let gate = HealthGate::new(HealthThresholds::default());
        for (p95_ms, error_rate) in [
            (f64::NAN, 0.01),
            (120.0, f64::NAN),
            (-1.0, 0.01),
            (120.0, -0.5),
            (f64::INFINITY, 0.0),
        ] {
            let verdict = gate.evaluate(&snapshot(p95_ms, error_rate));
            assert_eq!(verdict.decision, Decision::Abort, "p95={p95_ms} err={error_rate}");
            assert!(verdict.reason.starts_with("health unmeasurable"));
        }
    }

    #[test]
    fn empty_window_is_idle() {
        let mut window = HealthWindow::new("node-a");
        assert!(window.is_empty());
        let snapshot = window.roll();
        assert_eq!(snapshot.p95_ms, 0.0);
        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.window_id, 1);
    }

    #[test]
    fn window_computes_p95_and_error_rate() {
        let mut window = HealthWindow::new("node-a");
        for ms in 1..=100u64 {
            window.record(Duration::from_millis(ms), ms % 10 == 0);
        }
        assert_eq!(window.len(), 100);

        let snapshot = window.roll();
        assert!((snapshot.p95_ms - 95.0).abs() < 1e-9);
        assert!((snapshot.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(snapshot.node_id, "node-a");

        // Next window starts empty with a new id.
        let next = window.roll();
        assert_eq!(next.window_id, 2);
        assert_eq!(next.p95_ms, 0.0);
    }

    #[test]
    fn single_sample_is_its_own_percentile() {
        assert_eq!(percentile(&[42.0], 0.95), 42.0);
        assert_eq!(percentile(&[1.0, 2.0], 0.95), 2.0);
    }
}
