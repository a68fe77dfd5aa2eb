//! Participant role: evaluate, vote, apply.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use canary_state::{Decision, LogEntry, RoutingState};
use canary_transport::Message;

use super::{NodeEngine, PendingPrepare, Phase};

/// Why a proposal is refused before the health gate is consulted.
enum Refusal {
    Refused(String),
    /// Our committed state is older than the proposal's base.
    Behind(String),
}

impl NodeEngine {
    fn refusal(&self, version: u64, base_version: u64) -> Option<Refusal> {
        if let Some(fault) = &self.log_fault {
            return Some(Refusal::Refused(format!("log unavailable: {fault}")));
        }
        if let Some(reason) = &self.diverged {
            return Some(Refusal::Refused(format!("diverged: {reason}")));
        }
        if let Some(txid) = self.phase.txid() {
            return Some(Refusal::Refused(format!("transaction {txid} in flight")));
        }
        if version <= self.last_version {
            return Some(Refusal::Refused(format!(
                "stale proposal: version {version} is not above {}",
                self.last_version
            )));
        }
        let committed = self.current.version;
        if base_version > committed {
            return Some(Refusal::Behind(format!(
                "committed version {committed} behind proposal base {base_version}"
            )));
        }
        if base_version < committed {
            return Some(Refusal::Refused(format!(
                "proposal base {base_version} older than committed version {committed}"
            )));
        }
        None
    }

    pub(super) fn on_prepare_request(
        &mut self,
        from: &str,
        txid: String,
        version: u64,
        base_version: u64,
        proposed: RoutingState,
    ) {
        if let Some(pending) = self.phase.pending().filter(|p| p.proposed.txid == txid) {
            if let Some(vote) = pending.vote {
                debug!(%txid, %from, %vote, "duplicate prepare, repeating vote");
                self.send(
                    from,
                    Message::PrepareResp {
                        txid,
                        vote,
                        reason: "duplicate prepare; vote unchanged".into(),
                    },
                );
            }
            return;
        }

        if let Some(refusal) = self.refusal(version, base_version) {
            let (reason, behind) = match refusal {
                Refusal::Refused(reason) => (reason, false),
                Refusal::Behind(reason) => (reason, true),
            };
            warn!(%txid, %from, version, %reason, "voting ABORT without preparing");
            self.send(
                from,
                Message::PrepareResp {
                    txid,
                    vote: Decision::Abort,
                    reason,
                },
            );
            if behind {
                self.send(
                    from,
                    Message::SyncReq {
                        after_version: self.current.version,
                    },
                );
            }
            return;
        }

        let verdict = self.gate.evaluate(self.unmeasurable.as_ref().unwrap_or(&self.health));
        let entry = LogEntry::prepared(proposed.clone(), from, verdict.decision);
        if let Err(e) = self.persist(entry) {
            self.send(
                from,
                Message::PrepareResp {
                    txid,
                    vote: Decision::Abort,
                    reason: e.to_string(),
                },
            );
            return;
        }

        info!(
            %txid,
            version,
            coordinator = %from,
            vote = %verdict.decision,
            reason = %verdict.reason,
            "prepared"
        );
        self.phase = Phase::Prepared(PendingPrepare {
            proposed,
            coordinator: from.to_string(),
            vote: Some(verdict.decision),
            since: Instant::now(),
        });
        self.send(
            from,
            Message::PrepareResp {
                txid,
                vote: verdict.decision,
                reason: verdict.reason,
            },
        );
    }

    pub(super) fn on_decision(
        &mut self,
        from: &str,
        txid: String,
        outcome: Decision,
        state: RoutingState,
    ) {
        if let Some(pending) = self.phase.pending().filter(|p| p.proposed.txid == txid) {
            if pending.proposed.version != state.version {
                warn!(
                    %txid,
                    %from,
                    expected = pending.proposed.version,
                    got = state.version,
                    "decision version mismatch ignored"
                );
                return;
            }
            self.resolve_pending(state, from);
            return;
        }

        if self.phase.txid() == Some(txid.as_str()) {
            // Coordinating this round ourselves.
            self.adopt_round_decision(from, outcome);
            return;
        }

        if self.resolver.as_ref().is_some_and(|r| r.txid() == txid) {
            info!(%txid, %from, "decision arrived, ending resolver round");
            self.resolver = None;
        }

        if self.history.get(&state.version).is_some_and(|s| s.txid == txid) {
            debug!(%txid, %from, "duplicate decision ignored");
        } else {
            debug!(%txid, %from, %outcome, "decision for unknown transaction ignored");
        }
    }

    /// Persist the terminal state of the pending transaction and go idle.
    ///
    /// Returns false if the log write failed; the node stays in doubt.
    pub(super) fn resolve_pending(&mut self, state: RoutingState, source: &str) -> bool {
        let txid = state.txid.clone();
        let version = state.version;
        let status = state.status;
        if self.record_terminal(state).is_err() {
            return false;
        }
        self.phase = Phase::Idle;
        if self.resolver.as_ref().is_some_and(|r| r.txid() == txid) {
            self.resolver = None;
        }
        info!(%txid, version, %status, %source, "transaction resolved");
        true
    }
}
