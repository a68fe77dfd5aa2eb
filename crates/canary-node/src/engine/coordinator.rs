//! Coordinator role: propose, collect votes, decide.

use std::collections::BTreeMap;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use canary_state::{Decision, LogEntry, NodeId, epoch_millis, validate_weights};
use canary_transport::Message;

use super::{CoordinatorRound, NodeEngine, Phase, ReplyTx, RolloutReport};
use crate::error::{NodeError, NodeResult};
use crate::transaction::{Transaction, Vote, VoteRecord};

impl NodeEngine {
    fn check_can_propose(&self) -> NodeResult<()> {
        if let Some(fault) = &self.log_fault {
            return Err(NodeError::LogUnavailable(fault.clone()));
        }
        if let Some(reason) = &self.diverged {
            return Err(NodeError::Diverged(reason.clone()));
        }
        if let Some(txid) = self.phase.txid() {
            return Err(NodeError::RolloutInFlight(txid.to_string()));
        }
        Ok(())
    }

    pub(super) fn initiate_rollout(&mut self, weights: BTreeMap<String, f64>, reply: ReplyTx) {
        if let Err(e) = self.check_can_propose() {
            warn!(node_id = %self.config.node_id, error = %e, "rollout refused");
            let _ = reply.send(Err(e));
            return;
        }
        if let Err(e) = validate_weights(&weights) {
            let _ = reply.send(Err(NodeError::InvalidProposal(e.to_string())));
            return;
        }

        let node_id = self.config.node_id.clone();
        let version = self.last_version + 1;
        let txid = format!("rollout-{node_id}-{version}-{}", epoch_millis());
        let proposed = self.current.propose(version, &txid, weights);

        let own_entry = LogEntry::prepared(proposed.clone(), &node_id, Decision::Commit);
        if let Err(e) = self.persist(own_entry) {
            let _ = reply.send(Err(e));
            return;
        }

        let base_version = self.current.version;
        let participants: Vec<NodeId> = self.config.peers.keys().cloned().collect();
        let deadline = Instant::now() + self.config.timing.vote_timeout();
        info!(
            %txid,
            version,
            base_version,
            participants = participants.len(),
            weights = ?proposed.weights,
            "rollout proposed"
        );

        let request = Message::PrepareReq {
            txid: txid.clone(),
            version,
            base_version,
            proposed: proposed.clone(),
        };
        let undelivered = self.broadcast(&request);
        if !undelivered.is_empty() {
            warn!(%txid, ?undelivered, "prepare request not delivered");
        }

        let txn = Transaction::new(proposed, base_version, participants, deadline);
        let complete = txn.is_complete();
        self.phase = Phase::Proposed(CoordinatorRound {
            txn,
            reply: Some(reply),
        });
        if complete {
            self.decide_round();
        }
    }

    pub(super) fn on_prepare_response(
        &mut self,
        from: &str,
        txid: String,
        decision: Decision,
        reason: String,
    ) {
        let Phase::Proposed(round) = &mut self.phase else {
            debug!(%from, %txid, "vote outside a voting round ignored");
            return;
        };
        let vote = Vote {
            node_id: from.to_string(),
            txid,
            decision,
            reason,
        };
        match round.txn.record(vote.clone()) {
            VoteRecord::Accepted => {
                info!(
                    txid = %vote.txid,
                    voter = %from,
                    vote = %decision,
                    reason = %vote.reason,
                    "vote received"
                );
            }
            VoteRecord::Duplicate => {
                debug!(txid = %vote.txid, voter = %from, "duplicate vote ignored");
            }
            VoteRecord::Unexpected => {
                debug!(txid = %vote.txid, voter = %from, "vote for another transaction ignored");
                return;
            }
        }
        if round.txn.is_complete() {
            self.decide_round();
        }
    }

    /// Close the voting window and move to DECIDING.
    pub(super) fn decide_round(&mut self) {
        let round = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Proposed(round) => round,
            other => {
                self.phase = other;
                return;
            }
        };
        let outcome = round.txn.outcome();
        if outcome == Decision::Abort {
            info!(
                txid = %round.txn.txid,
                reasons = ?round.txn.abort_reasons(),
                "round aborted"
            );
        }
        self.phase = Phase::Deciding(round, outcome);
        self.finish_decision();
    }

    /// Write the terminal entry, then broadcast it and answer the caller.
    ///
    /// Stays in DECIDING when the write fails; the next successful log
    /// restore calls back in here.
    pub(super) fn finish_decision(&mut self) {
        let (round, outcome) = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Deciding(round, outcome) => (round, outcome),
            other => {
                self.phase = other;
                return;
            }
        };

        let final_state = round.txn.proposed.with_status(outcome.terminal_status());
        if let Err(e) = self.record_terminal(final_state.clone()) {
            warn!(
                txid = %round.txn.txid,
                %outcome,
                error = %e,
                "decision not yet durable, holding"
            );
            self.phase = Phase::Deciding(round, outcome);
            return;
        }

        self.broadcast_decision(&final_state);
        info!(
            txid = %final_state.txid,
            version = final_state.version,
            %outcome,
            "rollout decided"
        );

        let CoordinatorRound { txn, reply } = round;
        if let Some(reply) = reply {
            let abort_reasons = match outcome {
                Decision::Commit => Vec::new(),
                Decision::Abort => txn.abort_reasons(),
            };
            let _ = reply.send(Ok(RolloutReport {
                txid: txn.txid,
                version: final_state.version,
                outcome,
                state: final_state,
                abort_reasons,
            }));
        }
    }

    /// A DECISION for the round this node coordinates, sent by a resolver
    /// while our own outcome was not yet published.
    pub(super) fn adopt_round_decision(&mut self, from: &str, outcome: Decision) {
        let round = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Proposed(round) | Phase::Deciding(round, _) => round,
            other => {
                self.phase = other;
                return;
            }
        };
        warn!(txid = %round.txn.txid, %from, %outcome, "adopting outcome decided by resolver");
        self.phase = Phase::Deciding(round, outcome);
        self.finish_decision();
    }
}
