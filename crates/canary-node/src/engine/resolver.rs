//! In-doubt resolution: outcome queries, resolver rounds, presumed abort.

use std::collections::BTreeSet;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use canary_state::{NodeId, RoutingState, RoutingStatus};
use canary_transport::{Message, TxKnowledge};

use super::{NodeEngine, Phase};
use crate::election::{InDoubt, ResolveRound, elect_resolver};

impl NodeEngine {
    /// Heartbeat-tick work for a transaction held in doubt.
    pub(super) fn advance_in_doubt(&mut self, now: Instant) {
        let grace = self.config.timing.decision_grace();

        if let Phase::Prepared(pending) = &self.phase {
            if now.saturating_duration_since(pending.since) < grace {
                return;
            }
            let mut pending = pending.clone();
            warn!(
                txid = %pending.proposed.txid,
                coordinator = %pending.coordinator,
                "no decision within grace period, resolving"
            );
            pending.since = now;
            self.phase = Phase::Resolving(pending);
        }

        let Phase::Resolving(pending) = &self.phase else {
            return;
        };
        let subject = pending.in_doubt();
        let resolving_for = now.saturating_duration_since(pending.since);

        self.query_outcome(&subject, false);

        if subject.coordinator == self.config.node_id {
            if resolving_for >= grace {
                self.presume_abort(&subject);
            }
            return;
        }
        if !self.peers.is_reachable(&subject.coordinator) {
            self.maybe_start_resolver(subject, now);
        }
    }

    /// Ask every peer what it knows about `subject`.
    fn query_outcome(&self, subject: &InDoubt, resolver: bool) {
        let query = Message::OutcomeQuery {
            txid: subject.txid.clone(),
            version: subject.proposed.version,
            coordinator: subject.coordinator.clone(),
            proposed: subject.proposed.clone(),
            resolver,
        };
        let unreachable = self.broadcast(&query);
        debug!(txid = %subject.txid, resolver, ?unreachable, "outcome query sent");
    }

    /// A restarted coordinator that found nobody with an outcome.
    fn presume_abort(&mut self, subject: &InDoubt) {
        warn!(txid = %subject.txid, "no outcome found for own proposal, presuming ABORT");
        let aborted = subject.proposed.with_status(RoutingStatus::Aborted);
        if self.resolve_pending(aborted.clone(), "presumed abort") {
            self.broadcast_decision(&aborted);
        }
    }

    /// Start a resolver round if this node wins the election.
    fn maybe_start_resolver(&mut self, subject: InDoubt, now: Instant) {
        if self.resolver.as_ref().is_some_and(|r| r.txid() == subject.txid) {
            return;
        }
        let reachable = self.peers.reachable();
        let elected = elect_resolver(&self.config.node_id, &subject.coordinator, &reachable);
        if elected.as_deref() != Some(self.config.node_id.as_str()) {
            debug!(txid = %subject.txid, resolver = ?elected, "waiting for resolver");
            return;
        }

        let expected: BTreeSet<NodeId> = self
            .peers
            .ids()
            .chain(std::iter::once(&self.config.node_id))
            .filter(|id| **id != subject.coordinator)
            .cloned()
            .collect();
        let own = self.knowledge_of(&subject.txid, subject.proposed.version);
        let mut round = ResolveRound::new(
            subject.clone(),
            expected,
            now + self.config.timing.vote_timeout(),
        );
        round.record(&self.config.node_id, own);

        info!(
            txid = %subject.txid,
            coordinator = %subject.coordinator,
            ?reachable,
            "coordinator unreachable, acting as resolver"
        );
        self.query_outcome(&subject, true);
        let complete = round.is_complete();
        self.resolver = Some(round);
        if complete {
            self.finish_resolver_round();
        }
    }

    pub(super) fn on_outcome_query(
        &mut self,
        from: &str,
        txid: String,
        version: u64,
        coordinator: NodeId,
        proposed: RoutingState,
        resolver: bool,
    ) {
        let knowledge = self.knowledge_of(&txid, version);
        let unknown = knowledge == TxKnowledge::Unknown;
        self.send(
            from,
            Message::OutcomeReply {
                txid: txid.clone(),
                knowledge,
            },
        );

        if resolver {
            let outranked = self
                .resolver
                .as_ref()
                .is_some_and(|r| r.txid() == txid && from > self.config.node_id.as_str());
            if outranked {
                info!(%txid, resolver = %from, "higher resolver active, stepping down");
                self.resolver = None;
            }
            return;
        }

        // A peer is in doubt about a transaction we never saw prepared.
        let learned = unknown
            && matches!(self.phase, Phase::Idle)
            && coordinator != self.config.node_id
            && !self.peers.is_reachable(&coordinator);
        if learned && proposed.version > self.last_version {
            let subject = InDoubt {
                txid,
                coordinator,
                proposed,
            };
            self.maybe_start_resolver(subject, Instant::now());
        }
    }

    pub(super) fn on_outcome_reply(&mut self, from: &str, txid: String, knowledge: TxKnowledge) {
        if let Some(round) = self.resolver.as_mut().filter(|r| r.txid() == txid) {
            round.record(from, knowledge.clone());
            if round.is_complete() {
                self.finish_resolver_round();
                return;
            }
        }

        let Some(state) = knowledge.terminal() else {
            return;
        };
        let pending = self
            .phase
            .pending()
            .is_some_and(|p| p.proposed.txid == txid);
        if pending {
            info!(%txid, %from, status = %state.status, "outcome learned from peer");
            self.resolve_pending(state.clone(), from);
        }
    }

    /// Settle the resolver round: persist the verdict, then broadcast it.
    pub(super) fn finish_resolver_round(&mut self) {
        let Some(round) = self.resolver.take() else {
            return;
        };
        let verdict = round.verdict();
        info!(
            txid = %round.txid(),
            outcome = %verdict.outcome,
            reports = round.reports(),
            reason = %verdict.reason,
            "resolver decided"
        );

        let pending = self
            .phase
            .pending()
            .is_some_and(|p| p.proposed.txid == round.txid());
        let durable = if pending {
            self.resolve_pending(verdict.state.clone(), "resolver")
        } else if verdict.state.version > self.last_version
            && matches!(self.phase, Phase::Idle)
        {
            self.record_terminal(verdict.state.clone()).is_ok()
        } else {
            true
        };

        if durable {
            self.broadcast_decision(&verdict.state);
        }
    }
}
