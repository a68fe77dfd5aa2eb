//! Resolver election and resolver rounds.
//!
//! When the coordinator of an in-doubt transaction goes silent, every node
//! applies the same rule to pick a resolver: the highest node id among
//! itself and its reachable peers, never the coordinator. The resolver
//! gathers what each node knows about the transaction and settles it.

use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;

use canary_state::{Decision, NodeId, RoutingState, RoutingStatus};
use canary_transport::TxKnowledge;

/// A transaction some node holds PREPARED without an outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct InDoubt {
    pub txid: String,
    pub coordinator: NodeId,
    pub proposed: RoutingState,
}

/// Pick the resolver from `self_id` and the reachable peers.
pub fn elect_resolver(self_id: &str, coordinator: &str, reachable: &[NodeId]) -> Option<NodeId> {
    reachable
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(self_id))
        .filter(|id| *id != coordinator)
        .max()
        .map(str::to_string)
}

/// Outcome a resolver settles on, with the state to persist and broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub outcome: Decision,
    pub state: RoutingState,
    pub reason: String,
}

/// One resolver's collection of outcome reports.
#[derive(Debug)]
pub struct ResolveRound {
    pub subject: InDoubt,
    pub deadline: Instant,
    expected: BTreeSet<NodeId>,
    reports: BTreeMap<NodeId, TxKnowledge>,
}

impl ResolveRound {
    /// `expected` should be every node except the coordinator.
    pub fn new(subject: InDoubt, expected: BTreeSet<NodeId>, deadline: Instant) -> Self {
        Self {
            subject,
            deadline,
            expected,
            reports: BTreeMap::new(),
        }
    }

    pub fn txid(&self) -> &str {
        &self.subject.txid
    }

    /// Record a report. Returns false for nodes outside the round.
    pub fn record(&mut self, node_id: &str, knowledge: TxKnowledge) -> bool {
        if !self.expected.contains(node_id) {
            return false;
        }
        self.reports.insert(node_id.to_string(), knowledge);
        true
    }

    /// Everyone answered, or someone already knows the outcome.
    pub fn is_complete(&self) -> bool {
        self.reports.len() == self.expected.len()
            || self.reports.values().any(|k| k.terminal().is_some())
    }

    pub fn reports(&self) -> usize {
        self.reports.len()
    }

    pub fn verdict(&self) -> Verdict {
        let known = |status: RoutingStatus| {
            self.reports
                .values()
                .filter_map(TxKnowledge::terminal)
                .find(|state| state.status == status)
                .cloned()
        };

        if let Some(state) = known(RoutingStatus::Committed) {
            return Verdict {
                outcome: Decision::Commit,
                state,
                reason: "a node already committed".into(),
            };
        }
        if let Some(state) = known(RoutingStatus::Aborted) {
            return Verdict {
                outcome: Decision::Abort,
                state,
                reason: "a node already aborted".into(),
            };
        }

        let confirmed = self.expected.iter().all(|id| {
            matches!(
                self.reports.get(id),
                Some(TxKnowledge::Prepared {
                    vote: Some(Decision::Commit)
                })
            )
        });
        if confirmed {
            Verdict {
                outcome: Decision::Commit,
                state: self.subject.proposed.with_status(RoutingStatus::Committed),
                reason: "every reachable participant prepared with a COMMIT vote".into(),
            }
        } else {
            Verdict {
                outcome: Decision::Abort,
                state: self.subject.proposed.with_status(RoutingStatus::Aborted),
                reason: format!(
                    "outcome ambiguous with {} of {} reports",
                    self.reports.len(),
                    self.expected.len()
                ),
            }
        }
    }
}
