//! Vote collection for one coordinator round.

use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;

use canary_state::{Decision, NodeId, RoutingState};

/// One participant's answer to a PREPARE_REQ.
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub node_id: NodeId,
    pub txid: String,
    pub decision: Decision,
    pub reason: String,
}

/// How [`Transaction::record`] treated a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteRecord {
    Accepted,
    /// The participant had already voted; the first vote stands.
    Duplicate,
    /// Not a participant of this round, or a different txid.
    Unexpected,
}

/// In-memory state of a proposal, discarded once its outcome is logged.
#[derive(Debug)]
pub struct Transaction {
    pub txid: String,
    pub proposed: RoutingState,
    pub base_version: u64,
    pub deadline: Instant,
    participants: BTreeSet<NodeId>,
    votes: BTreeMap<NodeId, Vote>,
}

impl Transaction {
    pub fn new(
        proposed: RoutingState,
        base_version: u64,
        participants: impl IntoIterator<Item = NodeId>,
        deadline: Instant,
    ) -> Self {
        Self {
            txid: proposed.txid.clone(),
            proposed,
            base_version,
            deadline,
            participants: participants.into_iter().collect(),
            votes: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, vote: Vote) -> VoteRecord {
        if vote.txid != self.txid || !self.participants.contains(&vote.node_id) {
            return VoteRecord::Unexpected;
        }
        if self.votes.contains_key(&vote.node_id) {
            return VoteRecord::Duplicate;
        }
        self.votes.insert(vote.node_id.clone(), vote);
        VoteRecord::Accepted
    }

    /// Every participant has voted.
    pub fn is_complete(&self) -> bool {
        self.votes.len() == self.participants.len()
    }

    /// Participants that have not voted yet.
    pub fn missing(&self) -> Vec<NodeId> {
        self.participants
            .iter()
            .filter(|id| !self.votes.contains_key(*id))
            .cloned()
            .collect()
    }

    /// COMMIT only on unanimous COMMIT votes; silence counts as ABORT.
    pub fn outcome(&self) -> Decision {
        let unanimous = self.is_complete()
            && self.votes.values().all(|v| v.decision == Decision::Commit);
        if unanimous {
            Decision::Commit
        } else {
            Decision::Abort
        }
    }

    /// Human-readable causes of an ABORT outcome.
    pub fn abort_reasons(&self) -> Vec<String> {
        let mut reasons: Vec<String> = self
            .votes
            .values()
            .filter(|v| v.decision == Decision::Abort)
            .map(|v| format!("{}: {}", v.node_id, v.reason))
            .collect();
        reasons.extend(self.missing().into_iter().map(|id| format!("{id}: no vote")));
        reasons
    }
}
