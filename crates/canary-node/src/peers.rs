//! Peer table — tracks heartbeats and reachability of every other node.
//!
//! A peer counts as unreachable once
//! `elapsed_since_last_heartbeat / interval + failed_sends >= miss_limit`.
//! Peers that were never heard from are measured from table creation.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use canary_state::NodeId;

/// What this node knows about one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandle {
    pub node_id: NodeId,
    pub address: String,
    pub last_committed_version: Option<u64>,
    pub digest: Option<String>,
    pub last_heartbeat: Option<Instant>,
    /// Sends that failed since the last heartbeat.
    pub failed_sends: u32,
    pub reachable: bool,
}

pub struct PeerTable {
    peers: BTreeMap<NodeId, PeerHandle>,
    interval: Duration,
    miss_limit: u32,
    started: Instant,
}

impl PeerTable {
    pub fn new(
        addresses: &BTreeMap<NodeId, String>,
        interval: Duration,
        miss_limit: u32,
        now: Instant,
    ) -> Self {
        let peers = addresses
            .iter()
            .map(|(id, address)| {
                let handle = PeerHandle {
                    node_id: id.clone(),
                    address: address.clone(),
                    last_committed_version: None,
                    digest: None,
                    last_heartbeat: None,
                    failed_sends: 0,
                    reachable: true,
                };
                (id.clone(), handle)
            })
            .collect();
        Self {
            peers,
            interval,
            miss_limit,
            started: now,
        }
    }

    pub fn record_heartbeat(
        &mut self,
        node_id: &str,
        committed_version: u64,
        digest: &str,
        now: Instant,
    ) {
        let Some(peer) = self.peers.get_mut(node_id) else {
            warn!(%node_id, "heartbeat from unknown node");
            return;
        };
        let recovered = !peer.reachable;
        peer.last_committed_version = Some(committed_version);
        peer.digest = Some(digest.to_string());
        peer.last_heartbeat = Some(now);
        peer.failed_sends = 0;
        peer.reachable = true;
        if recovered {
            info!(peer = %node_id, "peer reachable again");
        }
    }

    pub fn record_send_failure(&mut self, node_id: &str) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.failed_sends = peer.failed_sends.saturating_add(1);
            debug!(peer = %node_id, failed_sends = peer.failed_sends, "send to peer failed");
        }
    }

    /// Heartbeats counted as missed for `node_id`.
    pub fn missed(&self, node_id: &str, now: Instant) -> u32 {
        let Some(peer) = self.peers.get(node_id) else {
            return 0;
        };
        let since = peer.last_heartbeat.unwrap_or(self.started);
        let elapsed = now.saturating_duration_since(since);
        let intervals = (elapsed.as_millis() / self.interval.as_millis().max(1)) as u32;
        intervals.saturating_add(peer.failed_sends)
    }

    /// Re-evaluate reachability of every peer.
    pub fn refresh(&mut self, now: Instant) {
        let missed: Vec<(NodeId, u32)> = self
            .peers
            .keys()
            .map(|id| (id.clone(), self.missed(id, now)))
            .collect();

        for (id, missed) in missed {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            let reachable = missed < self.miss_limit;
            if peer.reachable && !reachable {
                warn!(peer = %id, missed, "peer marked unreachable");
            }
            peer.reachable = reachable;
        }
    }

    pub fn is_reachable(&self, node_id: &str) -> bool {
        self.peers.get(node_id).is_some_and(|p| p.reachable)
    }

    pub fn reachable(&self) -> Vec<NodeId> {
        self.peers
            .values()
            .filter(|p| p.reachable)
            .map(|p| p.node_id.clone())
            .collect()
    }

    pub fn unreachable(&self) -> Vec<NodeId> {
        self.peers
            .values()
            .filter(|p| !p.reachable)
            .map(|p| p.node_id.clone())
            .collect()
    }

    #[cfg(test)]
    fn get(&self, node_id: &str) -> Option<&PeerHandle> {
        self.peers.get(node_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.keys()
    }
}
