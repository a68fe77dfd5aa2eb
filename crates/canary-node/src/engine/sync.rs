//! Heartbeats, health exchange and log catch-up.

use std::ops::Bound;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use canary_state::{HealthSnapshot, RoutingState};
use canary_transport::Message;

use super::{MAX_SYNC_ENTRIES, NodeEngine, Phase};

impl NodeEngine {
    /// Send our committed version and health to every peer.
    ///
    /// A refused heartbeat counts as one missed beat for that peer.
    pub(super) fn broadcast_heartbeat(&mut self) {
        let heartbeat = Message::Heartbeat {
            node_id: self.config.node_id.clone(),
            last_committed_version: self.current.version,
            digest: self.current.digest(),
        };
        let health = Message::HealthSnapshot(self.health.clone());

        let peers: Vec<_> = self.config.peers.keys().cloned().collect();
        for peer in peers {
            if !self.send(&peer, heartbeat.clone()) {
                self.peers.record_send_failure(&peer);
                continue;
            }
            self.send(&peer, health.clone());
        }
    }

    pub(super) fn on_heartbeat(&mut self, from: &str, last_committed_version: u64, digest: String) {
        self.peers
            .record_heartbeat(from, last_committed_version, &digest, Instant::now());

        let own = self.current.version;
        if last_committed_version > own {
            debug!(
                peer = %from,
                peer_version = last_committed_version,
                own,
                "peer ahead, requesting sync"
            );
            self.send(from, Message::SyncReq { after_version: own });
            return;
        }
        if last_committed_version < own || digest == self.current.digest() {
            return;
        }

        if self.diverged.is_none() {
            let reason = format!("peer {from} committed a different state at version {own}");
            error!(
                node_id = %self.config.node_id,
                peer = %from,
                version = own,
                own_digest = %self.current.digest(),
                peer_digest = %digest,
                "routing state diverged, refusing rollouts"
            );
            self.diverged = Some(reason);
        }
        self.send(
            from,
            Message::SyncReq {
                after_version: own.saturating_sub(1),
            },
        );
    }

    pub(super) fn on_health_snapshot(&mut self, from: &str, snapshot: HealthSnapshot) {
        if snapshot.node_id != from {
            warn!(%from, node_id = %snapshot.node_id, "health snapshot sender mismatch dropped");
            return;
        }
        self.peer_health.insert(from.to_string(), snapshot);
    }

    pub(super) fn on_sync_request(&self, from: &str, after_version: u64) {
        let entries: Vec<RoutingState> = self
            .history
            .range((Bound::Excluded(after_version), Bound::Unbounded))
            .map(|(_, state)| state.clone())
            .take(MAX_SYNC_ENTRIES)
            .collect();
        debug!(peer = %from, after_version, entries = entries.len(), "serving sync");
        self.send(from, Message::SyncResp { entries });
    }

    pub(super) fn on_sync_response(&mut self, from: &str, entries: Vec<RoutingState>) {
        if matches!(self.phase, Phase::Proposed(_) | Phase::Deciding(..)) {
            debug!(peer = %from, "sync response ignored while coordinating");
            return;
        }

        let mut applied = 0usize;
        for entry in entries {
            if let Some(pending) = self.phase.pending() {
                // The prepared entry already counts toward last_version.
                let (txid, version) = (pending.proposed.txid.clone(), pending.proposed.version);
                if entry.txid == txid {
                    if !self.resolve_pending(entry, from) {
                        break;
                    }
                    applied += 1;
                    continue;
                }
                if entry.version < version {
                    self.check_conflict(from, &entry);
                    continue;
                }
                warn!(
                    peer = %from,
                    pending = %txid,
                    txid = %entry.txid,
                    version = entry.version,
                    "sync entry conflicts with prepared transaction"
                );
                break;
            }

            if entry.version <= self.last_version {
                self.check_conflict(from, &entry);
                continue;
            }

            let txid = entry.txid.clone();
            if self.record_terminal(entry).is_err() {
                break;
            }
            if self.resolver.as_ref().is_some_and(|r| r.txid() == txid) {
                self.resolver = None;
            }
            applied += 1;
        }

        if applied > 0 {
            info!(
                peer = %from,
                applied,
                version = self.current.version,
                last_version = self.last_version,
                "caught up from peer"
            );
        }
    }

    /// Compare a replayed peer entry with our own record of that version.
    fn check_conflict(&self, from: &str, entry: &RoutingState) {
        let Some(own) = self.history.get(&entry.version) else {
            return;
        };
        if own.txid != entry.txid || own.status != entry.status || own.digest() != entry.digest() {
            warn!(
                peer = %from,
                version = entry.version,
                own_txid = %own.txid,
                peer_txid = %entry.txid,
                own_status = %own.status,
                peer_status = %entry.status,
                "sync entry conflicts with local log"
            );
        }
    }
}
