//! In-process network for exercising nodes without sockets.
//!
//! Each joined node gets a [`LocalTransport`] and an inbox receiver. Tests
//! can crash a node, isolate it, or cut a single direction of a link.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use canary_state::NodeId;

use crate::Transport;
use crate::error::TransportError;
use crate::message::{Envelope, Message};

const MAILBOX_DEPTH: usize = 1024;

#[derive(Default)]
struct Fabric {
    mailboxes: HashMap<NodeId, mpsc::Sender<Envelope>>,
    /// Directed links that drop traffic: (from, to).
    cut: HashSet<(NodeId, NodeId)>,
    isolated: HashSet<NodeId>,
}

/// Shared switchboard connecting every [`LocalTransport`].
#[derive(Clone, Default)]
pub struct LocalNetwork {
    fabric: Arc<Mutex<Fabric>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn fabric(&self) -> MutexGuard<'_, Fabric> {
        self.fabric.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach `node_id`, replacing any previous mailbox (a restart).
    pub fn join(&self, node_id: &str) -> (LocalTransport, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.fabric().mailboxes.insert(node_id.to_string(), tx);
        debug!(%node_id, "joined local network");
        let transport = LocalTransport {
            node_id: node_id.to_string(),
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Detach `node_id`; traffic to it is unreachable until it joins again.
    pub fn crash(&self, node_id: &str) {
        self.fabric().mailboxes.remove(node_id);
        debug!(%node_id, "crashed on local network");
    }

    /// Drop all traffic to and from `node_id`.
    pub fn isolate(&self, node_id: &str) {
        self.fabric().isolated.insert(node_id.to_string());
    }

    /// Drop traffic from `from` to `to`; the reverse direction is unaffected.
    pub fn cut(&self, from: &str, to: &str) {
        self.fabric().cut.insert((from.to_string(), to.to_string()));
    }

    /// Undo every cut and isolation.
    pub fn heal(&self) {
        let mut fabric = self.fabric();
        fabric.cut.clear();
        fabric.isolated.clear();
    }

    fn deliver(&self, from: &str, to: &str, message: Message) -> Result<(), TransportError> {
        let fabric = self.fabric();
        let blocked = fabric.isolated.contains(from)
            || fabric.isolated.contains(to)
            || fabric.cut.contains(&(from.to_string(), to.to_string()));
        if blocked || !fabric.mailboxes.contains_key(from) {
            return Err(TransportError::PeerUnreachable(to.to_string()));
        }
        let mailbox = fabric
            .mailboxes
            .get(to)
            .ok_or_else(|| TransportError::PeerUnreachable(to.to_string()))?;
        mailbox
            .try_send(Envelope {
                from: from.to_string(),
                message,
            })
            .map_err(|_| TransportError::PeerUnreachable(to.to_string()))
    }
}

/// One node's handle onto a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    node_id: NodeId,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn send(&self, to: &str, message: Message) -> Result<(), TransportError> {
        self.network.deliver(&self.node_id, to, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping() -> Message {
        Message::SyncReq { after_version: 0 }
    }

    #[tokio::test]
    async fn delivers_to_joined_nodes() {
        let net = LocalNetwork::new();
        let (a, _rx_a) = net.join("node-a");
        let (_b, mut rx_b) = net.join("node-b");

        a.send("node-b", ping()).unwrap();
        let envelope = rx_b.recv().await.unwrap();
        assert_eq!(envelope.from, "node-a");
        assert_eq!(envelope.message, ping());
    }

    #[tokio::test]
    async fn crashed_nodes_neither_send_nor_receive() {
        let net = LocalNetwork::new();
        let (a, _rx_a) = net.join("node-a");
        let (b, _rx_b) = net.join("node-b");

        net.crash("node-b");
        assert!(matches!(
            a.send("node-b", ping()),
            Err(TransportError::PeerUnreachable(_))
        ));
        assert!(b.send("node-a", ping()).is_err());

        let (_b, mut rx_b) = net.join("node-b");
        a.send("node-b", ping()).unwrap();
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn cut_is_one_directional() {
        let net = LocalNetwork::new();
        let (a, mut rx_a) = net.join("node-a");
        let (b, _rx_b) = net.join("node-b");

        net.cut("node-b", "node-a");
        assert!(b.send("node-a", ping()).is_err());
        assert!(a.send("node-b", ping()).is_ok());

        net.heal();
        b.send("node-a", ping()).unwrap();
        assert!(rx_a.recv().await.is_some());
    }

    #[tokio::test]
    async fn isolation_blocks_both_directions() {
        let net = LocalNetwork::new();
        let (a, _rx_a) = net.join("node-a");
        let (b, _rx_b) = net.join("node-b");

        net.isolate("node-a");
        assert!(a.send("node-b", ping()).is_err());
        assert!(b.send("node-a", ping()).is_err());
    }
}
