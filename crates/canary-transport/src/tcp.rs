//! TCP transport — one persistent outbound link per peer.
//!
//! Each configured peer gets a link task that owns the outbound connection.
//! The task connects with a timeout, writes queued frames, and on failure
//! marks the link down, drops what was queued and reconnects with
//! exponential backoff. Inbound connections are served by one reader task
//! each, which push validated envelopes into the node's inbox.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use canary_state::NodeId;

use crate::Transport;
use crate::backoff::Backoff;
use crate::codec::{read_frame, write_frame};
use crate::error::TransportError;
use crate::message::{Envelope, Message};

const LINK_CONNECTING: u8 = 0;
const LINK_UP: u8 = 1;
const LINK_DOWN: u8 = 2;

/// Tunables for peer links.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub connect_timeout: Duration,
    /// Frames buffered per peer before `send` reports the peer unreachable.
    pub queue_depth: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            queue_depth: 256,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

struct PeerLink {
    queue: mpsc::Sender<Envelope>,
    state: Arc<AtomicU8>,
}

/// [`Transport`] over persistent TCP connections.
pub struct TcpTransport {
    node_id: NodeId,
    local_addr: SocketAddr,
    links: HashMap<NodeId, PeerLink>,
}

impl TcpTransport {
    /// Bind `listen_addr` and start the listener and peer link tasks.
    pub async fn bind(
        node_id: &str,
        listen_addr: &str,
        peers: &BTreeMap<NodeId, String>,
        config: TcpConfig,
        inbox: mpsc::Sender<Envelope>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| TransportError::Bind(format!("{listen_addr}: {e}")))?;
        Self::start(node_id, listener, peers, config, inbox, shutdown)
    }

    /// Start serving on an already bound listener.
    pub fn start(
        node_id: &str,
        listener: TcpListener,
        peers: &BTreeMap<NodeId, String>,
        config: TcpConfig,
        inbox: mpsc::Sender<Envelope>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, TransportError> {
        let local_addr = listener.local_addr()?;
        let known: Arc<BTreeSet<NodeId>> = Arc::new(
            peers
                .keys()
                .filter(|id| id.as_str() != node_id)
                .cloned()
                .collect(),
        );

        tokio::spawn(accept_loop(
            listener,
            known,
            inbox,
            shutdown.clone(),
        ));

        let mut links = HashMap::new();
        for (peer, addr) in peers {
            if peer == node_id {
                continue;
            }
            let (queue, rx) = mpsc::channel(config.queue_depth);
            let state = Arc::new(AtomicU8::new(LINK_CONNECTING));
            tokio::spawn(run_link(
                peer.clone(),
                addr.clone(),
                rx,
                state.clone(),
                config.clone(),
                shutdown.clone(),
            ));
            links.insert(peer.clone(), PeerLink { queue, state });
        }

        info!(%node_id, %local_addr, peers = links.len(), "tcp transport started");
        Ok(Self {
            node_id: node_id.to_string(),
            local_addr,
            links,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: &str, message: Message) -> Result<(), TransportError> {
        let link = self
            .links
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.to_string()))?;
        if link.state.load(Ordering::Acquire) == LINK_DOWN {
            return Err(TransportError::PeerUnreachable(to.to_string()));
        }
        let envelope = Envelope {
            from: self.node_id.clone(),
            message,
        };
        link.queue
            .try_send(envelope)
            .map_err(|_| TransportError::PeerUnreachable(to.to_string()))
    }
}

// ── Inbound ───────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    known: Arc<BTreeSet<NodeId>>,
    inbox: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "inbound peer connection");
                    tokio::spawn(read_loop(
                        stream,
                        remote,
                        known.clone(),
                        inbox.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.changed() => {
                debug!("listener shutting down");
                break;
            }
        }
    }
}

async fn read_loop(
    stream: TcpStream,
    remote: SocketAddr,
    known: Arc<BTreeSet<NodeId>>,
    inbox: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = shutdown.changed() => break,
        };
        match frame {
            Ok(Some(envelope)) => {
                if !known.contains(&envelope.from) {
                    warn!(
                        %remote,
                        from = %envelope.from,
                        "frame from unknown peer, closing connection"
                    );
                    break;
                }
                debug!(from = %envelope.from, kind = envelope.message.kind(), "frame received");
                if inbox.send(envelope).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(%remote, "peer closed connection");
                break;
            }
            Err(TransportError::InvalidMessage(reason)) => {
                warn!(%remote, %reason, "dropping invalid message");
            }
            Err(e) => {
                warn!(%remote, error = %e, "closing peer connection");
                break;
            }
        }
    }
}

// ── Outbound ──────────────────────────────────────────────────────

async fn run_link(
    peer: NodeId,
    addr: String,
    mut queue: mpsc::Receiver<Envelope>,
    state: Arc<AtomicU8>,
    config: TcpConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);

    loop {
        let connect = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr));
        let connected = tokio::select! {
            result = connect => result,
            _ = shutdown.changed() => return,
        };

        match connected {
            Ok(Ok(mut stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                }
                state.store(LINK_UP, Ordering::Release);
                backoff.reset();
                info!(%peer, %addr, "peer link up");

                loop {
                    let next = tokio::select! {
                        next = queue.recv() => next,
                        _ = shutdown.changed() => return,
                    };
                    // All senders gone: the transport was dropped.
                    let Some(envelope) = next else { return };
                    if let Err(e) = write_frame(&mut stream, &envelope).await {
                        warn!(
                            %peer,
                            kind = envelope.message.kind(),
                            error = %e,
                            "peer link write failed"
                        );
                        break;
                    }
                }
            }
            Ok(Err(e)) => debug!(%peer, %addr, error = %e, "peer connect failed"),
            Err(_) => debug!(%peer, %addr, "peer connect timed out"),
        }

        state.store(LINK_DOWN, Ordering::Release);
        let mut dropped = 0usize;
        while queue.try_recv().is_ok() {
            dropped += 1;
        }
        let delay = backoff.next_delay();
        debug!(
            %peer,
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            dropped,
            "peer link down, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
        state.store(LINK_CONNECTING, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use canary_state::HealthSnapshot;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::codec::encode_frame;

    fn snapshot(node_id: &str) -> Message {
        Message::HealthSnapshot(HealthSnapshot::idle(node_id))
    }

    async fn recv(inbox: &mut mpsc::Receiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("inbox closed")
    }

    #[tokio::test]
    async fn delivers_between_two_nodes() {
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peers = BTreeMap::from([
            ("node-a".to_string(), listener_a.local_addr().unwrap().to_string()),
            ("node-b".to_string(), listener_b.local_addr().unwrap().to_string()),
        ]);

        let (inbox_a, mut rx_a) = mpsc::channel(16);
        let (inbox_b, mut rx_b) = mpsc::channel(16);
        let config = TcpConfig::default();
        let a = TcpTransport::start(
            "node-a",
            listener_a,
            &peers,
            config.clone(),
            inbox_a,
            shutdown.clone(),
        )
        .unwrap();
        let b = TcpTransport::start("node-b", listener_b, &peers, config, inbox_b, shutdown.clone())
            .unwrap();

        a.send("node-b", snapshot("node-a")).unwrap();
        let got = recv(&mut rx_b).await;
        assert_eq!(got.from, "node-a");
        assert_eq!(got.message, snapshot("node-a"));

        b.send("node-a", snapshot("node-b")).unwrap();
        assert_eq!(recv(&mut rx_a).await.from, "node-b");
    }

    #[tokio::test]
    async fn unknown_destination_is_an_error() {
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (inbox, _rx) = mpsc::channel(16);
        let no_peers = BTreeMap::new();
        let config = TcpConfig::default();
        let transport =
            TcpTransport::start("node-a", listener, &no_peers, config, inbox, shutdown).unwrap();

        let err = transport.send("node-z", snapshot("node-a")).unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn dead_peer_becomes_unreachable() {
        let (_shutdown_tx, shutdown) = watch::channel(false);
        // Grab a free port and release it so connects are refused.
        let dead_addr = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().to_string()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peers = BTreeMap::from([("node-b".to_string(), dead_addr)]);
        let (inbox, _rx) = mpsc::channel(16);
        let config = TcpConfig {
            backoff_base: Duration::from_secs(5),
            ..TcpConfig::default()
        };
        let transport =
            TcpTransport::start("node-a", listener, &peers, config, inbox, shutdown).unwrap();

        let mut unreachable = false;
        for _ in 0..100 {
            if let Err(TransportError::PeerUnreachable(peer)) =
                transport.send("node-b", snapshot("node-a"))
            {
                assert_eq!(peer, "node-b");
                unreachable = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(unreachable);
    }

    #[tokio::test]
    async fn frames_from_unknown_senders_are_dropped() {
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peers = BTreeMap::from([("node-a".to_string(), "127.0.0.1:1".to_string())]);
        let (inbox, mut rx) = mpsc::channel(16);
        let _transport =
            TcpTransport::start("node-b", listener, &peers, TcpConfig::default(), inbox, shutdown)
                .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let intruder = Envelope {
            from: "mallory".into(),
            message: snapshot("mallory"),
        };
        stream.write_all(&encode_frame(&intruder).unwrap()).await.unwrap();
        let friend = Envelope {
            from: "node-a".into(),
            message: snapshot("node-a"),
        };
        // The connection is closed after the intruder's frame, so this one is lost.
        let _ = stream.write_all(&encode_frame(&friend).unwrap()).await;

        let got = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(got.is_err(), "no envelope should reach the inbox");
    }
}
