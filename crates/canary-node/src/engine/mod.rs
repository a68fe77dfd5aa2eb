//! Node engine — the single writer of a node's routing state.
//!
//! One tokio task owns the transaction log, the current routing state and
//! the protocol phase. It reacts to four event sources in a `select!` loop:
//!
//! - peer envelopes from the transport inbox
//! - commands from [`NodeHandle`]s (start a rollout, report health)
//! - the heartbeat interval, which also drives retries and in-doubt
//!   resolution
//! - the earliest protocol deadline (vote window or resolver window)
//!
//! After each event the engine publishes a [`RoutingView`] through a
//! `watch` channel. Readers only ever see those snapshots.
//!
//! Phases:
//!
//! ```text
//! coordinator:  Idle → Proposed → Deciding → Idle
//! participant:  Idle → Prepared → (Resolving) → Idle
//! ```

mod coordinator;
mod participant;
mod resolver;
mod sync;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use canary_state::{
    Decision, HealthSnapshot, Journal, LogEntry, NodeId, RoutingState, RoutingStatus,
    TransactionLog, fold,
};
use canary_transport::{Envelope, Message, Transport, TransportError, TxKnowledge};

use crate::config::NodeConfig;
use crate::election::{InDoubt, ResolveRound};
use crate::error::{NodeError, NodeResult};
use crate::handle::NodeHandle;
use crate::health::HealthGate;
use crate::peers::PeerTable;
use crate::transaction::Transaction;

const COMMAND_DEPTH: usize = 64;

/// Attempts per peer before a DECISION is left to the peer to recover.
const MAX_REDELIVERY_ATTEMPTS: u32 = 5;

/// Most terminal states returned in one SYNC_RESP.
const MAX_SYNC_ENTRIES: usize = 256;

pub(crate) type ReplyTx = oneshot::Sender<NodeResult<RolloutReport>>;

pub(crate) enum Command {
    InitiateRollout {
        weights: BTreeMap<String, f64>,
        reply: ReplyTx,
    },
    StageCanary {
        share: f64,
        reply: ReplyTx,
    },
    ReportHealth(HealthSnapshot),
}

/// Result of a rollout this node coordinated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloutReport {
    pub txid: String,
    pub version: u64,
    pub outcome: Decision,
    /// Terminal state as written to the log.
    pub state: RoutingState,
    /// Why the round aborted; empty on commit.
    pub abort_reasons: Vec<String>,
}

/// Externally visible protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodePhase {
    Idle,
    Proposed,
    Deciding,
    Prepared,
    Resolving,
}

/// Consistent snapshot of a node, published after every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingView {
    pub node_id: NodeId,
    /// Last COMMITTED state: the effective routing configuration.
    pub current: RoutingState,
    /// Highest version in the log, aborted outcomes included.
    pub last_version: u64,
    pub phase: NodePhase,
    pub pending_txid: Option<String>,
    pub health: HealthSnapshot,
    /// Latest rejected local report, while no well-formed one replaced it.
    pub unmeasurable_health: Option<HealthSnapshot>,
    pub peer_health: BTreeMap<NodeId, HealthSnapshot>,
    pub unreachable_peers: Vec<NodeId>,
    pub log_fault: Option<String>,
    pub diverged: Option<String>,
}

/// A proposal this node holds PREPARED without an outcome.
#[derive(Debug, Clone)]
struct PendingPrepare {
    proposed: RoutingState,
    coordinator: NodeId,
    vote: Option<Decision>,
    /// When the current phase (PREPARED or RESOLVING) began.
    since: Instant,
}

impl PendingPrepare {
    fn in_doubt(&self) -> InDoubt {
        InDoubt {
            txid: self.proposed.txid.clone(),
            coordinator: self.coordinator.clone(),
            proposed: self.proposed.clone(),
        }
    }
}

struct CoordinatorRound {
    txn: Transaction,
    reply: Option<ReplyTx>,
}

enum Phase {
    Idle,
    Proposed(CoordinatorRound),
    /// Outcome reached; waiting for the terminal entry to become durable.
    Deciding(CoordinatorRound, Decision),
    Prepared(PendingPrepare),
    Resolving(PendingPrepare),
}

impl Phase {
    fn public(&self) -> NodePhase {
        match self {
            Phase::Idle => NodePhase::Idle,
            Phase::Proposed(_) => NodePhase::Proposed,
            Phase::Deciding(..) => NodePhase::Deciding,
            Phase::Prepared(_) => NodePhase::Prepared,
            Phase::Resolving(_) => NodePhase::Resolving,
        }
    }

    fn txid(&self) -> Option<&str> {
        match self {
            Phase::Idle => None,
            Phase::Proposed(round) | Phase::Deciding(round, _) => Some(&round.txn.txid),
            Phase::Prepared(pending) | Phase::Resolving(pending) => Some(&pending.proposed.txid),
        }
    }

    fn pending(&self) -> Option<&PendingPrepare> {
        match self {
            Phase::Prepared(pending) | Phase::Resolving(pending) => Some(pending),
            _ => None,
        }
    }
}

/// A DECISION that could not be handed to the transport yet.
struct Redelivery {
    to: NodeId,
    message: Message,
    attempts: u32,
}

pub struct NodeEngine {
    config: NodeConfig,
    journal: Box<dyn Journal>,
    transport: Arc<dyn Transport>,
    gate: HealthGate,
    peers: PeerTable,
    current: RoutingState,
    last_version: u64,
    /// Every terminal state in the log, by version.
    history: BTreeMap<u64, RoutingState>,
    phase: Phase,
    resolver: Option<ResolveRound>,
    /// Last well-formed local snapshot; published and sent to peers.
    health: HealthSnapshot,
    /// A malformed report newer than `health`. The gate votes on it until a
    /// well-formed window replaces it.
    unmeasurable: Option<HealthSnapshot>,
    peer_health: BTreeMap<NodeId, HealthSnapshot>,
    redeliveries: Vec<Redelivery>,
    log_fault: Option<String>,
    /// Set on the first equal-version digest mismatch and never cleared.
    /// Conflicting SYNC_RESP entries are only logged; repairing the log is
    /// left to an operator restart.
    diverged: Option<String>,
    view_tx: watch::Sender<RoutingView>,
}

impl NodeEngine {
    /// Open the node's log at `config.log_path()` and recover from it.
    pub fn open(config: NodeConfig, transport: Arc<dyn Transport>) -> NodeResult<Self> {
        config.validate()?;
        let (log, replay) = TransactionLog::open(&config.log_path())?;
        if replay.discarded_bytes > 0 {
            warn!(
                node_id = %config.node_id,
                discarded_bytes = replay.discarded_bytes,
                "recovered with a truncated log tail"
            );
        }
        Self::with_journal(config, Box::new(log), replay.entries, transport)
    }

    /// Build an engine on any journal, given the entries it already holds.
    pub fn with_journal(
        config: NodeConfig,
        journal: Box<dyn Journal>,
        entries: Vec<LogEntry>,
        transport: Arc<dyn Transport>,
    ) -> NodeResult<Self> {
        config.validate()?;
        let now = Instant::now();
        let recovered = fold(&entries, config.genesis());

        // Log ordering admits at most one open PREPARED entry.
        let phase = match recovered.in_doubt.into_iter().next_back() {
            Some(entry) => {
                let (coordinator, vote) = match entry.prepare {
                    Some(record) => (record.coordinator, Some(record.vote)),
                    None => (String::new(), None),
                };
                warn!(
                    node_id = %config.node_id,
                    txid = %entry.state.txid,
                    version = entry.state.version,
                    %coordinator,
                    "replayed transaction is in doubt, resolving"
                );
                Phase::Resolving(PendingPrepare {
                    proposed: entry.state,
                    coordinator,
                    vote,
                    since: now,
                })
            }
            None => Phase::Idle,
        };

        info!(
            node_id = %config.node_id,
            version = recovered.current.version,
            last_version = recovered.last_version,
            entries = entries.len(),
            "node state recovered"
        );

        let peers = PeerTable::new(
            &config.peers,
            config.timing.heartbeat_interval(),
            config.timing.heartbeat_miss_limit,
            now,
        );
        let health = HealthSnapshot::idle(&config.node_id);
        let initial_view = RoutingView {
            node_id: config.node_id.clone(),
            current: recovered.current.clone(),
            last_version: recovered.last_version,
            phase: phase.public(),
            pending_txid: phase.txid().map(str::to_string),
            health: health.clone(),
            unmeasurable_health: None,
            peer_health: BTreeMap::new(),
            unreachable_peers: Vec::new(),
            log_fault: None,
            diverged: None,
        };
        let (view_tx, _) = watch::channel(initial_view);

        Ok(Self {
            gate: HealthGate::new(config.health.clone()),
            config,
            journal,
            transport,
            peers,
            current: recovered.current,
            last_version: recovered.last_version,
            history: recovered
                .history
                .into_iter()
                .map(|state| (state.version, state))
                .collect(),
            phase,
            resolver: None,
            health,
            unmeasurable: None,
            peer_health: BTreeMap::new(),
            redeliveries: Vec::new(),
            log_fault: None,
            diverged: None,
            view_tx,
        })
    }

    /// Start the event loop. Returns the handle readers and callers use.
    pub fn spawn(
        self,
        inbox: mpsc::Receiver<Envelope>,
        shutdown: watch::Receiver<bool>,
    ) -> (NodeHandle, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_DEPTH);
        let handle = NodeHandle::new(commands, self.view_tx.subscribe());
        let task = tokio::spawn(self.run(inbox, command_rx, shutdown));
        (handle, task)
    }

    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Envelope>,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.timing.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            node_id = %self.config.node_id,
            version = self.current.version,
            peers = self.config.peers.len(),
            "node engine started"
        );

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                Some(envelope) = inbox.recv() => self.handle_envelope(envelope),
                Some(command) = commands.recv() => self.handle_command(command),
                _ = heartbeat.tick() => self.on_tick(Instant::now()),
                _ = sleep_until(deadline) => self.on_deadline(Instant::now()),
                _ = shutdown.changed() => {
                    info!(node_id = %self.config.node_id, "node engine shutting down");
                    break;
                }
            }
            self.publish_view();
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────

    fn handle_envelope(&mut self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        if !self.config.peers.contains_key(&from) {
            warn!(%from, kind = message.kind(), "message from unknown node dropped");
            return;
        }
        if let Err(e) = message.validate() {
            warn!(%from, kind = message.kind(), error = %e, "invalid message dropped");
            return;
        }
        debug!(%from, kind = message.kind(), "message received");

        match message {
            Message::PrepareReq {
                txid,
                version,
                base_version,
                proposed,
            } => self.on_prepare_request(&from, txid, version, base_version, proposed),
            Message::PrepareResp { txid, vote, reason } => {
                self.on_prepare_response(&from, txid, vote, reason)
            }
            Message::Decision {
                txid,
                outcome,
                state,
            } => self.on_decision(&from, txid, outcome, state),
            Message::Heartbeat {
                node_id,
                last_committed_version,
                digest,
            } => {
                if node_id != from {
                    warn!(%from, %node_id, "heartbeat sender mismatch dropped");
                    return;
                }
                self.on_heartbeat(&from, last_committed_version, digest)
            }
            Message::HealthSnapshot(snapshot) => self.on_health_snapshot(&from, snapshot),
            Message::OutcomeQuery {
                txid,
                version,
                coordinator,
                proposed,
                resolver,
            } => self.on_outcome_query(&from, txid, version, coordinator, proposed, resolver),
            Message::OutcomeReply { txid, knowledge } => {
                self.on_outcome_reply(&from, txid, knowledge)
            }
            Message::SyncReq { after_version } => self.on_sync_request(&from, after_version),
            Message::SyncResp { entries } => self.on_sync_response(&from, entries),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::InitiateRollout { weights, reply } => self.initiate_rollout(weights, reply),
            Command::StageCanary { share, reply } => match self.current.canary_split(share) {
                Ok(weights) => {
                    info!(node_id = %self.config.node_id, share, "staging canary rollout");
                    self.initiate_rollout(weights, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(NodeError::InvalidProposal(e.to_string())));
                }
            },
            Command::ReportHealth(snapshot) => {
                let snapshot = HealthSnapshot {
                    node_id: self.config.node_id.clone(),
                    ..snapshot
                };
                if !snapshot.is_well_formed() {
                    warn!(
                        p95_ms = snapshot.p95_ms,
                        error_rate = snapshot.error_rate,
                        window_id = snapshot.window_id,
                        kept_window = self.health.window_id,
                        "unmeasurable health report rejected, voting ABORT until the next window"
                    );
                    self.unmeasurable = Some(snapshot);
                    return;
                }
                debug!(
                    p95_ms = snapshot.p95_ms,
                    error_rate = snapshot.error_rate,
                    window_id = snapshot.window_id,
                    "local health updated"
                );
                self.unmeasurable = None;
                self.health = snapshot;
            }
        }
    }

    fn on_tick(&mut self, now: Instant) {
        self.peers.refresh(now);
        self.restore_log();
        self.broadcast_heartbeat();
        self.redeliver();
        self.advance_in_doubt(now);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let vote = match &self.phase {
            Phase::Proposed(round) => Some(round.txn.deadline),
            _ => None,
        };
        let resolver = self.resolver.as_ref().map(|round| round.deadline);
        match (vote, resolver) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_deadline(&mut self, now: Instant) {
        if matches!(&self.phase, Phase::Proposed(round) if now >= round.txn.deadline) {
            self.decide_round();
        }
        if self.resolver.as_ref().is_some_and(|round| now >= round.deadline) {
            self.finish_resolver_round();
        }
    }

    // ── Log ───────────────────────────────────────────────────────

    /// Append `entry`, or mark the node faulted if the write fails.
    fn persist(&mut self, entry: LogEntry) -> NodeResult<()> {
        if let Some(fault) = &self.log_fault {
            return Err(NodeError::LogUnavailable(fault.clone()));
        }
        match self.journal.append(&entry) {
            Ok(()) => {
                self.last_version = self.last_version.max(entry.state.version);
                Ok(())
            }
            Err(e) => {
                error!(
                    node_id = %self.config.node_id,
                    txid = %entry.state.txid,
                    version = entry.state.version,
                    error = %e,
                    "log append failed, refusing transactions until the log recovers"
                );
                self.log_fault = Some(e.to_string());
                Err(NodeError::LogUnavailable(e.to_string()))
            }
        }
    }

    /// Log a COMMITTED or ABORTED state, then make it effective.
    fn record_terminal(&mut self, state: RoutingState) -> NodeResult<()> {
        self.persist(LogEntry::terminal(state.clone()))?;
        if state.status == RoutingStatus::Committed {
            self.current = state.clone();
        }
        self.history.insert(state.version, state);
        Ok(())
    }

    fn restore_log(&mut self) {
        let Some(fault) = self.log_fault.clone() else {
            return;
        };
        match self.journal.restore() {
            Ok(()) => {
                info!(
                    node_id = %self.config.node_id,
                    previous = %fault,
                    "transaction log writable again"
                );
                self.log_fault = None;
                self.finish_decision();
            }
            Err(e) => debug!(error = %e, "transaction log still unavailable"),
        }
    }

    // ── Sending ───────────────────────────────────────────────────

    fn send(&self, to: &str, message: Message) -> bool {
        let kind = message.kind();
        match self.transport.send(to, message) {
            Ok(()) => true,
            Err(TransportError::PeerUnreachable(_)) => {
                debug!(peer = %to, kind, "peer unreachable");
                false
            }
            Err(e) => {
                warn!(peer = %to, kind, error = %e, "send failed");
                false
            }
        }
    }

    /// Send to every peer. Returns the peers the transport refused.
    fn broadcast(&self, message: &Message) -> Vec<NodeId> {
        self.config
            .peers
            .keys()
            .filter(|peer| !self.send(peer, message.clone()))
            .cloned()
            .collect()
    }

    /// Broadcast a DECISION, queueing refused peers for redelivery.
    fn broadcast_decision(&mut self, state: &RoutingState) {
        let outcome = match state.status {
            RoutingStatus::Committed => Decision::Commit,
            _ => Decision::Abort,
        };
        let message = Message::Decision {
            txid: state.txid.clone(),
            outcome,
            state: state.clone(),
        };
        for peer in self.broadcast(&message) {
            self.redeliveries.retain(|r| !(r.to == peer && r.message == message));
            self.redeliveries.push(Redelivery {
                to: peer,
                message: message.clone(),
                attempts: 1,
            });
        }
    }

    fn redeliver(&mut self) {
        for mut item in std::mem::take(&mut self.redeliveries) {
            if self.send(&item.to, item.message.clone()) {
                debug!(peer = %item.to, kind = item.message.kind(), "redelivered");
                continue;
            }
            item.attempts += 1;
            if item.attempts >= MAX_REDELIVERY_ATTEMPTS {
                warn!(
                    peer = %item.to,
                    kind = item.message.kind(),
                    attempts = item.attempts,
                    "giving up redelivery, peer must recover the outcome itself"
                );
            } else {
                self.redeliveries.push(item);
            }
        }
    }

    // ── Knowledge ─────────────────────────────────────────────────

    /// What this node can tell a peer about `txid`, proposed at `version`.
    fn knowledge_of(&self, txid: &str, version: u64) -> TxKnowledge {
        if let Some(state) = self.history.get(&version).filter(|s| s.txid == txid) {
            return match state.status {
                RoutingStatus::Committed => TxKnowledge::Committed {
                    state: state.clone(),
                },
                _ => TxKnowledge::Aborted {
                    state: state.clone(),
                },
            };
        }
        match &self.phase {
            Phase::Prepared(pending) | Phase::Resolving(pending)
                if pending.proposed.txid == txid =>
            {
                TxKnowledge::Prepared { vote: pending.vote }
            }
            Phase::Proposed(round) | Phase::Deciding(round, _) if round.txn.txid == txid => {
                TxKnowledge::Prepared {
                    vote: Some(Decision::Commit),
                }
            }
            _ => TxKnowledge::Unknown,
        }
    }

    // ── View ──────────────────────────────────────────────────────

    fn view(&self) -> RoutingView {
        RoutingView {
            node_id: self.config.node_id.clone(),
            current: self.current.clone(),
            last_version: self.last_version,
            phase: self.phase.public(),
            pending_txid: self.phase.txid().map(str::to_string),
            health: self.health.clone(),
            unmeasurable_health: self.unmeasurable.clone(),
            peer_health: self.peer_health.clone(),
            unreachable_peers: self.peers.unreachable(),
            log_fault: self.log_fault.clone(),
            diverged: self.diverged.clone(),
        }
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(self.view());
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
