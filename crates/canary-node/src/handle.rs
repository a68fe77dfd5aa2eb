//! Cloneable handle to a running [`NodeEngine`](crate::NodeEngine).
//!
//! Commands go to the engine over a bounded channel; reads come from the
//! latest published [`RoutingView`] and never block the engine.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot, watch};

use canary_state::{HealthSnapshot, RoutingState};

use crate::engine::{Command, RolloutReport, RoutingView};
use crate::error::{NodeError, NodeResult};

#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<RoutingView>,
}

impl NodeHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>, view: watch::Receiver<RoutingView>) -> Self {
        Self { commands, view }
    }

    /// Coordinate a rollout to `weights` and wait for its outcome.
    ///
    /// An ABORT is a successful call; inspect [`RolloutReport::outcome`].
    pub async fn initiate_rollout(
        &self,
        weights: BTreeMap<String, f64>,
    ) -> NodeResult<RolloutReport> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::InitiateRollout { weights, reply }, rx)
            .await
    }

    /// Roll out `share` of traffic to the canary model.
    pub async fn stage_canary(&self, share: f64) -> NodeResult<RolloutReport> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::StageCanary { share, reply }, rx).await
    }

    /// Replace the local health snapshot the gate evaluates.
    ///
    /// A malformed snapshot is held aside and makes the node vote ABORT
    /// until a well-formed one arrives.
    pub async fn report_health(&self, snapshot: HealthSnapshot) -> NodeResult<()> {
        self.commands
            .send(Command::ReportHealth(snapshot))
            .await
            .map_err(|_| NodeError::Stopped)
    }

    async fn request(
        &self,
        command: Command,
        rx: oneshot::Receiver<NodeResult<RolloutReport>>,
    ) -> NodeResult<RolloutReport> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// The committed routing state.
    pub fn routing_state(&self) -> RoutingState {
        self.view.borrow().current.clone()
    }

    /// The local health snapshot.
    pub fn health(&self) -> HealthSnapshot {
        self.view.borrow().health.clone()
    }

    pub fn view(&self) -> RoutingView {
        self.view.borrow().clone()
    }

    /// Wait until the published view satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&RoutingView) -> bool,
    ) -> NodeResult<RoutingView> {
        let mut view = self.view.clone();
        let seen = view.wait_for(predicate).await.map_err(|_| NodeError::Stopped)?;
        Ok((*seen).clone())
    }
}
