//! canary-node — two-phase commit engine for canary routing rollouts.
//!
//! Every node runs one [`NodeEngine`] task that owns its routing state and
//! transaction log. The engine plays coordinator for rollouts started
//! through its [`NodeHandle`], participant for proposals from peers, and
//! resolver when a coordinator disappears while a transaction is in doubt.
//!
//! # Architecture
//!
//! - [`engine`] — single-writer event loop: inbox, commands, heartbeat tick,
//!   protocol deadlines
//! - [`transaction`] — vote collection for one coordinator round
//! - [`election`] — resolver election and resolver rounds
//! - [`peers`] — heartbeat miss counting and reachability
//! - [`health`] — health gate and sampling windows
//! - [`handle`] — cloneable read/command handle for the serving layer

pub mod config;
pub mod election;
pub mod engine;
pub mod error;
pub mod handle;
pub mod health;
pub mod peers;
pub mod transaction;

pub use config::{HealthThresholds, NodeConfig, TimingConfig};
pub use engine::{NodeEngine, NodePhase, RolloutReport, RoutingView};
pub use error::{NodeError, NodeResult};
pub use handle::NodeHandle;
pub use health::{GateVerdict, HealthGate, HealthWindow};
