//! canary-state — routing state model and durable transaction log.
//!
//! Every node keeps one append-only log of [`RoutingState`] snapshots. The log
//! is the only thing a node trusts after a restart: folding its entries yields
//! the effective routing configuration and any transaction left in doubt.
//!
//! # Architecture
//!
//! - [`routing`] — the versioned configuration agreed on by two-phase commit
//! - [`health`] — health measurements exchanged between nodes (never logged)
//! - [`log`] — checksummed, length-framed records behind the [`Journal`] seam
//! - [`recovery`] — folding replayed entries into [`Recovered`] state

pub mod error;
pub mod health;
pub mod log;
pub mod recovery;
pub mod routing;

pub use error::{StateError, StateResult};
pub use health::HealthSnapshot;
pub use log::{Journal, LogEntry, PrepareRecord, Replay, TransactionLog};
pub use recovery::{Recovered, fold};
pub use routing::*;
