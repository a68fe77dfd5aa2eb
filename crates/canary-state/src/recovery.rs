//! Folding replayed log entries into the node's starting state.

use crate::log::LogEntry;
use crate::routing::{RoutingState, RoutingStatus};

/// State reconstructed from a transaction log.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    /// Last COMMITTED state, or genesis for an empty log.
    pub current: RoutingState,
    /// Highest version present in the log, aborted outcomes included.
    pub last_version: u64,
    /// Every terminal state, in log order.
    pub history: Vec<RoutingState>,
    /// PREPARED entries that never got a terminal entry.
    pub in_doubt: Vec<LogEntry>,
}

/// Fold `entries` (in log order) on top of `genesis`.
pub fn fold(entries: &[LogEntry], genesis: RoutingState) -> Recovered {
    let mut recovered = Recovered {
        last_version: genesis.version,
        current: genesis,
        history: Vec::new(),
        in_doubt: Vec::new(),
    };

    for entry in entries {
        let state = &entry.state;
        recovered.last_version = recovered.last_version.max(state.version);
        match state.status {
            RoutingStatus::Prepared => recovered.in_doubt.push(entry.clone()),
            RoutingStatus::Committed | RoutingStatus::Aborted => {
                recovered.in_doubt.retain(|open| open.state.txid != state.txid);
                if state.status == RoutingStatus::Committed {
                    recovered.current = state.clone();
                }
                recovered.history.push(state.clone());
            }
        }
    }

    recovered
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::routing::Decision;

    fn genesis() -> RoutingState {
        RoutingState::genesis("v1", "v2")
    }

    fn proposal(version: u64, canary: f64) -> RoutingState {
        let weights =
            BTreeMap::from([("v1".to_string(), 1.0 - canary), ("v2".to_string(), canary)]);
        genesis().propose(version, &format!("tx-{version}"), weights)
    }

    fn round(version: u64, canary: f64, outcome: RoutingStatus) -> Vec<LogEntry> {
        let state = proposal(version, canary);
        vec![
            LogEntry::prepared(state.clone(), "node-a", Decision::Commit),
            LogEntry::terminal(state.with_status(outcome)),
        ]
    }

    #[test]
    fn empty_log_yields_genesis() {
        let recovered = fold(&[], genesis());
        assert_eq!(recovered.current, genesis());
        assert_eq!(recovered.last_version, 0);
        assert!(recovered.history.is_empty());
        assert!(recovered.in_doubt.is_empty());
    }

    #[test]
    fn aborted_rounds_consume_versions_but_keep_current() {
        let mut entries = round(1, 0.05, RoutingStatus::Committed);
        entries.extend(round(2, 0.2, RoutingStatus::Aborted));

        let recovered = fold(&entries, genesis());
        assert_eq!(recovered.current.version, 1);
        assert_eq!(recovered.current.canary_share(), 0.05);
        assert_eq!(recovered.last_version, 2);
        assert_eq!(recovered.history.len(), 2);
        assert!(recovered.in_doubt.is_empty());
    }

    #[test]
    fn trailing_prepare_is_in_doubt() {
        let mut entries = round(1, 0.05, RoutingStatus::Committed);
        let pending = proposal(2, 0.2);
        entries.push(LogEntry::prepared(pending.clone(), "node-b", Decision::Commit));

        let recovered = fold(&entries, genesis());
        assert_eq!(recovered.current.version, 1);
        assert_eq!(recovered.last_version, 2);
        assert_eq!(recovered.in_doubt.len(), 1);
        assert_eq!(recovered.in_doubt[0].state.txid, pending.txid);
        assert_eq!(
            recovered.in_doubt[0].prepare.as_ref().map(|p| p.coordinator.as_str()),
            Some("node-b")
        );
    }
}
