//! Protocol messages exchanged between nodes.

use serde::{Deserialize, Serialize};

use canary_state::{Decision, HealthSnapshot, NodeId, RoutingState, RoutingStatus};

use crate::error::TransportError;

/// A message together with the node that sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: Message,
}

/// What a node knows about the outcome of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxKnowledge {
    Committed { state: RoutingState },
    Aborted { state: RoutingState },
    /// Prepared but undecided; `vote` is what this node voted, if it did.
    Prepared { vote: Option<Decision> },
    Unknown,
}

impl TxKnowledge {
    /// Terminal state, if the outcome is known.
    pub fn terminal(&self) -> Option<&RoutingState> {
        match self {
            TxKnowledge::Committed { state } | TxKnowledge::Aborted { state } => Some(state),
            TxKnowledge::Prepared { .. } | TxKnowledge::Unknown => None,
        }
    }
}

/// Every message of the commit protocol, heartbeat, resolver and sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Coordinator asks a participant to prepare `proposed`.
    PrepareReq {
        txid: String,
        version: u64,
        /// Committed version the proposal builds on.
        base_version: u64,
        proposed: RoutingState,
    },
    PrepareResp {
        txid: String,
        vote: Decision,
        reason: String,
    },
    /// Final outcome with the terminal state to persist.
    Decision {
        txid: String,
        outcome: Decision,
        state: RoutingState,
    },
    Heartbeat {
        node_id: NodeId,
        last_committed_version: u64,
        digest: String,
    },
    HealthSnapshot(HealthSnapshot),
    /// Ask a peer what it knows about an in-doubt transaction.
    OutcomeQuery {
        txid: String,
        version: u64,
        coordinator: NodeId,
        proposed: RoutingState,
        /// Set when the sender runs a resolver round for `txid`.
        resolver: bool,
    },
    OutcomeReply {
        txid: String,
        knowledge: TxKnowledge,
    },
    /// Pull terminal states above `after_version`.
    SyncReq { after_version: u64 },
    SyncResp { entries: Vec<RoutingState> },
}

impl Message {
    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PrepareReq { .. } => "PREPARE_REQ",
            Message::PrepareResp { .. } => "PREPARE_RESP",
            Message::Decision { .. } => "DECISION",
            Message::Heartbeat { .. } => "HEARTBEAT",
            Message::HealthSnapshot(_) => "HEALTH_SNAPSHOT",
            Message::OutcomeQuery { .. } => "OUTCOME_QUERY",
            Message::OutcomeReply { .. } => "OUTCOME_REPLY",
            Message::SyncReq { .. } => "SYNC_REQ",
            Message::SyncResp { .. } => "SYNC_RESP",
        }
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), TransportError> {
        match self {
            Message::PrepareReq {
                txid,
                version,
                base_version,
                proposed,
            } => {
                require_txid(txid)?;
                matches_state(txid, *version, proposed)?;
                if proposed.status != RoutingStatus::Prepared {
                    return invalid(format!("proposal {txid} is {}", proposed.status));
                }
                if version <= base_version {
                    return invalid(format!(
                        "proposal version {version} does not follow base {base_version}"
                    ));
                }
                valid_weights(proposed)
            }
            Message::PrepareResp { txid, .. } => require_txid(txid),
            Message::Decision {
                txid,
                outcome,
                state,
            } => {
                require_txid(txid)?;
                matches_state(txid, state.version, state)?;
                terminal_state(state, outcome.terminal_status())
            }
            Message::Heartbeat { node_id, digest, .. } => {
                if node_id.is_empty() {
                    return invalid("heartbeat without node id".into());
                }
                if digest.is_empty() {
                    return invalid(format!("heartbeat from {node_id} without digest"));
                }
                Ok(())
            }
            Message::HealthSnapshot(snapshot) => {
                if snapshot.is_well_formed() {
                    Ok(())
                } else {
                    invalid(format!(
                        "health snapshot from {} out of range: p95 {} error rate {}",
                        snapshot.node_id, snapshot.p95_ms, snapshot.error_rate
                    ))
                }
            }
            Message::OutcomeQuery {
                txid,
                version,
                coordinator,
                proposed,
                ..
            } => {
                require_txid(txid)?;
                if coordinator.is_empty() {
                    return invalid(format!("outcome query for {txid} without coordinator"));
                }
                matches_state(txid, *version, proposed)
            }
            Message::OutcomeReply { txid, knowledge } => {
                require_txid(txid)?;
                match knowledge {
                    TxKnowledge::Committed { state } => {
                        matches_state(txid, state.version, state)?;
                        terminal_state(state, RoutingStatus::Committed)
                    }
                    TxKnowledge::Aborted { state } => {
                        matches_state(txid, state.version, state)?;
                        terminal_state(state, RoutingStatus::Aborted)
                    }
                    TxKnowledge::Prepared { .. } | TxKnowledge::Unknown => Ok(()),
                }
            }
            Message::SyncReq { .. } => Ok(()),
            Message::SyncResp { entries } => {
                let mut previous: Option<u64> = None;
                for state in entries {
                    if !state.status.is_terminal() {
                        return invalid(format!("sync entry {} is not terminal", state.txid));
                    }
                    terminal_state(state, state.status)?;
                    if previous.is_some_and(|v| state.version <= v) {
                        return invalid(format!(
                            "sync entries out of order at version {}",
                            state.version
                        ));
                    }
                    previous = Some(state.version);
                }
                Ok(())
            }
        }
    }
}

fn invalid(reason: String) -> Result<(), TransportError> {
    Err(TransportError::InvalidMessage(reason))
}

fn require_txid(txid: &str) -> Result<(), TransportError> {
    if txid.is_empty() {
        return invalid("empty txid".into());
    }
    Ok(())
}

fn matches_state(txid: &str, version: u64, state: &RoutingState) -> Result<(), TransportError> {
    if state.txid != txid || state.version != version {
        return invalid(format!(
            "state {}@{} does not match {txid}@{version}",
            state.txid, state.version
        ));
    }
    Ok(())
}

fn valid_weights(state: &RoutingState) -> Result<(), TransportError> {
    state
        .validate_weights()
        .map_err(|e| TransportError::InvalidMessage(format!("{}: {e}", state.txid)))
}

fn terminal_state(state: &RoutingState, expected: RoutingStatus) -> Result<(), TransportError> {
    if state.status != expected {
        return invalid(format!(
            "state {} is {}, expected {expected}",
            state.txid, state.status
        ));
    }
    if expected == RoutingStatus::Committed {
        valid_weights(state)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn proposed(version: u64) -> RoutingState {
        let weights = BTreeMap::from([("v1".to_string(), 0.95), ("v2".to_string(), 0.05)]);
        RoutingState::genesis("v1", "v2").propose(version, "tx-1", weights)
    }

    fn prepare_req() -> Message {
        Message::PrepareReq {
            txid: "tx-1".into(),
            version: 1,
            base_version: 0,
            proposed: proposed(1),
        }
    }

    #[test]
    fn wire_tag_is_screaming_snake_case() {
        let json = serde_json::to_value(&prepare_req()).unwrap();
        assert_eq!(json["type"], "PREPARE_REQ");
        assert_eq!(json["proposed"]["status"], "PREPARED");

        let snapshot = Message::HealthSnapshot(HealthSnapshot::idle("node-a"));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["type"], "HEALTH_SNAPSHOT");
        assert_eq!(json["node_id"], "node-a");
        assert_eq!(snapshot.kind(), "HEALTH_SNAPSHOT");
    }

    #[test]
    fn unknown_message_type_fails_to_decode() {
        let raw = r#"{"type":"SHUTDOWN","node_id":"node-a"}"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn knowledge_serializes_with_kind_tag() {
        let reply = Message::OutcomeReply {
            txid: "tx-1".into(),
            knowledge: TxKnowledge::Prepared {
                vote: Some(Decision::Commit),
            },
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["knowledge"]["kind"], "PREPARED");
        assert_eq!(json["knowledge"]["vote"], "COMMIT");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn valid_prepare_passes() {
        assert!(prepare_req().validate().is_ok());
    }

    #[test]
    fn prepare_with_bad_weights_is_rejected() {
        let mut state = proposed(1);
        state.weights.insert("v2".into(), 0.5);
        let message = Message::PrepareReq {
            txid: "tx-1".into(),
            version: 1,
            base_version: 0,
            proposed: state,
        };
        assert!(matches!(
            message.validate(),
            Err(TransportError::InvalidMessage(_))
        ));
    }

    #[test]
    fn prepare_must_match_its_proposal() {
        let message = Message::PrepareReq {
            txid: "tx-2".into(),
            version: 1,
            base_version: 0,
            proposed: proposed(1),
        };
        assert!(message.validate().is_err());

        let message = Message::PrepareReq {
            txid: "tx-1".into(),
            version: 1,
            base_version: 1,
            proposed: proposed(1),
        };
        assert!(message.validate().is_err());
    }

    #[test]
    fn decision_status_must_match_outcome() {
        let state = proposed(1).with_status(RoutingStatus::Aborted);
        let message = Message::Decision {
            txid: "tx-1".into(),
            outcome: Decision::Commit,
            state: state.clone(),
        };
        assert!(message.validate().is_err());

        let message = Message::Decision {
            txid: "tx-1".into(),
            outcome: Decision::Abort,
            state,
        };
        assert!(message.validate().is_ok());
    }

    #[test]
    fn sync_entries_must_be_terminal_and_ordered() {
        let first = proposed(1).with_status(RoutingStatus::Committed);
        let second = RoutingState {
            version: 2,
            txid: "tx-2".into(),
            ..proposed(2).with_status(RoutingStatus::Aborted)
        };
        let ok = Message::SyncResp {
            entries: vec![first.clone(), second.clone()],
        };
        assert!(ok.validate().is_ok());

        let reversed = Message::SyncResp {
            entries: vec![second, first.clone()],
        };
        assert!(reversed.validate().is_err());

        let pending = Message::SyncResp {
            entries: vec![proposed(3)],
        };
        assert!(pending.validate().is_err());
    }

    #[test]
    fn health_snapshot_out_of_range_is_rejected() {
        let snapshot = HealthSnapshot {
            node_id: "node-a".into(),
            p95_ms: 120.0,
            error_rate: 1.5,
            window_id: 4,
        };
        assert!(Message::HealthSnapshot(snapshot).validate().is_err());
    }
}
