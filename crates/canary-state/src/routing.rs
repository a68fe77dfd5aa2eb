//! Routing state model — the versioned traffic split agreed on by 2PC.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StateError, StateResult};

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Allowed distance between the sum of all weights and 1.0.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Transaction id carried by the genesis state.
pub const GENESIS_TXID: &str = "genesis";

// ── Status ────────────────────────────────────────────────────────

/// Where a routing state sits in the commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingStatus {
    Prepared,
    Committed,
    Aborted,
}

impl RoutingStatus {
    /// COMMITTED and ABORTED close a transaction; PREPARED opens one.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RoutingStatus::Prepared)
    }
}

impl fmt::Display for RoutingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingStatus::Prepared => write!(f, "PREPARED"),
            RoutingStatus::Committed => write!(f, "COMMITTED"),
            RoutingStatus::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// A participant's vote, and also the outcome of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Commit,
    Abort,
}

impl Decision {
    /// Status of the terminal log entry this outcome produces.
    pub fn terminal_status(self) -> RoutingStatus {
        match self {
            Decision::Commit => RoutingStatus::Committed,
            Decision::Abort => RoutingStatus::Aborted,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit => write!(f, "COMMIT"),
            Decision::Abort => write!(f, "ABORT"),
        }
    }
}

// ── RoutingState ──────────────────────────────────────────────────

/// Versioned routing configuration: how traffic is split between the
/// stable and the canary model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingState {
    /// Strictly increasing per outcome; aborted attempts consume a version.
    pub version: u64,
    pub stable_model_id: String,
    pub canary_model_id: String,
    /// Model id → traffic fraction. Ordered so serialization is deterministic.
    pub weights: BTreeMap<String, f64>,
    pub status: RoutingStatus,
    pub txid: String,
    /// Epoch milliseconds assigned by the proposing coordinator.
    pub timestamp_ms: u64,
}

impl RoutingState {
    /// The state every node starts from before its log holds anything.
    ///
    /// Fixed timestamp and txid: nodes sharing a configuration derive
    /// byte-identical genesis states and therefore identical digests.
    pub fn genesis(stable_model_id: &str, canary_model_id: &str) -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(stable_model_id.to_string(), 1.0);
        weights.insert(canary_model_id.to_string(), 0.0);
        Self {
            version: 0,
            stable_model_id: stable_model_id.to_string(),
            canary_model_id: canary_model_id.to_string(),
            weights,
            status: RoutingStatus::Committed,
            txid: GENESIS_TXID.to_string(),
            timestamp_ms: 0,
        }
    }

    /// Weights that send `canary_share` of traffic to the canary model.
    pub fn canary_split(&self, canary_share: f64) -> StateResult<BTreeMap<String, f64>> {
        if !canary_share.is_finite() || !(0.0..=1.0).contains(&canary_share) {
            return Err(StateError::InvalidWeights(format!(
                "canary share {canary_share} outside [0, 1]"
            )));
        }
        let mut weights = BTreeMap::new();
        weights.insert(self.stable_model_id.clone(), 1.0 - canary_share);
        weights.insert(self.canary_model_id.clone(), canary_share);
        Ok(weights)
    }

    /// Build a PREPARED proposal on top of this state.
    pub fn propose(&self, version: u64, txid: &str, weights: BTreeMap<String, f64>) -> Self {
        Self {
            version,
            stable_model_id: self.stable_model_id.clone(),
            canary_model_id: self.canary_model_id.clone(),
            weights,
            status: RoutingStatus::Prepared,
            txid: txid.to_string(),
            timestamp_ms: epoch_millis(),
        }
    }

    /// Same snapshot with a different status.
    pub fn with_status(&self, status: RoutingStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn validate_weights(&self) -> StateResult<()> {
        validate_weights(&self.weights)
    }

    /// Share of traffic routed to the canary model.
    pub fn canary_share(&self) -> f64 {
        self.weights
            .get(&self.canary_model_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Lowercase hex SHA-256 of the JSON form of this state.
    pub fn digest(&self) -> String {
        // Serializing a map keyed by strings cannot fail.
        let payload = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&payload))
    }
}

/// Check that every weight is a fraction and that they sum to 1.0.
pub fn validate_weights(weights: &BTreeMap<String, f64>) -> StateResult<()> {
    if weights.is_empty() {
        return Err(StateError::InvalidWeights("no weights given".into()));
    }
    for (model, weight) in weights {
        if model.is_empty() {
            return Err(StateError::InvalidWeights("empty model id".into()));
        }
        if !weight.is_finite() || !(0.0..=1.0).contains(weight) {
            return Err(StateError::InvalidWeights(format!(
                "weight for {model} is {weight}, expected a value in [0, 1]"
            )));
        }
    }
    let sum: f64 = weights.values().sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(StateError::InvalidWeights(format!(
            "weights sum to {sum}, expected 1.0"
        )));
    }
    Ok(())
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(stable: f64, canary: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("v1".to_string(), stable), ("v2".to_string(), canary)])
    }

    #[test]
    fn genesis_is_deterministic() {
        let a = RoutingState::genesis("v1", "v2");
        let b = RoutingState::genesis("v1", "v2");
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.version, 0);
        assert_eq!(a.status, RoutingStatus::Committed);
        assert_eq!(a.txid, GENESIS_TXID);
        assert!(a.validate_weights().is_ok());
    }

    #[test]
    fn canary_split_builds_complementary_weights() {
        let state = RoutingState::genesis("v1", "v2");
        let weights = state.canary_split(0.05).unwrap();
        assert!((weights["v1"] - 0.95).abs() < 1e-12);
        assert_eq!(weights["v2"], 0.05);
        assert!(validate_weights(&weights).is_ok());
    }

    #[test]
    fn canary_split_rejects_out_of_range_share() {
        let state = RoutingState::genesis("v1", "v2");
        assert!(state.canary_split(1.5).is_err());
        assert!(state.canary_split(-0.1).is_err());
        assert!(state.canary_split(f64::NAN).is_err());
    }

    #[test]
    fn weights_within_tolerance_are_accepted() {
        // 0.1 + 0.2 is not exactly 0.3 in binary floating point.
        let weights = BTreeMap::from([
            ("a".to_string(), 0.1),
            ("b".to_string(), 0.2),
            ("c".to_string(), 0.7),
        ]);
        assert!(validate_weights(&weights).is_ok());
    }

    #[test]
    fn weights_not_summing_to_one_are_rejected() {
        let err = validate_weights(&split(0.9, 0.05)).unwrap_err();
        assert!(matches!(err, StateError::InvalidWeights(_)));
    }

    #[test]
    fn negative_and_empty_weights_are_rejected() {
        assert!(validate_weights(&split(1.1, -0.1)).is_err());
        assert!(validate_weights(&BTreeMap::new()).is_err());
        assert!(validate_weights(&BTreeMap::from([(String::new(), 1.0)])).is_err());
    }

    #[test]
    fn propose_keeps_model_ids_and_marks_prepared() {
        let genesis = RoutingState::genesis("v1", "v2");
        let proposed = genesis.propose(3, "tx-3", split(0.8, 0.2));
        assert_eq!(proposed.version, 3);
        assert_eq!(proposed.txid, "tx-3");
        assert_eq!(proposed.status, RoutingStatus::Prepared);
        assert_eq!(proposed.stable_model_id, "v1");
        assert_eq!(proposed.canary_share(), 0.2);
    }

    #[test]
    fn digest_changes_with_status_and_weights() {
        let genesis = RoutingState::genesis("v1", "v2");
        let proposed = genesis.propose(1, "tx-1", split(0.95, 0.05));
        let committed = proposed.with_status(RoutingStatus::Committed);
        assert_ne!(proposed.digest(), committed.digest());
        assert_ne!(genesis.digest(), committed.digest());
        assert_eq!(committed.digest().len(), 64);
    }

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&RoutingStatus::Committed).unwrap();
        assert_eq!(json, "\"COMMITTED\"");
        let decision: Decision = serde_json::from_str("\"ABORT\"").unwrap();
        assert_eq!(decision, Decision::Abort);
        assert_eq!(Decision::Commit.terminal_status(), RoutingStatus::Committed);
    }
}
