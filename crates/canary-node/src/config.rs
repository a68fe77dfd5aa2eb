//! Node configuration, loaded from TOML.
//!
//! ```toml
//! node_id = "node-a"
//! listen_addr = "127.0.0.1:7001"
//! data_dir = "logs"
//!
//! [peers]
//! node-b = "127.0.0.1:7002"
//! node-c = "127.0.0.1:7003"
//!
//! [health]
//! max_p95_ms = 200.0
//! max_error_rate = 0.05
//!
//! [timing]
//! vote_timeout_ms = 2000
//! heartbeat_interval_ms = 2000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use canary_state::{NodeId, RoutingState};

use crate::error::{NodeError, NodeResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory holding `<node_id>.log`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_stable_model")]
    pub stable_model_id: String,
    #[serde(default = "default_canary_model")]
    pub canary_model_id: String,
    /// Every other node: id → `host:port`.
    #[serde(default)]
    pub peers: BTreeMap<NodeId, String>,
    #[serde(default)]
    pub health: HealthThresholds,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Health gate limits a participant checks before voting COMMIT.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthThresholds {
    pub max_p95_ms: f64,
    pub max_error_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_p95_ms: 200.0,
            max_error_rate: 0.05,
        }
    }
}

/// Protocol timers, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// How long a coordinator (or resolver) waits for replies.
    pub vote_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before a peer counts as unreachable.
    pub heartbeat_miss_limit: u32,
    /// How long a participant stays PREPARED before resolving on its own.
    pub decision_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            vote_timeout_ms: 2000,
            heartbeat_interval_ms: 2000,
            heartbeat_miss_limit: 3,
            decision_grace_ms: 4000,
        }
    }
}

impl TimingConfig {
    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn decision_grace(&self) -> Duration {
        Duration::from_millis(self.decision_grace_ms)
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_stable_model() -> String {
    "v1".to_string()
}

fn default_canary_model() -> String {
    "v2".to_string()
}

impl NodeConfig {
    /// Configuration with every default and no peers.
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
            stable_model_id: default_stable_model(),
            canary_model_id: default_canary_model(),
            peers: BTreeMap::new(),
            health: HealthThresholds::default(),
            timing: TimingConfig::default(),
        }
    }

    pub fn with_peer(mut self, node_id: &str, address: &str) -> Self {
        self.peers.insert(node_id.to_string(), address.to_string());
        self
    }

    pub fn with_data_dir(mut self, data_dir: &Path) -> Self {
        self.data_dir = data_dir.to_path_buf();
        self
    }

    pub fn from_file(path: &Path) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> NodeResult<Self> {
        let config: NodeConfig =
            toml::from_str(content).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NodeResult<()> {
        let invalid = |msg: String| Err(NodeError::Config(msg));

        if self.node_id.trim().is_empty() {
            return invalid("node_id must not be empty".into());
        }
        if self.peers.contains_key(&self.node_id) {
            return invalid(format!("peer table lists the node itself ({})", self.node_id));
        }
        if let Some((peer, _)) = self.peers.iter().find(|(_, addr)| addr.trim().is_empty()) {
            return invalid(format!("peer {peer} has no address"));
        }
        if self.stable_model_id.is_empty()
            || self.canary_model_id.is_empty()
            || self.stable_model_id == self.canary_model_id
        {
            return invalid("stable and canary model ids must be distinct and non-empty".into());
        }
        let health = &self.health;
        if !(health.max_p95_ms.is_finite() && health.max_p95_ms > 0.0) {
            return invalid(format!("max_p95_ms must be positive, got {}", health.max_p95_ms));
        }
        if !(0.0..=1.0).contains(&health.max_error_rate) {
            return invalid(format!(
                "max_error_rate must be within [0, 1], got {}",
                health.max_error_rate
            ));
        }
        let timing = &self.timing;
        if timing.vote_timeout_ms == 0
            || timing.heartbeat_interval_ms == 0
            || timing.decision_grace_ms == 0
        {
            return invalid("timing intervals must be non-zero".into());
        }
        if timing.heartbeat_miss_limit == 0 {
            return invalid("heartbeat_miss_limit must be at least 1".into());
        }
        Ok(())
    }

    /// `<data_dir>/<node_id>.log`
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.log", self.node_id))
    }

    /// The state this node starts from when its log is empty.
    pub fn genesis(&self) -> RoutingState {
        RoutingState::genesis(&self.stable_model_id, &self.canary_model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let config = NodeConfig::from_toml_str(r#"node_id = "node-a""#).unwrap();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.stable_model_id, "v1");
        assert_eq!(config.canary_model_id, "v2");
        assert_eq!(config.health, HealthThresholds::default());
        assert_eq!(config.timing.vote_timeout(), Duration::from_secs(2));
        assert_eq!(config.timing.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(config.timing.heartbeat_miss_limit, 3);
        assert_eq!(config.log_path(), PathBuf::from("logs/node-a.log"));
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
node_id = "node-b"
listen_addr = "0.0.0.0:7002"
data_dir = "/var/lib/canary"

[peers]
node-a = "10.0.0.1:7001"
node-c = "10.0.0.3:7003"

[health]
max_p95_ms = 150.0

[timing]
vote_timeout_ms = 500
decision_grace_ms = 1000
"#;
        let config = NodeConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers["node-c"], "10.0.0.3:7003");
        assert_eq!(config.health.max_p95_ms, 150.0);
        assert_eq!(config.health.max_error_rate, 0.05);
        assert_eq!(config.timing.vote_timeout_ms, 500);
        assert_eq!(config.timing.heartbeat_interval_ms, 2000);
        assert_eq!(config.log_path(), PathBuf::from("/var/lib/canary/node-b.log"));
    }

    #[test]
    fn shipped_configs_form_one_cluster() {
        let configs = [
            include_str!("../../../config/node-a.toml"),
            include_str!("../../../config/node-b.toml"),
            include_str!("../../../config/node-c.toml"),
        ]
        .map(|toml| NodeConfig::from_toml_str(toml).unwrap());

        for config in &configs {
            assert_eq!(config.peers.len(), 2);
            for other in configs.iter().filter(|c| c.node_id != config.node_id) {
                assert_eq!(config.peers[&other.node_id], other.listen_addr);
            }
        }
    }

    #[test]
    fn self_in_peer_table_is_rejected() {
        let config = NodeConfig::new("node-a").with_peer("node-a", "127.0.0.1:1");
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn out_of_range_thresholds_are_rejected() {
        let mut config = NodeConfig::new("node-a");
        config.health.max_error_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::new("node-a");
        config.timing.heartbeat_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::new("node-a");
        config.canary_model_id = "v1".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = NodeConfig::from_toml_str("node_id = ").unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let toml = "node_id = \"node-c\"\n[peers]\nnode-a = \"127.0.0.1:7001\"\n";
        std::fs::write(&path, toml).unwrap();
        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.node_id, "node-c");
        assert!(NodeConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
