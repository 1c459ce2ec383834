//! Cluster topology and configuration.
//!
//! The topology is fixed when the cluster is deployed: N nodes with ordinals
//! `1..=N`. [`ClusterConfig`] is built once, validated, and then shared
//! read-only (`Arc<ClusterConfig>`) by every component; nothing reads ambient
//! process state after construction.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Node count of the reference deployment.
pub const REFERENCE_NODE_COUNT: u8 = 3;

/// Where secure material lands on each node unless configured otherwise.
pub const DEFAULT_REMOTE_CONFIG_DIR: &str = "/consul/config";

/// Static identity of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// 1-based position in the cluster.
    pub ordinal: u8,
    /// Node name (container / host name).
    pub name: String,
    /// Base URL of the node's secret-storage engine API.
    pub address: String,
}

/// Seal state of a node as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SealState {
    /// Master key not available.
    Sealed,
    /// Master key reconstructed in memory.
    Unsealed,
    /// Not observed yet, or the node could not be reached.
    Unknown,
}

impl fmt::Display for SealState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sealed => "SEALED",
            Self::Unsealed => "UNSEALED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Runtime view of a node: its identity plus observed state.
///
/// `seal_state` is only updated by the unseal coordinator and
/// `config_version` only by the secure rollout manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterNode {
    pub spec: NodeSpec,
    pub seal_state: SealState,
    pub config_version: Option<u64>,
}

impl ClusterNode {
    /// A node that has not been observed yet.
    #[must_use]
    pub fn new(spec: NodeSpec) -> Self {
        Self {
            spec,
            seal_state: SealState::Unknown,
            config_version: None,
        }
    }

    #[must_use]
    pub fn ordinal(&self) -> u8 {
        self.spec.ordinal
    }
}

/// Bounded exponential backoff for the wait-for-quorum loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumPolicy {
    /// Delay after the first unsuccessful poll.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Total time to wait before giving up with `QuorumTimeout`.
    pub timeout: Duration,
}

impl QuorumPolicy {
    /// Delay before poll number `attempt + 1` (doubling, capped).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidQuorumPolicy {
            reason: reason.to_owned(),
        };
        if self.initial_delay.is_zero() {
            return Err(invalid("initial delay must be positive"));
        }
        if self.max_delay < self.initial_delay {
            return Err(invalid("max delay must be at least the initial delay"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be positive"));
        }
        Ok(())
    }
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Immutable cluster configuration passed to every component.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    nodes: Vec<NodeSpec>,
    quorum: QuorumPolicy,
    decrypt_timeout: Duration,
    remote_config_dir: String,
}

impl ClusterConfig {
    /// Build a configuration from an explicit node list.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the list is empty, ordinals are not
    /// `1..=N` in order, names repeat, or a node has an empty name/address.
    pub fn new(nodes: Vec<NodeSpec>) -> Result<Self, ConfigError> {
        if nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        if nodes.len() > usize::from(u8::MAX) {
            return Err(ConfigError::TooManyNodes { count: nodes.len() });
        }

        let mut names = HashSet::new();
        for (expected, node) in (1..=u8::MAX).zip(&nodes) {
            if node.ordinal != expected {
                return Err(ConfigError::NodeOrdinal {
                    expected,
                    actual: node.ordinal,
                });
            }
            if node.name.is_empty() || node.name.chars().any(char::is_whitespace) {
                return Err(ConfigError::InvalidNode {
                    ordinal: node.ordinal,
                    reason: "name must be non-empty without whitespace".to_owned(),
                });
            }
            if node.address.is_empty() {
                return Err(ConfigError::InvalidNode {
                    ordinal: node.ordinal,
                    reason: "address must be non-empty".to_owned(),
                });
            }
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateNode {
                    name: node.name.clone(),
                });
            }
        }

        Ok(Self {
            nodes,
            quorum: QuorumPolicy::default(),
            decrypt_timeout: Duration::from_secs(120),
            remote_config_dir: DEFAULT_REMOTE_CONFIG_DIR.to_owned(),
        })
    }

    /// `count` nodes named `{prefix}1..` reachable at `http://{name}:{port}`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoNodes`] if `count` is zero.
    pub fn uniform(prefix: &str, count: u8, port: u16) -> Result<Self, ConfigError> {
        let nodes = (1..=count)
            .map(|ordinal| {
                let name = format!("{prefix}{ordinal}");
                NodeSpec {
                    ordinal,
                    address: format!("http://{name}:{port}"),
                    name,
                }
            })
            .collect();
        Self::new(nodes)
    }

    /// Replace the quorum polling policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidQuorumPolicy`] for zero or inverted delays.
    pub fn with_quorum_policy(mut self, policy: QuorumPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        self.quorum = policy;
        Ok(self)
    }

    /// Bound on how long share decryption may block.
    #[must_use]
    pub fn with_decrypt_timeout(mut self, timeout: Duration) -> Self {
        self.decrypt_timeout = timeout;
        self
    }

    /// Directory on each node that receives the secure bundle.
    #[must_use]
    pub fn with_remote_config_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_config_dir = dir.into();
        self
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Look up a node by ordinal.
    #[must_use]
    pub fn node(&self, ordinal: u8) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.ordinal == ordinal)
    }

    /// Peers one node must see before the cluster has full quorum (N-1).
    #[must_use]
    pub fn required_peers(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    #[must_use]
    pub fn quorum_policy(&self) -> QuorumPolicy {
        self.quorum
    }

    #[must_use]
    pub fn decrypt_timeout(&self) -> Duration {
        self.decrypt_timeout
    }

    #[must_use]
    pub fn remote_config_dir(&self) -> &str {
        &self.remote_config_dir
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn spec(ordinal: u8, name: &str) -> NodeSpec {
        NodeSpec {
            ordinal,
            name: name.to_owned(),
            address: format!("http://{name}:8200"),
        }
    }

    #[test]
    fn uniform_reference_topology() {
        let config = ClusterConfig::uniform("vault", REFERENCE_NODE_COUNT, 8200).unwrap();
        assert_eq!(config.node_count(), 3);
        assert_eq!(config.required_peers(), 2);
        let second = config.node(2).unwrap();
        assert_eq!(second.name, "vault2");
        assert_eq!(second.address, "http://vault2:8200");
        assert_eq!(config.remote_config_dir(), DEFAULT_REMOTE_CONFIG_DIR);
    }

    #[test]
    fn empty_topology_rejected() {
        assert!(matches!(ClusterConfig::new(vec![]), Err(ConfigError::NoNodes)));
        assert!(matches!(
            ClusterConfig::uniform("vault", 0, 8200),
            Err(ConfigError::NoNodes)
        ));
    }

    #[test]
    fn ordinals_must_be_contiguous() {
        let err = ClusterConfig::new(vec![spec(1, "a"), spec(3, "c")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NodeOrdinal {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = ClusterConfig::new(vec![spec(1, "a"), spec(2, "a")]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateNode { .. }));
    }

    #[test]
    fn blank_name_rejected() {
        let err = ClusterConfig::new(vec![spec(1, "has space")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNode { ordinal: 1, .. }));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = QuorumPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(700));
        assert_eq!(policy.delay_for(40), Duration::from_millis(700));
    }

    #[test]
    fn invalid_quorum_policy_rejected() {
        let config = ClusterConfig::uniform("vault", 3, 8200).unwrap();
        let err = config
            .with_quorum_policy(QuorumPolicy {
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(1),
                timeout: Duration::from_secs(10),
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidQuorumPolicy { .. }));
    }

    #[test]
    fn seal_state_display_is_uppercase() {
        assert_eq!(SealState::Unsealed.to_string(), "UNSEALED");
        assert_eq!(
            serde_json::to_string(&SealState::Sealed).unwrap(),
            "\"SEALED\""
        );
    }
}
