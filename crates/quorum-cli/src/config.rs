//! CLI configuration for `quorumctl`.
//!
//! Deployment settings come from `QUORUM_*` environment variables with
//! defaults matching the reference deployment (three nodes `vault1..vault3`
//! behind a Consul cluster). A few operator-facing values are also exposed as
//! clap flags and override what is loaded here.

use std::path::PathBuf;
use std::time::Duration;

use quorum_core::cluster::{ClusterConfig, NodeSpec, QuorumPolicy, REFERENCE_NODE_COUNT};
use quorum_core::error::ConfigError;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Everything `quorumctl` needs to reach the cluster.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Node name prefix; nodes are `{prefix}1..{prefix}N`.
    pub node_prefix: String,
    /// Number of nodes in the cluster.
    pub node_count: u8,
    /// Port of each node's engine API.
    pub vault_port: u16,
    /// Explicit `name=url` node list. Takes precedence over prefix/count/port.
    pub nodes: Option<String>,
    /// Base URL of the Consul HTTP API.
    pub consul_addr: String,
    /// ACL token for Consul (optional).
    pub consul_token: Option<String>,
    /// Where share artifacts and the sealed root credential are written.
    pub artifact_dir: PathBuf,
    /// Local staging directory for secure bundles.
    pub staging_dir: PathBuf,
    /// Directory on each node receiving the secure bundle.
    pub remote_config_dir: String,
    /// Compose file used to launch nodes.
    pub compose_file: PathBuf,
    /// Log filter (e.g., `info`, `quorum_core=debug`).
    pub log_level: String,
    pub log_format: LogFormat,
    /// Seconds to wait for full quorum.
    pub quorum_timeout_secs: u64,
    /// Seconds one share decryption may take.
    pub decrypt_timeout_secs: u64,
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `QUORUM_NODE_PREFIX`: node name prefix (default: `vault`)
    /// - `QUORUM_NODE_COUNT`: number of nodes (default: `3`)
    /// - `QUORUM_VAULT_PORT`: engine API port on each node (default: `8200`)
    /// - `QUORUM_NODES`: explicit `name=url,...` list (overrides the three above)
    /// - `QUORUM_CONSUL_ADDR`: Consul HTTP API (default: `http://127.0.0.1:8500`)
    /// - `QUORUM_CONSUL_TOKEN`: Consul ACL token (optional)
    /// - `QUORUM_ARTIFACT_DIR`: share artifact directory (default: `./quorum-artifacts`)
    /// - `QUORUM_STAGING_DIR`: secure bundle staging directory (default: `./quorum-staging`)
    /// - `QUORUM_REMOTE_CONFIG_DIR`: bundle directory on nodes (default: `/consul/config`)
    /// - `QUORUM_COMPOSE_FILE`: compose file for `docker compose` (default: `docker-compose.yml`)
    /// - `QUORUM_LOG_LEVEL`: log filter (default: `warn`)
    /// - `QUORUM_LOG_FORMAT`: `text` or `json` (default: `text`)
    /// - `QUORUM_QUORUM_TIMEOUT`: seconds to wait for quorum (default: `300`)
    /// - `QUORUM_DECRYPT_TIMEOUT`: seconds per share decryption (default: `120`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_owned());

        let log_format = match lookup("QUORUM_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            node_prefix: var("QUORUM_NODE_PREFIX", "vault"),
            node_count: lookup("QUORUM_NODE_COUNT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(REFERENCE_NODE_COUNT),
            vault_port: lookup("QUORUM_VAULT_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8200),
            nodes: lookup("QUORUM_NODES").filter(|v| !v.trim().is_empty()),
            consul_addr: var("QUORUM_CONSUL_ADDR", "http://127.0.0.1:8500"),
            consul_token: lookup("QUORUM_CONSUL_TOKEN").filter(|v| !v.is_empty()),
            artifact_dir: PathBuf::from(var("QUORUM_ARTIFACT_DIR", "./quorum-artifacts")),
            staging_dir: PathBuf::from(var("QUORUM_STAGING_DIR", "./quorum-staging")),
            remote_config_dir: var(
                "QUORUM_REMOTE_CONFIG_DIR",
                quorum_core::cluster::DEFAULT_REMOTE_CONFIG_DIR,
            ),
            compose_file: PathBuf::from(var("QUORUM_COMPOSE_FILE", "docker-compose.yml")),
            log_level: var("QUORUM_LOG_LEVEL", "warn"),
            log_format,
            quorum_timeout_secs: lookup("QUORUM_QUORUM_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            decrypt_timeout_secs: lookup("QUORUM_DECRYPT_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
        }
    }

    /// Build the immutable cluster configuration handed to the core.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an empty or malformed node list.
    pub fn cluster_config(&self) -> Result<ClusterConfig, ConfigError> {
        let base = match &self.nodes {
            Some(list) => ClusterConfig::new(parse_node_list(list)?)?,
            None => ClusterConfig::uniform(&self.node_prefix, self.node_count, self.vault_port)?,
        };
        let quorum = QuorumPolicy {
            timeout: Duration::from_secs(self.quorum_timeout_secs),
            ..QuorumPolicy::default()
        };
        Ok(base
            .with_quorum_policy(quorum)?
            .with_decrypt_timeout(Duration::from_secs(self.decrypt_timeout_secs))
            .with_remote_config_dir(self.remote_config_dir.clone()))
    }
}

/// Parse `name=url,name=url,...` into ordered node specs.
fn parse_node_list(list: &str) -> Result<Vec<NodeSpec>, ConfigError> {
    let entries: Vec<&str> = list
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .collect();
    if entries.len() > usize::from(u8::MAX) {
        return Err(ConfigError::TooManyNodes {
            count: entries.len(),
        });
    }

    (1..=u8::MAX)
        .zip(entries)
        .map(|(ordinal, entry)| {
            let (name, address) =
                entry
                    .split_once('=')
                    .ok_or_else(|| ConfigError::InvalidNode {
                        ordinal,
                        reason: format!("expected name=url, got '{entry}'"),
                    })?;
            Ok(NodeSpec {
                ordinal,
                name: name.trim().to_owned(),
                address: address.trim().trim_end_matches('/').to_owned(),
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_with(vars: &[(&str, &str)]) -> CliConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        CliConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_describe_reference_deployment() {
        let config = config_with(&[]);
        let cluster = config.cluster_config().unwrap();
        assert_eq!(cluster.node_count(), 3);
        assert_eq!(cluster.nodes()[0].name, "vault1");
        assert_eq!(cluster.nodes()[2].address, "http://vault3:8200");
        assert_eq!(cluster.remote_config_dir(), "/consul/config");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(cluster.quorum_policy().timeout, Duration::from_secs(300));
    }

    #[test]
    fn env_overrides_topology() {
        let config = config_with(&[
            ("QUORUM_NODE_PREFIX", "node"),
            ("QUORUM_NODE_COUNT", "5"),
            ("QUORUM_VAULT_PORT", "9200"),
            ("QUORUM_LOG_FORMAT", "json"),
            ("QUORUM_DECRYPT_TIMEOUT", "7"),
        ]);
        let cluster = config.cluster_config().unwrap();
        assert_eq!(cluster.node_count(), 5);
        assert_eq!(cluster.nodes()[4].address, "http://node5:9200");
        assert_eq!(cluster.decrypt_timeout(), Duration::from_secs(7));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn unparsable_numbers_fall_back() {
        let config = config_with(&[("QUORUM_NODE_COUNT", "three")]);
        assert_eq!(config.node_count, 3);
    }

    #[test]
    fn explicit_node_list_wins() {
        let config = config_with(&[
            ("QUORUM_NODE_COUNT", "5"),
            (
                "QUORUM_NODES",
                "vault1=http://127.0.0.1:8200/, vault2=http://127.0.0.1:8210",
            ),
        ]);
        let cluster = config.cluster_config().unwrap();
        assert_eq!(cluster.node_count(), 2);
        assert_eq!(cluster.nodes()[0].address, "http://127.0.0.1:8200");
        assert_eq!(cluster.nodes()[1].ordinal, 2);
    }

    #[test]
    fn malformed_node_entry_is_rejected() {
        let config = config_with(&[("QUORUM_NODES", "vault1")]);
        assert!(matches!(
            config.cluster_config(),
            Err(ConfigError::InvalidNode { ordinal: 1, .. })
        ));
    }

    #[test]
    fn zero_nodes_is_rejected() {
        let config = config_with(&[("QUORUM_NODE_COUNT", "0")]);
        assert!(matches!(config.cluster_config(), Err(ConfigError::NoNodes)));
    }
}
