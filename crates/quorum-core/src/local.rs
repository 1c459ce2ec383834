//! In-process cluster: every collaborator the orchestration core needs,
//! backed by memory.
//!
//! [`LocalCluster`] owns N [`LocalVaultNode`]s over one shared storage
//! backend and plays both the consensus store ([`ConsensusBackend`]) and the
//! process plumbing ([`NodeChannel`]). Faults can be injected per node so
//! tests can stop a rollout halfway and re-run it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use quorum_storage::{MemoryBackend, StorageBackend};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::{
    ConsensusBackend, ConsensusStatus, LockToken, NodeChannel, SecretEngine,
};
use crate::cluster::{ClusterConfig, NodeSpec};
use crate::crypto::EncryptionKey;
use crate::error::{BackendError, ChannelError};
use crate::node::LocalVaultNode;

#[derive(Debug, Default)]
struct LocalState {
    launched: BTreeSet<u8>,
    locks: HashMap<String, String>,
    files: BTreeMap<(u8, String), Vec<u8>>,
    deliveries: usize,
    restarts: BTreeMap<u8, usize>,
    fail_launch: BTreeSet<u8>,
    fail_delivery: BTreeSet<u8>,
    fail_restart: BTreeSet<u8>,
}

/// A whole cluster living in this process.
#[derive(Debug)]
pub struct LocalCluster {
    nodes: Vec<Arc<LocalVaultNode>>,
    kv: MemoryBackend,
    state: Mutex<LocalState>,
}

impl LocalCluster {
    /// One local node per entry of `config`. Nodes start stopped.
    #[must_use]
    pub fn new(config: &ClusterConfig) -> Self {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let nodes = config
            .nodes()
            .iter()
            .map(|spec| Arc::new(LocalVaultNode::new(spec.clone(), Arc::clone(&storage))))
            .collect();
        Self {
            nodes,
            kv: MemoryBackend::new(),
            state: Mutex::new(LocalState::default()),
        }
    }

    /// The nodes as secret engines, in ordinal order.
    #[must_use]
    pub fn engines(&self) -> Vec<Arc<dyn SecretEngine>> {
        self.nodes
            .iter()
            .map(|n| Arc::clone(n) as Arc<dyn SecretEngine>)
            .collect()
    }

    #[must_use]
    pub fn node(&self, ordinal: u8) -> Option<&Arc<LocalVaultNode>> {
        self.nodes.iter().find(|n| n.spec().ordinal == ordinal)
    }

    /// Mark every node as running.
    pub async fn launch_all(&self) {
        let mut state = self.state.lock().await;
        state.launched.extend(self.nodes.iter().map(|n| n.spec().ordinal));
    }

    pub async fn fail_launch_of(&self, ordinal: u8) {
        self.state.lock().await.fail_launch.insert(ordinal);
    }

    pub async fn fail_delivery_to(&self, ordinal: u8) {
        self.state.lock().await.fail_delivery.insert(ordinal);
    }

    pub async fn fail_restart_on(&self, ordinal: u8) {
        self.state.lock().await.fail_restart.insert(ordinal);
    }

    pub async fn clear_faults(&self) {
        let mut state = self.state.lock().await;
        state.fail_launch.clear();
        state.fail_delivery.clear();
        state.fail_restart.clear();
    }

    /// Successful file deliveries so far.
    pub async fn deliveries(&self) -> usize {
        self.state.lock().await.deliveries
    }

    /// Successful restarts of `ordinal` so far.
    pub async fn restarts(&self, ordinal: u8) -> usize {
        self.state.lock().await.restarts.get(&ordinal).copied().unwrap_or(0)
    }

    /// Content last delivered to `remote` on `ordinal`.
    pub async fn delivered_file(&self, ordinal: u8, remote: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .files
            .get(&(ordinal, remote.to_owned()))
            .cloned()
    }

    fn local_node(&self, spec: &NodeSpec) -> Option<&Arc<LocalVaultNode>> {
        self.node(spec.ordinal)
    }
}

#[async_trait::async_trait]
impl ConsensusBackend for LocalCluster {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.kv.get(key).await?)
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        Ok(self.kv.put(key, value).await?)
    }

    async fn acquire_lock(&self, name: &str) -> Result<Option<LockToken>, BackendError> {
        let mut state = self.state.lock().await;
        if state.locks.contains_key(name) {
            return Ok(None);
        }
        let token = uuid::Uuid::new_v4().to_string();
        state.locks.insert(name.to_owned(), token.clone());
        Ok(Some(LockToken(token)))
    }

    async fn release_lock(&self, name: &str, token: &LockToken) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        match state.locks.get(name) {
            Some(held) if *held == token.0 => {
                state.locks.remove(name);
                Ok(())
            }
            Some(_) => Err(BackendError::Lock {
                name: name.to_owned(),
                reason: "lock is held by another session".to_owned(),
            }),
            None => Ok(()),
        }
    }

    async fn status(&self) -> Result<ConsensusStatus, BackendError> {
        let state = self.state.lock().await;
        let Some(first) = state.launched.iter().next() else {
            return Err(BackendError::Unavailable {
                reason: "no node is running".to_owned(),
            });
        };
        let leader = self.node(*first).map(|n| n.spec().name.clone());
        Ok(ConsensusStatus {
            peers: state.launched.len() - 1,
            leader,
        })
    }
}

#[async_trait::async_trait]
impl NodeChannel for LocalCluster {
    async fn launch(&self, node: &NodeSpec) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if state.fail_launch.contains(&node.ordinal) || self.local_node(node).is_none() {
            return Err(ChannelError::LaunchFailed {
                node: node.name.clone(),
                reason: "injected launch failure".to_owned(),
            });
        }
        state.launched.insert(node.ordinal);
        info!(ordinal = node.ordinal, node = %node.name, "local node launched");
        Ok(())
    }

    async fn deliver(
        &self,
        node: &NodeSpec,
        local: &Path,
        remote: &str,
    ) -> Result<(), ChannelError> {
        let failed = |reason: String| ChannelError::DeliveryFailed {
            node: node.name.clone(),
            remote_path: remote.to_owned(),
            reason,
        };
        let content = tokio::fs::read(local)
            .await
            .map_err(|e| failed(format!("read {}: {e}", local.display())))?;

        let mut state = self.state.lock().await;
        if state.fail_delivery.contains(&node.ordinal) {
            return Err(failed("injected delivery failure".to_owned()));
        }
        state.files.insert((node.ordinal, remote.to_owned()), content);
        state.deliveries += 1;
        debug!(ordinal = node.ordinal, remote, "file delivered");
        Ok(())
    }

    async fn restart(&self, node: &NodeSpec) -> Result<(), ChannelError> {
        let Some(local) = self.local_node(node) else {
            return Err(ChannelError::RestartFailed {
                node: node.name.clone(),
                reason: "unknown node".to_owned(),
            });
        };
        {
            let mut state = self.state.lock().await;
            if state.fail_restart.contains(&node.ordinal) {
                return Err(ChannelError::RestartFailed {
                    node: node.name.clone(),
                    reason: "injected restart failure".to_owned(),
                });
            }
            *state.restarts.entry(node.ordinal).or_default() += 1;
            state.launched.insert(node.ordinal);
        }
        local.restart().await;
        Ok(())
    }

    async fn generate_gossip_key(&self, node: &NodeSpec) -> Result<String, ChannelError> {
        if !self.state.lock().await.launched.contains(&node.ordinal) {
            return Err(ChannelError::KeygenFailed {
                node: node.name.clone(),
                reason: "node is not running".to_owned(),
            });
        }
        Ok(BASE64.encode(EncryptionKey::generate().as_bytes()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cluster() -> (ClusterConfig, LocalCluster) {
        let config = ClusterConfig::uniform("vault", 3, 8200).unwrap();
        let local = LocalCluster::new(&config);
        (config, local)
    }

    #[tokio::test]
    async fn peers_follow_launched_nodes() {
        let (config, local) = cluster();
        assert!(local.status().await.is_err());

        local.launch(&config.nodes()[0]).await.unwrap();
        assert_eq!(local.status().await.unwrap().peers, 0);

        local.launch_all().await;
        let status = local.status().await.unwrap();
        assert_eq!(status.peers, 2);
        assert_eq!(status.leader.as_deref(), Some("vault1"));
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let (_, local) = cluster();
        let token = local.acquire_lock("quorum/lock/init").await.unwrap().unwrap();
        assert!(local.acquire_lock("quorum/lock/init").await.unwrap().is_none());

        let foreign = LockToken("other".to_owned());
        assert!(local.release_lock("quorum/lock/init", &foreign).await.is_err());

        local.release_lock("quorum/lock/init", &token).await.unwrap();
        assert!(local.acquire_lock("quorum/lock/init").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delivery_and_fault_injection() {
        let (config, local) = cluster();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secure.json");
        tokio::fs::write(&path, b"{}").await.unwrap();
        let node = &config.nodes()[1];

        local.deliver(node, &path, "/consul/config/secure.json").await.unwrap();
        assert_eq!(local.deliveries().await, 1);
        assert_eq!(
            local.delivered_file(2, "/consul/config/secure.json").await,
            Some(b"{}".to_vec())
        );

        local.fail_delivery_to(2).await;
        assert!(local.deliver(node, &path, "/x").await.is_err());
        local.clear_faults().await;
        local.deliver(node, &path, "/x").await.unwrap();
        assert_eq!(local.deliveries().await, 2);
    }

    #[tokio::test]
    async fn restart_counts_and_faults() {
        let (config, local) = cluster();
        let node = &config.nodes()[0];
        local.restart(node).await.unwrap();
        assert_eq!(local.restarts(1).await, 1);

        local.fail_restart_on(1).await;
        assert!(local.restart(node).await.is_err());
        assert_eq!(local.restarts(1).await, 1);
    }

    #[tokio::test]
    async fn gossip_key_needs_running_node() {
        let (config, local) = cluster();
        let node = &config.nodes()[0];
        assert!(local.generate_gossip_key(node).await.is_err());

        local.launch(node).await.unwrap();
        let key = local.generate_gossip_key(node).await.unwrap();
        assert_eq!(BASE64.decode(key).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn engines_share_initialization() {
        let (_, local) = cluster();
        assert_eq!(local.engines().len(), 3);
        assert!(!local.engines()[2].seal_status().await.unwrap().initialized);
    }
}
