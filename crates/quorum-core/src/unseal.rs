//! Unseal coordinator.
//!
//! One [`UnsealCoordinator::unseal`] call takes one operator's share
//! artifact, decrypts it locally, and submits the share to every node in
//! ordinal order. Nodes unseal independently: each needs `threshold`
//! distinct shares of its own, and a cluster with some nodes unsealed is a
//! valid degraded state.
//!
//! The coordinator keeps an [`UnsealSession`] with the digests of the shares
//! each node has counted in the current attempt. A share a node already
//! counted is not sent again; a node that restarted (sealed, no progress)
//! has its digests forgotten so it can be fed again.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::backend::{SealStatus, SecretEngine, ShareValue};
use crate::cluster::{ClusterConfig, ClusterNode, SealState};
use crate::error::{IdentityError, UnsealError};
use crate::identity::IdentityKeypair;

/// Something that can open a share artifact addressed to its holder.
///
/// Implementations may block (hardware token, passphrase prompt); the
/// coordinator runs them on the blocking pool under a timeout.
pub trait ShareDecryptor: Send + Sync {
    /// Fingerprint of the identity this decryptor holds.
    fn fingerprint(&self) -> String;

    /// Open one share envelope.
    ///
    /// # Errors
    ///
    /// Any [`IdentityError`]; the coordinator reports it as `DecryptionFailed`.
    fn decrypt(&self, envelope: &[u8]) -> Result<Zeroizing<Vec<u8>>, IdentityError>;
}

impl ShareDecryptor for IdentityKeypair {
    fn fingerprint(&self) -> String {
        self.identity().fingerprint()
    }

    fn decrypt(&self, envelope: &[u8]) -> Result<Zeroizing<Vec<u8>>, IdentityError> {
        self.open_share(envelope)
    }
}

/// What happened on one node during one `unseal` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// The share was submitted and counted.
    Applied,
    /// The node already counted this share in the current attempt.
    Duplicate,
    /// The node was unsealed before the call; nothing was submitted.
    AlreadyUnsealed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUnseal {
    pub ordinal: u8,
    pub name: String,
    pub outcome: NodeOutcome,
    pub seal_state: SealState,
    pub progress: u8,
    pub threshold: u8,
}

/// Per-node result of one `unseal` call, in ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsealReport {
    pub nodes: Vec<NodeUnseal>,
    /// Every node of the cluster is unsealed.
    pub complete: bool,
}

/// Digests of the shares each node counted in the current attempt.
#[derive(Debug, Default)]
pub struct UnsealSession {
    applied: BTreeMap<u8, BTreeSet<String>>,
}

impl UnsealSession {
    /// Distinct shares recorded for `ordinal`.
    #[must_use]
    pub fn applied_to(&self, ordinal: u8) -> usize {
        self.applied.get(&ordinal).map_or(0, BTreeSet::len)
    }
}

#[derive(Debug)]
struct CoordinatorState {
    nodes: Vec<ClusterNode>,
    session: Option<UnsealSession>,
}

/// Drives every node of the cluster from sealed to unsealed.
pub struct UnsealCoordinator {
    config: Arc<ClusterConfig>,
    engines: Vec<Arc<dyn SecretEngine>>,
    state: Mutex<CoordinatorState>,
}

impl UnsealCoordinator {
    /// `engines[i]` must be the engine of node `i + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`UnsealError::TopologyMismatch`] if the counts differ.
    pub fn new(
        config: Arc<ClusterConfig>,
        engines: Vec<Arc<dyn SecretEngine>>,
    ) -> Result<Self, UnsealError> {
        if engines.len() != config.node_count() {
            return Err(UnsealError::TopologyMismatch {
                expected: config.node_count(),
                actual: engines.len(),
            });
        }
        let nodes = config.nodes().iter().cloned().map(ClusterNode::new).collect();
        Ok(Self {
            config,
            engines,
            state: Mutex::new(CoordinatorState {
                nodes,
                session: None,
            }),
        })
    }

    /// Decrypt `artifact` with `decryptor` and submit the share to every node.
    ///
    /// Safe to repeat: unsealed nodes and shares already counted are skipped.
    ///
    /// # Errors
    ///
    /// - [`UnsealError::InvalidArtifact`] if the artifact is not hex.
    /// - [`UnsealError::DecryptionFailed`] / [`UnsealError::DecryptionTimedOut`]
    ///   if the share cannot be opened. No node is contacted.
    /// - [`UnsealError::Node`] if a node rejects the share; the report holds
    ///   the nodes handled before it. Later nodes are untouched.
    pub async fn unseal(
        &self,
        artifact: &str,
        decryptor: Arc<dyn ShareDecryptor>,
    ) -> Result<UnsealReport, UnsealError> {
        let envelope = hex::decode(artifact.trim()).map_err(|e| UnsealError::InvalidArtifact {
            reason: format!("hex decode failed: {e}"),
        })?;
        let share = self.decrypt(envelope, decryptor).await?;
        let digest = share.digest();

        let mut state = self.state.lock().await;
        let CoordinatorState { nodes, session } = &mut *state;
        let session = session.get_or_insert_with(UnsealSession::default);
        let mut report = UnsealReport::default();

        for (node, engine) in nodes.iter_mut().zip(&self.engines) {
            let ordinal = node.ordinal();
            let result = apply_share(engine.as_ref(), session, ordinal, &share, &digest).await;
            let (outcome, status) = match result {
                Ok(done) => done,
                Err(source) => {
                    node.seal_state = SealState::Unknown;
                    warn!(ordinal, error = %source, "unseal failed on node");
                    return Err(UnsealError::Node {
                        ordinal,
                        source,
                        report: Box::new(report),
                    });
                }
            };

            node.seal_state = status.state();
            debug!(ordinal, ?outcome, progress = status.progress, "share handled");
            report.nodes.push(NodeUnseal {
                ordinal,
                name: node.spec.name.clone(),
                outcome,
                seal_state: node.seal_state,
                progress: status.progress,
                threshold: status.threshold,
            });
        }

        report.complete = report
            .nodes
            .iter()
            .all(|n| n.seal_state == SealState::Unsealed);
        if report.complete {
            state.session = None;
            info!(nodes = report.nodes.len(), "all nodes unsealed");
        }
        Ok(report)
    }

    /// Forget the current attempt. Nodes keep whatever progress they have.
    pub async fn abort(&self) {
        if self.state.lock().await.session.take().is_some() {
            info!("unseal session aborted");
        }
    }

    /// Distinct shares recorded for `ordinal` in the current attempt.
    pub async fn session_progress(&self, ordinal: u8) -> usize {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .map_or(0, |s| s.applied_to(ordinal))
    }

    /// Poll every node's seal status. Unreachable nodes become `UNKNOWN`.
    pub async fn refresh(&self) -> Vec<ClusterNode> {
        let mut state = self.state.lock().await;
        for (node, engine) in state.nodes.iter_mut().zip(&self.engines) {
            node.seal_state = match engine.seal_status().await {
                Ok(status) => status.state(),
                Err(e) => {
                    warn!(ordinal = node.ordinal(), error = %e, "seal status unavailable");
                    SealState::Unknown
                }
            };
        }
        state.nodes.clone()
    }

    /// Last observed view of the cluster.
    pub async fn nodes(&self) -> Vec<ClusterNode> {
        self.state.lock().await.nodes.clone()
    }

    async fn decrypt(
        &self,
        envelope: Vec<u8>,
        decryptor: Arc<dyn ShareDecryptor>,
    ) -> Result<ShareValue, UnsealError> {
        let limit = self.config.decrypt_timeout();
        let fingerprint = decryptor.fingerprint();
        let task = tokio::task::spawn_blocking(move || decryptor.decrypt(&envelope));

        match tokio::time::timeout(limit, task).await {
            Err(_) => Err(UnsealError::DecryptionTimedOut {
                secs: limit.as_secs(),
            }),
            Ok(Err(join)) => Err(UnsealError::DecryptionFailed {
                reason: format!("decryption task failed: {join}"),
            }),
            Ok(Ok(Err(e))) => {
                debug!(identity = %fingerprint, "share artifact did not open");
                Err(UnsealError::DecryptionFailed {
                    reason: e.to_string(),
                })
            }
            Ok(Ok(Ok(plain))) => Ok(ShareValue::new(plain)),
        }
    }
}

impl fmt::Debug for UnsealCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealCoordinator")
            .field("nodes", &self.config.node_count())
            .finish_non_exhaustive()
    }
}

async fn apply_share(
    engine: &dyn SecretEngine,
    session: &mut UnsealSession,
    ordinal: u8,
    share: &ShareValue,
    digest: &str,
) -> Result<(NodeOutcome, SealStatus), crate::error::EngineError> {
    let before = engine.seal_status().await?;
    let applied = session.applied.entry(ordinal).or_default();

    if !before.sealed {
        applied.clear();
        return Ok((NodeOutcome::AlreadyUnsealed, before));
    }
    if before.progress == 0 {
        // Restarted or reset since the last call.
        applied.clear();
    }
    if applied.contains(digest) {
        return Ok((NodeOutcome::Duplicate, before));
    }

    match engine.unseal(share).await {
        Ok(after) if after.sealed => {
            applied.insert(digest.to_owned());
            // The engine already held this share from before the session.
            let outcome = if after.progress == before.progress {
                NodeOutcome::Duplicate
            } else {
                NodeOutcome::Applied
            };
            Ok((outcome, after))
        }
        Ok(after) => {
            applied.clear();
            Ok((NodeOutcome::Applied, after))
        }
        Err(e) => {
            applied.clear();
            Err(e)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{ConsensusBackend, EncryptedShare};
    use crate::identity::EnvelopePurpose;
    use crate::local::LocalCluster;
    use crate::splitter::ThresholdSplitter;

    struct Harness {
        cluster: Arc<LocalCluster>,
        coordinator: UnsealCoordinator,
        keys: Vec<Arc<IdentityKeypair>>,
        shares: Vec<EncryptedShare>,
    }

    async fn harness(recipients: usize) -> Harness {
        let config = Arc::new(ClusterConfig::uniform("vault", 3, 8200).unwrap());
        let cluster = Arc::new(LocalCluster::new(&config));
        let keys: Vec<_> = (0..recipients)
            .map(|i| Arc::new(IdentityKeypair::generate(format!("op{i}")).unwrap()))
            .collect();
        let ids: Vec<_> = keys.iter().map(|k| k.identity()).collect();
        let splitter = ThresholdSplitter::new(
            Arc::clone(&cluster.engines()[0]),
            Arc::clone(&cluster) as Arc<dyn ConsensusBackend>,
        );
        let shares = splitter.initialize(&ids, None).await.unwrap().shares().to_vec();
        let coordinator = UnsealCoordinator::new(config, cluster.engines()).unwrap();
        Harness {
            cluster,
            coordinator,
            keys,
            shares,
        }
    }

    impl Harness {
        async fn unseal_with(&self, i: usize) -> Result<UnsealReport, UnsealError> {
            let decryptor = Arc::clone(&self.keys[i]) as Arc<dyn ShareDecryptor>;
            self.coordinator
                .unseal(&self.shares[i].to_artifact(), decryptor)
                .await
        }
    }

    #[tokio::test]
    async fn threshold_minus_one_leaves_nodes_sealed() {
        let h = harness(3).await;
        let report = h.unseal_with(0).await.unwrap();
        assert!(!report.complete);
        assert_eq!(report.nodes.len(), 3);
        for node in &report.nodes {
            assert_eq!(node.outcome, NodeOutcome::Applied);
            assert_eq!(node.seal_state, SealState::Sealed);
            assert_eq!((node.progress, node.threshold), (1, 2));
        }
        assert_eq!(h.coordinator.session_progress(2).await, 1);
    }

    #[tokio::test]
    async fn two_of_three_unseals_every_node() {
        let h = harness(3).await;
        h.unseal_with(0).await.unwrap();
        let report = h.unseal_with(1).await.unwrap();
        assert!(report.complete);
        assert!(report.nodes.iter().all(|n| n.seal_state == SealState::Unsealed));
        assert_eq!(h.coordinator.session_progress(1).await, 0);
    }

    #[tokio::test]
    async fn repeating_a_share_is_a_no_op() {
        let h = harness(3).await;
        h.unseal_with(0).await.unwrap();
        let report = h.unseal_with(0).await.unwrap();
        assert!(report.nodes.iter().all(|n| n.outcome == NodeOutcome::Duplicate));
        assert!(report.nodes.iter().all(|n| n.progress == 1));
    }

    #[tokio::test]
    async fn unsealed_nodes_are_left_alone() {
        let h = harness(1).await;
        assert!(h.unseal_with(0).await.unwrap().complete);
        let report = h.unseal_with(0).await.unwrap();
        assert!(report.complete);
        assert!(
            report
                .nodes
                .iter()
                .all(|n| n.outcome == NodeOutcome::AlreadyUnsealed)
        );
    }

    #[tokio::test]
    async fn restarted_node_is_fed_again() {
        let h = harness(3).await;
        h.unseal_with(0).await.unwrap();
        h.cluster.node(2).unwrap().restart().await;

        let report = h.unseal_with(0).await.unwrap();
        assert_eq!(report.nodes[0].outcome, NodeOutcome::Duplicate);
        assert_eq!(report.nodes[1].outcome, NodeOutcome::Applied);
        assert_eq!(report.nodes[1].progress, 1);
    }

    #[tokio::test]
    async fn wrong_key_fails_before_any_node() {
        let h = harness(2).await;
        let stranger = Arc::new(IdentityKeypair::generate("stranger").unwrap());
        let err = h
            .coordinator
            .unseal(&h.shares[0].to_artifact(), stranger)
            .await
            .unwrap_err();
        assert!(matches!(err, UnsealError::DecryptionFailed { .. }));
        assert!(h.coordinator.nodes().await.iter().all(|n| n.seal_state == SealState::Unknown));
    }

    #[tokio::test]
    async fn garbage_artifact_is_invalid() {
        let h = harness(1).await;
        let decryptor = Arc::clone(&h.keys[0]) as Arc<dyn ShareDecryptor>;
        let err = h.coordinator.unseal("zz-not-hex", decryptor).await.unwrap_err();
        assert!(matches!(err, UnsealError::InvalidArtifact { .. }));
    }

    struct SlowDecryptor;

    impl ShareDecryptor for SlowDecryptor {
        fn fingerprint(&self) -> String {
            "slow".to_owned()
        }

        fn decrypt(&self, _envelope: &[u8]) -> Result<Zeroizing<Vec<u8>>, IdentityError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Zeroizing::new(Vec::new()))
        }
    }

    #[tokio::test]
    async fn slow_decryption_times_out() {
        let config = Arc::new(
            ClusterConfig::uniform("vault", 1, 8200)
                .unwrap()
                .with_decrypt_timeout(Duration::from_millis(20)),
        );
        let cluster = LocalCluster::new(&config);
        let coordinator = UnsealCoordinator::new(config, cluster.engines()).unwrap();
        let err = coordinator
            .unseal("00", Arc::new(SlowDecryptor))
            .await
            .unwrap_err();
        assert!(matches!(err, UnsealError::DecryptionTimedOut { .. }));
    }

    #[tokio::test]
    async fn engine_count_must_match_topology() {
        let config = Arc::new(ClusterConfig::uniform("vault", 3, 8200).unwrap());
        let cluster = LocalCluster::new(&config);
        let mut engines = cluster.engines();
        engines.pop();
        let err = UnsealCoordinator::new(config, engines).unwrap_err();
        assert!(matches!(
            err,
            UnsealError::TopologyMismatch { expected: 3, actual: 2 }
        ));
    }

    #[tokio::test]
    async fn share_counted_before_abort_is_a_duplicate() {
        let h = harness(3).await;
        h.unseal_with(0).await.unwrap();
        h.coordinator.abort().await;

        let report = h.unseal_with(0).await.unwrap();
        for node in &report.nodes {
            assert_eq!(node.outcome, NodeOutcome::Duplicate);
            assert_eq!(node.progress, 1);
            assert_eq!(node.seal_state, SealState::Sealed);
        }
        assert_eq!(h.coordinator.session_progress(1).await, 1);
    }

    #[tokio::test]
    async fn root_credential_artifact_is_not_a_share() {
        let config = Arc::new(ClusterConfig::uniform("vault", 3, 8200).unwrap());
        let cluster = LocalCluster::new(&config);
        let coordinator = UnsealCoordinator::new(config, cluster.engines()).unwrap();
        let alice = Arc::new(IdentityKeypair::generate("alice").unwrap());
        let sealed = alice
            .identity()
            .seal(EnvelopePurpose::RootCredential, b"q.root")
            .unwrap();

        let err = coordinator
            .unseal(&hex::encode(sealed), alice)
            .await
            .unwrap_err();
        assert!(matches!(err, UnsealError::DecryptionFailed { .. }));
        assert!(coordinator.nodes().await.iter().all(|n| n.seal_state == SealState::Unknown));
    }

    #[tokio::test]
    async fn refresh_and_abort() {
        let h = harness(3).await;
        h.unseal_with(0).await.unwrap();
        h.coordinator.abort().await;
        assert_eq!(h.coordinator.session_progress(1).await, 0);

        let nodes = h.coordinator.refresh().await;
        assert!(nodes.iter().all(|n| n.seal_state == SealState::Sealed));
    }
}
