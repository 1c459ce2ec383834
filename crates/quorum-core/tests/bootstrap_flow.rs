//! End-to-end bring-up of an in-process cluster.
//!
//! Every scenario runs the real components against `LocalCluster`, which
//! stands in for the vault nodes, the consensus store and the container
//! runtime.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use quorum_core::backend::{ConsensusBackend, NodeChannel, SecretEngine};
use quorum_core::bootstrap::{BootstrapPlan, BootstrapSequencer};
use quorum_core::cluster::{ClusterConfig, QuorumPolicy, SealState};
use quorum_core::distribution::{
    ArtifactOutcome, KeyDistributor, PENDING_KEY, ROOT_CREDENTIAL_KEY,
};
use quorum_core::error::{BootstrapError, DistributionError, SplitError};
use quorum_core::identity::IdentityKeypair;
use quorum_core::local::LocalCluster;
use quorum_core::tls::generate_cluster_material;
use quorum_core::unseal::{NodeOutcome, ShareDecryptor, UnsealCoordinator};
use quorum_storage::{FileBackend, MemoryBackend, StorageBackend, StorageError};
use tokio::sync::watch;

const OPS_POLICY: &str = r#"{"rules":[{"path":"secret/ops/**","capabilities":["read","list"]}]}"#;

struct Env {
    _dir: tempfile::TempDir,
    config: Arc<ClusterConfig>,
    cluster: Arc<LocalCluster>,
    artifacts: Arc<FileBackend>,
    sequencer: BootstrapSequencer,
}

async fn env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(
        ClusterConfig::uniform("vault", 3, 8200)
            .unwrap()
            .with_quorum_policy(QuorumPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                timeout: Duration::from_secs(5),
            })
            .unwrap(),
    );
    let cluster = Arc::new(LocalCluster::new(&config));
    let artifacts = Arc::new(FileBackend::open(dir.path().join("artifacts")).await.unwrap());
    let sequencer = BootstrapSequencer::new(
        Arc::clone(&config),
        Arc::clone(&cluster) as Arc<dyn NodeChannel>,
        Arc::clone(&cluster) as Arc<dyn ConsensusBackend>,
        cluster.engines(),
        Arc::clone(&artifacts) as Arc<dyn StorageBackend>,
        dir.path().join("staging"),
    );
    Env {
        _dir: dir,
        config,
        cluster,
        artifacts,
        sequencer,
    }
}

fn keypairs(count: usize) -> Vec<Arc<IdentityKeypair>> {
    (0..count)
        .map(|i| Arc::new(IdentityKeypair::generate(format!("operator{}", i + 1)).unwrap()))
        .collect()
}

async fn seal_states(cluster: &LocalCluster) -> Vec<SealState> {
    let mut states = Vec::new();
    for engine in cluster.engines() {
        states.push(engine.seal_status().await.unwrap().state());
    }
    states
}

#[tokio::test]
async fn three_operators_two_of_three_unseal_everything() {
    let env = env().await;
    let keys = keypairs(3);
    let (_tx, rx) = watch::channel(false);

    let plan = BootstrapPlan {
        identities: keys.iter().map(|k| k.identity()).collect(),
        threshold: Some(2),
        unseal_with: vec![Arc::clone(&keys[0]), Arc::clone(&keys[1])],
        policies: vec![("ops".to_owned(), OPS_POLICY.to_owned())],
        ..BootstrapPlan::default()
    };
    let summary = env.sequencer.run(plan, rx).await.unwrap();

    assert_eq!(summary.peers, 2);
    assert_eq!((summary.share_count, summary.threshold), (3, 2));
    assert_eq!(summary.distribution.written(), 3);
    assert!(summary.unseal.as_ref().unwrap().complete);
    assert_eq!(summary.policies_applied, vec!["ops"]);
    assert!(summary.policies_pending.is_empty());
    assert_eq!(seal_states(&env.cluster).await, vec![SealState::Unsealed; 3]);

    // Operator 3's share was never needed but is in place.
    let distributor = KeyDistributor::new(Arc::clone(&env.artifacts) as Arc<dyn StorageBackend>);
    assert!(distributor.read_artifact(&keys[2].identity()).await.unwrap().is_some());

    // The root credential is only readable by the bootstrap operator.
    let sealed = env.artifacts.get(ROOT_CREDENTIAL_KEY).await.unwrap().unwrap();
    let envelope = hex::decode(sealed).unwrap();
    let opened = keys[0].open_root_credential(&envelope).unwrap();
    let credential = summary.root_credential.as_ref().unwrap();
    assert_eq!(opened.as_slice(), credential.expose().as_bytes());
    assert!(keys[1].open_root_credential(&envelope).is_err());
    assert!(keys[0].open_share(&envelope).is_err());
    assert!(!summary.resumed);
    assert!(env.artifacts.get(PENDING_KEY).await.unwrap().is_none());

    let policy = env.cluster.node(3).unwrap().read_policy("ops").await.unwrap();
    assert_eq!(policy.rules.len(), 1);
}

#[tokio::test]
async fn single_operator_threshold_defaults_to_one() {
    let env = env().await;
    let keys = keypairs(1);
    let (_tx, rx) = watch::channel(false);

    let plan = BootstrapPlan {
        identities: vec![keys[0].identity()],
        unseal_with: vec![Arc::clone(&keys[0])],
        ..BootstrapPlan::default()
    };
    let summary = env.sequencer.run(plan, rx).await.unwrap();

    assert_eq!(summary.threshold, 1);
    let unseal = summary.unseal.unwrap();
    assert!(unseal.complete);
    assert!(unseal.nodes.iter().all(|n| n.outcome == NodeOutcome::Applied));
    assert_eq!(seal_states(&env.cluster).await, vec![SealState::Unsealed; 3]);
}

#[tokio::test]
async fn policies_wait_while_sealed() {
    let env = env().await;
    let keys = keypairs(3);
    let (_tx, rx) = watch::channel(false);

    let plan = BootstrapPlan {
        identities: keys.iter().map(|k| k.identity()).collect(),
        unseal_with: vec![Arc::clone(&keys[0])],
        policies: vec![("ops".to_owned(), OPS_POLICY.to_owned())],
        ..BootstrapPlan::default()
    };
    let summary = env.sequencer.run(plan, rx).await.unwrap();

    assert!(!summary.unseal.unwrap().complete);
    assert!(summary.policies_applied.is_empty());
    assert_eq!(summary.policies_pending, vec!["ops"]);
    assert_eq!(seal_states(&env.cluster).await, vec![SealState::Sealed; 3]);
}

#[tokio::test]
async fn second_bootstrap_is_already_initialized() {
    let env = env().await;
    let keys = keypairs(2);
    let identities: Vec<_> = keys.iter().map(|k| k.identity()).collect();

    let (_tx, rx) = watch::channel(false);
    let plan = BootstrapPlan {
        identities: identities.clone(),
        ..BootstrapPlan::default()
    };
    env.sequencer.run(plan, rx).await.unwrap();
    let before = env.artifacts.list("unseal-keys/").await.unwrap();
    let first_artifact = env.artifacts.get(&before[0]).await.unwrap();

    let (_tx, rx) = watch::channel(false);
    let plan = BootstrapPlan {
        identities,
        ..BootstrapPlan::default()
    };
    let err = env.sequencer.run(plan, rx).await.unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Split(SplitError::AlreadyInitialized)
    ));

    // No share was regenerated.
    assert_eq!(env.artifacts.list("unseal-keys/").await.unwrap(), before);
    assert_eq!(env.artifacts.get(&before[0]).await.unwrap(), first_artifact);
}

#[tokio::test]
async fn secure_rollout_runs_before_initialize() {
    let env = env().await;
    let keys = keypairs(1);
    let material = generate_cluster_material(&env.config)
        .unwrap()
        .into_secure_material(None);
    let (_tx, rx) = watch::channel(false);

    let plan = BootstrapPlan {
        identities: vec![keys[0].identity()],
        secure: Some(material),
        unseal_with: vec![Arc::clone(&keys[0])],
        ..BootstrapPlan::default()
    };
    let summary = env.sequencer.run(plan, rx).await.unwrap();

    let rollout = summary.rollout.unwrap();
    assert_eq!(rollout.version, 1);
    assert_eq!(rollout.restarts(), 3);
    assert!(rollout.generated_gossip_key.is_some());
    for ordinal in 1..=3 {
        assert!(
            env.cluster
                .delivered_file(ordinal, "/consul/config/tls/server.crt")
                .await
                .is_some()
        );
    }
    // The rollout restarts happened before unseal, so nodes stay unsealed.
    assert_eq!(seal_states(&env.cluster).await, vec![SealState::Unsealed; 3]);
}

#[tokio::test]
async fn operators_unseal_separately_after_bootstrap() {
    let env = env().await;
    let keys = keypairs(3);
    let (_tx, rx) = watch::channel(false);
    let plan = BootstrapPlan {
        identities: keys.iter().map(|k| k.identity()).collect(),
        ..BootstrapPlan::default()
    };
    env.sequencer.run(plan, rx).await.unwrap();

    let distributor = KeyDistributor::new(Arc::clone(&env.artifacts) as Arc<dyn StorageBackend>);
    let coordinator =
        UnsealCoordinator::new(Arc::clone(&env.config), env.cluster.engines()).unwrap();

    for (i, key) in keys.iter().enumerate().skip(1) {
        let artifact = distributor.read_artifact(&key.identity()).await.unwrap().unwrap();
        let report = coordinator
            .unseal(&artifact, Arc::clone(key) as Arc<dyn ShareDecryptor>)
            .await
            .unwrap();
        assert_eq!(report.complete, i == 2);
    }

    // A late operator is a harmless no-op.
    let artifact = distributor.read_artifact(&keys[0].identity()).await.unwrap().unwrap();
    let report = coordinator
        .unseal(&artifact, Arc::clone(&keys[0]) as Arc<dyn ShareDecryptor>)
        .await
        .unwrap();
    assert!(report.nodes.iter().all(|n| n.outcome == NodeOutcome::AlreadyUnsealed));
}

/// Artifact store that accepts `budget` writes, then fails every put.
struct FlakyStore {
    inner: MemoryBackend,
    budget: AtomicUsize,
}

#[async_trait::async_trait]
impl StorageBackend for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let left = self.budget.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StorageError::Write {
                key: key.to_owned(),
                reason: "no space left on device".to_owned(),
            });
        }
        self.budget.store(left - 1, Ordering::SeqCst);
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }
}

#[tokio::test]
async fn interrupted_distribution_is_completed_by_rerun() {
    let env = env().await;
    let store = Arc::new(FlakyStore {
        inner: MemoryBackend::new(),
        budget: AtomicUsize::new(1),
    });
    let sequencer = BootstrapSequencer::new(
        Arc::clone(&env.config),
        Arc::clone(&env.cluster) as Arc<dyn NodeChannel>,
        Arc::clone(&env.cluster) as Arc<dyn ConsensusBackend>,
        env.cluster.engines(),
        Arc::clone(&store) as Arc<dyn StorageBackend>,
        std::env::temp_dir().join("quorum-flaky-staging"),
    );
    let keys = keypairs(3);
    let plan = || BootstrapPlan {
        identities: keys.iter().map(|k| k.identity()).collect(),
        threshold: Some(2),
        unseal_with: vec![Arc::clone(&keys[0]), Arc::clone(&keys[1])],
        policies: vec![("ops".to_owned(), OPS_POLICY.to_owned())],
        ..BootstrapPlan::default()
    };

    // Only the staged record fits before the store fills up.
    let (_tx, rx) = watch::channel(false);
    let err = sequencer.run(plan(), rx).await.unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Distribution(DistributionError::Write { .. })
    ));
    assert!(store.inner.get(PENDING_KEY).await.unwrap().is_some());
    assert!(store.inner.list("unseal-keys/").await.unwrap().is_empty());

    store.budget.store(usize::MAX, Ordering::SeqCst);
    let (_tx, rx) = watch::channel(false);
    let summary = sequencer.run(plan(), rx).await.unwrap();

    assert!(summary.resumed);
    assert_eq!((summary.share_count, summary.threshold), (3, 2));
    assert_eq!(summary.distribution.written(), 3);
    assert_eq!(
        summary.distribution.root_credential,
        Some(ArtifactOutcome::Written)
    );
    assert_eq!(store.inner.list("unseal-keys/").await.unwrap().len(), 3);
    assert!(store.inner.get(ROOT_CREDENTIAL_KEY).await.unwrap().is_some());
    assert!(store.inner.get(PENDING_KEY).await.unwrap().is_none());

    // The recovered shares unseal the cluster and the bootstrap keypair
    // recovers the root credential for the initial policies.
    assert!(summary.unseal.as_ref().unwrap().complete);
    assert!(summary.root_credential.is_some());
    assert_eq!(summary.policies_applied, vec!["ops"]);
    assert_eq!(seal_states(&env.cluster).await, vec![SealState::Unsealed; 3]);
}

#[tokio::test]
async fn resumed_run_without_bootstrap_keypair_leaves_policies_pending() {
    let env = env().await;
    let store = Arc::new(FlakyStore {
        inner: MemoryBackend::new(),
        budget: AtomicUsize::new(2),
    });
    let sequencer = BootstrapSequencer::new(
        Arc::clone(&env.config),
        Arc::clone(&env.cluster) as Arc<dyn NodeChannel>,
        Arc::clone(&env.cluster) as Arc<dyn ConsensusBackend>,
        env.cluster.engines(),
        Arc::clone(&store) as Arc<dyn StorageBackend>,
        std::env::temp_dir().join("quorum-flaky-staging"),
    );
    let keys = keypairs(3);
    let plan = || BootstrapPlan {
        identities: keys.iter().map(|k| k.identity()).collect(),
        unseal_with: vec![Arc::clone(&keys[1]), Arc::clone(&keys[2])],
        policies: vec![("ops".to_owned(), OPS_POLICY.to_owned())],
        ..BootstrapPlan::default()
    };

    let (_tx, rx) = watch::channel(false);
    let err = sequencer.run(plan(), rx).await.unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Distribution(DistributionError::Write { completed, .. })
            if completed == ["operator1"]
    ));

    store.budget.store(usize::MAX, Ordering::SeqCst);
    let (_tx, rx) = watch::channel(false);
    let summary = sequencer.run(plan(), rx).await.unwrap();

    assert!(summary.resumed);
    assert_eq!(summary.distribution.written(), 2);
    assert!(summary.unseal.unwrap().complete);
    assert!(summary.root_credential.is_none());
    assert!(summary.policies_applied.is_empty());
    assert_eq!(summary.policies_pending, vec!["ops"]);

    // The bootstrap operator can still open it later.
    let distributor = KeyDistributor::new(Arc::clone(&store) as Arc<dyn StorageBackend>);
    assert!(distributor.open_root_credential(&keys[0]).await.unwrap().is_some());
}

#[tokio::test]
async fn cancelled_before_launch() {
    let env = env().await;
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let plan = BootstrapPlan {
        identities: vec![keypairs(1)[0].identity()],
        ..BootstrapPlan::default()
    };
    let err = env.sequencer.run(plan, rx).await.unwrap_err();
    assert!(matches!(err, BootstrapError::Cancelled { stage: "launch" }));
    assert!(env.cluster.status().await.is_err());
}
