//! Cluster bootstrap sequencer.
//!
//! Runs the whole bring-up in order: launch nodes, wait for the consensus
//! store to see every peer, optionally secure the transport, initialize and
//! distribute shares, unseal with whatever keypairs the plan carries, then
//! apply the initial policies. The first failing step aborts the sequence.
//! Nothing is rolled back; every step is safe to re-run on its own.
//!
//! Initialize happens once. Its output is staged in the artifact store before
//! any share is written, and a run that finds a staged distribution finishes
//! it instead of initializing again.
//!
//! Waiting for quorum uses bounded exponential backoff and listens on a
//! `watch` channel so the operator can cancel a hung bring-up.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use quorum_storage::StorageBackend;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{ConsensusBackend, NodeChannel, RootCredential, SecretEngine};
use crate::cluster::ClusterConfig;
use crate::distribution::{DistributionReport, KeyDistributor};
use crate::error::{BootstrapError, EngineError, SplitError};
use crate::identity::{IdentityKeypair, RecipientIdentity};
use crate::rollout::{RolloutReport, SecureMaterial, SecureRolloutManager};
use crate::splitter::ThresholdSplitter;
use crate::unseal::{ShareDecryptor, UnsealCoordinator, UnsealReport};

/// What to bootstrap.
#[derive(Debug, Default)]
pub struct BootstrapPlan {
    /// Share recipients. The first one also receives the root credential.
    pub identities: Vec<RecipientIdentity>,
    pub threshold: Option<u8>,
    /// Secure the transport before initializing.
    pub secure: Option<SecureMaterial>,
    /// Keypairs to unseal with right away (single-operator and demo path).
    pub unseal_with: Vec<Arc<IdentityKeypair>>,
    /// `(name, document)` pairs applied once the cluster is unsealed.
    pub policies: Vec<(String, String)>,
}

/// Outcome of a completed bootstrap.
#[derive(Debug)]
pub struct BootstrapSummary {
    /// Peers visible when quorum was declared.
    pub peers: usize,
    pub rollout: Option<RolloutReport>,
    pub share_count: usize,
    pub threshold: u8,
    /// The run finished a distribution staged by an earlier run.
    pub resumed: bool,
    pub distribution: DistributionReport,
    /// Shown once to the bootstrap operator. On a resumed run it is only
    /// known if the plan carries the bootstrap operator's keypair.
    pub root_credential: Option<RootCredential>,
    /// Last unseal report, if the plan carried keypairs.
    pub unseal: Option<UnsealReport>,
    pub policies_applied: Vec<String>,
    /// Policies not applied because the cluster is still sealed or the root
    /// credential is unknown.
    pub policies_pending: Vec<String>,
}

/// Collaborators the sequencer drives.
pub struct BootstrapSequencer {
    config: Arc<ClusterConfig>,
    channel: Arc<dyn NodeChannel>,
    consensus: Arc<dyn ConsensusBackend>,
    engines: Vec<Arc<dyn SecretEngine>>,
    artifacts: Arc<dyn StorageBackend>,
    staging_dir: PathBuf,
}

impl BootstrapSequencer {
    /// `engines[i]` belongs to node `i + 1`; `artifacts` receives the share files.
    #[must_use]
    pub fn new(
        config: Arc<ClusterConfig>,
        channel: Arc<dyn NodeChannel>,
        consensus: Arc<dyn ConsensusBackend>,
        engines: Vec<Arc<dyn SecretEngine>>,
        artifacts: Arc<dyn StorageBackend>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            channel,
            consensus,
            engines,
            artifacts,
            staging_dir: staging_dir.into(),
        }
    }

    /// Run every step of `plan` in order.
    ///
    /// # Errors
    ///
    /// The [`BootstrapError`] of the first failing step. Steps that finished
    /// before it stay done.
    pub async fn run(
        &self,
        plan: BootstrapPlan,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<BootstrapSummary, BootstrapError> {
        check_cancelled(&shutdown, "launch")?;
        for node in self.config.nodes() {
            self.channel
                .launch(node)
                .await
                .map_err(|source| BootstrapError::Launch {
                    ordinal: node.ordinal,
                    source,
                })?;
        }
        info!(nodes = self.config.node_count(), "nodes launched");

        let peers = self.wait_for_quorum(&mut shutdown).await?;

        let rollout = match &plan.secure {
            Some(material) => {
                check_cancelled(&shutdown, "secure rollout")?;
                let manager = SecureRolloutManager::new(
                    Arc::clone(&self.config),
                    Arc::clone(&self.channel),
                    Arc::clone(&self.consensus),
                    self.staging_dir.clone(),
                );
                Some(manager.secure(material).await?)
            }
            None => None,
        };

        check_cancelled(&shutdown, "initialize")?;
        let engine = self.engines.first().ok_or_else(|| {
            SplitError::Engine(EngineError::Unavailable {
                reason: "no engine configured".to_owned(),
            })
        })?;
        let distributor = KeyDistributor::new(Arc::clone(&self.artifacts));
        let (pending, fresh_credential) = match distributor.pending().await? {
            Some(pending) => {
                info!(
                    shares = pending.shares.len(),
                    "finishing distribution staged by an earlier run"
                );
                (pending, None)
            }
            None => {
                let splitter =
                    ThresholdSplitter::new(Arc::clone(engine), Arc::clone(&self.consensus));
                let secret = splitter.initialize(&plan.identities, plan.threshold).await?;
                let pending = distributor.stage(&plan.identities, &secret).await?;
                (pending, Some(secret.root_credential().clone()))
            }
        };
        let resumed = fresh_credential.is_none();
        let share_count = pending.shares.len();
        let threshold = pending.threshold;
        let distribution = distributor.finish(&plan.identities, &pending).await?;

        let root_credential = match fresh_credential {
            Some(credential) => Some(credential),
            None => self.recover_root_credential(&plan, &distributor).await?,
        };

        let unseal = self.unseal(&plan, &distributor, &shutdown).await?;
        let unsealed = unseal.as_ref().is_some_and(|r| r.complete);

        let mut policies_applied = Vec::new();
        let mut policies_pending = Vec::new();
        for (name, document) in &plan.policies {
            let Some(credential) = root_credential.as_ref().filter(|_| unsealed) else {
                policies_pending.push(name.clone());
                continue;
            };
            engine
                .write_policy(credential, name, document)
                .await
                .map_err(|source| BootstrapError::Policy {
                    name: name.clone(),
                    source,
                })?;
            info!(policy = %name, "initial policy applied");
            policies_applied.push(name.clone());
        }
        if !policies_pending.is_empty() {
            warn!(pending = policies_pending.len(), unsealed, "policies not applied");
        }

        info!(share_count, threshold, resumed, unsealed, "bootstrap complete");
        Ok(BootstrapSummary {
            peers,
            rollout,
            share_count,
            threshold,
            resumed,
            distribution,
            root_credential,
            unseal,
            policies_applied,
            policies_pending,
        })
    }

    /// Open the stored root credential with the bootstrap operator's
    /// keypair, if the plan carries it.
    async fn recover_root_credential(
        &self,
        plan: &BootstrapPlan,
        distributor: &KeyDistributor,
    ) -> Result<Option<RootCredential>, BootstrapError> {
        let Some(bootstrap) = plan.identities.first() else {
            return Ok(None);
        };
        let fingerprint = bootstrap.fingerprint();
        let Some(keypair) = plan
            .unseal_with
            .iter()
            .find(|k| k.identity().fingerprint() == fingerprint)
        else {
            debug!("bootstrap keypair not supplied, root credential stays sealed");
            return Ok(None);
        };
        Ok(distributor.open_root_credential(keypair).await?)
    }

    async fn unseal(
        &self,
        plan: &BootstrapPlan,
        distributor: &KeyDistributor,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Option<UnsealReport>, BootstrapError> {
        if plan.unseal_with.is_empty() {
            return Ok(None);
        }
        let coordinator =
            UnsealCoordinator::new(Arc::clone(&self.config), self.engines.clone())?;

        let mut last = None;
        for keypair in &plan.unseal_with {
            check_cancelled(shutdown, "unseal")?;
            let identity = keypair.identity();
            let artifact = distributor.read_artifact(&identity).await?.ok_or_else(|| {
                BootstrapError::ArtifactMissing {
                    recipient: identity.to_string(),
                }
            })?;
            let report = coordinator
                .unseal(&artifact, Arc::clone(keypair) as Arc<dyn ShareDecryptor>)
                .await?;
            let complete = report.complete;
            last = Some(report);
            if complete {
                break;
            }
        }
        Ok(last)
    }

    /// Poll the consensus store until one node sees N-1 peers.
    ///
    /// Polls back off exponentially per the cluster's
    /// [`QuorumPolicy`](crate::cluster::QuorumPolicy).
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::QuorumTimeout`] once the policy's timeout passes.
    /// - [`BootstrapError::Cancelled`] if `shutdown` flips to `true`.
    pub async fn wait_for_quorum(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<usize, BootstrapError> {
        let policy = self.config.quorum_policy();
        let required = self.config.required_peers();
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut peers = 0;

        loop {
            check_cancelled(shutdown, "quorum wait")?;
            match self.consensus.status().await {
                Ok(status) if status.peers >= required => {
                    info!(peers = status.peers, leader = ?status.leader, "quorum formed");
                    return Ok(status.peers);
                }
                Ok(status) => {
                    peers = status.peers;
                    debug!(peers, required, attempt, "waiting for quorum");
                }
                Err(e) => debug!(error = %e, attempt, "consensus status unavailable"),
            }

            let elapsed = started.elapsed();
            if elapsed >= policy.timeout {
                warn!(peers, required, "quorum wait timed out");
                return Err(BootstrapError::QuorumTimeout {
                    waited_secs: elapsed.as_secs(),
                    peers,
                    required,
                });
            }
            let delay = policy.delay_for(attempt).min(policy.timeout - elapsed);
            attempt = attempt.saturating_add(1);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can cancel any more.
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for BootstrapSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapSequencer")
            .field("nodes", &self.config.node_count())
            .field("staging_dir", &self.staging_dir)
            .finish_non_exhaustive()
    }
}

fn check_cancelled(
    shutdown: &watch::Receiver<bool>,
    stage: &'static str,
) -> Result<(), BootstrapError> {
    if *shutdown.borrow() {
        info!(stage, "bootstrap cancelled");
        return Err(BootstrapError::Cancelled { stage });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use quorum_storage::MemoryBackend;

    use super::*;
    use crate::cluster::QuorumPolicy;
    use crate::local::LocalCluster;

    fn fast_config(timeout_ms: u64) -> Arc<ClusterConfig> {
        Arc::new(
            ClusterConfig::uniform("vault", 3, 8200)
                .unwrap()
                .with_quorum_policy(QuorumPolicy {
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(4),
                    timeout: Duration::from_millis(timeout_ms),
                })
                .unwrap(),
        )
    }

    fn sequencer(config: &Arc<ClusterConfig>, cluster: &Arc<LocalCluster>) -> BootstrapSequencer {
        BootstrapSequencer::new(
            Arc::clone(config),
            Arc::clone(cluster) as Arc<dyn NodeChannel>,
            Arc::clone(cluster) as Arc<dyn ConsensusBackend>,
            cluster.engines(),
            Arc::new(MemoryBackend::new()),
            std::env::temp_dir().join("quorum-bootstrap-unit"),
        )
    }

    #[tokio::test]
    async fn quorum_wait_times_out_with_missing_peer() {
        let config = fast_config(30);
        let cluster = Arc::new(LocalCluster::new(&config));
        cluster.launch(&config.nodes()[0]).await.unwrap();
        cluster.launch(&config.nodes()[1]).await.unwrap();

        let (_tx, mut rx) = watch::channel(false);
        let err = sequencer(&config, &cluster)
            .wait_for_quorum(&mut rx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::QuorumTimeout { peers: 1, required: 2, .. }
        ));
    }

    #[tokio::test]
    async fn quorum_wait_can_be_cancelled() {
        let config = fast_config(60_000);
        let cluster = Arc::new(LocalCluster::new(&config));
        let seq = sequencer(&config, &cluster);

        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { seq.wait_for_quorum(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, BootstrapError::Cancelled { stage: "quorum wait" }));
    }

    #[tokio::test]
    async fn quorum_is_reported_once_all_peers_are_up() {
        let config = fast_config(1_000);
        let cluster = Arc::new(LocalCluster::new(&config));
        cluster.launch_all().await;
        let (_tx, mut rx) = watch::channel(false);
        let peers = sequencer(&config, &cluster)
            .wait_for_quorum(&mut rx)
            .await
            .unwrap();
        assert_eq!(peers, 2);
    }

    #[tokio::test]
    async fn launch_failure_names_the_node() {
        let config = fast_config(1_000);
        let cluster = Arc::new(LocalCluster::new(&config));
        cluster.fail_launch_of(2).await;
        let (_tx, rx) = watch::channel(false);
        let plan = BootstrapPlan {
            identities: vec![IdentityKeypair::generate("solo").unwrap().identity()],
            ..BootstrapPlan::default()
        };
        let err = sequencer(&config, &cluster).run(plan, rx).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Launch { ordinal: 2, .. }));
    }
}
