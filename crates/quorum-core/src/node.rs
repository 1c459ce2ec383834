//! One in-process vault node.
//!
//! Every node of a [`LocalCluster`](crate::local::LocalCluster) owns its own
//! barrier, seal manager and policy store over the cluster's shared storage.
//! Initializing through any node initializes the cluster; each node must
//! then be unsealed on its own.

use std::sync::Arc;

use quorum_storage::StorageBackend;
use tracing::debug;

use crate::backend::{InitOutput, InitRequest, RootCredential, SealStatus, SecretEngine, ShareValue};
use crate::barrier::Barrier;
use crate::cluster::NodeSpec;
use crate::error::{BarrierError, EngineError, PolicyError, SealError};
use crate::policy::{Policy, PolicyStore};
use crate::seal::SealManager;

/// A vault node running inside this process.
#[derive(Debug)]
pub struct LocalVaultNode {
    spec: NodeSpec,
    seal: SealManager,
    policies: PolicyStore,
}

impl LocalVaultNode {
    #[must_use]
    pub fn new(spec: NodeSpec, storage: Arc<dyn StorageBackend>) -> Self {
        let barrier = Arc::new(Barrier::new(storage));
        Self {
            spec,
            seal: SealManager::new(Arc::clone(&barrier)),
            policies: PolicyStore::new(barrier),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    /// Simulate a process restart: the node comes back sealed.
    pub async fn restart(&self) {
        self.seal.reset().await;
        debug!(ordinal = self.spec.ordinal, "local node restarted");
    }

    /// Read a stored policy. Needs an unsealed node.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Sealed`] or [`EngineError::InvalidRequest`] for an unknown name.
    pub async fn read_policy(&self, name: &str) -> Result<Policy, EngineError> {
        self.policies.get(name).await.map_err(policy_error)
    }
}

#[async_trait::async_trait]
impl SecretEngine for LocalVaultNode {
    async fn initialize(&self, request: &InitRequest) -> Result<InitOutput, EngineError> {
        self.seal
            .init(&request.recipients, request.threshold)
            .await
            .map_err(seal_error)
    }

    async fn seal_status(&self) -> Result<SealStatus, EngineError> {
        self.seal.status().await.map_err(seal_error)
    }

    async fn unseal(&self, share: &ShareValue) -> Result<SealStatus, EngineError> {
        self.seal
            .submit_unseal_share(share.as_bytes())
            .await
            .map_err(seal_error)
    }

    async fn write_policy(
        &self,
        credential: &RootCredential,
        name: &str,
        document: &str,
    ) -> Result<(), EngineError> {
        if !self.seal.verify_root_credential(credential).await.map_err(seal_error)? {
            return Err(EngineError::PermissionDenied);
        }
        let policy = Policy::parse(name, document).map_err(policy_error)?;
        self.policies.put(&policy).await.map_err(policy_error)
    }
}

fn seal_error(err: SealError) -> EngineError {
    match err {
        SealError::AlreadyInitialized => EngineError::AlreadyInitialized,
        SealError::NotInitialized => EngineError::NotInitialized,
        SealError::InvalidConfig { reason } => EngineError::InvalidRequest { reason },
        SealError::InvalidShare { reason }
        | SealError::RecoveryFailed { reason }
        | SealError::RootKeyDecryption { reason } => EngineError::InvalidShare { reason },
        SealError::Barrier(BarrierError::Sealed) => EngineError::Sealed,
        other => EngineError::Internal {
            reason: other.to_string(),
        },
    }
}

fn policy_error(err: PolicyError) -> EngineError {
    match err {
        PolicyError::Invalid { .. }
        | PolicyError::BuiltIn { .. }
        | PolicyError::NotFound { .. } => EngineError::InvalidRequest {
            reason: err.to_string(),
        },
        PolicyError::Barrier(BarrierError::Sealed) => EngineError::Sealed,
        PolicyError::Barrier(other) => EngineError::Internal {
            reason: other.to_string(),
        },
    }
}
