//! Threshold share splitter.
//!
//! Wraps the engine's one-time initialize operation. The splitter validates
//! recipients and threshold, takes the cluster-wide init lock, and hands back
//! what the engine produced: one sealed share per recipient plus the root
//! credential. It never sees a share in clear.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{
    ConsensusBackend, EncryptedShare, InitRequest, LockToken, RootCredential, SecretEngine,
};
use crate::error::{EngineError, SplitError};
use crate::identity::RecipientIdentity;

/// Consensus lock held for the duration of initialize.
pub const INIT_LOCK: &str = "quorum/lock/init";

/// Pick the threshold for `share_count` recipients.
///
/// Without a request the threshold is 1 for a single recipient and 2
/// otherwise. An explicit threshold must satisfy `1 <= k <= n`, and `k >= 2`
/// once there is more than one recipient.
///
/// # Errors
///
/// Returns [`SplitError::InvalidThreshold`] when the constraints fail, and
/// [`SplitError::NoIdentities`] when `share_count` is zero.
pub fn resolve_threshold(share_count: usize, requested: Option<u8>) -> Result<u8, SplitError> {
    if share_count == 0 {
        return Err(SplitError::NoIdentities);
    }
    let threshold = requested.unwrap_or(if share_count == 1 { 1 } else { 2 });
    let invalid = |reason: &str| SplitError::InvalidThreshold {
        threshold,
        shares: share_count,
        reason: reason.to_owned(),
    };

    if threshold == 0 {
        return Err(invalid("threshold must be at least 1"));
    }
    if usize::from(threshold) > share_count {
        return Err(invalid("threshold exceeds the number of shares"));
    }
    if share_count > 1 && threshold < 2 {
        return Err(invalid("a single share must not unseal a multi-operator cluster"));
    }
    Ok(threshold)
}

/// The engine's answer to initialize: the master secret as sealed shares.
pub struct ThresholdSecret {
    share_count: usize,
    threshold: u8,
    shares: Vec<EncryptedShare>,
    root_credential: RootCredential,
}

impl ThresholdSecret {
    #[cfg(test)]
    pub(crate) fn new(
        threshold: u8,
        shares: Vec<EncryptedShare>,
        root_credential: RootCredential,
    ) -> Self {
        Self {
            share_count: shares.len(),
            threshold,
            shares,
            root_credential,
        }
    }

    #[must_use]
    pub fn share_count(&self) -> usize {
        self.share_count
    }

    #[must_use]
    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Shares in the order the engine returned them.
    #[must_use]
    pub fn shares(&self) -> &[EncryptedShare] {
        &self.shares
    }

    #[must_use]
    pub fn root_credential(&self) -> &RootCredential {
        &self.root_credential
    }
}

impl fmt::Debug for ThresholdSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdSecret")
            .field("share_count", &self.share_count)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

/// Runs initialize against one node of the cluster.
pub struct ThresholdSplitter {
    engine: Arc<dyn SecretEngine>,
    consensus: Arc<dyn ConsensusBackend>,
}

impl ThresholdSplitter {
    #[must_use]
    pub fn new(engine: Arc<dyn SecretEngine>, consensus: Arc<dyn ConsensusBackend>) -> Self {
        Self { engine, consensus }
    }

    /// Initialize the cluster for `identities`.
    ///
    /// # Errors
    ///
    /// - [`SplitError::NoIdentities`], [`SplitError::TooManyIdentities`] or
    ///   [`SplitError::DuplicateIdentity`] for a bad recipient list.
    /// - [`SplitError::InvalidThreshold`] before anything touches the cluster.
    /// - [`SplitError::InitInProgress`] if another operator holds the init lock.
    /// - [`SplitError::AlreadyInitialized`] if the cluster was initialized before.
    /// - [`SplitError::Engine`] / [`SplitError::Backend`] for collaborator failures.
    pub async fn initialize(
        &self,
        identities: &[RecipientIdentity],
        threshold: Option<u8>,
    ) -> Result<ThresholdSecret, SplitError> {
        if identities.is_empty() {
            return Err(SplitError::NoIdentities);
        }
        if identities.len() > usize::from(u8::MAX) {
            return Err(SplitError::TooManyIdentities {
                count: identities.len(),
            });
        }
        let mut seen = HashSet::new();
        for identity in identities {
            let fingerprint = identity.fingerprint();
            if !seen.insert(fingerprint.clone()) {
                return Err(SplitError::DuplicateIdentity { fingerprint });
            }
        }
        let threshold = resolve_threshold(identities.len(), threshold)?;

        let token = self
            .consensus
            .acquire_lock(INIT_LOCK)
            .await?
            .ok_or(SplitError::InitInProgress)?;

        let request = InitRequest {
            recipients: identities.to_vec(),
            threshold,
        };
        let result = self.engine.initialize(&request).await;
        self.release(&token).await;

        let output = result.map_err(|e| match e {
            EngineError::AlreadyInitialized => SplitError::AlreadyInitialized,
            other => SplitError::Engine(other),
        })?;

        info!(
            shares = output.shares.len(),
            threshold, "cluster initialized"
        );

        Ok(ThresholdSecret {
            share_count: identities.len(),
            threshold,
            shares: output.shares,
            root_credential: output.root_credential,
        })
    }

    async fn release(&self, token: &LockToken) {
        if let Err(e) = self.consensus.release_lock(INIT_LOCK, token).await {
            warn!(error = %e, "failed to release init lock");
        }
    }
}

impl fmt::Debug for ThresholdSplitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdSplitter").finish_non_exhaustive()
    }
}
