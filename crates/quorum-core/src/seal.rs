//! Seal lifecycle of the reference engine.
//!
//! Initialization generates a root key and an unseal key, stores the root
//! key encrypted under the unseal key, splits the unseal key with Shamir's
//! scheme, and seals each share to one recipient identity. The server never
//! holds a plaintext share after `init` returns.
//!
//! Unsealing accumulates decrypted shares per node. A share the node has
//! already counted is ignored; at the threshold the unseal key is recovered
//! and the barrier opens. A node that restarts comes back sealed with an
//! empty accumulator.
//!
//! Storage layout (all raw, readable while sealed):
//!
//! - `sys/seal/root_key`: root key encrypted under the unseal key.
//! - `sys/seal/config`: share count and threshold.
//! - `sys/seal/root_token`: SHA-256 of the root credential.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sharks::{Share, Sharks};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{EncryptedShare, InitOutput, RootCredential, SealStatus};
use crate::barrier::Barrier;
use crate::crypto::{self, EncryptionKey};
use crate::error::SealError;
use crate::identity::{EnvelopePurpose, RecipientIdentity};

const ROOT_KEY_PATH: &str = "sys/seal/root_key";
const SEAL_CONFIG_PATH: &str = "sys/seal/config";
const ROOT_TOKEN_PATH: &str = "sys/seal/root_token";

/// Persisted seal configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SealConfig {
    pub shares: u8,
    pub threshold: u8,
}

/// Seal state of one node over the cluster's shared storage.
pub struct SealManager {
    barrier: Arc<Barrier>,
    /// Share bytes counted in the current unseal attempt.
    pending_shares: Mutex<Vec<Vec<u8>>>,
}

impl SealManager {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier,
            pending_shares: Mutex::new(Vec::new()),
        }
    }

    /// Initialize the vault, sealing share `i` to `recipients[i]`.
    ///
    /// The node stays sealed afterwards.
    ///
    /// # Errors
    ///
    /// - [`SealError::InvalidConfig`] if the recipient count or threshold is out of range.
    /// - [`SealError::AlreadyInitialized`] if a root key already exists.
    /// - [`SealError::Identity`] if sealing a share to its recipient fails.
    /// - [`SealError::Barrier`] if the storage backend fails.
    pub async fn init(
        &self,
        recipients: &[RecipientIdentity],
        threshold: u8,
    ) -> Result<InitOutput, SealError> {
        let shares = validate_config(recipients.len(), threshold)?;

        if self.is_initialized().await? {
            return Err(SealError::AlreadyInitialized);
        }

        let root_key = EncryptionKey::generate();
        let unseal_key = EncryptionKey::generate();
        let encrypted_root = crypto::encrypt(&unseal_key, root_key.as_bytes())?;

        let dealer = Sharks(threshold).dealer(unseal_key.as_bytes());
        let mut sealed_shares = Vec::with_capacity(recipients.len());
        for ((position, share), recipient) in dealer.enumerate().zip(recipients) {
            let share_bytes = zeroize::Zeroizing::new(Vec::from(&share));
            let index = u8::try_from(position + 1).map_err(|_| SealError::InvalidConfig {
                reason: format!("share position {position} exceeds 255"),
            })?;
            sealed_shares.push(EncryptedShare {
                index,
                recipient: recipient.fingerprint(),
                ciphertext: recipient.seal(EnvelopePurpose::Share { index }, &share_bytes)?,
            });
        }

        let config = SealConfig { shares, threshold };
        let config_bytes = serde_json::to_vec(&config).map_err(|e| SealError::InvalidConfig {
            reason: format!("failed to serialize seal config: {e}"),
        })?;

        let root_token = format!("q.{}", uuid::Uuid::new_v4().simple());

        // Config and token hash first: the root key marks the vault initialized.
        self.barrier.put_raw(SEAL_CONFIG_PATH, &config_bytes).await?;
        self.barrier
            .put_raw(ROOT_TOKEN_PATH, &crypto::sha256(root_token.as_bytes()))
            .await?;
        self.barrier.put_raw(ROOT_KEY_PATH, &encrypted_root).await?;

        info!(shares, threshold, "vault initialized");

        Ok(InitOutput {
            shares: sealed_shares,
            root_credential: RootCredential::new(root_token),
        })
    }

    /// Submit one decrypted share.
    ///
    /// Returns the status after the share was counted. An unsealed node
    /// returns its status unchanged, and so does a share already pending.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] if the vault hasn't been initialized.
    /// - [`SealError::InvalidShare`] if the share bytes are malformed.
    /// - [`SealError::RecoveryFailed`] if reconstruction fails.
    /// - [`SealError::RootKeyDecryption`] if the recovered key does not open the root key.
    pub async fn submit_unseal_share(&self, share: &[u8]) -> Result<SealStatus, SealError> {
        let config = self.load_config().await?;

        if self.barrier.is_unsealed().await {
            debug!("share submitted to an unsealed node, ignoring");
            return self.status().await;
        }

        Share::try_from(share).map_err(|e| SealError::InvalidShare {
            reason: format!("share deserialization failed: {e}"),
        })?;

        let mut pending = self.pending_shares.lock().await;
        if pending.iter().any(|p| p.as_slice() == share) {
            debug!("share already counted");
            return Ok(progress(config, pending.len(), true));
        }
        pending.push(share.to_vec());

        if pending.len() < usize::from(config.threshold) {
            return Ok(progress(config, pending.len(), true));
        }

        let result = self.recover(config, &pending).await;
        pending.clear();
        drop(pending);

        match result {
            Ok(root_key) => {
                self.barrier.unseal(root_key).await;
                info!("node unsealed");
                Ok(progress(config, 0, false))
            }
            Err(e) => {
                warn!(error = %e, "unseal attempt failed, progress reset");
                Err(e)
            }
        }
    }

    async fn recover(
        &self,
        config: SealConfig,
        pending: &[Vec<u8>],
    ) -> Result<EncryptionKey, SealError> {
        let parsed: Vec<Share> = pending
            .iter()
            .map(|bytes| {
                Share::try_from(bytes.as_slice()).map_err(|e| SealError::InvalidShare {
                    reason: format!("share deserialization failed: {e}"),
                })
            })
            .collect::<Result<_, _>>()?;

        let unseal_key_bytes = zeroize::Zeroizing::new(
            Sharks(config.threshold)
                .recover(&parsed)
                .map_err(|e| SealError::RecoveryFailed {
                    reason: e.to_string(),
                })?,
        );
        let unseal_key_array: [u8; 32] =
            unseal_key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| SealError::RecoveryFailed {
                    reason: "recovered key is not 32 bytes".to_owned(),
                })?;
        let unseal_key = EncryptionKey::from_bytes(unseal_key_array);

        let encrypted_root = self
            .barrier
            .get_raw(ROOT_KEY_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;
        let root_key_bytes = zeroize::Zeroizing::new(
            crypto::decrypt(&unseal_key, &encrypted_root).map_err(|e| {
                SealError::RootKeyDecryption {
                    reason: e.to_string(),
                }
            })?,
        );
        let root_key_array: [u8; 32] =
            root_key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| SealError::RootKeyDecryption {
                    reason: "decrypted root key is not 32 bytes".to_owned(),
                })?;
        Ok(EncryptionKey::from_bytes(root_key_array))
    }

    /// Drop the root key and any pending shares, as a process restart would.
    pub async fn reset(&self) {
        self.pending_shares.lock().await.clear();
        self.barrier.seal().await;
    }

    /// Whether a root key exists in storage.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if the storage backend fails.
    pub async fn is_initialized(&self) -> Result<bool, SealError> {
        Ok(self.barrier.get_raw(ROOT_KEY_PATH).await?.is_some())
    }

    /// Current seal status of this node.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if the storage backend fails.
    pub async fn status(&self) -> Result<SealStatus, SealError> {
        if !self.is_initialized().await? {
            return Ok(SealStatus {
                sealed: true,
                ..SealStatus::default()
            });
        }
        let config = self.load_config().await?;
        let sealed = !self.barrier.is_unsealed().await;
        let pending = self.pending_shares.lock().await.len();
        Ok(progress(config, if sealed { pending } else { 0 }, sealed))
    }

    /// Check `credential` against the stored root credential hash.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] if no credential was ever issued.
    /// - [`SealError::Barrier`] if the storage backend fails.
    pub async fn verify_root_credential(
        &self,
        credential: &RootCredential,
    ) -> Result<bool, SealError> {
        let stored = self
            .barrier
            .get_raw(ROOT_TOKEN_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;
        let presented = crypto::sha256(credential.expose().as_bytes());
        Ok(bool::from(presented.as_slice().ct_eq(stored.as_slice())))
    }

    async fn load_config(&self) -> Result<SealConfig, SealError> {
        let config_bytes = self
            .barrier
            .get_raw(SEAL_CONFIG_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;

        serde_json::from_slice(&config_bytes).map_err(|e| SealError::InvalidConfig {
            reason: format!("failed to deserialize seal config: {e}"),
        })
    }
}

impl std::fmt::Debug for SealManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealManager")
            .field("barrier", &self.barrier)
            .finish_non_exhaustive()
    }
}

fn progress(config: SealConfig, pending: usize, sealed: bool) -> SealStatus {
    SealStatus {
        initialized: true,
        sealed,
        threshold: config.threshold,
        shares: config.shares,
        progress: u8::try_from(pending).unwrap_or(u8::MAX),
    }
}

/// Validate the share count and threshold. Returns the share count as `u8`.
///
/// A single recipient may use threshold 1; otherwise the threshold is at
/// least 2 and never above the share count.
fn validate_config(recipient_count: usize, threshold: u8) -> Result<u8, SealError> {
    let shares = u8::try_from(recipient_count).map_err(|_| SealError::InvalidConfig {
        reason: format!("share count must be 1-255, got {recipient_count}"),
    })?;
    if shares == 0 {
        return Err(SealError::InvalidConfig {
            reason: "share count must be 1-255, got 0".to_owned(),
        });
    }
    if threshold == 0 || threshold > shares {
        return Err(SealError::InvalidConfig {
            reason: format!("threshold must be 1-{shares}, got {threshold}"),
        });
    }
    if shares > 1 && threshold < 2 {
        return Err(SealError::InvalidConfig {
            reason: format!("threshold must be at least 2 for {shares} shares"),
        });
    }
    Ok(shares)
}
