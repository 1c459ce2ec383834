//! Key distribution manager.
//!
//! Turns the splitter's output into one artifact per recipient. Each share
//! carries its position and the fingerprint it was sealed to; both are
//! checked against the identity list before anything is written, so a
//! reordered or truncated engine response is refused outright.
//!
//! Before the first artifact is written, every sealed share and the sealed
//! root credential are staged together in one [`PendingDistribution`]
//! record. Initialize cannot be repeated, so the record is what lets an
//! interrupted distribution be finished by a later run. It is removed once
//! every artifact is in place.
//!
//! Artifacts are write-once. Re-running with the same inputs skips every
//! artifact that is already in place.

use std::fmt;
use std::sync::Arc;

use quorum_storage::{StorageBackend, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{EncryptedShare, RootCredential};
use crate::error::DistributionError;
use crate::identity::{EnvelopePurpose, IdentityKeypair, RecipientIdentity};
use crate::splitter::ThresholdSecret;

/// Prefix for per-recipient share artifacts.
pub const ARTIFACT_PREFIX: &str = "unseal-keys/";

/// Key of the sealed root credential.
pub const ROOT_CREDENTIAL_KEY: &str = "root-credential.sealed";

/// Key of the staged distribution record.
pub const PENDING_KEY: &str = "pending-distribution.json";

/// Artifact key for `identity`: `unseal-keys/<label>-<fp16>.share`.
#[must_use]
pub fn artifact_key(identity: &RecipientIdentity) -> String {
    let fingerprint = identity.fingerprint();
    format!(
        "{ARTIFACT_PREFIX}{}-{}.share",
        identity.label(),
        &fingerprint[..16]
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOutcome {
    Written,
    /// Identical content was already stored; nothing was rewritten.
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedArtifact {
    pub recipient: String,
    pub fingerprint: String,
    pub key: String,
    pub outcome: ArtifactOutcome,
}

/// What one distribution did, in recipient order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionReport {
    pub artifacts: Vec<DistributedArtifact>,
    /// Set by [`KeyDistributor::finish`].
    pub root_credential: Option<ArtifactOutcome>,
}

impl DistributionReport {
    /// Artifacts written by this call.
    #[must_use]
    pub fn written(&self) -> usize {
        self.artifacts
            .iter()
            .filter(|a| a.outcome == ArtifactOutcome::Written)
            .count()
    }
}

/// Everything a distribution writes, staged before the first artifact.
///
/// Shares and the root credential are sealed to their recipients, so the
/// record needs no more protection than the artifacts themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDistribution {
    pub threshold: u8,
    pub shares: Vec<EncryptedShare>,
    /// Hex envelope of the root credential, sealed to the first recipient.
    pub root_credential: String,
}

impl PendingDistribution {
    /// Encode for the artifact store, or for an operator to save by hand.
    ///
    /// # Errors
    ///
    /// Returns [`DistributionError::Record`] if serialization fails.
    pub fn to_json(&self) -> Result<String, DistributionError> {
        serde_json::to_string_pretty(self).map_err(|e| DistributionError::Record {
            reason: e.to_string(),
        })
    }

    /// Decode a record produced by [`PendingDistribution::to_json`].
    ///
    /// # Errors
    ///
    /// Returns [`DistributionError::Record`] for malformed input.
    pub fn from_json(json: &[u8]) -> Result<Self, DistributionError> {
        serde_json::from_slice(json).map_err(|e| DistributionError::Record {
            reason: e.to_string(),
        })
    }
}

/// Writes share artifacts into an artifact store.
pub struct KeyDistributor {
    artifacts: Arc<dyn StorageBackend>,
}

impl KeyDistributor {
    #[must_use]
    pub fn new(artifacts: Arc<dyn StorageBackend>) -> Self {
        Self { artifacts }
    }

    /// Seal the root credential to `identities[0]` and stage the whole
    /// distribution of `secret` under [`PENDING_KEY`].
    ///
    /// # Errors
    ///
    /// - [`DistributionError::ShareCountMismatch`] if `identities` is empty.
    /// - [`DistributionError::Identity`] if sealing the credential fails.
    /// - [`DistributionError::Stage`] if the record cannot be stored. The
    ///   error carries the record so the caller can keep it elsewhere.
    pub async fn stage(
        &self,
        identities: &[RecipientIdentity],
        secret: &ThresholdSecret,
    ) -> Result<PendingDistribution, DistributionError> {
        let bootstrap = identities
            .first()
            .ok_or(DistributionError::ShareCountMismatch {
                expected: secret.shares().len(),
                actual: 0,
            })?;
        let sealed = bootstrap.seal(
            EnvelopePurpose::RootCredential,
            secret.root_credential().expose().as_bytes(),
        )?;
        let pending = PendingDistribution {
            threshold: secret.threshold(),
            shares: secret.shares().to_vec(),
            root_credential: hex::encode(sealed),
        };

        let json = pending.to_json()?;
        if let Err(source) = self.artifacts.put(PENDING_KEY, json.as_bytes()).await {
            return Err(DistributionError::Stage {
                pending: Box::new(pending),
                source,
            });
        }
        info!(shares = pending.shares.len(), "distribution staged");
        Ok(pending)
    }

    /// The staged distribution left by an earlier run, if any.
    ///
    /// # Errors
    ///
    /// [`DistributionError::Read`] or [`DistributionError::Record`].
    pub async fn pending(&self) -> Result<Option<PendingDistribution>, DistributionError> {
        let stored = self
            .artifacts
            .get(PENDING_KEY)
            .await
            .map_err(|source| DistributionError::Read {
                key: PENDING_KEY.to_owned(),
                source,
            })?;
        stored.map(|bytes| PendingDistribution::from_json(&bytes)).transpose()
    }

    /// Write every staged artifact and the sealed root credential, then drop
    /// the staged record.
    ///
    /// # Errors
    ///
    /// As [`KeyDistributor::distribute`]. The staged record is kept on
    /// failure, so calling `finish` again picks up where this call stopped.
    pub async fn finish(
        &self,
        identities: &[RecipientIdentity],
        pending: &PendingDistribution,
    ) -> Result<DistributionReport, DistributionError> {
        let mut report = self.distribute(identities, pending.shares.clone()).await?;
        let bootstrap = identities
            .first()
            .ok_or(DistributionError::ShareCountMismatch {
                expected: pending.shares.len(),
                actual: 0,
            })?;
        report.root_credential = Some(
            self.store_root_credential(bootstrap, &pending.root_credential)
                .await?,
        );

        if let Err(e) = self.artifacts.delete(PENDING_KEY).await {
            warn!(error = %e, key = PENDING_KEY, "staged distribution record not removed");
        } else {
            debug!("staged distribution record removed");
        }
        Ok(report)
    }

    /// Write share `i` to the artifact of `identities[i]`.
    ///
    /// # Errors
    ///
    /// - [`DistributionError::ShareCountMismatch`] / [`DistributionError::IdentityMismatch`]
    ///   if the shares do not line up with the identities. Nothing is written.
    /// - [`DistributionError::ArtifactConflict`] if a recipient already has a
    ///   different artifact. Nothing is written.
    /// - [`DistributionError::Write`] if a write fails; `completed` lists the
    ///   recipients whose artifacts are in place.
    pub async fn distribute(
        &self,
        identities: &[RecipientIdentity],
        shares: Vec<EncryptedShare>,
    ) -> Result<DistributionReport, DistributionError> {
        if shares.len() != identities.len() {
            return Err(DistributionError::ShareCountMismatch {
                expected: identities.len(),
                actual: shares.len(),
            });
        }
        for (position, (share, identity)) in shares.iter().zip(identities).enumerate() {
            let fingerprint = identity.fingerprint();
            if usize::from(share.index) != position + 1 || share.recipient != fingerprint {
                return Err(DistributionError::IdentityMismatch {
                    position: position + 1,
                    expected: fingerprint,
                    actual: share.recipient.clone(),
                });
            }
        }

        // Plan every artifact before the first write.
        let mut plan = Vec::with_capacity(shares.len());
        for (share, identity) in shares.into_iter().zip(identities) {
            let key = artifact_key(identity);
            let content = share.to_artifact().into_bytes();
            let existing = self
                .artifacts
                .get(&key)
                .await
                .map_err(|source| DistributionError::Read {
                    key: key.clone(),
                    source,
                })?;
            let outcome = match existing {
                None => ArtifactOutcome::Written,
                Some(stored) if stored == content => ArtifactOutcome::AlreadyPresent,
                Some(_) => {
                    return Err(DistributionError::ArtifactConflict {
                        recipient: identity.to_string(),
                        key,
                    });
                }
            };
            plan.push((identity, key, content, outcome));
        }

        let mut report = DistributionReport::default();
        for (identity, key, content, outcome) in plan {
            if outcome == ArtifactOutcome::Written {
                self.artifacts
                    .put(&key, &content)
                    .await
                    .map_err(|source| DistributionError::Write {
                        recipient: identity.to_string(),
                        key: key.clone(),
                        completed: report
                            .artifacts
                            .iter()
                            .map(|a| a.recipient.clone())
                            .collect(),
                        source,
                    })?;
                info!(recipient = %identity.label(), key = %key, "share artifact written");
            } else {
                debug!(recipient = %identity.label(), key = %key, "share artifact already present");
            }
            report.artifacts.push(DistributedArtifact {
                recipient: identity.label().to_owned(),
                fingerprint: identity.fingerprint(),
                key,
                outcome,
            });
        }

        Ok(report)
    }

    async fn store_root_credential(
        &self,
        bootstrap: &RecipientIdentity,
        sealed: &str,
    ) -> Result<ArtifactOutcome, DistributionError> {
        let key = ROOT_CREDENTIAL_KEY.to_owned();
        let existing = self
            .artifacts
            .get(&key)
            .await
            .map_err(|source| DistributionError::Read {
                key: key.clone(),
                source,
            })?;
        match existing {
            Some(stored) if stored == sealed.as_bytes() => {
                debug!("root credential already delivered");
                return Ok(ArtifactOutcome::AlreadyPresent);
            }
            Some(_) => {
                return Err(DistributionError::ArtifactConflict {
                    recipient: bootstrap.to_string(),
                    key,
                });
            }
            None => {}
        }

        self.artifacts
            .put(&key, sealed.as_bytes())
            .await
            .map_err(|source| DistributionError::Write {
                recipient: bootstrap.to_string(),
                key,
                completed: Vec::new(),
                source,
            })?;
        info!(recipient = %bootstrap.label(), "root credential sealed to bootstrap identity");
        Ok(ArtifactOutcome::Written)
    }

    /// Open the stored root credential with the bootstrap identity.
    ///
    /// # Errors
    ///
    /// [`DistributionError::Read`] if the store fails or the artifact is not
    /// hex, [`DistributionError::Identity`] if `keypair` cannot open it.
    pub async fn open_root_credential(
        &self,
        keypair: &IdentityKeypair,
    ) -> Result<Option<RootCredential>, DistributionError> {
        let unreadable = |reason: String| DistributionError::Read {
            key: ROOT_CREDENTIAL_KEY.to_owned(),
            source: StorageError::Read {
                key: ROOT_CREDENTIAL_KEY.to_owned(),
                reason,
            },
        };
        let Some(stored) = self
            .artifacts
            .get(ROOT_CREDENTIAL_KEY)
            .await
            .map_err(|source| DistributionError::Read {
                key: ROOT_CREDENTIAL_KEY.to_owned(),
                source,
            })?
        else {
            return Ok(None);
        };
        let envelope = hex::decode(stored.trim_ascii()).map_err(|e| unreadable(e.to_string()))?;
        let plain = keypair.open_root_credential(&envelope)?;
        let credential = std::str::from_utf8(&plain).map_err(|e| unreadable(e.to_string()))?;
        Ok(Some(RootCredential::new(credential)))
    }

    /// The stored artifact for `identity`, hex text, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DistributionError::Read`] if the store fails or the
    /// artifact is not UTF-8.
    pub async fn read_artifact(
        &self,
        identity: &RecipientIdentity,
    ) -> Result<Option<String>, DistributionError> {
        let key = artifact_key(identity);
        let bytes = self
            .artifacts
            .get(&key)
            .await
            .map_err(|source| DistributionError::Read {
                key: key.clone(),
                source,
            })?;
        bytes
            .map(|b| {
                String::from_utf8(b).map_err(|e| DistributionError::Read {
                    key: key.clone(),
                    source: StorageError::Read {
                        key: key.clone(),
                        reason: e.to_string(),
                    },
                })
            })
            .transpose()
    }
}

impl fmt::Debug for KeyDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDistributor").finish_non_exhaustive()
    }
}
