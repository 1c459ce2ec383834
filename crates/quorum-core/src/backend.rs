//! Contracts with the external collaborators.
//!
//! The orchestration core never talks to a vault process, the consensus
//! store, or a container runtime directly. It consumes three traits:
//!
//! - [`SecretEngine`]: one per node; `initialize`, `seal_status`, `unseal`,
//!   `write_policy`.
//! - [`ConsensusBackend`]: the shared consensus/key-value store; `read`,
//!   `write`, locks, and the peer-count health signal.
//! - [`NodeChannel`]: process plumbing; launch a node, copy a file onto it,
//!   restart it, and ask it for a fresh gossip key.
//!
//! Implementations live in [`crate::local`] (in-process) and in the CLI
//! (HTTP and Docker).

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::cluster::{NodeSpec, SealState};
use crate::crypto;
use crate::error::{BackendError, ChannelError, EngineError};
use crate::identity::RecipientIdentity;

/// Parameters for the engine's one-time initialize operation.
#[derive(Debug, Clone)]
pub struct InitRequest {
    /// Share recipients, in the order shares must be returned.
    pub recipients: Vec<RecipientIdentity>,
    /// Shares required to unseal.
    pub threshold: u8,
}

/// One share sealed to one recipient, tagged with both its position and the
/// recipient's fingerprint so the binding can be verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedShare {
    /// 1-based position matching the recipient order of the request.
    pub index: u8,
    /// Fingerprint of the identity this share is sealed to.
    pub recipient: String,
    /// Envelope produced by [`RecipientIdentity::seal`].
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedShare {
    /// Hex-encoded envelope, the on-disk artifact format.
    #[must_use]
    pub fn to_artifact(&self) -> String {
        hex::encode(&self.ciphertext)
    }
}

/// The bootstrap-level credential returned once by initialize.
#[derive(Clone)]
pub struct RootCredential(Zeroizing<String>);

impl RootCredential {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// The credential in clear. Show it to the bootstrap operator only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RootCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootCredential([REDACTED])")
    }
}

/// A decrypted share value, held only for the duration of an unseal call.
#[derive(Clone)]
pub struct ShareValue(Zeroizing<Vec<u8>>);

impl ShareValue {
    #[must_use]
    pub fn new(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// SHA-256 of the share, used to recognise re-submissions.
    #[must_use]
    pub fn digest(&self) -> String {
        crypto::sha256_hex(&self.0)
    }
}

impl fmt::Debug for ShareValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShareValue([REDACTED])")
    }
}

/// Raw output of the engine's initialize operation.
#[derive(Debug)]
pub struct InitOutput {
    pub shares: Vec<EncryptedShare>,
    pub root_credential: RootCredential,
}

/// Seal status as reported by one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    /// Whether the cluster has been initialized.
    pub initialized: bool,
    /// Whether this node is sealed.
    pub sealed: bool,
    /// Shares required to unseal.
    pub threshold: u8,
    /// Total shares issued.
    pub shares: u8,
    /// Distinct shares this node holds in its current unseal attempt.
    pub progress: u8,
}

impl SealStatus {
    #[must_use]
    pub fn state(&self) -> SealState {
        if self.sealed {
            SealState::Sealed
        } else {
            SealState::Unsealed
        }
    }
}

/// Health signal from the consensus store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusStatus {
    /// Other servers visible to the node that answered.
    pub peers: usize,
    /// Current leader address, if one is elected.
    pub leader: Option<String>,
}

/// Proof of holding a consensus lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

/// A node's secret-storage engine.
#[async_trait::async_trait]
pub trait SecretEngine: Send + Sync {
    /// Generate the master secret and return one sealed share per recipient.
    ///
    /// # Errors
    ///
    /// Must return [`EngineError::AlreadyInitialized`] if the cluster has
    /// been initialized before.
    async fn initialize(&self, request: &InitRequest) -> Result<InitOutput, EngineError>;

    /// Current seal status of this node.
    async fn seal_status(&self) -> Result<SealStatus, EngineError>;

    /// Submit one decrypted share. Idempotent for an unsealed node and for a
    /// share the node already counted.
    async fn unseal(&self, share: &ShareValue) -> Result<SealStatus, EngineError>;

    /// Store an access-control policy document under `name`.
    async fn write_policy(
        &self,
        credential: &RootCredential,
        name: &str,
        document: &str,
    ) -> Result<(), EngineError>;
}

/// The consensus store shared by all nodes.
#[async_trait::async_trait]
pub trait ConsensusBackend: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), BackendError>;

    /// Try to take the named lock. `Ok(None)` means someone else holds it.
    async fn acquire_lock(&self, name: &str) -> Result<Option<LockToken>, BackendError>;

    async fn release_lock(&self, name: &str, token: &LockToken) -> Result<(), BackendError>;

    /// Peer visibility from whichever node answers.
    async fn status(&self) -> Result<ConsensusStatus, BackendError>;
}

/// Process plumbing around the nodes.
#[async_trait::async_trait]
pub trait NodeChannel: Send + Sync {
    async fn launch(&self, node: &NodeSpec) -> Result<(), ChannelError>;

    /// Copy `local` onto the node at `remote`. Re-delivering identical
    /// content must be harmless.
    async fn deliver(
        &self,
        node: &NodeSpec,
        local: &Path,
        remote: &str,
    ) -> Result<(), ChannelError>;

    async fn restart(&self, node: &NodeSpec) -> Result<(), ChannelError>;

    /// Ask a live node for a fresh base64 gossip encryption key.
    async fn generate_gossip_key(&self, node: &NodeSpec) -> Result<String, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_redacted_in_debug() {
        let cred = RootCredential::new("s.root-token");
        assert!(!format!("{cred:?}").contains("root-token"));

        let share = ShareValue::new(Zeroizing::new(vec![1, 2, 3]));
        assert_eq!(format!("{share:?}"), "ShareValue([REDACTED])");
    }

    #[test]
    fn share_digest_depends_on_content() {
        let a = ShareValue::new(Zeroizing::new(vec![1, 2, 3]));
        let b = ShareValue::new(Zeroizing::new(vec![1, 2, 4]));
        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn seal_status_maps_to_state() {
        let sealed = SealStatus {
            sealed: true,
            ..SealStatus::default()
        };
        assert_eq!(sealed.state(), SealState::Sealed);
        let unsealed = SealStatus {
            initialized: true,
            ..SealStatus::default()
        };
        assert_eq!(unsealed.state(), SealState::Unsealed);
    }

    #[test]
    fn artifact_is_hex() {
        let share = EncryptedShare {
            index: 1,
            recipient: "ab".repeat(20),
            ciphertext: vec![0xde, 0xad],
        };
        assert_eq!(share.to_artifact(), "dead");
    }
}
