//! Error types for `quorum-core`.
//!
//! One enum per subsystem. Variants carry the node ordinal, recipient
//! fingerprint, or step at which the failure happened so the operator can
//! decide whether to re-run the step. Errors never include key material or
//! share plaintext.
//!
//! Multi-node operations that fail partway attach the partial report
//! (which nodes or recipients already completed) to the error.

use quorum_storage::StorageError;

use crate::distribution::PendingDistribution;
use crate::rollout::RolloutReport;
use crate::unseal::UnsealReport;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },
}

/// Errors from the encryption barrier of the reference engine.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The node is sealed; nothing can be read or written through the barrier.
    #[error("node is sealed")]
    Sealed,

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from recipient identities and share envelopes.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The identity label is empty, too long, or has forbidden characters.
    #[error("invalid identity label '{label}': {reason}")]
    InvalidLabel { label: String, reason: String },

    /// A public or secret key could not be decoded.
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    /// An identity file could not be parsed.
    #[error("failed to parse identity: {reason}")]
    Parse { reason: String },

    /// The envelope is shorter than its fixed header.
    #[error("share envelope too short: {actual} bytes")]
    EnvelopeTooShort { actual: usize },

    /// The envelope was produced by an unknown format version.
    #[error("unsupported share envelope version {version}")]
    UnsupportedEnvelope { version: u8 },

    /// The envelope header names an unknown purpose or carries a bad key.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    /// The envelope opened, but holds something other than what was asked for.
    #[error("envelope holds {actual}, expected {expected}")]
    WrongPurpose {
        expected: &'static str,
        actual: String,
    },

    /// The envelope could not be opened with this identity's secret key.
    #[error("decryption failed for identity {fingerprint}")]
    DecryptionFailed { fingerprint: String },

    /// HPKE refused to seal to this recipient.
    #[error("sealing to recipient failed: {reason}")]
    Seal { reason: String },
}

/// Errors from the reference engine's seal manager.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// The vault has already been initialized.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// The vault has not been initialized yet.
    #[error("vault is not initialized")]
    NotInitialized,

    /// Invalid share count / threshold parameters.
    #[error("invalid seal config: {reason}")]
    InvalidConfig { reason: String },

    /// A submitted unseal share was malformed.
    #[error("invalid unseal share: {reason}")]
    InvalidShare { reason: String },

    /// Shamir recovery failed.
    #[error("share recovery failed: {reason}")]
    RecoveryFailed { reason: String },

    /// The reconstructed unseal key did not decrypt the root key.
    #[error("root key decryption failed: {reason}")]
    RootKeyDecryption { reason: String },

    /// Sealing a share to its recipient failed.
    #[error("seal identity error: {0}")]
    Identity(#[from] IdentityError),

    /// A cryptographic operation failed.
    #[error("seal crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The barrier returned an error during raw storage access.
    #[error("seal barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from policy operations in the reference engine.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The policy document is invalid.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// Built-in policies cannot be overwritten.
    #[error("cannot modify built-in policy: {name}")]
    BuiltIn { name: String },

    /// The requested policy does not exist.
    #[error("policy not found: {name}")]
    NotFound { name: String },

    /// The barrier returned an error.
    #[error("policy barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors building a [`ClusterConfig`](crate::cluster::ClusterConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The topology has no nodes.
    #[error("cluster must have at least one node")]
    NoNodes,

    /// More nodes than ordinals can address.
    #[error("cluster has {count} nodes, at most 255 are supported")]
    TooManyNodes { count: usize },

    /// Node ordinals must run 1..=N in order.
    #[error("expected node ordinal {expected}, got {actual}")]
    NodeOrdinal { expected: u8, actual: u8 },

    /// Two nodes share a name.
    #[error("duplicate node name '{name}'")]
    DuplicateNode { name: String },

    /// A node entry is malformed.
    #[error("invalid node {ordinal}: {reason}")]
    InvalidNode { ordinal: u8, reason: String },

    /// The quorum polling policy is inconsistent.
    #[error("invalid quorum policy: {reason}")]
    InvalidQuorumPolicy { reason: String },
}

/// Errors reported by a node's secret-storage engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Initialization already happened on this cluster.
    #[error("engine is already initialized")]
    AlreadyInitialized,

    /// The engine has not been initialized.
    #[error("engine is not initialized")]
    NotInitialized,

    /// The operation requires an unsealed node.
    #[error("engine is sealed")]
    Sealed,

    /// The request was rejected as malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The submitted share was rejected.
    #[error("invalid share: {reason}")]
    InvalidShare { reason: String },

    /// The supplied root credential was not accepted.
    #[error("permission denied")]
    PermissionDenied,

    /// The node could not be reached.
    #[error("engine unavailable: {reason}")]
    Unavailable { reason: String },

    /// Any other engine-side failure.
    #[error("engine internal error: {reason}")]
    Internal { reason: String },
}

/// Errors from the consensus/storage backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("consensus backend unavailable: {reason}")]
    Unavailable { reason: String },

    /// The backend answered with something unexpected.
    #[error("invalid consensus backend response: {reason}")]
    InvalidResponse { reason: String },

    /// A lock operation failed.
    #[error("lock '{name}' failed: {reason}")]
    Lock { name: String, reason: String },

    /// The underlying key-value store failed.
    #[error("consensus storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the artifact delivery channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Starting the node failed.
    #[error("failed to launch node '{node}': {reason}")]
    LaunchFailed { node: String, reason: String },

    /// Copying an artifact onto the node failed.
    #[error("failed to deliver '{remote_path}' to node '{node}': {reason}")]
    DeliveryFailed {
        node: String,
        remote_path: String,
        reason: String,
    },

    /// Restarting the node failed.
    #[error("failed to restart node '{node}': {reason}")]
    RestartFailed { node: String, reason: String },

    /// The node could not produce a gossip key.
    #[error("node '{node}' failed to generate a gossip key: {reason}")]
    KeygenFailed { node: String, reason: String },
}

/// Errors from the threshold share splitter.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// No recipient identities were supplied.
    #[error("at least one recipient identity is required")]
    NoIdentities,

    /// More recipients than the share format supports.
    #[error("{count} recipient identities supplied, at most 255 are supported")]
    TooManyIdentities { count: usize },

    /// The same identity appears twice.
    #[error("identity {fingerprint} was supplied more than once")]
    DuplicateIdentity { fingerprint: String },

    /// Threshold outside the allowed range for this share count.
    #[error("invalid threshold {threshold} for {shares} shares: {reason}")]
    InvalidThreshold {
        threshold: u8,
        shares: usize,
        reason: String,
    },

    /// The cluster was initialized before; nothing was regenerated.
    #[error("cluster is already initialized")]
    AlreadyInitialized,

    /// Another operator holds the init lock.
    #[error("another initialization is in progress")]
    InitInProgress,

    /// The engine failed during initialization.
    #[error("initialize failed: {0}")]
    Engine(EngineError),

    /// The consensus backend failed while locking.
    #[error("initialize lock failed: {0}")]
    Backend(#[from] BackendError),
}

/// Errors from the key distribution manager.
#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    /// The number of shares does not match the number of identities.
    #[error("expected {expected} shares, got {actual}")]
    ShareCountMismatch { expected: usize, actual: usize },

    /// A share is not bound to the identity at its position.
    #[error("share at position {position} is for {actual}, expected {expected}")]
    IdentityMismatch {
        position: usize,
        expected: String,
        actual: String,
    },

    /// A different artifact already exists for this recipient.
    #[error("artifact '{key}' for {recipient} already exists with different content")]
    ArtifactConflict { recipient: String, key: String },

    /// Writing an artifact failed; `completed` lists recipients already done.
    #[error("failed to write artifact '{key}' for {recipient} ({} already completed): {source}", completed.len())]
    Write {
        recipient: String,
        key: String,
        completed: Vec<String>,
        source: StorageError,
    },

    /// Reading an existing artifact failed.
    #[error("failed to read artifact '{key}': {source}")]
    Read {
        key: String,
        source: StorageError,
    },

    /// Storing the staged distribution record failed. The record is
    /// returned so it can be kept somewhere else.
    #[error("failed to stage distribution: {source}")]
    Stage {
        pending: Box<PendingDistribution>,
        source: StorageError,
    },

    /// The staged distribution record could not be encoded or decoded.
    #[error("invalid staged distribution record: {reason}")]
    Record { reason: String },

    /// Sealing or opening an envelope failed.
    #[error("distribution identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Errors from the unseal coordinator.
#[derive(Debug, thiserror::Error)]
pub enum UnsealError {
    /// The share artifact could not be decoded.
    #[error("invalid share artifact: {reason}")]
    InvalidArtifact { reason: String },

    /// The operator's key did not open the artifact.
    #[error("share decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// Decryption did not finish within the configured timeout.
    #[error("share decryption timed out after {secs}s")]
    DecryptionTimedOut { secs: u64 },

    /// The coordinator was given a different number of engines than nodes.
    #[error("cluster has {expected} nodes but {actual} engines were supplied")]
    TopologyMismatch { expected: usize, actual: usize },

    /// Applying the share to a node failed; earlier nodes are in `report`.
    #[error("unseal failed on node {ordinal}: {source}")]
    Node {
        ordinal: u8,
        source: EngineError,
        report: Box<UnsealReport>,
    },
}

/// Errors from the secure rollout manager.
#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    /// Required TLS material was not supplied.
    #[error("missing secure material: {what}")]
    MissingMaterial { what: &'static str },

    /// Supplied material is malformed.
    #[error("invalid {what}: {reason}")]
    InvalidMaterial { what: &'static str, reason: String },

    /// No node could generate a gossip key.
    #[error("gossip key generation failed on every node: {reason}")]
    GossipKeygen { reason: String },

    /// Another operator holds the rollout lock.
    #[error("another secure rollout is in progress")]
    RolloutInProgress,

    /// Writing the local staging copy of the bundle failed.
    #[error("failed to stage '{path}': {reason}")]
    Staging { path: String, reason: String },

    /// Delivery to a node failed; earlier nodes are in `report`.
    #[error("delivery to node {ordinal} failed: {source}")]
    Delivery {
        ordinal: u8,
        source: ChannelError,
        report: Box<RolloutReport>,
    },

    /// Restarting a node failed; earlier nodes are in `report`.
    #[error("restart of node {ordinal} failed: {source}")]
    Restart {
        ordinal: u8,
        source: ChannelError,
        report: Box<RolloutReport>,
    },

    /// A rollout ledger record could not be encoded or decoded.
    #[error("rollout ledger error: {reason}")]
    Ledger { reason: String },

    /// The consensus backend failed.
    #[error("rollout backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Errors from demo TLS material generation.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Certificate or key generation failed.
    #[error("certificate generation failed: {reason}")]
    Generation { reason: String },
}

/// Errors from the bootstrap sequencer.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// A node instance could not be launched.
    #[error("launch of node {ordinal} failed: {source}")]
    Launch { ordinal: u8, source: ChannelError },

    /// Quorum did not form before the deadline.
    #[error("quorum not formed after {waited_secs}s: {peers} of {required} peers visible")]
    QuorumTimeout {
        waited_secs: u64,
        peers: usize,
        required: usize,
    },

    /// The operator interrupted the sequence.
    #[error("bootstrap cancelled during {stage}")]
    Cancelled { stage: &'static str },

    /// The secure rollout step failed.
    #[error("secure rollout step failed: {0}")]
    Rollout(#[from] RolloutError),

    /// The initialize step failed.
    #[error("initialize step failed: {0}")]
    Split(#[from] SplitError),

    /// The distribution step failed.
    #[error("distribution step failed: {0}")]
    Distribution(#[from] DistributionError),

    /// The unseal step failed.
    #[error("unseal step failed: {0}")]
    Unseal(#[from] UnsealError),

    /// No artifact was distributed to an identity asked to unseal.
    #[error("no share artifact was distributed to {recipient}")]
    ArtifactMissing { recipient: String },

    /// Applying a policy failed.
    #[error("policy '{name}' failed: {source}")]
    Policy { name: String, source: EngineError },
}
