//! Encryption barrier for the reference engine.
//!
//! Every value a [`LocalVaultNode`](crate::node::LocalVaultNode) stores
//! passes through the barrier: AES-256-GCM under the root key, which only
//! exists in memory while the node is unsealed. All nodes of a cluster share
//! one storage backend but each holds its own barrier, so a node can be
//! sealed while its peers serve requests.
//!
//! Seal metadata (the encrypted root key, share config) is written with
//! [`put_raw`](Barrier::put_raw) because it must be readable while sealed.

use std::fmt;
use std::sync::Arc;

use quorum_storage::StorageBackend;
use tokio::sync::RwLock;

use crate::crypto::{self, EncryptionKey};
use crate::error::BarrierError;

/// The encryption barrier wrapping a storage backend.
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    key: RwLock<Option<EncryptionKey>>,
}

impl Barrier {
    /// Create a sealed barrier over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            key: RwLock::new(None),
        }
    }

    /// Install the root key; reads and writes succeed from now on.
    pub async fn unseal(&self, key: EncryptionKey) {
        *self.key.write().await = Some(key);
    }

    /// Drop the root key. It is zeroized when the old value is dropped.
    pub async fn seal(&self) {
        *self.key.write().await = None;
    }

    pub async fn is_unsealed(&self) -> bool {
        self.key.read().await.is_some()
    }

    /// Read and decrypt a value.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the node is sealed.
    /// - [`BarrierError::Crypto`] if decryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        let root_key = self.root_key().await?;
        match self.storage.get(key).await? {
            None => Ok(None),
            Some(ciphertext) => Ok(Some(crypto::decrypt(&root_key, &ciphertext)?)),
        }
    }

    /// Encrypt and write a value.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the node is sealed.
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let root_key = self.root_key().await?;
        let ciphertext = crypto::encrypt(&root_key, value)?;
        self.storage.put(key, &ciphertext).await?;
        Ok(())
    }

    /// List keys under `prefix`. Paths are stored in clear; values are not.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the node is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        let _root_key = self.root_key().await?;
        Ok(self.storage.list(prefix).await?)
    }

    /// Write bytes without encryption. Only for data that is already
    /// encrypted or not sensitive, and must be readable while sealed.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the storage backend fails.
    pub async fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        self.storage.put(key, value).await?;
        Ok(())
    }

    /// Read bytes without decryption.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the storage backend fails.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        Ok(self.storage.get(key).await?)
    }

    async fn root_key(&self) -> Result<EncryptionKey, BarrierError> {
        self.key.read().await.clone().ok_or(BarrierError::Sealed)
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use quorum_storage::MemoryBackend;

    use super::*;

    fn make_barrier() -> Barrier {
        Barrier::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn sealed_barrier_rejects_reads_and_writes() {
        let barrier = make_barrier();
        assert!(matches!(barrier.get("k").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.put("k", b"v").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.list("").await, Err(BarrierError::Sealed)));
    }

    #[tokio::test]
    async fn unsealed_roundtrip_stores_ciphertext() {
        let storage = MemoryBackend::new();
        let barrier = Barrier::new(Arc::new(storage.clone()));
        barrier.unseal(EncryptionKey::generate()).await;

        barrier.put("sys/policies/ops", b"{}").await.unwrap();
        assert_eq!(
            barrier.get("sys/policies/ops").await.unwrap(),
            Some(b"{}".to_vec())
        );
        let raw = storage.get("sys/policies/ops").await.unwrap().unwrap();
        assert_ne!(raw, b"{}");
    }

    #[tokio::test]
    async fn two_barriers_over_shared_storage_seal_independently() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let first = Barrier::new(Arc::clone(&storage));
        let second = Barrier::new(storage);
        let key = EncryptionKey::generate();

        first.unseal(key.clone()).await;
        first.put("shared", b"value").await.unwrap();
        assert!(matches!(second.get("shared").await, Err(BarrierError::Sealed)));

        second.unseal(key).await;
        assert_eq!(second.get("shared").await.unwrap(), Some(b"value".to_vec()));
    }

    #[tokio::test]
    async fn wrong_key_cannot_decrypt() {
        let barrier = make_barrier();
        barrier.unseal(EncryptionKey::generate()).await;
        barrier.put("k", b"secret").await.unwrap();
        barrier.seal().await;

        barrier.unseal(EncryptionKey::generate()).await;
        assert!(matches!(barrier.get("k").await, Err(BarrierError::Crypto(_))));
    }

    #[tokio::test]
    async fn raw_access_works_while_sealed() {
        let barrier = make_barrier();
        barrier.put_raw("sys/seal/config", b"cfg").await.unwrap();
        assert_eq!(
            barrier.get_raw("sys/seal/config").await.unwrap(),
            Some(b"cfg".to_vec())
        );
        assert!(!barrier.is_unsealed().await);
    }
}
