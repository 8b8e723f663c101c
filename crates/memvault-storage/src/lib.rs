//! Physical medium adapters for `memvault`.
//!
//! [`StorageBackend`] is the narrowest possible view of the backing medium:
//! UTF-8 keys mapped to opaque bytes. It has no notion of slices, owners,
//! tokens or encryption. `memvault-core` builds its backend from configuration
//! and hands it only to its private ledger, so code outside the vault never
//! holds a handle the vault writes through.
//!
//! Backends:
//!
//! - [`MemoryBackend`]: in-memory, for tests and ephemeral vaults
//! - [`RedbBackend`]: pure-Rust B-tree file (feature `redb-backend`, default)
//! - [`RocksDbBackend`]: LSM store via the `rocksdb` bindings (feature `rocksdb-backend`)

mod error;
mod memory;
#[cfg(feature = "redb-backend")]
mod redb_backend;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// A key-value view of the backing medium.
///
/// Keys use `/` as a namespace separator (`slices/<id>`, `sys/keyring`).
/// Values are opaque; everything the vault stores here is either sealed
/// ciphertext or metadata wrapped around sealed ciphertext.
///
/// Implementations must be safe to share across async tasks.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Fetch a value. `Ok(None)` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the medium fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the medium fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove a key. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the medium fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List keys starting with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the medium fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Check whether a key exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the medium fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
