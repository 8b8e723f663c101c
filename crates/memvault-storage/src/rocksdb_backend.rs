//! `RocksDB` backend (feature `rocksdb-backend`).
//!
//! For deployments that already ship the `RocksDB` native library. Calls are
//! dispatched to the blocking pool because the bindings are synchronous.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};

use crate::{StorageBackend, StorageError};

type Db = DBWithThreadMode<MultiThreaded>;

/// Storage backend over a `RocksDB` directory.
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    path: PathBuf,
}

impl RocksDbBackend {
    /// Open the database directory, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` refuses the path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Db::open(&opts, path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Db) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| StorageError::Transaction {
                reason: format!("blocking task failed: {e}"),
            })?
    }
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_owned();
        self.blocking(move |db| {
            db.get(key.as_bytes()).map_err(|e| StorageError::Read {
                key,
                reason: e.to_string(),
            })
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let key = key.to_owned();
        let value = value.to_vec();
        self.blocking(move |db| {
            db.put(key.as_bytes(), &value)
                .map_err(|e| StorageError::Write {
                    key,
                    reason: e.to_string(),
                })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_owned();
        self.blocking(move |db| {
            db.delete(key.as_bytes()).map_err(|e| StorageError::Delete {
                key,
                reason: e.to_string(),
            })
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_owned();
        self.blocking(move |db| {
            let mut keys = Vec::new();
            for item in db.iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward)) {
                let (k, _) = item.map_err(|e| StorageError::List {
                    prefix: prefix.clone(),
                    reason: e.to_string(),
                })?;
                let key = String::from_utf8(k.to_vec()).map_err(|e| StorageError::InvalidKey {
                    reason: e.to_string(),
                })?;
                if !key.starts_with(&prefix) {
                    break;
                }
                keys.push(key);
            }
            Ok(keys)
        })
        .await
    }
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
