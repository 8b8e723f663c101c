//! redb backend: the default persistent medium.
//!
//! Single-file, pure-Rust B-tree with ACID transactions. Every call opens its
//! own transaction on a blocking thread, so a successful `put` is durable by
//! the time it returns.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::{StorageBackend, StorageError};

const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// Storage backend over a single redb database file.
///
/// # Examples
///
/// ```no_run
/// # use memvault_storage::RedbBackend;
/// let backend = RedbBackend::open("/var/lib/memvault/vault.redb").unwrap();
/// ```
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbBackend {
    /// Open the database file, creating it and its table if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be created or is not
    /// a redb database, and [`StorageError::Transaction`] if the table cannot
    /// be initialised.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Open {
                path: path.display().to_string(),
                reason: format!("cannot create parent directory: {e}"),
            })?;
        }

        let db = Database::create(path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let txn = db.begin_write().map_err(txn_error)?;
        txn.open_table(BLOBS).map_err(txn_error)?;
        txn.commit().map_err(txn_error)?;

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
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| StorageError::Transaction {
                reason: format!("blocking task failed: {e}"),
            })?
    }
}

fn txn_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

fn list_error(prefix: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::List {
        prefix: prefix.to_owned(),
        reason: e.to_string(),
    }
}

#[async_trait::async_trait]
impl StorageBackend for RedbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_owned();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(txn_error)?;
            let table = txn.open_table(BLOBS).map_err(txn_error)?;
            let value = table.get(key.as_str()).map_err(|e| StorageError::Read {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            Ok(value.map(|v| v.value().to_vec()))
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let key = key.to_owned();
        let value = value.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(txn_error)?;
            {
                let mut table = txn.open_table(BLOBS).map_err(txn_error)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(|e| StorageError::Write {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
            }
            txn.commit().map_err(|e| StorageError::Write {
                key,
                reason: format!("commit failed: {e}"),
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_owned();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(txn_error)?;
            {
                let mut table = txn.open_table(BLOBS).map_err(txn_error)?;
                table
                    .remove(key.as_str())
                    .map_err(|e| StorageError::Delete {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
            }
            txn.commit().map_err(|e| StorageError::Delete {
                key,
                reason: format!("commit failed: {e}"),
            })
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_owned();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(txn_error)?;
            let table = txn.open_table(BLOBS).map_err(txn_error)?;
            let range = table
                .range(prefix.as_str()..)
                .map_err(|e| list_error(&prefix, e))?;

            let mut keys = Vec::new();
            for item in range {
                let (k, _) = item.map_err(|e| list_error(&prefix, e))?;
                let key = k.value();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                keys.push(key.to_owned());
            }
            Ok(keys)
        })
        .await
    }
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.redb");
        {
            let backend = RedbBackend::open(&path).unwrap();
            backend.put("slices/a", b"sealed-a").await.unwrap();
            backend.put("slices/b", b"sealed-b").await.unwrap();
            backend.delete("slices/b").await.unwrap();
        }
        let backend = RedbBackend::open(&path).unwrap();
        assert_eq!(
            backend.get("slices/a").await.unwrap(),
            Some(b"sealed-a".to_vec())
        );
        assert_eq!(backend.get("slices/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_respects_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RedbBackend::open(dir.path().join("nested/vault.redb")).unwrap();
        backend.put("slices/1", b"x").await.unwrap();
        backend.put("slices/2", b"y").await.unwrap();
        backend.put("sys/keyring", b"z").await.unwrap();
        assert_eq!(
            backend.list("slices/").await.unwrap(),
            vec!["slices/1", "slices/2"]
        );
        assert!(backend.exists("sys/keyring").await.unwrap());
    }
}
