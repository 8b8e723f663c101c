//! Ledger store: the only code that touches the backing medium.
//!
//! This module is private to the crate. Every slice operation takes a
//! [`Grant`], which exists only after a token validated and the policy
//! engine cleared the request, and the grant must cover the exact call.
//! Callers outside the crate cannot reach a ledger at all.
//!
//! Layout on the medium:
//!
//! - `slices/<slice_id>` JSON [`SliceRecord`] wrapping the sealed payload
//! - `tombstones/<uuid>` JSON [`Tombstone`] left by each purge
//! - `keys/<logical key>` the slice id, written before a new slice and
//!   removed after a purge
//! - `sys/keyring`, `sys/delegations` sealed system records

use std::sync::Arc;

use chrono::{DateTime, Utc};
use memvault_storage::{StorageBackend, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::crypto::sha256_hex;
use crate::error::LedgerError;
use crate::retry::RetryPolicy;
use crate::slice::{KeyPrefix, LogicalKey, ModifiedBy, SCHEMA_VERSION, SliceId, SliceKind};
use crate::token::{Grant, GrantTarget, Operation};

const SLICE_PREFIX: &str = "slices/";
const TOMBSTONE_PREFIX: &str = "tombstones/";
const INDEX_PREFIX: &str = "keys/";
pub(crate) const KEYRING_RECORD: &str = "sys/keyring";
pub(crate) const DELEGATIONS_RECORD: &str = "sys/delegations";

/// A slice as stored. The payload stays sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SliceRecord {
    pub key: String,
    pub kind: SliceKind,
    pub owner: String,
    pub schema_version: u32,
    pub revision: u64,
    /// Hex SHA-256 of `sealed`.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub modified_by: ModifiedBy,
    #[serde(with = "crate::serde_b64")]
    pub sealed: Vec<u8>,
}

impl SliceRecord {
    pub(crate) fn logical_key(&self) -> Result<LogicalKey, LedgerError> {
        LogicalKey::parse(&self.key).map_err(|e| LedgerError::Corrupted {
            slice: self.key.clone(),
            reason: e.to_string(),
        })
    }
}

/// Left behind by a purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Tombstone {
    pub tombstone_id: Uuid,
    pub slice_id: SliceId,
    pub key: String,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: ModifiedBy,
}

/// A sealed payload to store under a key.
pub(crate) struct PutRequest<'a> {
    pub key: &'a LogicalKey,
    pub sealed: Vec<u8>,
    /// `None` creates only; `Some` updates only if the stored checksum matches.
    pub expected_checksum: Option<&'a str>,
    /// Owner of a new communal slice. Defaults to the writer; personal
    /// slices are always owned by the identity in their key.
    pub owner: Option<&'a str>,
}

fn slice_path(id: &SliceId) -> String {
    format!("{SLICE_PREFIX}{id}")
}

fn index_path(key: &str) -> String {
    format!("{INDEX_PREFIX}{key}")
}

/// The prefix a listing grant was issued for.
fn require_listing(grant: &Grant) -> Result<&KeyPrefix, LedgerError> {
    require(grant, &[Operation::Read, Operation::Export], "list")?;
    match grant.target() {
        GrantTarget::Prefix(granted) => Ok(granted),
        _ => Err(LedgerError::GrantMismatch {
            granted: grant.operation(),
            required: "list",
        }),
    }
}

fn require(grant: &Grant, allowed: &[Operation], required: &'static str) -> Result<(), LedgerError> {
    if allowed.contains(&grant.operation()) {
        Ok(())
    } else {
        Err(LedgerError::GrantMismatch {
            granted: grant.operation(),
            required,
        })
    }
}

fn require_slice(grant: &Grant, id: &SliceId, required: &'static str) -> Result<(), LedgerError> {
    match grant.target() {
        GrantTarget::Slice(granted) if granted == id => Ok(()),
        _ => Err(LedgerError::GrantMismatch {
            granted: grant.operation(),
            required,
        }),
    }
}

fn require_system(grant: &Grant, required: &'static str) -> Result<(), LedgerError> {
    require(grant, &[Operation::Admin], required)?;
    if *grant.target() == GrantTarget::System {
        Ok(())
    } else {
        Err(LedgerError::GrantMismatch {
            granted: grant.operation(),
            required,
        })
    }
}

fn encoding(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Encoding {
        reason: e.to_string(),
    }
}

pub(crate) struct LedgerStore {
    backend: Arc<dyn StorageBackend>,
    retry: RetryPolicy,
}

impl LedgerStore {
    pub(crate) fn new(backend: Arc<dyn StorageBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    async fn raw_get(&self, path: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self
            .retry
            .run("ledger get", StorageError::is_transient, || self.backend.get(path))
            .await?)
    }

    async fn raw_put(&self, path: &str, value: &[u8]) -> Result<(), LedgerError> {
        Ok(self
            .retry
            .run("ledger put", StorageError::is_transient, || {
                self.backend.put(path, value)
            })
            .await?)
    }

    async fn raw_delete(&self, path: &str) -> Result<(), LedgerError> {
        Ok(self
            .retry
            .run("ledger delete", StorageError::is_transient, || {
                self.backend.delete(path)
            })
            .await?)
    }

    async fn raw_list(&self, prefix: &str) -> Result<Vec<String>, LedgerError> {
        Ok(self
            .retry
            .run("ledger list", StorageError::is_transient, || {
                self.backend.list(prefix)
            })
            .await?)
    }

    /// Load and check a record without any grant check.
    async fn load(&self, id: &SliceId) -> Result<Option<SliceRecord>, LedgerError> {
        let Some(bytes) = self.raw_get(&slice_path(id)).await? else {
            return Ok(None);
        };
        let corrupted = |reason: String| {
            error!(slice = %id, reason = %reason, "stored slice record is corrupted");
            LedgerError::Corrupted {
                slice: id.to_string(),
                reason,
            }
        };

        let record: SliceRecord = serde_json::from_slice(&bytes)
            .map_err(|e| corrupted(format!("record is unreadable: {e}")))?;
        if sha256_hex(&record.sealed) != record.checksum {
            return Err(corrupted("payload checksum mismatch".to_owned()));
        }
        if LogicalKey::parse(&record.key).map(|k| k.slice_id()).ok().as_ref() != Some(id) {
            return Err(corrupted("record is stored under the wrong id".to_owned()));
        }
        Ok(Some(record))
    }

    /// Fetch one record.
    ///
    /// The grant must be for reading, exporting or administration, and must
    /// target this slice or a prefix containing its key.
    pub(crate) async fn get(&self, grant: &Grant, id: &SliceId) -> Result<SliceRecord, LedgerError> {
        require(
            grant,
            &[Operation::Read, Operation::Export, Operation::Admin],
            "get",
        )?;
        if let GrantTarget::Slice(granted) = grant.target() {
            if granted != id {
                return Err(LedgerError::GrantMismatch {
                    granted: grant.operation(),
                    required: "get",
                });
            }
        }

        let record = self.load(id).await?.ok_or_else(|| LedgerError::NotFound {
            slice: id.to_string(),
        })?;

        match grant.target() {
            GrantTarget::Slice(_) => {}
            GrantTarget::Prefix(prefix) => {
                if !prefix.matches(&record.logical_key()?) {
                    return Err(LedgerError::GrantMismatch {
                        granted: grant.operation(),
                        required: "get",
                    });
                }
            }
            GrantTarget::System => require_system(grant, "get")?,
        }
        Ok(record)
    }

    /// Store a sealed payload with optimistic concurrency.
    ///
    /// Returns the record as written. The caller holds the slice's write lock.
    pub(crate) async fn put(
        &self,
        grant: &Grant,
        request: PutRequest<'_>,
    ) -> Result<SliceRecord, LedgerError> {
        require(grant, &[Operation::Write], "put")?;
        let id = request.key.slice_id();
        require_slice(grant, &id, "put")?;

        let current = self.load(&id).await?;
        let conflict = || LedgerError::Conflict {
            slice: id.to_string(),
        };
        match (&current, request.expected_checksum) {
            (Some(_), None) | (None, Some(_)) => return Err(conflict()),
            (Some(existing), Some(expected)) if existing.checksum != expected => {
                return Err(conflict());
            }
            _ => {}
        }

        let now = Utc::now();
        let modified_by = ModifiedBy {
            identity: grant.identity().to_owned(),
            token_id: grant.token_id(),
        };
        let record = match current {
            Some(existing) => SliceRecord {
                revision: existing.revision.saturating_add(1),
                checksum: sha256_hex(&request.sealed),
                modified_at: now,
                modified_by,
                sealed: request.sealed,
                schema_version: SCHEMA_VERSION,
                ..existing
            },
            None => SliceRecord {
                key: request.key.to_string(),
                kind: request.key.kind(),
                owner: request
                    .key
                    .personal_owner()
                    .or(request.owner)
                    .unwrap_or(grant.identity())
                    .to_owned(),
                schema_version: SCHEMA_VERSION,
                revision: 1,
                checksum: sha256_hex(&request.sealed),
                created_at: now,
                modified_at: now,
                modified_by,
                sealed: request.sealed,
            },
        };

        let bytes = serde_json::to_vec(&record).map_err(encoding)?;
        if record.revision == 1 {
            self.raw_put(&index_path(&record.key), id.as_str().as_bytes())
                .await?;
        }
        self.raw_put(&slice_path(&id), &bytes).await?;
        debug!(slice = %id, revision = record.revision, "slice stored");
        Ok(record)
    }

    /// Hard-delete a slice, leaving a tombstone. Returns the tombstone id.
    pub(crate) async fn delete(&self, grant: &Grant, key: &LogicalKey) -> Result<Uuid, LedgerError> {
        require(grant, &[Operation::Purge], "delete")?;
        let id = key.slice_id();
        require_slice(grant, &id, "delete")?;

        let path = slice_path(&id);
        if self.raw_get(&path).await?.is_none() {
            return Err(LedgerError::NotFound {
                slice: id.to_string(),
            });
        }

        let tombstone = Tombstone {
            tombstone_id: Uuid::new_v4(),
            slice_id: id,
            key: key.to_string(),
            deleted_at: Utc::now(),
            deleted_by: ModifiedBy {
                identity: grant.identity().to_owned(),
                token_id: grant.token_id(),
            },
        };
        let bytes = serde_json::to_vec(&tombstone).map_err(encoding)?;
        self.raw_put(&format!("{TOMBSTONE_PREFIX}{}", tombstone.tombstone_id), &bytes)
            .await?;
        self.raw_delete(&path).await?;
        self.raw_delete(&index_path(key.as_str())).await?;

        info!(slice = %tombstone.slice_id, tombstone = %tombstone.tombstone_id, "slice purged");
        Ok(tombstone.tombstone_id)
    }

    /// Ids of slices of `kind` under `prefix`, read from the key index
    /// without loading any record. The grant must target a prefix covering
    /// `prefix`.
    pub(crate) async fn ids_under(
        &self,
        grant: &Grant,
        kind: SliceKind,
        prefix: &KeyPrefix,
    ) -> Result<Vec<SliceId>, LedgerError> {
        let granted = require_listing(grant)?;
        Ok(self
            .raw_list(&index_path(prefix.as_str()))
            .await?
            .iter()
            .filter_map(|path| path.strip_prefix(INDEX_PREFIX))
            .filter_map(|raw| LogicalKey::parse(raw).ok())
            .filter(|key| key.kind() == kind && prefix.matches(key) && granted.matches(key))
            .map(|key| key.slice_id())
            .collect())
    }

    /// Readable records of `kind` under `prefix`, optionally only those
    /// owned by `owner`. Each record is loaded once.
    ///
    /// Records that fail their integrity check are skipped and logged.
    pub(crate) async fn list(
        &self,
        grant: &Grant,
        owner: Option<&str>,
        kind: SliceKind,
        prefix: &KeyPrefix,
    ) -> Result<Vec<SliceRecord>, LedgerError> {
        let mut records = Vec::new();
        for id in self.ids_under(grant, kind, prefix).await? {
            let record = match self.load(&id).await {
                Ok(Some(record)) => record,
                Ok(None) | Err(LedgerError::Corrupted { .. }) => continue,
                Err(e) => return Err(e),
            };
            if owner.is_none_or(|o| o == record.owner) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn all_ids(&self) -> Result<Vec<SliceId>, LedgerError> {
        Ok(self
            .raw_list(SLICE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|path| path.strip_prefix(SLICE_PREFIX).map(SliceId::from_raw))
            .collect())
    }

    /// Every slice id, for key rotation.
    pub(crate) async fn ids_for_admin(&self, grant: &Grant) -> Result<Vec<SliceId>, LedgerError> {
        require_system(grant, "ids")?;
        self.all_ids().await
    }

    /// Replace a record's payload with the same content sealed under a new
    /// key. Revision and provenance are kept.
    pub(crate) async fn reseal(
        &self,
        grant: &Grant,
        record: SliceRecord,
        sealed: Vec<u8>,
    ) -> Result<SliceRecord, LedgerError> {
        require_system(grant, "reseal")?;
        let id = record.logical_key()?.slice_id();
        let record = SliceRecord {
            checksum: sha256_hex(&sealed),
            sealed,
            ..record
        };
        let bytes = serde_json::to_vec(&record).map_err(encoding)?;
        self.raw_put(&slice_path(&id), &bytes).await?;
        Ok(record)
    }

    /// Remove every slice, tombstone and delegation. The keyring stays.
    pub(crate) async fn wipe(&self, grant: &Grant) -> Result<usize, LedgerError> {
        require_system(grant, "wipe")?;
        let mut removed = 0usize;
        for prefix in [SLICE_PREFIX, TOMBSTONE_PREFIX, INDEX_PREFIX] {
            for path in self.raw_list(prefix).await? {
                self.raw_delete(&path).await?;
                if prefix == SLICE_PREFIX {
                    removed += 1;
                }
            }
        }
        self.raw_delete(DELEGATIONS_RECORD).await?;
        info!(slices = removed, "ledger wiped");
        Ok(removed)
    }

    /// Read a system record. Only the facade's bootstrap and administration
    /// paths call this.
    pub(crate) async fn load_system(&self, name: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        self.raw_get(name).await
    }

    pub(crate) async fn store_system(&self, name: &str, value: &[u8]) -> Result<(), LedgerError> {
        self.raw_put(name, value).await
    }

    #[cfg(test)]
    pub(crate) async fn tombstones(&self) -> Result<Vec<Tombstone>, LedgerError> {
        let mut out = Vec::new();
        for path in self.raw_list(TOMBSTONE_PREFIX).await? {
            if let Some(bytes) = self.raw_get(&path).await? {
                out.push(serde_json::from_slice(&bytes).map_err(encoding)?);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use memvault_storage::MemoryBackend;

    use super::*;

    fn key(raw: &str) -> LogicalKey {
        LogicalKey::parse(raw).unwrap()
    }

    fn ledger(backend: MemoryBackend) -> LedgerStore {
        LedgerStore::new(
            Arc::new(backend),
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    fn slice_grant(op: Operation, k: &LogicalKey) -> Grant {
        Grant::for_tests("alden", op, GrantTarget::Slice(k.slice_id()))
    }

    async fn create(ledger: &LedgerStore, k: &LogicalKey, payload: &[u8]) -> SliceRecord {
        ledger
            .put(
                &slice_grant(Operation::Write, k),
                PutRequest {
                    key: k,
                    sealed: payload.to_vec(),
                    expected_checksum: None,
                    owner: None,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_update_with_matching_checksum() {
        let ledger = ledger(MemoryBackend::new());
        let k = key("personal.alden.notes");
        let first = create(&ledger, &k, b"sealed-1").await;
        assert_eq!(first.revision, 1);
        assert_eq!(first.owner, "alden");

        let second = ledger
            .put(
                &slice_grant(Operation::Write, &k),
                PutRequest {
                    key: &k,
                    sealed: b"sealed-2".to_vec(),
                    expected_checksum: Some(&first.checksum),
                    owner: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(second.revision, 2);
        assert_eq!(second.created_at, first.created_at);
        assert_ne!(second.checksum, first.checksum);

        let read = ledger
            .get(&slice_grant(Operation::Read, &k), &k.slice_id())
            .await
            .unwrap();
        assert_eq!(read.sealed, b"sealed-2");
    }

    #[tokio::test]
    async fn stale_or_missing_checksums_conflict() {
        let ledger = ledger(MemoryBackend::new());
        let k = key("communal.board");
        let first = create(&ledger, &k, b"v1").await;

        let again = ledger
            .put(
                &slice_grant(Operation::Write, &k),
                PutRequest {
                    key: &k,
                    sealed: b"v2".to_vec(),
                    expected_checksum: None,
                    owner: None,
                },
            )
            .await;
        assert!(matches!(again, Err(LedgerError::Conflict { .. })));

        let stale = ledger
            .put(
                &slice_grant(Operation::Write, &k),
                PutRequest {
                    key: &k,
                    sealed: b"v2".to_vec(),
                    expected_checksum: Some("0000"),
                    owner: None,
                },
            )
            .await;
        assert!(matches!(stale, Err(LedgerError::Conflict { .. })));

        let absent = key("communal.absent");
        let update_missing = ledger
            .put(
                &slice_grant(Operation::Write, &absent),
                PutRequest {
                    key: &absent,
                    sealed: b"v".to_vec(),
                    expected_checksum: Some(&first.checksum),
                    owner: None,
                },
            )
            .await;
        assert!(matches!(update_missing, Err(LedgerError::Conflict { .. })));
    }

    #[tokio::test]
    async fn grants_must_cover_the_call() {
        let ledger = ledger(MemoryBackend::new());
        let k = key("personal.alden.notes");
        let other = key("personal.alden.other");
        create(&ledger, &k, b"x").await;

        let wrong_op = ledger.get(&slice_grant(Operation::Write, &k), &k.slice_id()).await;
        assert!(matches!(wrong_op, Err(LedgerError::GrantMismatch { .. })));

        let wrong_target = ledger.get(&slice_grant(Operation::Read, &other), &k.slice_id()).await;
        assert!(matches!(wrong_target, Err(LedgerError::GrantMismatch { .. })));

        let outside = Grant::for_tests(
            "alden",
            Operation::Read,
            GrantTarget::Prefix(KeyPrefix::parse("personal.bryn").unwrap()),
        );
        assert!(matches!(
            ledger.get(&outside, &k.slice_id()).await,
            Err(LedgerError::GrantMismatch { .. })
        ));

        let purge_as_write = ledger.delete(&slice_grant(Operation::Write, &k), &k).await;
        assert!(matches!(purge_as_write, Err(LedgerError::GrantMismatch { .. })));

        let wipe_without_admin = ledger.wipe(&slice_grant(Operation::Purge, &k)).await;
        assert!(matches!(wipe_without_admin, Err(LedgerError::GrantMismatch { .. })));
    }

    #[tokio::test]
    async fn delete_leaves_a_tombstone() {
        let ledger = ledger(MemoryBackend::new());
        let k = key("personal.alden.notes");
        create(&ledger, &k, b"x").await;

        let tombstone = ledger.delete(&slice_grant(Operation::Purge, &k), &k).await.unwrap();
        let stones = ledger.tombstones().await.unwrap();
        assert_eq!(stones.len(), 1);
        assert_eq!(stones[0].tombstone_id, tombstone);
        assert_eq!(stones[0].key, "personal.alden.notes");

        let gone = ledger.get(&slice_grant(Operation::Read, &k), &k.slice_id()).await;
        assert!(matches!(gone, Err(LedgerError::NotFound { .. })));
        let again = ledger.delete(&slice_grant(Operation::Purge, &k), &k).await;
        assert!(matches!(again, Err(LedgerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_filters_by_owner_kind_and_prefix() {
        let ledger = ledger(MemoryBackend::new());
        for raw in [
            "personal.alden.a",
            "personal.alden.b.c",
            "personal.bryn.a",
            "communal.board",
        ] {
            create(&ledger, &key(raw), raw.as_bytes()).await;
        }
        let grant = Grant::for_tests(
            "alden",
            Operation::Read,
            GrantTarget::Prefix(KeyPrefix::parse("personal").unwrap()),
        );

        let alden = KeyPrefix::parse("personal.alden").unwrap();
        let records = ledger
            .list(&grant, None, SliceKind::Personal, &alden)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);

        let all_personal = KeyPrefix::parse("personal").unwrap();
        let bryns = ledger
            .list(&grant, Some("bryn"), SliceKind::Personal, &all_personal)
            .await
            .unwrap();
        assert_eq!(bryns.len(), 1);
        assert_eq!(bryns[0].key, "personal.bryn.a");

        let communal = KeyPrefix::parse("communal").unwrap();
        let none = ledger
            .list(&grant, None, SliceKind::Communal, &communal)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn listing_reads_only_records_under_the_prefix() {
        let backend = CountingBackend::default();
        let ledger = LedgerStore::new(
            Arc::new(backend.clone()),
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        );
        for raw in ["personal.alden.a", "personal.alden.b", "personal.aldenx.c"] {
            create(&ledger, &key(raw), raw.as_bytes()).await;
        }
        for n in 0..20 {
            create(&ledger, &key(&format!("personal.bryn.n{n}")), b"x").await;
        }
        let grant = Grant::for_tests(
            "alden",
            Operation::Read,
            GrantTarget::Prefix(KeyPrefix::parse("personal.alden").unwrap()),
        );

        backend.gets.store(0, Ordering::SeqCst);
        let records = ledger
            .list(&grant, None, SliceKind::Personal, &KeyPrefix::parse("personal.alden").unwrap())
            .await
            .unwrap();
        let mut keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["personal.alden.a", "personal.alden.b"]);
        assert_eq!(backend.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn purged_slices_leave_the_index() {
        let ledger = ledger(MemoryBackend::new());
        let k = key("communal.board");
        create(&ledger, &k, b"x").await;
        let grant = Grant::for_tests(
            "alden",
            Operation::Read,
            GrantTarget::Prefix(KeyPrefix::parse("communal").unwrap()),
        );
        let communal = KeyPrefix::parse("communal").unwrap();
        assert_eq!(
            ledger.ids_under(&grant, SliceKind::Communal, &communal).await.unwrap(),
            vec![k.slice_id()]
        );

        ledger.delete(&slice_grant(Operation::Purge, &k), &k).await.unwrap();
        assert!(ledger
            .ids_under(&grant, SliceKind::Communal, &communal)
            .await
            .unwrap()
            .is_empty());

        let again = create(&ledger, &k, b"y").await;
        assert_eq!(again.revision, 1);
        assert_eq!(ledger.list(&grant, None, SliceKind::Communal, &communal).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_communal_slices_take_the_named_owner() {
        let ledger = ledger(MemoryBackend::new());
        let board = key("communal.board");
        let record = ledger
            .put(
                &slice_grant(Operation::Write, &board),
                PutRequest {
                    key: &board,
                    sealed: b"x".to_vec(),
                    expected_checksum: None,
                    owner: Some("bryn"),
                },
            )
            .await
            .unwrap();
        assert_eq!(record.owner, "bryn");
        assert_eq!(record.modified_by.identity, "alden");

        // A personal key always names its owner.
        let notes = key("personal.alden.notes");
        let record = ledger
            .put(
                &slice_grant(Operation::Write, &notes),
                PutRequest {
                    key: &notes,
                    sealed: b"x".to_vec(),
                    expected_checksum: None,
                    owner: Some("bryn"),
                },
            )
            .await
            .unwrap();
        assert_eq!(record.owner, "alden");
    }

    #[tokio::test]
    async fn damaged_payload_is_reported_as_corruption() {
        let backend = MemoryBackend::new();
        let ledger = ledger(backend.clone());
        let k = key("personal.alden.notes");
        create(&ledger, &k, b"sealed-bytes").await;

        let path = slice_path(&k.slice_id());
        let mut record: serde_json::Value =
            serde_json::from_slice(&backend.get(&path).await.unwrap().unwrap()).unwrap();
        record["sealed"] = serde_json::Value::String("c2VhbGVkLWJ5dGVa".to_owned());
        backend
            .put(&path, &serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let result = ledger.get(&slice_grant(Operation::Read, &k), &k.slice_id()).await;
        assert!(matches!(result, Err(LedgerError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn wipe_keeps_the_keyring() {
        let ledger = ledger(MemoryBackend::new());
        let k = key("communal.board");
        create(&ledger, &k, b"x").await;
        ledger.delete(&slice_grant(Operation::Purge, &k), &k).await.unwrap();
        create(&ledger, &key("communal.other"), b"y").await;
        ledger.store_system(KEYRING_RECORD, b"ring").await.unwrap();
        ledger.store_system(DELEGATIONS_RECORD, b"d").await.unwrap();

        let admin = Grant::for_tests("root", Operation::Admin, GrantTarget::System);
        assert_eq!(ledger.wipe(&admin).await.unwrap(), 1);
        assert!(ledger.ids_for_admin(&admin).await.unwrap().is_empty());
        assert!(ledger.tombstones().await.unwrap().is_empty());
        let listing = Grant::for_tests(
            "root",
            Operation::Read,
            GrantTarget::Prefix(KeyPrefix::parse("communal").unwrap()),
        );
        assert!(ledger
            .ids_under(&listing, SliceKind::Communal, &KeyPrefix::parse("communal").unwrap())
            .await
            .unwrap()
            .is_empty());
        assert!(ledger.load_system(DELEGATIONS_RECORD).await.unwrap().is_none());
        assert_eq!(
            ledger.load_system(KEYRING_RECORD).await.unwrap(),
            Some(b"ring".to_vec())
        );
    }

    /// Fails the first `failures` writes with a transient error.
    struct FlakyBackend {
        inner: MemoryBackend,
        failures: AtomicU32,
        permanent: bool,
    }

    #[async_trait::async_trait]
    impl StorageBackend for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if self.permanent || remaining > 0 {
                self.failures.store(remaining.saturating_sub(1), Ordering::SeqCst);
                return Err(StorageError::Write {
                    key: key.to_owned(),
                    reason: "device busy".to_owned(),
                });
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list(prefix).await
        }
    }

    /// Counts reads so tests can see how many records a call loaded.
    #[derive(Clone, Default)]
    struct CountingBackend {
        inner: MemoryBackend,
        gets: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl StorageBackend for CountingBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list(prefix).await
        }
    }

    fn flaky(failures: u32, permanent: bool) -> LedgerStore {
        LedgerStore::new(
            Arc::new(FlakyBackend {
                inner: MemoryBackend::new(),
                failures: AtomicU32::new(failures),
                permanent,
            }),
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn transient_storage_failures_are_retried() {
        let ledger = flaky(2, false);
        let k = key("communal.board");
        let record = create(&ledger, &k, b"x").await;
        assert_eq!(record.revision, 1);
    }

    #[tokio::test]
    async fn persistent_storage_failure_surfaces() {
        let ledger = flaky(0, true);
        let k = key("communal.board");
        let result = ledger
            .put(
                &slice_grant(Operation::Write, &k),
                PutRequest {
                    key: &k,
                    sealed: b"x".to_vec(),
                    expected_checksum: None,
                    owner: None,
                },
            )
            .await;
        assert!(matches!(result, Err(LedgerError::Storage(StorageError::Write { .. }))));
    }
}
