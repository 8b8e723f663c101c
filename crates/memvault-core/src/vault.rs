//! The vault facade.
//!
//! [`open_vault`] is the only way to obtain a vault. It builds the storage
//! backend from configuration and hands it to the private ledger, so nothing
//! outside this crate holds a handle the vault writes through.
//!
//! Every request on a [`VaultHandle`] follows the same path:
//!
//! ```text
//! Received -> TokenValidated -> PolicyChecked -> Executed -> Audited -> Responded
//!                   \                \               \
//!                    +----------------+---------------+--> Denied | Errored
//! ```
//!
//! Exactly one audit record is appended per request, before the caller sees
//! the result. Each request runs in its own task; the configured timeout
//! bounds how long the caller waits, never the task itself.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use memvault_storage::{MemoryBackend, StorageBackend};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::{
    AuditEntry, AuditOperation, AuditQuery, AuditRecord, AuditSink, AuditTrail, ChainStatus, MemoryAuditSink,
};
use crate::audit_file::FileAuditSink;
use crate::bundle::{ImportReport, Manifest, SignedBundle, open_bundle, open_entry, seal_bundle, seal_entry};
use crate::config::{AuditConfig, StorageConfig, VaultConfig};
use crate::crypto::{CryptoEngine, EncryptionKey};
use crate::error::{ConfigError, CryptoError, DenyReason, LedgerError, VaultError};
use crate::identity::Credentials;
use crate::ledger::{DELEGATIONS_RECORD, KEYRING_RECORD, LedgerStore, PutRequest, SliceRecord};
use crate::locks::StripedLocks;
use crate::policy::{Delegation, PolicyDocument, PolicyEngine};
use crate::slice::{KeyPrefix, LogicalKey, SCHEMA_VERSION, SliceView, WriteReceipt};
use crate::token::{CapabilityToken, Grant, Operation, Requested, TokenAuthority, TokenRequest, Validated};

/// Outcome of a key rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationReport {
    pub active_version: u32,
    pub resealed: usize,
    /// Slices that failed their integrity check and were left as they were.
    pub unreadable: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Received,
    TokenValidated,
    PolicyChecked,
    Executed,
    Audited,
    Responded,
    Denied,
    Errored,
}

impl RequestState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::TokenValidated => "token_validated",
            Self::PolicyChecked => "policy_checked",
            Self::Executed => "executed",
            Self::Audited => "audited",
            Self::Responded => "responded",
            Self::Denied => "denied",
            Self::Errored => "errored",
        }
    }
}

struct Request {
    id: Uuid,
    operation: AuditOperation,
    state: RequestState,
    corruption: bool,
}

impl Request {
    fn received(operation: AuditOperation) -> Self {
        let request = Self {
            id: Uuid::new_v4(),
            operation,
            state: RequestState::Received,
            corruption: false,
        };
        debug!(request = %request.id, operation = operation.as_str(), state = "received", "request state");
        request
    }

    fn advance(&mut self, next: RequestState) {
        debug!(
            request = %self.id,
            operation = self.operation.as_str(),
            from = self.state.as_str(),
            to = next.as_str(),
            "request state"
        );
        self.state = next;
    }
}

/// Who a request is attributed to in the audit trail.
struct Actor {
    identity: String,
    token_id: Option<Uuid>,
}

impl Actor {
    fn anonymous() -> Self {
        Self {
            identity: "unknown".to_owned(),
            token_id: None,
        }
    }

    fn validated(validated: &Validated) -> Self {
        Self {
            identity: validated.identity().to_owned(),
            token_id: Some(validated.token_id()),
        }
    }
}

struct Admitted {
    actor: Actor,
    validated: Validated,
    grant: Grant,
}

fn internal(e: impl fmt::Display) -> VaultError {
    VaultError::Internal {
        reason: e.to_string(),
    }
}

fn ledger_error(target: &str, e: LedgerError) -> VaultError {
    match e {
        LedgerError::NotFound { .. } => VaultError::NotFound {
            key: target.to_owned(),
        },
        LedgerError::Conflict { .. } => VaultError::Conflict {
            key: target.to_owned(),
        },
        LedgerError::Corrupted { .. } => VaultError::Integrity {
            key: target.to_owned(),
        },
        LedgerError::Storage(e) => VaultError::Storage {
            reason: e.to_string(),
        },
        other @ (LedgerError::GrantMismatch { .. } | LedgerError::Encoding { .. }) => internal(other),
    }
}

fn bootstrap_error(e: LedgerError) -> VaultError {
    match e {
        LedgerError::Storage(e) => ConfigError::Storage(e).into(),
        other => internal(other),
    }
}

fn owner_prefix(owner: &str) -> Result<KeyPrefix, VaultError> {
    KeyPrefix::parse(&format!("personal.{owner}")).map_err(internal)
}

struct VaultInner {
    crypto: CryptoEngine,
    ledger: LedgerStore,
    audit: AuditTrail,
    tokens: TokenAuthority,
    policy: PolicyEngine,
    locks: StripedLocks,
    /// Serialises keyring, delegation and policy changes.
    admin: Mutex<()>,
    request_timeout: Option<Duration>,
    chunk_size: usize,
}

/// Open (or create) a vault.
///
/// On first open a keyring is generated and stored wrapped under the master
/// key. Later opens unwrap it; a different master key is refused.
///
/// # Errors
///
/// Returns [`VaultError::Config`] when the key, storage, audit log or policy
/// document is unusable, including [`ConfigError::WrongMasterKey`] and
/// [`ConfigError::AuditChainCorrupted`].
pub async fn open_vault(config: VaultConfig) -> Result<VaultHandle, VaultError> {
    let master = config.key_source.resolve()?;
    let backend = build_backend(&config.storage)?;
    open_with_backend(config, master, backend).await
}

fn build_backend(storage: &StorageConfig) -> Result<Arc<dyn StorageBackend>, ConfigError> {
    Ok(match storage {
        StorageConfig::Memory => {
            info!("using in-memory storage (data will not persist)");
            Arc::new(MemoryBackend::new())
        }
        #[cfg(feature = "redb-backend")]
        StorageConfig::Redb { path } => {
            info!(path = %path.display(), "using redb storage");
            Arc::new(memvault_storage::RedbBackend::open(path)?)
        }
        #[cfg(not(feature = "redb-backend"))]
        StorageConfig::Redb { path } => return Err(unsupported("redb", path)),
        #[cfg(feature = "rocksdb-backend")]
        StorageConfig::RocksDb { path } => {
            info!(path = %path.display(), "using RocksDB storage");
            Arc::new(memvault_storage::RocksDbBackend::open(path)?)
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageConfig::RocksDb { path } => return Err(unsupported("rocksdb", path)),
    })
}

#[cfg(any(not(feature = "redb-backend"), not(feature = "rocksdb-backend")))]
fn unsupported(backend: &str, path: &std::path::Path) -> ConfigError {
    ConfigError::Storage(memvault_storage::StorageError::Open {
        path: path.display().to_string(),
        reason: format!("built without the {backend}-backend feature"),
    })
}

async fn open_with_backend(
    config: VaultConfig,
    master: EncryptionKey,
    backend: Arc<dyn StorageBackend>,
) -> Result<VaultHandle, VaultError> {
    let ledger = LedgerStore::new(backend, config.storage_retry);
    let crypto = load_keyring(&ledger, master).await?;

    let sink: Arc<dyn AuditSink> = match &config.audit {
        AuditConfig::Memory => Arc::new(MemoryAuditSink::new()),
        AuditConfig::File { path } => {
            info!(path = %path.display(), "file audit sink registered");
            Arc::new(FileAuditSink::new(path))
        }
        AuditConfig::Sink(sink) => Arc::clone(sink),
    };
    let opened = AuditTrail::open(sink, &crypto, config.verify_audit_on_open, config.audit_retry)
        .await
        .map_err(ConfigError::from)?;
    let audit = match opened {
        Ok(trail) => trail,
        Err(ChainStatus::Corrupted { at_sequence, reason }) => {
            error!(at_sequence, reason = %reason, "audit chain is corrupted; refusing to open");
            return Err(ConfigError::AuditChainCorrupted { at_sequence, reason }.into());
        }
        Err(ChainStatus::Ok { .. }) => return Err(internal("audit trail refused an intact chain")),
    };

    let checked = config.policy.resolve()?.validate()?;
    info!(
        version = checked.version(),
        identities = checked.identity_count(),
        "policy loaded"
    );
    let policy = PolicyEngine::new(checked);
    policy
        .replace_delegations(load_delegations(&ledger, &crypto).await?)
        .await;

    info!(
        key_version = crypto.active_version().await,
        timeout_ms = config.request_timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        "vault opened"
    );
    Ok(VaultHandle {
        inner: Arc::new(VaultInner {
            crypto,
            ledger,
            audit,
            tokens: TokenAuthority::new(),
            policy,
            locks: StripedLocks::new(config.lock_stripes),
            admin: Mutex::new(()),
            request_timeout: config.request_timeout,
            chunk_size: config.chunk_size.max(1),
        }),
    })
}

async fn load_keyring(ledger: &LedgerStore, master: EncryptionKey) -> Result<CryptoEngine, VaultError> {
    if let Some(wrapped) = ledger.load_system(KEYRING_RECORD).await.map_err(bootstrap_error)? {
        return CryptoEngine::restore(master, &wrapped).map_err(|e| {
            VaultError::Config(match e {
                CryptoError::Integrity { .. } => ConfigError::WrongMasterKey,
                other => ConfigError::Crypto(other),
            })
        });
    }

    let crypto = CryptoEngine::new(master).map_err(ConfigError::from)?;
    let wrapped = crypto.wrap_keyring().await.map_err(ConfigError::from)?;
    ledger
        .store_system(KEYRING_RECORD, &wrapped)
        .await
        .map_err(bootstrap_error)?;
    info!("new keyring created");
    Ok(crypto)
}

async fn load_delegations(ledger: &LedgerStore, crypto: &CryptoEngine) -> Result<Vec<Delegation>, VaultError> {
    let Some(sealed) = ledger
        .load_system(DELEGATIONS_RECORD)
        .await
        .map_err(bootstrap_error)?
    else {
        return Ok(Vec::new());
    };
    let json = Zeroizing::new(
        crypto
            .open_export(&sealed, DELEGATIONS_RECORD.as_bytes())
            .map_err(ConfigError::from)?,
    );
    serde_json::from_slice(&json).map_err(|e| internal(format!("delegation record is malformed: {e}")))
}

impl VaultInner {
    async fn actor_for(&self, token: &CapabilityToken) -> Actor {
        match self.tokens.holder(token).await {
            Some(identity) => Actor {
                identity,
                token_id: Some(token.id()),
            },
            None => Actor::anonymous(),
        }
    }

    /// Token validation followed by policy authorization.
    async fn admit(
        &self,
        req: &mut Request,
        token: &CapabilityToken,
        operation: Operation,
        requested: Requested<'_>,
    ) -> Result<Admitted, (Actor, VaultError)> {
        let validated = self.validate_token(req, token, operation, requested).await?;
        self.clear(req, validated, requested).await
    }

    async fn validate_token(
        &self,
        req: &mut Request,
        token: &CapabilityToken,
        operation: Operation,
        requested: Requested<'_>,
    ) -> Result<Validated, (Actor, VaultError)> {
        match self
            .tokens
            .validate(token, operation, requested, &self.policy)
            .await
        {
            Ok(validated) => {
                req.advance(RequestState::TokenValidated);
                Ok(validated)
            }
            Err(reason) => Err((self.actor_for(token).await, VaultError::denied(reason))),
        }
    }

    /// Policy authorization for a token that already validated.
    async fn clear(
        &self,
        req: &mut Request,
        validated: Validated,
        requested: Requested<'_>,
    ) -> Result<Admitted, (Actor, VaultError)> {
        let actor = Actor::validated(&validated);
        let cleared = match requested {
            Requested::Key(key) => self.policy.authorize(&validated, key).await,
            Requested::Prefix(prefix) => self.policy.authorize_prefix(&validated, prefix).await,
            Requested::System => self.policy.authorize_admin(&validated).await,
            Requested::Bundle => return Err((actor, internal("a bundle is cleared through its prefix"))),
        };
        let grant = match cleared {
            Ok(clearance) => validated.grant(clearance),
            Err(reason) => Err(VaultError::denied(reason)),
        };
        match grant {
            Ok(grant) => {
                req.advance(RequestState::PolicyChecked);
                Ok(Admitted {
                    actor,
                    validated,
                    grant,
                })
            }
            Err(e) => Err((actor, e)),
        }
    }

    /// Record the request's outcome, then hand back its result.
    async fn finish<T>(
        &self,
        mut req: Request,
        actor: &Actor,
        target: &str,
        result: Result<T, VaultError>,
        note: Option<String>,
    ) -> Result<T, VaultError> {
        let entry = AuditEntry::new(actor.identity.clone(), actor.token_id, req.operation, target);
        let (entry, terminal) = match &result {
            Ok(_) => (entry.allowed(note.as_deref()), None),
            Err(VaultError::NotFound { .. }) => (entry.allowed(Some("not_found")), None),
            Err(VaultError::Denied { reason }) => (entry.denied(reason.code()), Some(RequestState::Denied)),
            Err(e) => {
                if matches!(e, VaultError::Integrity { .. }) {
                    req.corruption = true;
                }
                debug!(request = %req.id, error = %e, "request failed");
                (entry.errored(e.code()), Some(RequestState::Errored))
            }
        };
        let entry = if req.corruption { entry.corrupted() } else { entry };

        if terminal.is_none() {
            req.advance(RequestState::Executed);
        }
        if let Err(e) = self.audit.record(entry).await {
            error!(
                request = %req.id,
                operation = req.operation.as_str(),
                error = %e,
                "audit append failed; vault is failing closed"
            );
            return Err(VaultError::AuditUnavailable);
        }
        match terminal {
            Some(state) => req.advance(state),
            None => {
                req.advance(RequestState::Audited);
                req.advance(RequestState::Responded);
            }
        }
        result
    }

    async fn request_token(
        &self,
        credentials: Credentials,
        request: TokenRequest,
    ) -> Result<CapabilityToken, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::RequestToken);
        let target = request.scope.pattern().to_owned();

        let identity = match self.policy.authenticate(&credentials).await {
            Ok(identity) => identity,
            Err(reason) => {
                let actor = Actor {
                    identity: credentials.identity().to_owned(),
                    token_id: None,
                };
                return self
                    .finish(req, &actor, &target, Err(VaultError::denied(reason)), None)
                    .await;
            }
        };
        req.advance(RequestState::TokenValidated);

        let issued = match self.policy.issue_terms(&identity, &request).await {
            Ok(terms) => {
                req.advance(RequestState::PolicyChecked);
                self.tokens
                    .issue(
                        &identity.id,
                        identity.class,
                        request.scope.clone(),
                        request.operations.clone(),
                        terms,
                    )
                    .await
                    .map_err(VaultError::denied)
            }
            Err(reason) => Err(VaultError::denied(reason)),
        };
        let actor = Actor {
            identity: identity.id.clone(),
            token_id: issued.as_ref().ok().map(CapabilityToken::id),
        };
        self.finish(req, &actor, &target, issued, None).await
    }

    async fn revoke_token(&self, token: CapabilityToken) -> Result<(), VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::RevokeToken);
        let target = token.id().to_string();

        let (actor, result) = match self.tokens.revoke_presented(&token).await {
            Ok(identity) => {
                req.advance(RequestState::TokenValidated);
                let actor = Actor {
                    identity,
                    token_id: Some(token.id()),
                };
                (actor, Ok(()))
            }
            Err(reason) => (self.actor_for(&token).await, Err(VaultError::denied(reason))),
        };
        self.finish(req, &actor, &target, result, None).await
    }

    async fn read(&self, token: CapabilityToken, key: LogicalKey) -> Result<SliceView, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::Read);
        let admitted = match self
            .admit(&mut req, &token, Operation::Read, Requested::Key(&key))
            .await
        {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, key.as_str(), Err(e), None).await,
        };
        let result = self.read_slice(&admitted.grant, &key).await;
        self.finish(req, &admitted.actor, key.as_str(), result, None)
            .await
    }

    async fn read_slice(&self, grant: &Grant, key: &LogicalKey) -> Result<SliceView, VaultError> {
        let id = key.slice_id();
        let _guard = self.locks.read(&id).await;
        let record = self
            .ledger
            .get(grant, &id)
            .await
            .map_err(|e| ledger_error(key.as_str(), e))?;
        let plaintext = self.open_record(&record, key).await?;
        Ok(SliceView {
            key: key.clone(),
            owner: record.owner,
            plaintext,
            checksum: record.checksum,
            revision: record.revision,
            schema_version: record.schema_version,
            created_at: record.created_at,
            modified_at: record.modified_at,
            modified_by: record.modified_by,
        })
    }

    async fn open_record(&self, record: &SliceRecord, key: &LogicalKey) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        self.crypto
            .open(&record.sealed, key.as_str().as_bytes())
            .await
            .map(Zeroizing::new)
            .map_err(|e| {
                error!(key = %key, error = %e, "sealed payload failed authentication");
                VaultError::Integrity {
                    key: key.to_string(),
                }
            })
    }

    async fn write(
        &self,
        token: CapabilityToken,
        key: LogicalKey,
        plaintext: Zeroizing<Vec<u8>>,
        expected_checksum: Option<String>,
    ) -> Result<WriteReceipt, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::Write);
        let admitted = match self
            .admit(&mut req, &token, Operation::Write, Requested::Key(&key))
            .await
        {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, key.as_str(), Err(e), None).await,
        };
        let result = self
            .write_slice(&admitted.grant, &key, &plaintext, expected_checksum.as_deref(), None)
            .await
            .map(|record| WriteReceipt {
                key: key.clone(),
                checksum: record.checksum,
                revision: record.revision,
            });
        self.finish(req, &admitted.actor, key.as_str(), result, None)
            .await
    }

    /// Seal and store under the slice's write lock, so a key rotation never
    /// misses a payload sealed under a retiring key.
    async fn write_slice(
        &self,
        grant: &Grant,
        key: &LogicalKey,
        plaintext: &[u8],
        expected_checksum: Option<&str>,
        owner: Option<&str>,
    ) -> Result<SliceRecord, VaultError> {
        let _guard = self.locks.write(&key.slice_id()).await;
        let sealed = self
            .crypto
            .seal(plaintext, key.as_str().as_bytes())
            .await
            .map_err(internal)?;
        self.ledger
            .put(
                grant,
                PutRequest {
                    key,
                    sealed,
                    expected_checksum,
                    owner,
                },
            )
            .await
            .map_err(|e| ledger_error(key.as_str(), e))
    }

    async fn purge(&self, token: CapabilityToken, key: LogicalKey) -> Result<Uuid, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::Purge);
        let admitted = match self
            .admit(&mut req, &token, Operation::Purge, Requested::Key(&key))
            .await
        {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, key.as_str(), Err(e), None).await,
        };
        let result = {
            let _guard = self.locks.write(&key.slice_id()).await;
            self.ledger
                .delete(&admitted.grant, &key)
                .await
                .map_err(|e| ledger_error(key.as_str(), e))
        };
        let note = result.as_ref().ok().map(|tombstone| format!("tombstone:{tombstone}"));
        self.finish(req, &admitted.actor, key.as_str(), result, note)
            .await
    }

    async fn list(&self, token: CapabilityToken, prefix: KeyPrefix) -> Result<Vec<LogicalKey>, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::List);
        let admitted = match self
            .admit(&mut req, &token, Operation::Read, Requested::Prefix(&prefix))
            .await
        {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, prefix.as_str(), Err(e), None).await,
        };
        let result = self.visible_keys(&admitted, &prefix).await;
        self.finish(req, &admitted.actor, prefix.as_str(), result, None)
            .await
    }

    /// Keys under `prefix` the token and the policy both let the caller read.
    async fn visible_keys(&self, admitted: &Admitted, prefix: &KeyPrefix) -> Result<Vec<LogicalKey>, VaultError> {
        let records = self
            .ledger
            .list(&admitted.grant, None, prefix.kind(), prefix)
            .await
            .map_err(|e| ledger_error(prefix.as_str(), e))?;

        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            let Ok(key) = record.logical_key() else { continue };
            if admitted.validated.covers(&key)
                && self.policy.authorize(&admitted.validated, &key).await.is_ok()
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn export(&self, token: CapabilityToken, prefix: KeyPrefix) -> Result<SignedBundle, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::Export);
        let admitted = match self
            .admit(&mut req, &token, Operation::Export, Requested::Prefix(&prefix))
            .await
        {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, prefix.as_str(), Err(e), None).await,
        };
        let result = self.export_prefix(&admitted, &prefix).await;
        self.finish(req, &admitted.actor, prefix.as_str(), result, None)
            .await
    }

    /// All-or-nothing: every slice under the prefix must be covered.
    async fn export_prefix(&self, admitted: &Admitted, prefix: &KeyPrefix) -> Result<SignedBundle, VaultError> {
        let ids = self
            .ledger
            .ids_under(&admitted.grant, prefix.kind(), prefix)
            .await
            .map_err(|e| ledger_error(prefix.as_str(), e))?;

        let mut entries = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.chunk_size) {
            for id in chunk {
                let _guard = self.locks.read(id).await;
                let record = match self.ledger.get(&admitted.grant, id).await {
                    Ok(record) => record,
                    // Purged since the listing.
                    Err(LedgerError::NotFound { .. }) => continue,
                    Err(e) => return Err(ledger_error(id.as_str(), e)),
                };
                let key = record
                    .logical_key()
                    .map_err(|e| ledger_error(id.as_str(), e))?;
                if !admitted.validated.covers(&key) {
                    return Err(VaultError::denied(DenyReason::OutOfScope {
                        key: key.to_string(),
                    }));
                }
                self.policy
                    .authorize(&admitted.validated, &key)
                    .await
                    .map_err(VaultError::denied)?;
                let plaintext = self.open_record(&record, &key).await?;
                entries.push(seal_entry(
                    &self.crypto,
                    &key,
                    &record.owner,
                    record.schema_version,
                    &plaintext,
                )?);
            }
            tokio::task::yield_now().await;
        }

        debug!(prefix = %prefix, entries = entries.len(), "export manifest assembled");
        seal_bundle(
            &self.crypto,
            &Manifest {
                prefix: prefix.to_string(),
                exported_at: Utc::now(),
                exported_by: admitted.actor.identity.clone(),
                entries,
            },
        )
    }

    async fn import(&self, bundle: SignedBundle, token: CapabilityToken) -> Result<ImportReport, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::Import);

        // The token is checked before the bundle is looked at.
        let validated = match self
            .validate_token(&mut req, &token, Operation::Write, Requested::Bundle)
            .await
        {
            Ok(validated) => validated,
            Err((actor, e)) => return self.finish(req, &actor, "bundle", Err(e), None).await,
        };
        let actor = Actor::validated(&validated);
        let (manifest, keys, prefix) = match self.open_import(&bundle) {
            Ok(opened) => opened,
            Err(e) => return self.finish(req, &actor, "bundle", Err(e), None).await,
        };
        if !validated.overlaps(&prefix) {
            let e = VaultError::denied(DenyReason::OutOfScope {
                key: prefix.to_string(),
            });
            return self.finish(req, &actor, prefix.as_str(), Err(e), None).await;
        }

        let admitted = match self
            .clear(&mut req, validated, Requested::Prefix(&prefix))
            .await
        {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, prefix.as_str(), Err(e), None).await,
        };
        let result = self.import_entries(&admitted, &manifest, keys).await;
        let note = result
            .as_ref()
            .ok()
            .map(|r| format!("written:{},conflicts:{}", r.written.len(), r.conflicts.len()));
        self.finish(req, &admitted.actor, prefix.as_str(), result, note)
            .await
    }

    /// Verify a bundle and check every key lies under its prefix.
    fn open_import(&self, bundle: &SignedBundle) -> Result<(Manifest, Vec<LogicalKey>, KeyPrefix), VaultError> {
        let (manifest, keys) = open_bundle(&self.crypto, bundle)?;
        let prefix = KeyPrefix::parse(&manifest.prefix).map_err(|e| VaultError::InvalidBundle {
            reason: format!("bundle prefix rejected: {e}"),
        })?;
        if let Some(stray) = keys.iter().find(|k| !prefix.matches(k)) {
            return Err(VaultError::InvalidBundle {
                reason: format!("'{stray}' lies outside the bundle prefix"),
            });
        }
        Ok((manifest, keys, prefix))
    }

    /// Authorise and open every entry before writing any of them.
    async fn import_entries(
        &self,
        admitted: &Admitted,
        manifest: &Manifest,
        keys: Vec<LogicalKey>,
    ) -> Result<ImportReport, VaultError> {
        let mut staged = Vec::with_capacity(keys.len());
        for (entry, key) in manifest.entries.iter().zip(keys) {
            if entry.schema_version != SCHEMA_VERSION {
                return Err(VaultError::InvalidBundle {
                    reason: format!(
                        "'{key}' has schema version {}, this vault writes {SCHEMA_VERSION}",
                        entry.schema_version
                    ),
                });
            }
            if !admitted.validated.covers(&key) {
                return Err(VaultError::denied(DenyReason::OutOfScope {
                    key: key.to_string(),
                }));
            }
            let clearance = self
                .policy
                .authorize(&admitted.validated, &key)
                .await
                .map_err(VaultError::denied)?;
            let grant = admitted.validated.grant(clearance)?;
            let plaintext = open_entry(&self.crypto, entry)?;
            staged.push((key, grant, entry.owner.as_str(), plaintext));
        }

        let mut report = ImportReport::default();
        for chunk in staged.chunks(self.chunk_size) {
            for (key, grant, owner, plaintext) in chunk {
                match self.write_slice(grant, key, plaintext, None, Some(*owner)).await {
                    Ok(_) => report.written.push(key.clone()),
                    Err(VaultError::Conflict { .. }) => report.conflicts.push(key.clone()),
                    Err(e) => return Err(e),
                }
            }
            tokio::task::yield_now().await;
        }
        info!(
            written = report.written.len(),
            conflicts = report.conflicts.len(),
            "bundle imported"
        );
        Ok(report)
    }

    async fn delegate(
        &self,
        token: CapabilityToken,
        delegate: String,
        operations: BTreeSet<Operation>,
        ttl: Option<Duration>,
    ) -> Result<Delegation, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::Delegate);
        let admitted = match self.admission_for_owner(&mut req, &token).await {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, &delegate, Err(e), None).await,
        };
        let result = self
            .grant_delegation(&admitted, &delegate, operations, ttl)
            .await;
        self.finish(req, &admitted.actor, &delegate, result, None)
            .await
    }

    /// A delegation change must be made by the owner, with a token that may
    /// write the owner's personal slices.
    async fn admission_for_owner(
        &self,
        req: &mut Request,
        token: &CapabilityToken,
    ) -> Result<Admitted, (Actor, VaultError)> {
        let Some(owner) = self.tokens.holder(token).await else {
            return Err((Actor::anonymous(), VaultError::denied(DenyReason::UnknownToken)));
        };
        let prefix = owner_prefix(&owner).map_err(|e| (Actor::anonymous(), e))?;
        self.admit(req, token, Operation::Write, Requested::Prefix(&prefix))
            .await
    }

    async fn grant_delegation(
        &self,
        admitted: &Admitted,
        delegate: &str,
        operations: BTreeSet<Operation>,
        ttl: Option<Duration>,
    ) -> Result<Delegation, VaultError> {
        let owner = admitted.validated.identity();
        if operations.is_empty() || !operations.iter().all(|op| Operation::DATA.contains(op)) {
            return Err(VaultError::InvalidRequest {
                reason: "delegations cover one or more data operations".to_owned(),
            });
        }
        if delegate == owner {
            return Err(VaultError::InvalidRequest {
                reason: "an identity cannot delegate to itself".to_owned(),
            });
        }
        if self.policy.identity(delegate).await.is_none() {
            return Err(VaultError::denied(DenyReason::UnknownIdentity));
        }
        let expires_at = ttl
            .map(|ttl| chrono::Duration::from_std(ttl).map(|ttl| Utc::now() + ttl))
            .transpose()
            .map_err(|_| VaultError::InvalidRequest {
                reason: "delegation lifetime is out of range".to_owned(),
            })?;

        let delegation = Delegation {
            owner: owner.to_owned(),
            delegate: delegate.to_owned(),
            operations,
            expires_at,
        };
        let _admin = self.admin.lock().await;
        self.policy.add_delegation(delegation.clone()).await;
        if let Err(e) = self.persist_delegations().await {
            self.policy.remove_delegation(owner, delegate).await;
            return Err(e);
        }
        Ok(delegation)
    }

    async fn revoke_delegation(&self, token: CapabilityToken, delegate: String) -> Result<(), VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::RevokeDelegation);
        let admitted = match self.admission_for_owner(&mut req, &token).await {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, &delegate, Err(e), None).await,
        };
        let result = self.drop_delegation(&admitted, &delegate).await;
        self.finish(req, &admitted.actor, &delegate, result, None)
            .await
    }

    async fn drop_delegation(&self, admitted: &Admitted, delegate: &str) -> Result<(), VaultError> {
        let owner = admitted.validated.identity();
        let _admin = self.admin.lock().await;
        if !self.policy.remove_delegation(owner, delegate).await {
            return Err(VaultError::NotFound {
                key: format!("delegation {owner} -> {delegate}"),
            });
        }
        info!(owner = %owner, delegate = %delegate, "delegation revoked");
        self.persist_delegations().await
    }

    /// Delegations are sealed under a master-derived key, so they stay
    /// readable across data key rotations.
    async fn persist_delegations(&self) -> Result<(), VaultError> {
        let delegations = self.policy.delegations().await;
        let json = Zeroizing::new(serde_json::to_vec(&delegations).map_err(internal)?);
        let sealed = self
            .crypto
            .seal_export(&json, DELEGATIONS_RECORD.as_bytes())
            .map_err(internal)?;
        self.ledger
            .store_system(DELEGATIONS_RECORD, &sealed)
            .await
            .map_err(|e| ledger_error(DELEGATIONS_RECORD, e))
    }

    async fn store_keyring(&self, wrapped: &[u8]) -> Result<(), VaultError> {
        self.ledger
            .store_system(KEYRING_RECORD, wrapped)
            .await
            .map_err(|e| ledger_error(KEYRING_RECORD, e))
    }

    async fn rotate_key(&self, token: CapabilityToken) -> Result<RotationReport, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::RotateKey);
        let admitted = match self
            .admit(&mut req, &token, Operation::Admin, Requested::System)
            .await
        {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, "keyring", Err(e), None).await,
        };
        let result = self.rotate(&admitted.grant).await;
        let note = result.as_ref().ok().map(|r| {
            req.corruption = r.unreadable > 0;
            format!("version:{},resealed:{}", r.active_version, r.resealed)
        });
        self.finish(req, &admitted.actor, "keyring", result, note)
            .await
    }

    /// Add a data key, re-seal every slice under it in chunks, then retire
    /// the old keys. Old payloads stay readable until the last step.
    ///
    /// Each keyring is stored before the engine switches to it, so a failed
    /// store leaves the vault sealing under a key that is already on disk.
    async fn rotate(&self, grant: &Grant) -> Result<RotationReport, VaultError> {
        let _admin = self.admin.lock().await;
        let pending = self.crypto.prepare_rotation().await.map_err(internal)?;
        self.store_keyring(pending.wrapped_keyring()).await?;
        let version = self.crypto.commit_rotation(pending).await;
        // Writers that sealed under the previous key have now committed.
        drop(self.locks.write_all().await);

        let mut report = RotationReport {
            active_version: version,
            resealed: 0,
            unreadable: 0,
        };
        let ids = self
            .ledger
            .ids_for_admin(grant)
            .await
            .map_err(|e| ledger_error("keyring", e))?;
        for chunk in ids.chunks(self.chunk_size) {
            for id in chunk {
                let _guard = self.locks.write(id).await;
                let record = match self.ledger.get(grant, id).await {
                    Ok(record) => record,
                    Err(LedgerError::NotFound { .. }) => continue,
                    Err(LedgerError::Corrupted { .. }) => {
                        report.unreadable += 1;
                        continue;
                    }
                    Err(e) => return Err(ledger_error(id.as_str(), e)),
                };
                if CryptoEngine::sealed_version(&record.sealed) == Some(version) {
                    continue;
                }
                let Ok(key) = record.logical_key() else {
                    report.unreadable += 1;
                    continue;
                };
                let Ok(plaintext) = self.open_record(&record, &key).await else {
                    report.unreadable += 1;
                    continue;
                };
                let sealed = self
                    .crypto
                    .seal(&plaintext, key.as_str().as_bytes())
                    .await
                    .map_err(internal)?;
                self.ledger
                    .reseal(grant, record, sealed)
                    .await
                    .map_err(|e| ledger_error(key.as_str(), e))?;
                report.resealed += 1;
            }
            tokio::task::yield_now().await;
        }

        let remaining = self.crypto.wrap_retired_keyring().await.map_err(internal)?;
        self.store_keyring(&remaining).await?;
        let retired = self.crypto.retire_inactive().await;
        info!(
            version,
            resealed = report.resealed,
            unreadable = report.unreadable,
            retired = ?retired,
            "key rotation complete"
        );
        Ok(report)
    }

    async fn wipe(&self, token: CapabilityToken) -> Result<usize, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::Wipe);
        let admitted = match self
            .admit(&mut req, &token, Operation::Admin, Requested::System)
            .await
        {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, "vault", Err(e), None).await,
        };
        // Held until the closing record is down, so no write lands between
        // the wipe and the restart of the trail.
        let _admin = self.admin.lock().await;
        let _all = self.locks.write_all().await;
        let removed = match self.wipe_ledger(&admitted.grant).await {
            Ok(removed) => removed,
            Err(e) => return self.finish(req, &admitted.actor, "vault", Err(e), None).await,
        };
        req.advance(RequestState::Executed);

        let entry = AuditEntry::new(
            admitted.actor.identity.clone(),
            admitted.actor.token_id,
            AuditOperation::Wipe,
            "vault",
        )
        .allowed(Some(&format!("slices_removed:{removed}")));
        if let Err(e) = self.audit.close_and_reset(entry, &self.crypto).await {
            error!(request = %req.id, error = %e, "closing record could not be written; vault is failing closed");
            return Err(VaultError::AuditUnavailable);
        }
        req.advance(RequestState::Audited);
        req.advance(RequestState::Responded);
        info!(identity = %admitted.actor.identity, slices = removed, "vault wiped");
        Ok(removed)
    }

    async fn wipe_ledger(&self, grant: &Grant) -> Result<usize, VaultError> {
        let removed = self
            .ledger
            .wipe(grant)
            .await
            .map_err(|e| ledger_error("vault", e))?;
        self.policy.replace_delegations(Vec::new()).await;
        Ok(removed)
    }

    async fn reload_policy(&self, token: CapabilityToken, document: PolicyDocument) -> Result<u64, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::ReloadPolicy);
        let admitted = match self
            .admit(&mut req, &token, Operation::Admin, Requested::System)
            .await
        {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, "policy", Err(e), None).await,
        };
        let result = self.apply_policy(document).await;
        let note = result.as_ref().ok().map(|version| format!("version:{version}"));
        self.finish(req, &admitted.actor, "policy", result, note)
            .await
    }

    /// Issued tokens stay valid until they expire.
    async fn apply_policy(&self, document: PolicyDocument) -> Result<u64, VaultError> {
        let checked = document.validate()?;
        let _admin = self.admin.lock().await;
        let current = self.policy.version().await;
        if checked.version() <= current {
            return Err(VaultError::InvalidRequest {
                reason: format!(
                    "policy version {} is not newer than {current}",
                    checked.version()
                ),
            });
        }
        let version = checked.version();
        self.policy.reload(checked).await;
        Ok(version)
    }

    async fn query_audit(&self, token: CapabilityToken, query: AuditQuery) -> Result<Vec<AuditRecord>, VaultError> {
        self.audit.ensure_available()?;
        let mut req = Request::received(AuditOperation::QueryAudit);
        let admitted = match self
            .admit(&mut req, &token, Operation::Admin, Requested::System)
            .await
        {
            Ok(admitted) => admitted,
            Err((actor, e)) => return self.finish(req, &actor, "audit", Err(e), None).await,
        };
        let result = self
            .audit
            .query(&query, &self.crypto)
            .await
            .map_err(VaultError::from);
        if let Err(VaultError::AuditChainCorrupted { at_sequence, reason }) = &result {
            error!(at_sequence, reason = %reason, "audit query found a corrupted chain");
        }
        let note = result.as_ref().ok().map(|records| format!("matched:{}", records.len()));
        self.finish(req, &admitted.actor, "audit", result, note)
            .await
    }

    async fn verify_audit_chain(&self) -> Result<ChainStatus, VaultError> {
        let status = self.audit.verify(&self.crypto).await?;
        match &status {
            ChainStatus::Ok { records } => info!(records, "audit chain verified"),
            ChainStatus::Corrupted { at_sequence, reason } => {
                error!(at_sequence, reason = %reason, "audit chain is corrupted");
            }
        }
        Ok(status)
    }
}

/// Handle to an open vault. Clones share the same vault.
#[derive(Clone)]
pub struct VaultHandle {
    inner: Arc<VaultInner>,
}

impl VaultHandle {
    /// Run a request in its own task and wait for it, up to the timeout.
    async fn dispatch<T, F, Fut>(&self, request: F) -> Result<T, VaultError>
    where
        F: FnOnce(Arc<VaultInner>) -> Fut,
        Fut: Future<Output = Result<T, VaultError>> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::spawn(request(Arc::clone(&self.inner)));
        let joined = match self.inner.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    let after_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    warn!(after_ms, "request timed out; it completes in the background");
                    return Err(VaultError::TimedOut { after_ms });
                }
            },
            None => task.await,
        };
        joined.map_err(|e| internal(format!("request task failed: {e}")))?
    }

    /// Obtain a capability token. The only way callers get one.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] for unknown identities, bad secrets, operations
    /// the identity's class may not hold, a zero TTL or too many live tokens.
    pub async fn request_token(
        &self,
        credentials: &Credentials,
        request: TokenRequest,
    ) -> Result<CapabilityToken, VaultError> {
        let credentials = credentials.clone();
        self.dispatch(move |vault| async move { vault.request_token(credentials, request).await })
            .await
    }

    /// Permanently revoke a token. Only its holder can present it.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] if the token is not genuine, has expired or
    /// was already revoked.
    pub async fn revoke_token(&self, token: &CapabilityToken) -> Result<(), VaultError> {
        let token = token.clone();
        self.dispatch(move |vault| async move { vault.revoke_token(token).await })
            .await
    }

    /// Decrypt one slice.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`], [`VaultError::NotFound`], or
    /// [`VaultError::Integrity`] if the stored record fails authentication.
    pub async fn read(&self, token: &CapabilityToken, key: &LogicalKey) -> Result<SliceView, VaultError> {
        let (token, key) = (token.clone(), key.clone());
        self.dispatch(move |vault| async move { vault.read(token, key).await })
            .await
    }

    /// Create or update a slice.
    ///
    /// `expected_checksum` is `None` to create a slice that must not exist
    /// yet, or the checksum from the last read to update one.
    ///
    /// # Errors
    ///
    /// [`VaultError::Conflict`] when the slice changed since it was read (or
    /// already exists on create); [`VaultError::Denied`] on token or policy
    /// rejection.
    pub async fn write(
        &self,
        token: &CapabilityToken,
        key: &LogicalKey,
        plaintext: &[u8],
        expected_checksum: Option<&str>,
    ) -> Result<WriteReceipt, VaultError> {
        let (token, key) = (token.clone(), key.clone());
        let plaintext = Zeroizing::new(plaintext.to_vec());
        let expected = expected_checksum.map(str::to_owned);
        self.dispatch(move |vault| async move { vault.write(token, key, plaintext, expected).await })
            .await
    }

    /// Hard-delete a slice. Returns the id of the tombstone left in its place.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] or [`VaultError::NotFound`].
    pub async fn purge(&self, token: &CapabilityToken, key: &LogicalKey) -> Result<Uuid, VaultError> {
        let (token, key) = (token.clone(), key.clone());
        self.dispatch(move |vault| async move { vault.purge(token, key).await })
            .await
    }

    /// Keys under `prefix` the caller may read, in order.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] when the token cannot read under the prefix.
    pub async fn list(&self, token: &CapabilityToken, prefix: &KeyPrefix) -> Result<Vec<LogicalKey>, VaultError> {
        let (token, prefix) = (token.clone(), prefix.clone());
        self.dispatch(move |vault| async move { vault.list(token, prefix).await })
            .await
    }

    /// Export every slice under `prefix` as a sealed, signed bundle.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] if any slice under the prefix is outside the
    /// token's reach; [`VaultError::Integrity`] if one fails authentication.
    pub async fn export(&self, token: &CapabilityToken, prefix: &KeyPrefix) -> Result<SignedBundle, VaultError> {
        let (token, prefix) = (token.clone(), prefix.clone());
        self.dispatch(move |vault| async move { vault.export(token, prefix).await })
            .await
    }

    /// Import a bundle exported by a vault with the same master key.
    ///
    /// Existing slices are never overwritten; they are reported as conflicts.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] if the token is not valid for writing, which
    /// is checked before the bundle is opened, or if any entry is outside the
    /// token's reach; [`VaultError::InvalidBundle`] for foreign or altered
    /// bundles.
    pub async fn import(&self, bundle: &SignedBundle, token: &CapabilityToken) -> Result<ImportReport, VaultError> {
        let (bundle, token) = (bundle.clone(), token.clone());
        self.dispatch(move |vault| async move { vault.import(bundle, token).await })
            .await
    }

    /// Let `delegate` perform `operations` on the token holder's personal
    /// slices. `ttl` of `None` lasts until revoked.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] unless the token may write the holder's
    /// personal slices; [`VaultError::InvalidRequest`] for empty or
    /// administrative operation sets.
    pub async fn delegate(
        &self,
        token: &CapabilityToken,
        delegate: &str,
        operations: impl IntoIterator<Item = Operation>,
        ttl: Option<Duration>,
    ) -> Result<Delegation, VaultError> {
        let (token, delegate) = (token.clone(), delegate.to_owned());
        let operations: BTreeSet<Operation> = operations.into_iter().collect();
        self.dispatch(move |vault| async move { vault.delegate(token, delegate, operations, ttl).await })
            .await
    }

    /// # Errors
    ///
    /// [`VaultError::NotFound`] if no such delegation exists.
    pub async fn revoke_delegation(&self, token: &CapabilityToken, delegate: &str) -> Result<(), VaultError> {
        let (token, delegate) = (token.clone(), delegate.to_owned());
        self.dispatch(move |vault| async move { vault.revoke_delegation(token, delegate).await })
            .await
    }

    /// Rotate the data key and re-seal every slice under the new one.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] without an admin token.
    pub async fn rotate_key(&self, token: &CapabilityToken) -> Result<RotationReport, VaultError> {
        let token = token.clone();
        self.dispatch(move |vault| async move { vault.rotate_key(token).await })
            .await
    }

    /// Delete every slice, tombstone and delegation, and restart the audit
    /// log with a signed closing record. Returns the number of slices removed.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] without an admin token.
    pub async fn wipe(&self, token: &CapabilityToken) -> Result<usize, VaultError> {
        let token = token.clone();
        self.dispatch(move |vault| async move { vault.wipe(token).await })
            .await
    }

    /// Replace the identity registry and class policies. The new document
    /// must carry a higher version. Returns the version now in force.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] without an admin token; [`VaultError::Config`]
    /// for an invalid document.
    pub async fn reload_policy(&self, token: &CapabilityToken, document: PolicyDocument) -> Result<u64, VaultError> {
        let token = token.clone();
        self.dispatch(move |vault| async move { vault.reload_policy(token, document).await })
            .await
    }

    /// Audit records matching `query`, oldest first. The log is verified
    /// before anything is returned.
    ///
    /// # Errors
    ///
    /// [`VaultError::Denied`] without an admin token;
    /// [`VaultError::AuditChainCorrupted`] if the log fails verification.
    pub async fn query_audit(&self, token: &CapabilityToken, query: AuditQuery) -> Result<Vec<AuditRecord>, VaultError> {
        let token = token.clone();
        self.dispatch(move |vault| async move { vault.query_audit(token, query).await })
            .await
    }

    /// Re-read the audit log and check every link.
    ///
    /// # Errors
    ///
    /// [`VaultError::AuditUnavailable`] if the log cannot be read.
    pub async fn verify_audit_chain(&self) -> Result<ChainStatus, VaultError> {
        self.dispatch(|vault| async move { vault.verify_audit_chain().await })
            .await
    }
}

impl fmt::Debug for VaultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultHandle").finish_non_exhaustive()
    }
}
