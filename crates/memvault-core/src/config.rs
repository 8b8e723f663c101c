//! Vault configuration.
//!
//! Built explicitly with [`VaultConfig::new`] and the `with_*` methods, or
//! loaded from `MEMVAULT_*` environment variables with
//! [`VaultConfig::from_env`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditSink;
use crate::crypto::EncryptionKey;
use crate::error::ConfigError;
use crate::locks::DEFAULT_STRIPES;
use crate::policy::{PolicyDocument, SealedPolicy};
use crate::retry::RetryPolicy;

/// Default environment variable holding the base64 master key.
pub const DEFAULT_KEY_ENV: &str = "MEMVAULT_MASTER_KEY";
const DEFAULT_STORAGE_PATH: &str = "./data/memvault.redb";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_IMPORT_CHUNK: usize = 32;

/// Where sealed slices live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// Nothing survives the process.
    Memory,
    Redb { path: PathBuf },
    RocksDb { path: PathBuf },
}

/// Where the master key comes from.
#[derive(Clone)]
pub enum KeySource {
    /// Base64-encoded key material.
    Inline(String),
    /// Base64 key read from an environment variable at open time.
    Env { var: String },
    /// Key handed over by the embedding application.
    External(EncryptionKey),
}

impl KeySource {
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingKey`] if the environment variable is
    /// unset, or [`ConfigError::InvalidKey`] if the material is not a base64
    /// 32-byte key.
    pub fn resolve(&self) -> Result<EncryptionKey, ConfigError> {
        let decode = |encoded: &str| {
            EncryptionKey::from_base64(encoded).map_err(|e| ConfigError::InvalidKey {
                reason: e.to_string(),
            })
        };
        match self {
            Self::Inline(encoded) => decode(encoded),
            Self::Env { var } => {
                let value = zeroize::Zeroizing::new(std::env::var(var).map_err(|_| {
                    ConfigError::MissingKey {
                        source_name: format!("environment variable {var}"),
                    }
                })?);
                decode(&value)
            }
            Self::External(key) => Ok(key.clone()),
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(_) => f.write_str("Inline([REDACTED])"),
            Self::Env { var } => f.debug_struct("Env").field("var", var).finish(),
            Self::External(_) => f.write_str("External([REDACTED])"),
        }
    }
}

/// Where audit records go.
#[derive(Clone)]
pub enum AuditConfig {
    Memory,
    /// JSON lines, one record per line.
    File { path: PathBuf },
    /// A sink supplied by the embedding application.
    Sink(Arc<dyn AuditSink>),
}

impl fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::File { path } => f.debug_struct("File").field("path", path).finish(),
            Self::Sink(sink) => f.debug_tuple("Sink").field(&sink.name()).finish(),
        }
    }
}

/// Where the identity registry and class policies come from.
#[derive(Debug, Clone)]
pub enum PolicySource {
    Inline(PolicyDocument),
    /// A sealed policy file; its checksum is verified on load.
    File { path: PathBuf },
}

impl PolicySource {
    /// # Errors
    ///
    /// Returns [`ConfigError::PolicyRead`], [`ConfigError::PolicyParse`] or
    /// [`ConfigError::PolicyIntegrity`] for unusable policy files.
    pub fn resolve(&self) -> Result<PolicyDocument, ConfigError> {
        match self {
            Self::Inline(document) => Ok(document.clone()),
            Self::File { path } => SealedPolicy::load(path)?.open(),
        }
    }
}

/// Everything `open_vault` needs.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub storage: StorageConfig,
    pub key_source: KeySource,
    pub audit: AuditConfig,
    pub policy: PolicySource,
    /// How long a caller waits for a request. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Refuse to open when the stored audit chain does not verify.
    pub verify_audit_on_open: bool,
    pub storage_retry: RetryPolicy,
    pub audit_retry: RetryPolicy,
    pub lock_stripes: usize,
    /// Slices written per batch during import and key rotation.
    pub chunk_size: usize,
}

impl VaultConfig {
    /// In-memory storage and audit, empty registry, default limits.
    #[must_use]
    pub fn new(key_source: KeySource) -> Self {
        Self {
            storage: StorageConfig::Memory,
            key_source,
            audit: AuditConfig::Memory,
            policy: PolicySource::Inline(PolicyDocument::new()),
            request_timeout: Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
            verify_audit_on_open: true,
            storage_retry: RetryPolicy::default(),
            audit_retry: RetryPolicy::default(),
            lock_stripes: DEFAULT_STRIPES,
            chunk_size: DEFAULT_IMPORT_CHUNK,
        }
    }

    #[must_use]
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditConfig) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: PolicySource) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_verify_audit_on_open(mut self, verify: bool) -> Self {
        self.verify_audit_on_open = verify;
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Load configuration from environment variables.
    ///
    /// - `MEMVAULT_STORAGE`: `memory`, `redb` or `rocksdb` (default `memory`)
    /// - `MEMVAULT_STORAGE_PATH`: path for persistent backends (default `./data/memvault.redb`)
    /// - `MEMVAULT_KEY_ENV`: variable holding the base64 master key (default `MEMVAULT_MASTER_KEY`)
    /// - `MEMVAULT_AUDIT_FILE`: audit log path (default: in-memory audit)
    /// - `MEMVAULT_POLICY_FILE`: sealed policy document (default: empty registry)
    /// - `MEMVAULT_REQUEST_TIMEOUT_MS`: request timeout, `0` disables (default `30000`)
    /// - `MEMVAULT_VERIFY_AUDIT_ON_OPEN`: `true`/`false` (default `true`)
    ///
    /// The key itself is read when the vault opens, not here.
    #[must_use]
    pub fn from_env() -> Self {
        let storage_path = PathBuf::from(
            std::env::var("MEMVAULT_STORAGE_PATH").unwrap_or_else(|_| DEFAULT_STORAGE_PATH.to_owned()),
        );
        let storage = match std::env::var("MEMVAULT_STORAGE")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "redb" => StorageConfig::Redb { path: storage_path },
            "rocksdb" => StorageConfig::RocksDb { path: storage_path },
            _ => StorageConfig::Memory,
        };

        let key_source = KeySource::Env {
            var: std::env::var("MEMVAULT_KEY_ENV").unwrap_or_else(|_| DEFAULT_KEY_ENV.to_owned()),
        };

        let audit = std::env::var("MEMVAULT_AUDIT_FILE")
            .ok()
            .map_or(AuditConfig::Memory, |path| AuditConfig::File {
                path: PathBuf::from(path),
            });

        let policy = std::env::var("MEMVAULT_POLICY_FILE").ok().map_or_else(
            || PolicySource::Inline(PolicyDocument::new()),
            |path| PolicySource::File {
                path: PathBuf::from(path),
            },
        );

        let timeout_ms = std::env::var("MEMVAULT_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let request_timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));

        let verify_audit_on_open = std::env::var("MEMVAULT_VERIFY_AUDIT_ON_OPEN")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            storage,
            audit,
            policy,
            request_timeout,
            verify_audit_on_open,
            ..Self::new(key_source)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::identity::{Identity, IdentityClass, TrustTier};

    #[test]
    fn inline_keys_are_validated() {
        let key = EncryptionKey::generate();
        let resolved = KeySource::Inline(key.to_base64().to_string()).resolve().unwrap();
        assert_eq!(resolved.as_bytes(), key.as_bytes());

        assert!(matches!(
            KeySource::Inline("too-short".to_owned()).resolve(),
            Err(ConfigError::InvalidKey { .. })
        ));
    }

    #[test]
    fn unset_key_variable_is_reported_by_name() {
        let source = KeySource::Env {
            var: "MEMVAULT_TEST_KEY_THAT_IS_NEVER_SET".to_owned(),
        };
        match source.resolve() {
            Err(ConfigError::MissingKey { source_name }) => {
                assert!(source_name.contains("MEMVAULT_TEST_KEY_THAT_IS_NEVER_SET"));
            }
            other => panic!("expected MissingKey, got {other:?}"),
        }
    }

    #[test]
    fn key_sources_do_not_print_material() {
        let key = EncryptionKey::generate();
        let encoded = key.to_base64().to_string();
        let rendered = format!("{:?}", KeySource::Inline(encoded.clone()));
        assert!(!rendered.contains(&encoded));
    }

    #[test]
    fn policy_files_are_integrity_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let doc = PolicyDocument::new().with_identity(Identity {
            id: "alden".to_owned(),
            class: IdentityClass::Primary,
            trust_tier: TrustTier::Core,
            secret_hash: crate::crypto::sha256_hex(b"pw"),
        });
        std::fs::write(&path, doc.clone().seal().unwrap().to_json().unwrap()).unwrap();

        let source = PolicySource::File { path: path.clone() };
        assert_eq!(source.resolve().unwrap(), doc);

        let tampered = std::fs::read_to_string(&path).unwrap().replace("core", "untrusted");
        std::fs::write(&path, tampered).unwrap();
        assert!(matches!(
            source.resolve(),
            Err(ConfigError::PolicyIntegrity { .. })
        ));

        let missing = PolicySource::File {
            path: dir.path().join("absent.json"),
        };
        assert!(matches!(missing.resolve(), Err(ConfigError::PolicyRead { .. })));
    }

    #[test]
    fn builder_defaults() {
        let config = VaultConfig::new(KeySource::External(EncryptionKey::generate()))
            .with_request_timeout(None)
            .with_chunk_size(0);
        assert_eq!(config.storage, StorageConfig::Memory);
        assert!(config.request_timeout.is_none());
        assert_eq!(config.chunk_size, 1);
        assert!(config.verify_audit_on_open);
    }
}
