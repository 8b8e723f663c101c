//! Core library for `memvault`.
//!
//! A secure memory vault: every slice is sealed with AES-256-GCM under a
//! versioned data key, every request must present a capability token, the
//! per-identity policy engine decides what each token may touch, and every
//! request leaves exactly one record in a hash-chained audit trail.
//!
//! The storage backend is built from configuration inside [`open_vault`] and
//! handed only to the private ledger. Callers work through [`VaultHandle`].

pub mod audit;
pub mod audit_file;
pub mod bundle;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
mod ledger;
mod locks;
pub mod policy;
pub mod retry;
mod serde_b64;
pub mod slice;
pub mod token;
pub mod vault;

pub use audit::{AuditOperation, AuditOutcome, AuditQuery, AuditRecord, AuditSink, ChainStatus, MemoryAuditSink};
pub use audit_file::FileAuditSink;
pub use bundle::{ImportReport, SignedBundle};
pub use config::{AuditConfig, KeySource, PolicySource, StorageConfig, VaultConfig};
pub use crypto::EncryptionKey;
pub use error::{ConfigError, DenyReason, VaultError};
pub use identity::{Credentials, Identity, IdentityClass, TrustTier};
pub use policy::{ClassPolicy, Delegation, PolicyDocument, SealedPolicy};
pub use slice::{KeyPrefix, LogicalKey, SliceKind, SliceView, WriteReceipt};
pub use token::{CapabilityToken, Operation, Scope, TokenRequest, TokenUsage};
pub use vault::{RotationReport, VaultHandle, open_vault};
