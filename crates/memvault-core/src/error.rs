//! Error types for `memvault-core`.
//!
//! Each component has its own error enum; [`VaultError`] is the taxonomy
//! callers of the facade see. No variant ever carries key material,
//! plaintext or token secrets.

use std::fmt;

use memvault_storage::StorageError;

use crate::token::Operation;

/// Errors from the crypto engine.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// Authentication failed: wrong key, wrong context, truncated or
    /// tampered blob. No plaintext is ever returned alongside this error.
    #[error("integrity check failed: {reason}")]
    Integrity { reason: String },

    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Key material supplied by configuration is malformed.
    #[error("invalid key material: {reason}")]
    InvalidKey { reason: String },
}

/// Errors from the ledger store.
#[derive(Debug, thiserror::Error)]
pub(crate) enum LedgerError {
    #[error("slice {slice} not found")]
    NotFound { slice: String },

    /// Optimistic concurrency check failed.
    #[error("slice {slice} changed since it was read")]
    Conflict { slice: String },

    /// The stored record is unreadable or its checksum does not match.
    #[error("slice {slice} is corrupted: {reason}")]
    Corrupted { slice: String, reason: String },

    /// The grant handed in does not cover the requested ledger call.
    #[error("grant for '{granted}' does not cover {required}")]
    GrantMismatch {
        granted: Operation,
        required: &'static str,
    },

    #[error("ledger encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("ledger storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the audit trail.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink '{sink}' failed: {reason}")]
    SinkFailure { sink: String, reason: String },

    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },

    /// A previous append exhausted its retries; the trail accepts nothing
    /// further until the vault is reopened.
    #[error("audit trail halted after a failed append (fail-closed)")]
    Halted,

    /// The stored log no longer verifies, so nothing read from it is trusted.
    #[error("audit chain corrupted at sequence {at_sequence}: {reason}")]
    Corrupted { at_sequence: u64, reason: String },
}

/// Errors raised while loading configuration or opening a vault.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("master key not available from {source_name}")]
    MissingKey { source_name: String },

    #[error("invalid master key: {reason}")]
    InvalidKey { reason: String },

    /// The stored keyring could not be unwrapped with the configured master key.
    #[error("master key does not match this vault")]
    WrongMasterKey,

    #[error("failed to read policy document '{path}': {reason}")]
    PolicyRead { path: String, reason: String },

    #[error("failed to parse policy document: {reason}")]
    PolicyParse { reason: String },

    /// The policy document's checksum does not match its content.
    #[error("policy document integrity check failed (expected {expected}, computed {computed})")]
    PolicyIntegrity { expected: String, computed: String },

    #[error("invalid policy document: {reason}")]
    InvalidPolicy { reason: String },

    #[error("audit chain corrupted at sequence {at_sequence}: {reason}")]
    AuditChainCorrupted { at_sequence: u64, reason: String },

    #[error("audit log unavailable: {0}")]
    Audit(#[from] AuditError),

    #[error("storage unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("keyring unavailable: {0}")]
    Crypto(#[from] CryptoError),
}

/// Why a request was refused by the token authority or the policy engine.
///
/// Denials are definitive: the facade never retries them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    UnknownIdentity,
    BadCredentials,
    UnknownToken,
    Expired,
    Revoked,
    /// A single-use token was already spent.
    Consumed,
    OperationNotGranted { operation: Operation },
    OutOfScope { key: String },
    RateLimited,
    /// The identity class may not perform this operation on this slice kind.
    ClassForbids { operation: Operation, kind: String },
    /// Acting on another identity's personal slice needs a delegation.
    DelegationRequired { owner: String },
    TooManyTokens { limit: u32 },
    InvalidTtl,
    InvalidScope { reason: String },
}

impl DenyReason {
    /// Stable machine-readable reason code, recorded in the audit trail.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownIdentity => "unknown_identity",
            Self::BadCredentials => "bad_credentials",
            Self::UnknownToken => "unknown_token",
            Self::Expired => "token_expired",
            Self::Revoked => "token_revoked",
            Self::Consumed => "token_consumed",
            Self::OperationNotGranted { .. } => "operation_not_granted",
            Self::OutOfScope { .. } => "out_of_scope",
            Self::RateLimited => "rate_limited",
            Self::ClassForbids { .. } => "class_forbids",
            Self::DelegationRequired { .. } => "delegation_required",
            Self::TooManyTokens { .. } => "too_many_tokens",
            Self::InvalidTtl => "invalid_ttl",
            Self::InvalidScope { .. } => "invalid_scope",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperationNotGranted { operation } => {
                write!(f, "token does not grant '{operation}'")
            }
            Self::OutOfScope { key } => write!(f, "'{key}' is outside the token scope"),
            Self::ClassForbids { operation, kind } => {
                write!(f, "identity class may not {operation} {kind} slices")
            }
            Self::DelegationRequired { owner } => {
                write!(f, "no delegation from owner '{owner}'")
            }
            Self::TooManyTokens { limit } => write!(f, "active token limit {limit} reached"),
            Self::InvalidScope { reason } => write!(f, "invalid scope: {reason}"),
            other => f.write_str(other.code()),
        }
    }
}

/// Errors returned by the vault facade.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Token or policy rejection. Never retried automatically.
    #[error("denied: {reason}")]
    Denied { reason: DenyReason },

    /// Optimistic concurrency collision; re-read and retry.
    #[error("conflict on '{key}': slice changed since it was read")]
    Conflict { key: String },

    /// The stored record failed authentication; recorded as a corruption event.
    #[error("integrity failure on '{key}'")]
    Integrity { key: String },

    #[error("'{key}' not found")]
    NotFound { key: String },

    /// The backing medium failed after bounded retries.
    #[error("storage failure: {reason}")]
    Storage { reason: String },

    /// The audit trail cannot record; the vault refuses new requests.
    #[error("audit trail unavailable; vault is failing closed")]
    AuditUnavailable,

    #[error("audit chain corrupted at sequence {at_sequence}: {reason}")]
    AuditChainCorrupted { at_sequence: u64, reason: String },

    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("invalid export bundle: {reason}")]
    InvalidBundle { reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The caller stopped waiting. Work already committed stands.
    #[error("request timed out after {after_ms} ms")]
    TimedOut { after_ms: u64 },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl VaultError {
    pub(crate) fn denied(reason: DenyReason) -> Self {
        Self::Denied { reason }
    }

    /// The reason code recorded in the audit trail for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Denied { reason } => reason.code(),
            Self::Conflict { .. } => "conflict",
            Self::Integrity { .. } => "integrity",
            Self::NotFound { .. } => "not_found",
            Self::Storage { .. } => "storage",
            Self::AuditUnavailable => "audit_unavailable",
            Self::AuditChainCorrupted { .. } => "audit_chain_corrupted",
            Self::InvalidKey { .. } => "invalid_key",
            Self::InvalidBundle { .. } => "invalid_bundle",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::TimedOut { .. } => "timed_out",
            Self::Config(_) => "config",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<AuditError> for VaultError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::Corrupted { at_sequence, reason } => Self::AuditChainCorrupted { at_sequence, reason },
            _ => Self::AuditUnavailable,
        }
    }
}
