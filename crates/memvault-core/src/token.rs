//! Capability tokens and the authority that issues and validates them.
//!
//! # Security model
//!
//! - A token is an id (UUID v4) plus a 256-bit random secret. Callers cannot
//!   construct one: there is no public constructor and no `Deserialize`.
//! - The authority keeps only `SHA-256(secret)` and compares it with
//!   `subtle::ConstantTimeEq`.
//! - Tokens are short-lived and never renewable. Expired or revoked tokens
//!   fail every check, whoever holds them.
//! - A successful validation yields a [`Validated`]. Combined with a policy
//!   [`Clearance`] it becomes the [`Grant`] the ledger demands on every call.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{random_secret, sha256_hex};
use crate::error::{DenyReason, VaultError};
use crate::identity::IdentityClass;
use crate::policy::{Clearance, PolicyEngine};
use crate::slice::{KeyPrefix, LogicalKey, SliceId, SliceKind};

/// An operation a token may grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Export,
    Purge,
    /// Key rotation, wipe and policy reload. Only for classes that may administer.
    Admin,
}

impl Operation {
    /// The four data operations, without `Admin`.
    pub const DATA: [Self; 4] = [Self::Read, Self::Write, Self::Export, Self::Purge];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Export => "export",
            Self::Purge => "purge",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource scope of a token: a slice kind and a glob over logical keys.
///
/// `*` matches any run of characters, dots included, so
/// `personal.alden.*` covers every slice under `personal.alden`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    kind: SliceKind,
    pattern: String,
}

impl Scope {
    /// # Errors
    ///
    /// Returns [`VaultError::Denied`] with [`DenyReason::InvalidScope`] when the
    /// pattern does not start with the kind's segment or contains characters
    /// outside keys and globs.
    pub fn new(kind: SliceKind, pattern: impl Into<String>) -> Result<Self, VaultError> {
        let pattern = pattern.into();
        let first = pattern.split('.').next().unwrap_or_default();
        if first != kind.as_str() {
            return Err(VaultError::denied(DenyReason::InvalidScope {
                reason: format!("pattern '{pattern}' must start with '{kind}'"),
            }));
        }
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*' | '?');
        if !pattern.chars().all(allowed) {
            return Err(VaultError::denied(DenyReason::InvalidScope {
                reason: format!("pattern '{pattern}' contains unsupported characters"),
            }));
        }
        Ok(Self { kind, pattern })
    }

    /// Scope covering everything under `prefix`.
    ///
    /// # Errors
    ///
    /// Same as [`Scope::new`].
    pub fn under(prefix: &KeyPrefix) -> Result<Self, VaultError> {
        Self::new(prefix.kind(), format!("{}.*", prefix.as_str()))
    }

    #[must_use]
    pub fn kind(&self) -> SliceKind {
        self.kind
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn covers(&self, key: &LogicalKey) -> bool {
        key.kind() == self.kind && glob_match::glob_match(&self.pattern, key.as_str())
    }

    /// Whether any key under `prefix` could fall inside this scope.
    #[must_use]
    pub fn overlaps(&self, prefix: &KeyPrefix) -> bool {
        if prefix.kind() != self.kind {
            return false;
        }
        let literal = self
            .pattern
            .split(['*', '?'])
            .next()
            .unwrap_or_default();
        literal.starts_with(prefix.as_str()) || prefix.as_str().starts_with(literal)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenUsage {
    SingleUse,
    #[default]
    MultiUse,
}

/// What a caller asks for in `request_token`.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub scope: Scope,
    pub operations: BTreeSet<Operation>,
    pub ttl: Duration,
    pub usage: TokenUsage,
}

impl TokenRequest {
    #[must_use]
    pub fn new(scope: Scope, operations: impl IntoIterator<Item = Operation>, ttl: Duration) -> Self {
        Self {
            scope,
            operations: operations.into_iter().collect(),
            ttl,
            usage: TokenUsage::MultiUse,
        }
    }

    #[must_use]
    pub fn single_use(mut self) -> Self {
        self.usage = TokenUsage::SingleUse;
        self
    }
}

/// A capability token held by a caller.
///
/// Only the vault creates these. Cloning shares the same capability.
#[derive(Clone)]
pub struct CapabilityToken {
    id: Uuid,
    secret: Zeroizing<String>,
    expires_at: DateTime<Utc>,
    usage: TokenUsage,
}

impl CapabilityToken {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityToken")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("usage", &self.usage)
            .finish()
    }
}

/// Limits the policy engine imposes on a token at issuance.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IssueTerms {
    pub ttl: Duration,
    pub usage: TokenUsage,
    pub max_tokens: u32,
}

struct TokenRecord {
    secret_hash: String,
    identity: String,
    class: IdentityClass,
    scope: Scope,
    operations: BTreeSet<Operation>,
    expires_at: DateTime<Utc>,
    usage: TokenUsage,
    revoked: bool,
    consumed: bool,
}

impl TokenRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at && !self.revoked && !self.consumed
    }

    fn secret_matches(&self, token: &CapabilityToken) -> bool {
        let presented = sha256_hex(token.secret.as_bytes());
        presented
            .as_bytes()
            .ct_eq(self.secret_hash.as_bytes())
            .into()
    }
}

/// What a validation was asked to cover.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Requested<'a> {
    Key(&'a LogicalKey),
    Prefix(&'a KeyPrefix),
    System,
    /// An import whose prefix is only known once the bundle is opened.
    Bundle,
}

/// Proof that a token passed validation for one operation.
#[derive(Debug, Clone)]
pub(crate) struct Validated {
    token_id: Uuid,
    identity: String,
    class: IdentityClass,
    operation: Operation,
    scope: Scope,
}

impl Validated {
    pub(crate) fn token_id(&self) -> Uuid {
        self.token_id
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn class(&self) -> IdentityClass {
        self.class
    }

    pub(crate) fn operation(&self) -> Operation {
        self.operation
    }

    pub(crate) fn covers(&self, key: &LogicalKey) -> bool {
        self.scope.covers(key)
    }

    pub(crate) fn overlaps(&self, prefix: &KeyPrefix) -> bool {
        self.scope.overlaps(prefix)
    }

    /// Combine with a policy clearance issued for this same validation.
    pub(crate) fn grant(&self, clearance: Clearance) -> Result<Grant, VaultError> {
        if clearance.token_id() != self.token_id || clearance.operation() != self.operation {
            return Err(VaultError::Internal {
                reason: "clearance was issued for a different request".to_owned(),
            });
        }
        Ok(Grant {
            identity: self.identity.clone(),
            token_id: self.token_id,
            operation: self.operation,
            target: clearance.into_target(),
        })
    }
}

/// What a grant lets the ledger touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GrantTarget {
    Slice(SliceId),
    Prefix(KeyPrefix),
    /// Vault-wide administration: rotation and wipe.
    System,
}

/// Witness that a validated token and the policy engine both approved one
/// operation on one target. The ledger refuses to act without one.
#[derive(Debug, Clone)]
pub(crate) struct Grant {
    identity: String,
    token_id: Uuid,
    operation: Operation,
    target: GrantTarget,
}

impl Grant {
    #[cfg(test)]
    pub(crate) fn for_tests(identity: &str, operation: Operation, target: GrantTarget) -> Self {
        Self {
            identity: identity.to_owned(),
            token_id: Uuid::new_v4(),
            operation,
            target,
        }
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn token_id(&self) -> Uuid {
        self.token_id
    }

    pub(crate) fn operation(&self) -> Operation {
        self.operation
    }

    pub(crate) fn target(&self) -> &GrantTarget {
        &self.target
    }
}

/// Issues, validates and revokes capability tokens. Token state lives only
/// in memory; reopening a vault invalidates every outstanding token.
#[derive(Default)]
pub(crate) struct TokenAuthority {
    records: Mutex<HashMap<Uuid, TokenRecord>>,
}

impl TokenAuthority {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Issue a token for an authenticated identity under `terms`.
    pub(crate) async fn issue(
        &self,
        identity: &str,
        class: IdentityClass,
        scope: Scope,
        operations: BTreeSet<Operation>,
        terms: IssueTerms,
    ) -> Result<CapabilityToken, DenyReason> {
        if terms.ttl.is_zero() {
            return Err(DenyReason::InvalidTtl);
        }
        let ttl = chrono::Duration::from_std(terms.ttl).map_err(|_| DenyReason::InvalidTtl)?;
        let now = Utc::now();

        let mut records = self.records.lock().await;
        records.retain(|_, r| now < r.expires_at);

        let active = records
            .values()
            .filter(|r| r.identity == identity && r.is_live(now))
            .count();
        if active >= usize::try_from(terms.max_tokens).unwrap_or(usize::MAX) {
            return Err(DenyReason::TooManyTokens {
                limit: terms.max_tokens,
            });
        }

        let id = Uuid::new_v4();
        let secret = random_secret();
        let expires_at = now + ttl;
        records.insert(
            id,
            TokenRecord {
                secret_hash: sha256_hex(secret.as_bytes()),
                identity: identity.to_owned(),
                class,
                scope,
                operations,
                expires_at,
                usage: terms.usage,
                revoked: false,
                consumed: false,
            },
        );

        info!(identity = %identity, token_id = %id, expires_at = %expires_at, "token issued");
        Ok(CapabilityToken {
            id,
            secret,
            expires_at,
            usage: terms.usage,
        })
    }

    /// Run every token check, in order, for one operation.
    ///
    /// Single-use tokens are spent by a successful validation.
    pub(crate) async fn validate(
        &self,
        token: &CapabilityToken,
        operation: Operation,
        requested: Requested<'_>,
        policy: &PolicyEngine,
    ) -> Result<Validated, DenyReason> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&token.id)
            .filter(|r| r.secret_matches(token))
            .ok_or(DenyReason::UnknownToken)?;

        if Utc::now() >= record.expires_at {
            return Err(DenyReason::Expired);
        }
        if record.revoked {
            return Err(DenyReason::Revoked);
        }
        if record.consumed {
            return Err(DenyReason::Consumed);
        }
        if !record.operations.contains(&operation) {
            return Err(DenyReason::OperationNotGranted { operation });
        }
        let in_scope = match requested {
            Requested::Key(key) => record.scope.covers(key),
            Requested::Prefix(prefix) => record.scope.overlaps(prefix),
            Requested::System | Requested::Bundle => true,
        };
        if !in_scope {
            let key = match requested {
                Requested::Key(key) => key.to_string(),
                Requested::Prefix(prefix) => prefix.to_string(),
                Requested::System | Requested::Bundle => String::new(),
            };
            return Err(DenyReason::OutOfScope { key });
        }
        if !policy.consume_budget(&record.identity, record.class).await {
            return Err(DenyReason::RateLimited);
        }
        if record.usage == TokenUsage::SingleUse {
            record.consumed = true;
        }

        debug!(token_id = %token.id, operation = %operation, "token validated");
        Ok(Validated {
            token_id: token.id,
            identity: record.identity.clone(),
            class: record.class,
            operation,
            scope: record.scope.clone(),
        })
    }

    /// Identity behind a token, if the token is genuine. Used to attribute
    /// audit records for denied requests.
    pub(crate) async fn holder(&self, token: &CapabilityToken) -> Option<String> {
        let records = self.records.lock().await;
        records
            .get(&token.id)
            .filter(|r| r.secret_matches(token))
            .map(|r| r.identity.clone())
    }

    /// Revoke a token presented by its holder. Returns the holder's identity.
    ///
    /// A token that has already expired or been revoked is refused with the
    /// same reason validation would give.
    pub(crate) async fn revoke_presented(&self, token: &CapabilityToken) -> Result<String, DenyReason> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&token.id)
            .filter(|r| r.secret_matches(token))
            .ok_or(DenyReason::UnknownToken)?;
        if Utc::now() >= record.expires_at {
            return Err(DenyReason::Expired);
        }
        if record.revoked {
            return Err(DenyReason::Revoked);
        }
        record.revoked = true;
        info!(token_id = %token.id, identity = %record.identity, "token revoked");
        Ok(record.identity.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::{Identity, TrustTier};
    use crate::policy::PolicyDocument;

    fn key(raw: &str) -> LogicalKey {
        LogicalKey::parse(raw).unwrap()
    }

    fn terms(ttl_secs: u64, usage: TokenUsage) -> IssueTerms {
        IssueTerms {
            ttl: Duration::from_secs(ttl_secs),
            usage,
            max_tokens: 4,
        }
    }

    fn policy() -> PolicyEngine {
        let doc = PolicyDocument::new().with_identity(Identity {
            id: "alden".to_owned(),
            class: IdentityClass::Primary,
            trust_tier: TrustTier::Core,
            secret_hash: sha256_hex(b"pw"),
        });
        PolicyEngine::new(doc.validate().unwrap())
    }

    async fn issue(
        authority: &TokenAuthority,
        ops: &[Operation],
        terms: IssueTerms,
    ) -> CapabilityToken {
        authority
            .issue(
                "alden",
                IdentityClass::Primary,
                Scope::new(SliceKind::Personal, "personal.alden.*").unwrap(),
                ops.iter().copied().collect(),
                terms,
            )
            .await
            .unwrap()
    }

    #[test]
    fn scope_glob_crosses_segments() {
        let scope = Scope::new(SliceKind::Personal, "personal.alden.*").unwrap();
        assert!(scope.covers(&key("personal.alden.notes")));
        assert!(scope.covers(&key("personal.alden.journal.today")));
        assert!(!scope.covers(&key("personal.bryn.notes")));
        assert!(!scope.covers(&key("communal.notes")));
    }

    #[test]
    fn scope_must_name_its_kind() {
        assert!(Scope::new(SliceKind::Communal, "personal.alden.*").is_err());
        assert!(Scope::new(SliceKind::Communal, "communal/../x").is_err());
        let prefix = KeyPrefix::parse("communal.recipes").unwrap();
        let scope = Scope::under(&prefix).unwrap();
        assert_eq!(scope.pattern(), "communal.recipes.*");
    }

    #[test]
    fn scope_overlap_with_prefixes() {
        let scope = Scope::new(SliceKind::Personal, "personal.alden.*").unwrap();
        assert!(scope.overlaps(&KeyPrefix::parse("personal").unwrap()));
        assert!(scope.overlaps(&KeyPrefix::parse("personal.alden").unwrap()));
        assert!(scope.overlaps(&KeyPrefix::parse("personal.alden.journal").unwrap()));
        assert!(!scope.overlaps(&KeyPrefix::parse("personal.bryn").unwrap()));
        assert!(!scope.overlaps(&KeyPrefix::parse("communal").unwrap()));
    }

    #[tokio::test]
    async fn valid_token_passes_and_records_identity() {
        let authority = TokenAuthority::new();
        let policy = policy();
        let token = issue(&authority, &[Operation::Read], terms(60, TokenUsage::MultiUse)).await;
        let k = key("personal.alden.notes");

        let validated = authority
            .validate(&token, Operation::Read, Requested::Key(&k), &policy)
            .await
            .unwrap();
        assert_eq!(validated.identity(), "alden");
        assert_eq!(validated.token_id(), token.id());
    }

    #[tokio::test]
    async fn checks_fail_with_specific_reasons() {
        let authority = TokenAuthority::new();
        let policy = policy();
        let token = issue(&authority, &[Operation::Read], terms(60, TokenUsage::MultiUse)).await;

        let inside = key("personal.alden.notes");
        let outside = key("personal.bryn.notes");
        let denied = authority
            .validate(&token, Operation::Write, Requested::Key(&inside), &policy)
            .await;
        assert!(matches!(
            denied,
            Err(DenyReason::OperationNotGranted { operation: Operation::Write })
        ));
        let denied = authority
            .validate(&token, Operation::Read, Requested::Key(&outside), &policy)
            .await;
        assert!(matches!(denied, Err(DenyReason::OutOfScope { .. })));
    }

    #[tokio::test]
    async fn forged_secret_is_unknown() {
        let authority = TokenAuthority::new();
        let policy = policy();
        let token = issue(&authority, &[Operation::Read], terms(60, TokenUsage::MultiUse)).await;
        let mut forged = token.clone();
        forged.secret = Zeroizing::new("0".repeat(64));

        let k = key("personal.alden.notes");
        let denied = authority
            .validate(&forged, Operation::Read, Requested::Key(&k), &policy)
            .await;
        assert!(matches!(denied, Err(DenyReason::UnknownToken)));
        assert!(authority.holder(&forged).await.is_none());
    }

    #[tokio::test]
    async fn revoked_is_checked_before_operation() {
        let authority = TokenAuthority::new();
        let policy = policy();
        let token = issue(&authority, &[Operation::Read], terms(60, TokenUsage::MultiUse)).await;
        assert_eq!(authority.revoke_presented(&token).await.unwrap(), "alden");

        let k = key("personal.alden.notes");
        let denied = authority
            .validate(&token, Operation::Purge, Requested::Key(&k), &policy)
            .await;
        assert!(matches!(denied, Err(DenyReason::Revoked)));
    }

    #[tokio::test]
    async fn revoking_twice_is_refused() {
        let authority = TokenAuthority::new();
        let token = issue(&authority, &[Operation::Read], terms(60, TokenUsage::MultiUse)).await;
        authority.revoke_presented(&token).await.unwrap();
        assert_eq!(authority.revoke_presented(&token).await, Err(DenyReason::Revoked));

        let mut forged = token.clone();
        forged.secret = Zeroizing::new("0".repeat(64));
        assert_eq!(authority.revoke_presented(&forged).await, Err(DenyReason::UnknownToken));
    }

    #[tokio::test]
    async fn expired_tokens_cannot_be_revoked() {
        let authority = TokenAuthority::new();
        let token = issue(&authority, &[Operation::Read], terms(1, TokenUsage::MultiUse)).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(authority.revoke_presented(&token).await, Err(DenyReason::Expired));
    }

    #[tokio::test]
    async fn bundle_requests_defer_the_scope_check() {
        let authority = TokenAuthority::new();
        let policy = policy();
        let token = issue(&authority, &[Operation::Write], terms(60, TokenUsage::MultiUse)).await;
        let validated = authority
            .validate(&token, Operation::Write, Requested::Bundle, &policy)
            .await
            .unwrap();
        assert!(validated.overlaps(&KeyPrefix::parse("personal.alden").unwrap()));
        assert!(!validated.overlaps(&KeyPrefix::parse("communal").unwrap()));
    }

    #[tokio::test]
    async fn single_use_tokens_are_spent() {
        let authority = TokenAuthority::new();
        let policy = policy();
        let token = issue(&authority, &[Operation::Read], terms(60, TokenUsage::SingleUse)).await;
        let k = key("personal.alden.notes");

        authority
            .validate(&token, Operation::Read, Requested::Key(&k), &policy)
            .await
            .unwrap();
        let second = authority
            .validate(&token, Operation::Read, Requested::Key(&k), &policy)
            .await;
        assert!(matches!(second, Err(DenyReason::Consumed)));
    }

    #[tokio::test]
    async fn expired_tokens_are_denied() {
        let authority = TokenAuthority::new();
        let policy = policy();
        let token = issue(&authority, &[Operation::Read], terms(1, TokenUsage::MultiUse)).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let k = key("personal.alden.notes");
        let denied = authority
            .validate(&token, Operation::Read, Requested::Key(&k), &policy)
            .await;
        assert!(matches!(denied, Err(DenyReason::Expired)));
    }

    #[tokio::test]
    async fn zero_ttl_and_token_limit() {
        let authority = TokenAuthority::new();
        let scope = Scope::new(SliceKind::Personal, "personal.alden.*").unwrap();
        let zero = authority
            .issue(
                "alden",
                IdentityClass::Primary,
                scope.clone(),
                BTreeSet::from([Operation::Read]),
                terms(0, TokenUsage::MultiUse),
            )
            .await;
        assert!(matches!(zero, Err(DenyReason::InvalidTtl)));

        for _ in 0..4 {
            issue(&authority, &[Operation::Read], terms(60, TokenUsage::MultiUse)).await;
        }
        let fifth = authority
            .issue(
                "alden",
                IdentityClass::Primary,
                scope,
                BTreeSet::from([Operation::Read]),
                terms(60, TokenUsage::MultiUse),
            )
            .await;
        assert!(matches!(fifth, Err(DenyReason::TooManyTokens { limit: 4 })));
    }

    #[test]
    fn token_debug_hides_secret() {
        let token = CapabilityToken {
            id: Uuid::new_v4(),
            secret: Zeroizing::new("abcdef".to_owned()),
            expires_at: Utc::now(),
            usage: TokenUsage::MultiUse,
        };
        assert!(!format!("{token:?}").contains("abcdef"));
    }
}
