//! Security policy engine.
//!
//! Holds the identity registry and, per identity class, which operations are
//! allowed on personal and communal slices, how many tokens may be live, how
//! long they may last and how fast they may be used. Also holds the owner
//! delegations that let one identity act on another's personal slices.
//!
//! Configuration arrives as a [`PolicyDocument`], usually loaded from a
//! [`SealedPolicy`] file whose checksum is verified before anything in it is
//! trusted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::sha256_hex;
use crate::error::{ConfigError, DenyReason};
use crate::identity::{Credentials, Identity, IdentityClass, RiskLevel};
use crate::slice::{KeyPrefix, LogicalKey, SliceKind, is_segment};
use crate::token::{GrantTarget, IssueTerms, Operation, TokenRequest, TokenUsage, Validated};

/// TTL ceiling for high-risk identities.
const HIGH_RISK_TTL: Duration = Duration::from_secs(60);
/// Floor for the elevated-risk TTL cap.
const ELEVATED_MIN_TTL: Duration = Duration::from_secs(30);

/// Token-bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Burst size.
    pub capacity: u32,
    pub refill_per_minute: u32,
}

/// What one identity class may do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassPolicy {
    pub personal: BTreeSet<Operation>,
    pub communal: BTreeSet<Operation>,
    /// May hold `admin` tokens: key rotation, wipe, policy reload.
    #[serde(default)]
    pub administer: bool,
    pub max_tokens: u32,
    pub max_ttl_secs: u64,
    pub rate: RateLimit,
}

impl ClassPolicy {
    /// Built-in policy for a class.
    #[must_use]
    pub fn defaults_for(class: IdentityClass) -> Self {
        use Operation::{Export, Purge, Read, Write};

        let (personal, communal, administer, max_tokens, max_ttl_secs, capacity, refill) =
            match class {
                IdentityClass::Primary => (
                    vec![Read, Write, Export, Purge],
                    vec![Read, Write, Export, Purge],
                    false,
                    16,
                    900,
                    50,
                    60,
                ),
                IdentityClass::Persona => (
                    vec![Read, Write, Export],
                    vec![Read, Write],
                    false,
                    8,
                    600,
                    30,
                    30,
                ),
                IdentityClass::Plugin => (vec![Read, Write], vec![Read], false, 4, 300, 20, 20),
                IdentityClass::External => (vec![Read, Write], vec![Read], false, 2, 120, 10, 10),
                IdentityClass::System => (
                    vec![Read, Write, Export, Purge],
                    vec![Read, Write, Export, Purge],
                    true,
                    32,
                    900,
                    100,
                    120,
                ),
            };
        Self {
            personal: personal.into_iter().collect(),
            communal: communal.into_iter().collect(),
            administer,
            max_tokens,
            max_ttl_secs,
            rate: RateLimit {
                capacity,
                refill_per_minute: refill,
            },
        }
    }

    #[must_use]
    pub fn allows(&self, kind: SliceKind, operation: Operation) -> bool {
        match operation {
            Operation::Admin => self.administer,
            _ => match kind {
                SliceKind::Personal => self.personal.contains(&operation),
                SliceKind::Communal => self.communal.contains(&operation),
            },
        }
    }

    fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }
}

/// The identity registry and class policies, as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: u64,
    pub identities: Vec<Identity>,
    /// Classes absent here use [`ClassPolicy::defaults_for`].
    #[serde(default)]
    pub classes: BTreeMap<IdentityClass, ClassPolicy>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyDocument {
    /// Version 1, no identities, built-in class policies.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: 1,
            identities: Vec::new(),
            classes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identities.push(identity);
        self
    }

    #[must_use]
    pub fn with_class(mut self, class: IdentityClass, policy: ClassPolicy) -> Self {
        self.classes.insert(class, policy);
        self
    }

    /// Hex SHA-256 of the document's canonical JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PolicyParse`] if the document cannot be serialized.
    pub fn checksum(&self) -> Result<String, ConfigError> {
        let canonical = serde_json::to_vec(self).map_err(|e| ConfigError::PolicyParse {
            reason: e.to_string(),
        })?;
        Ok(sha256_hex(&canonical))
    }

    /// Wrap the document with its checksum for storage.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PolicyParse`] if the document cannot be serialized.
    pub fn seal(self) -> Result<SealedPolicy, ConfigError> {
        let checksum = self.checksum()?;
        Ok(SealedPolicy {
            document: self,
            checksum,
        })
    }

    /// Check the document for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPolicy`] for duplicate or malformed
    /// identity ids, malformed secret hashes, and unusable class limits.
    pub fn validate(self) -> Result<CheckedPolicy, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPolicy { reason };

        let mut identities = HashMap::with_capacity(self.identities.len());
        for identity in &self.identities {
            if !is_segment(&identity.id) {
                return Err(invalid(format!(
                    "identity id '{}' may only contain letters, digits, '-' and '_'",
                    identity.id
                )));
            }
            let hash_ok = identity.secret_hash.len() == 64
                && identity.secret_hash.bytes().all(|b| b.is_ascii_hexdigit());
            if !hash_ok {
                return Err(invalid(format!(
                    "identity '{}' has a malformed secret_hash",
                    identity.id
                )));
            }
            if identities
                .insert(identity.id.clone(), identity.clone())
                .is_some()
            {
                return Err(invalid(format!("identity '{}' is defined twice", identity.id)));
            }
        }

        let mut classes = BTreeMap::new();
        for class in IdentityClass::ALL {
            let policy = self
                .classes
                .get(&class)
                .cloned()
                .unwrap_or_else(|| ClassPolicy::defaults_for(class));
            if policy.max_ttl_secs == 0 || policy.rate.capacity == 0 {
                return Err(invalid(format!(
                    "class '{class}' needs a non-zero max_ttl_secs and rate capacity"
                )));
            }
            if policy.personal.contains(&Operation::Admin)
                || policy.communal.contains(&Operation::Admin)
            {
                return Err(invalid(format!(
                    "class '{class}' lists 'admin' as a slice operation; use 'administer'"
                )));
            }
            classes.insert(class, policy);
        }

        Ok(CheckedPolicy {
            version: self.version,
            identities,
            classes,
        })
    }
}

/// A policy document paired with the checksum it was sealed under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedPolicy {
    pub document: PolicyDocument,
    pub checksum: String,
}

impl SealedPolicy {
    /// Parse a sealed document without verifying it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PolicyParse`] for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::PolicyParse {
            reason: e.to_string(),
        })
    }

    /// Read and parse a sealed document from disk, without verifying it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PolicyRead`] if the file is unreadable, or
    /// [`ConfigError::PolicyParse`] for malformed JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::PolicyRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&json)
    }

    /// Pretty-printed JSON for writing to disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PolicyParse`] if serialization fails.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::PolicyParse {
            reason: e.to_string(),
        })
    }

    /// Verify the checksum and return the document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PolicyIntegrity`] if the content was altered
    /// after sealing.
    pub fn open(self) -> Result<PolicyDocument, ConfigError> {
        let computed = self.document.checksum()?;
        let matches: bool = computed
            .as_bytes()
            .ct_eq(self.checksum.to_ascii_lowercase().as_bytes())
            .into();
        if !matches {
            return Err(ConfigError::PolicyIntegrity {
                expected: self.checksum,
                computed,
            });
        }
        Ok(self.document)
    }
}

/// A document that passed [`PolicyDocument::validate`].
#[derive(Debug, Clone)]
pub struct CheckedPolicy {
    version: u64,
    identities: HashMap<String, Identity>,
    classes: BTreeMap<IdentityClass, ClassPolicy>,
}

impl CheckedPolicy {
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }
}

/// An owner's standing permission for another identity to act on the
/// owner's personal slices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub owner: String,
    pub delegate: String,
    pub operations: BTreeSet<Operation>,
    /// `None` lasts until revoked.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Delegation {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Token bucket refilled continuously at `refill_per_sec`.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: RateLimit) -> Self {
        let capacity = f64::from(rate.capacity);
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: f64::from(rate.refill_per_minute) / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed
            .mul_add(self.refill_per_sec, self.tokens)
            .min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Adopt new limits without refunding what was already spent.
    fn retune(&mut self, rate: RateLimit) {
        self.capacity = f64::from(rate.capacity);
        self.refill_per_sec = f64::from(rate.refill_per_minute) / 60.0;
        self.tokens = self.tokens.min(self.capacity);
    }
}

/// Policy approval for one operation on one target. Only this module
/// creates them; [`Validated::grant`] turns one into a ledger grant.
#[derive(Debug)]
pub(crate) struct Clearance {
    token_id: Uuid,
    operation: Operation,
    target: GrantTarget,
}

impl Clearance {
    fn new(validated: &Validated, target: GrantTarget) -> Self {
        Self {
            token_id: validated.token_id(),
            operation: validated.operation(),
            target,
        }
    }

    pub(crate) fn token_id(&self) -> Uuid {
        self.token_id
    }

    pub(crate) fn operation(&self) -> Operation {
        self.operation
    }

    pub(crate) fn into_target(self) -> GrantTarget {
        self.target
    }
}

/// The live policy: registry, class rules, rate buckets and delegations.
pub(crate) struct PolicyEngine {
    current: RwLock<CheckedPolicy>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    delegations: RwLock<Vec<Delegation>>,
}

impl PolicyEngine {
    pub(crate) fn new(policy: CheckedPolicy) -> Self {
        Self {
            current: RwLock::new(policy),
            buckets: Mutex::new(HashMap::new()),
            delegations: RwLock::new(Vec::new()),
        }
    }

    pub(crate) async fn version(&self) -> u64 {
        self.current.read().await.version
    }

    pub(crate) async fn class_policy(&self, class: IdentityClass) -> ClassPolicy {
        self.current
            .read()
            .await
            .classes
            .get(&class)
            .cloned()
            .unwrap_or_else(|| ClassPolicy::defaults_for(class))
    }

    pub(crate) async fn identity(&self, id: &str) -> Option<Identity> {
        self.current.read().await.identities.get(id).cloned()
    }

    /// Match credentials against the registry.
    pub(crate) async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, DenyReason> {
        let identity = self
            .identity(credentials.identity())
            .await
            .ok_or(DenyReason::UnknownIdentity)?;
        let presented = sha256_hex(credentials.secret().as_bytes());
        let matches: bool = presented
            .as_bytes()
            .ct_eq(identity.secret_hash.to_ascii_lowercase().as_bytes())
            .into();
        if matches {
            Ok(identity)
        } else {
            Err(DenyReason::BadCredentials)
        }
    }

    /// Decide whether `identity` may hold the requested token, and on what terms.
    pub(crate) async fn issue_terms(
        &self,
        identity: &Identity,
        request: &TokenRequest,
    ) -> Result<IssueTerms, DenyReason> {
        if request.ttl.is_zero() {
            return Err(DenyReason::InvalidTtl);
        }
        if request.operations.is_empty() {
            return Err(DenyReason::InvalidScope {
                reason: "no operations requested".to_owned(),
            });
        }
        let policy = self.class_policy(identity.class).await;
        let kind = request.scope.kind();
        if let Some(denied) = request
            .operations
            .iter()
            .find(|op| !policy.allows(kind, **op))
        {
            return Err(DenyReason::ClassForbids {
                operation: *denied,
                kind: kind.to_string(),
            });
        }

        let class_max = policy.max_ttl();
        let mut ttl = request.ttl.min(class_max);
        let mut usage = request.usage;
        match identity.trust_tier.risk() {
            RiskLevel::High => {
                ttl = ttl.min(HIGH_RISK_TTL);
                usage = TokenUsage::SingleUse;
            }
            RiskLevel::Elevated => {
                ttl = ttl.min((class_max / 2).max(ELEVATED_MIN_TTL));
            }
            RiskLevel::Low => {}
        }

        Ok(IssueTerms {
            ttl,
            usage,
            max_tokens: policy.max_tokens,
        })
    }

    /// Take one unit from the identity's rate bucket. `false` when empty.
    pub(crate) async fn consume_budget(&self, identity: &str, class: IdentityClass) -> bool {
        let rate = self.class_policy(class).await.rate;
        let mut buckets = self.buckets.lock().await;
        let allowed = buckets
            .entry(identity.to_owned())
            .or_insert_with(|| TokenBucket::new(rate))
            .try_consume();
        if !allowed {
            warn!(identity = %identity, "rate limit exhausted");
        }
        allowed
    }

    /// Whether `identity` may perform `operation` on slices owned by `owner`.
    pub(crate) async fn check_delegation(
        &self,
        identity: &str,
        owner: &str,
        operation: Operation,
    ) -> bool {
        if identity == owner {
            return true;
        }
        let now = Utc::now();
        self.delegations.read().await.iter().any(|d| {
            d.owner == owner
                && d.delegate == identity
                && d.operations.contains(&operation)
                && d.is_live(now)
        })
    }

    /// Approve a validated operation on one slice.
    pub(crate) async fn authorize(
        &self,
        validated: &Validated,
        key: &LogicalKey,
    ) -> Result<Clearance, DenyReason> {
        let operation = validated.operation();
        let policy = self.class_policy(validated.class()).await;
        if !policy.allows(key.kind(), operation) {
            return Err(DenyReason::ClassForbids {
                operation,
                kind: key.kind().to_string(),
            });
        }
        if let Some(owner) = key.personal_owner() {
            if !self
                .check_delegation(validated.identity(), owner, operation)
                .await
            {
                return Err(DenyReason::DelegationRequired {
                    owner: owner.to_owned(),
                });
            }
        }
        Ok(Clearance::new(validated, GrantTarget::Slice(key.slice_id())))
    }

    /// Approve a validated operation over a prefix. Individual slices under
    /// it still go through [`authorize`](Self::authorize).
    pub(crate) async fn authorize_prefix(
        &self,
        validated: &Validated,
        prefix: &KeyPrefix,
    ) -> Result<Clearance, DenyReason> {
        let operation = validated.operation();
        let policy = self.class_policy(validated.class()).await;
        if !policy.allows(prefix.kind(), operation) {
            return Err(DenyReason::ClassForbids {
                operation,
                kind: prefix.kind().to_string(),
            });
        }
        Ok(Clearance::new(validated, GrantTarget::Prefix(prefix.clone())))
    }

    /// Approve a vault-wide administrative operation.
    pub(crate) async fn authorize_admin(&self, validated: &Validated) -> Result<Clearance, DenyReason> {
        let policy = self.class_policy(validated.class()).await;
        if validated.operation() != Operation::Admin || !policy.administer {
            return Err(DenyReason::ClassForbids {
                operation: validated.operation(),
                kind: "system".to_owned(),
            });
        }
        Ok(Clearance::new(validated, GrantTarget::System))
    }

    /// Record a delegation, replacing any earlier one between the same pair.
    pub(crate) async fn add_delegation(&self, delegation: Delegation) {
        let mut delegations = self.delegations.write().await;
        delegations.retain(|d| !(d.owner == delegation.owner && d.delegate == delegation.delegate));
        info!(owner = %delegation.owner, delegate = %delegation.delegate, "delegation granted");
        delegations.push(delegation);
    }

    /// Remove the delegation from `owner` to `delegate`. Returns whether one existed.
    pub(crate) async fn remove_delegation(&self, owner: &str, delegate: &str) -> bool {
        let mut delegations = self.delegations.write().await;
        let before = delegations.len();
        delegations.retain(|d| !(d.owner == owner && d.delegate == delegate));
        before != delegations.len()
    }

    /// Live delegations, for persisting.
    pub(crate) async fn delegations(&self) -> Vec<Delegation> {
        let now = Utc::now();
        self.delegations
            .read()
            .await
            .iter()
            .filter(|d| d.is_live(now))
            .cloned()
            .collect()
    }

    pub(crate) async fn replace_delegations(&self, delegations: Vec<Delegation>) {
        *self.delegations.write().await = delegations;
    }

    /// Swap in a new registry and class rules.
    ///
    /// Issued tokens are untouched and stay valid until they expire. Rate
    /// buckets survive for identities that remain registered.
    pub(crate) async fn reload(&self, policy: CheckedPolicy) {
        let version = policy.version;
        let mut current = self.current.write().await;
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|id, _| policy.identities.contains_key(id));
        for (id, bucket) in buckets.iter_mut() {
            if let Some(identity) = policy.identities.get(id) {
                if let Some(class) = policy.classes.get(&identity.class) {
                    bucket.retune(class.rate);
                }
            }
        }
        *current = policy;
        info!(version, "policy reloaded");
    }
}
