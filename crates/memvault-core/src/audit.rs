//! Hash-chained audit trail.
//!
//! Every request that reaches the vault produces exactly one [`AuditRecord`],
//! written before the response is returned. Records are appended to an
//! [`AuditSink`] as JSON lines and chained: each record stores the hash of
//! its predecessor, and its own hash covers every other field. Editing,
//! reordering or dropping a record breaks the chain at that point.
//!
//! Appends are retried with backoff. If an append still fails the trail
//! halts and the vault refuses further requests (fail-closed).
//!
//! A full-vault wipe resets the sink and starts it with a signed closing
//! record that continues the old sequence and links to the old head.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::crypto::sha256_hex;
use crate::error::AuditError;
use crate::retry::RetryPolicy;

/// `prev_hash` of the first record of a fresh chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Signs and verifies closing records. Implemented by the crypto engine.
pub trait ChainSigner: Send + Sync {
    fn sign(&self, digest: &str) -> Option<String>;
    fn verify(&self, digest: &str, signature: &str) -> bool;
}

/// Append-only storage for serialized audit records.
///
/// Implementations must be safe to share across async tasks and must never
/// drop a line silently.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name (for error reporting).
    fn name(&self) -> &str;

    /// Durably append one line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::SinkFailure`] if the line could not be persisted.
    async fn append(&self, line: &str) -> Result<(), AuditError>;

    /// Every line currently stored, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::SinkFailure`] if the sink cannot be read.
    async fn read_all(&self) -> Result<Vec<String>, AuditError>;

    /// Discard every stored line. Only used by a full-vault wipe.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::SinkFailure`] if the sink cannot be cleared.
    async fn reset(&self) -> Result<(), AuditError>;
}

/// In-memory sink. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored lines.
    pub async fn lines(&self) -> Vec<String> {
        self.lines.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, line: &str) -> Result<(), AuditError> {
        self.lines.lock().await.push(line.to_owned());
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<String>, AuditError> {
        Ok(self.lines.lock().await.clone())
    }

    async fn reset(&self) -> Result<(), AuditError> {
        self.lines.lock().await.clear();
        Ok(())
    }
}

/// What was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    RequestToken,
    RevokeToken,
    Read,
    Write,
    Purge,
    List,
    Export,
    Import,
    Delegate,
    RevokeDelegation,
    RotateKey,
    ReloadPolicy,
    Wipe,
    QueryAudit,
}

impl AuditOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestToken => "request_token",
            Self::RevokeToken => "revoke_token",
            Self::Read => "read",
            Self::Write => "write",
            Self::Purge => "purge",
            Self::List => "list",
            Self::Export => "export",
            Self::Import => "import",
            Self::Delegate => "delegate",
            Self::RevokeDelegation => "revoke_delegation",
            Self::RotateKey => "rotate_key",
            Self::ReloadPolicy => "reload_policy",
            Self::Wipe => "wipe",
            Self::QueryAudit => "query_audit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Error,
}

/// One link of the chain, as stored.
///
/// Unknown fields are rejected and every field is always written, so a
/// renamed key is as detectable as a changed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub identity: String,
    /// Token id, or `"none"` for requests that never presented a valid token.
    pub token_id: String,
    pub operation: AuditOperation,
    /// Logical key, prefix or other subject of the request.
    pub target: String,
    pub outcome: AuditOutcome,
    /// Machine-readable reason code for denials, errors and notable outcomes.
    pub reason: Option<String>,
    /// The request hit a record that failed integrity checks.
    pub corruption: bool,
    pub prev_hash: String,
    pub hash: String,
    /// Present only on closing records written by a wipe.
    pub signature: Option<String>,
}

#[derive(Serialize)]
struct HashInput<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    identity: &'a str,
    token_id: &'a str,
    operation: AuditOperation,
    target: &'a str,
    outcome: AuditOutcome,
    reason: Option<&'a str>,
    corruption: bool,
    prev_hash: &'a str,
}

impl AuditRecord {
    /// Hash over every field except `hash` and `signature`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Serialization`] if the fields cannot be encoded.
    pub fn compute_hash(&self) -> Result<String, AuditError> {
        let input = HashInput {
            sequence: self.sequence,
            timestamp: &self.timestamp,
            identity: &self.identity,
            token_id: &self.token_id,
            operation: self.operation,
            target: &self.target,
            outcome: self.outcome,
            reason: self.reason.as_deref(),
            corruption: self.corruption,
            prev_hash: &self.prev_hash,
        };
        let canonical = serde_json::to_vec(&input).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        Ok(sha256_hex(&canonical))
    }

    fn to_line(&self) -> Result<String, AuditError> {
        serde_json::to_string(self).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })
    }
}

/// A decision to be recorded. The trail fills in sequence and hashes.
#[derive(Debug, Clone)]
pub(crate) struct AuditEntry {
    identity: String,
    token_id: Option<Uuid>,
    operation: AuditOperation,
    target: String,
    outcome: AuditOutcome,
    reason: Option<String>,
    corruption: bool,
}

impl AuditEntry {
    pub(crate) fn new(
        identity: impl Into<String>,
        token_id: Option<Uuid>,
        operation: AuditOperation,
        target: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            token_id,
            operation,
            target: target.into(),
            outcome: AuditOutcome::Allowed,
            reason: None,
            corruption: false,
        }
    }

    pub(crate) fn allowed(mut self, reason: Option<&str>) -> Self {
        self.outcome = AuditOutcome::Allowed;
        self.reason = reason.map(str::to_owned);
        self
    }

    pub(crate) fn denied(mut self, code: &str) -> Self {
        self.outcome = AuditOutcome::Denied;
        self.reason = Some(code.to_owned());
        self
    }

    pub(crate) fn errored(mut self, code: &str) -> Self {
        self.outcome = AuditOutcome::Error;
        self.reason = Some(code.to_owned());
        self
    }

    pub(crate) fn corrupted(mut self) -> Self {
        self.corruption = true;
        self
    }
}

/// Which records an audit query returns. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    pub identity: Option<String>,
    pub operation: Option<AuditOperation>,
    pub outcome: Option<AuditOutcome>,
    /// Inclusive lower bound on the record timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the record timestamp.
    pub until: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches.
    pub limit: Option<usize>,
}

impl AuditQuery {
    #[must_use]
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.identity.as_deref().is_none_or(|id| id == record.identity)
            && self.operation.is_none_or(|op| op == record.operation)
            && self.outcome.is_none_or(|outcome| outcome == record.outcome)
            && self.since.is_none_or(|since| record.timestamp >= since)
            && self.until.is_none_or(|until| record.timestamp < until)
    }
}

/// Result of [`AuditTrail::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    Ok { records: u64 },
    Corrupted { at_sequence: u64, reason: String },
}

impl ChainStatus {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainHead {
    sequence: u64,
    hash: String,
}

impl ChainHead {
    fn genesis() -> Self {
        Self {
            sequence: 0,
            hash: GENESIS_HASH.to_owned(),
        }
    }
}

enum Walk {
    Intact(Option<ChainHead>, u64),
    Broken(u64, String),
}

/// Check a sequence of stored lines. Returns the head on success.
fn walk(lines: &[String], signer: &dyn ChainSigner) -> Result<Walk, AuditError> {
    let mut head: Option<ChainHead> = None;
    let mut count = 0u64;

    for line in lines {
        let expected = head.as_ref().map_or(1, |h| h.sequence.saturating_add(1));
        let broken = |reason: &str| Ok(Walk::Broken(expected, reason.to_owned()));

        let Ok(record) = serde_json::from_str::<AuditRecord>(line) else {
            return broken("record is unreadable");
        };
        if record.to_line()? != *line {
            return broken("record is not in canonical form");
        }

        match &head {
            None if record.signature.is_some() => {
                // A chain may open with the closing record of a wipe, which
                // continues the sequence of the chain it replaced.
                if record.operation != AuditOperation::Wipe {
                    return broken("only closing records may carry a signature");
                }
            }
            None => {
                if record.sequence != 1 || record.prev_hash != GENESIS_HASH {
                    return broken("chain does not start at genesis");
                }
            }
            Some(h) => {
                if record.sequence != expected {
                    return broken("sequence gap");
                }
                if record.prev_hash != h.hash {
                    return broken("previous-hash link broken");
                }
                if record.signature.is_some() {
                    return broken("signature outside a closing position");
                }
            }
        }

        if record.compute_hash()? != record.hash {
            return Ok(Walk::Broken(record.sequence.min(expected), "hash mismatch".to_owned()));
        }
        if let Some(signature) = &record.signature {
            if !signer.verify(&record.hash, signature) {
                return Ok(Walk::Broken(record.sequence, "closing signature invalid".to_owned()));
            }
        }

        count += 1;
        head = Some(ChainHead {
            sequence: record.sequence,
            hash: record.hash,
        });
    }

    Ok(Walk::Intact(head, count))
}

/// The vault's single audit trail. Sequence allocation and appends run
/// under one lock.
pub(crate) struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    head: Mutex<ChainHead>,
    halted: AtomicBool,
    retry: RetryPolicy,
}

impl AuditTrail {
    /// Attach to a sink and recover the chain head from what it holds.
    ///
    /// With `verify`, a broken chain is refused and returned as the
    /// corrupted status.
    pub(crate) async fn open(
        sink: Arc<dyn AuditSink>,
        signer: &dyn ChainSigner,
        verify: bool,
        retry: RetryPolicy,
    ) -> Result<Result<Self, ChainStatus>, AuditError> {
        let lines = sink.read_all().await?;
        let head = if verify {
            match walk(&lines, signer)? {
                Walk::Intact(head, _) => head,
                Walk::Broken(at_sequence, reason) => {
                    return Ok(Err(ChainStatus::Corrupted {
                        at_sequence,
                        reason,
                    }));
                }
            }
        } else {
            lines
                .iter()
                .rev()
                .find_map(|l| serde_json::from_str::<AuditRecord>(l).ok())
                .map(|r| ChainHead {
                    sequence: r.sequence,
                    hash: r.hash,
                })
        };

        let head = head.unwrap_or_else(ChainHead::genesis);
        info!(sink = sink.name(), sequence = head.sequence, "audit trail opened");
        Ok(Ok(Self {
            sink,
            head: Mutex::new(head),
            halted: AtomicBool::new(false),
            retry,
        }))
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Fail fast when the trail can no longer record.
    pub(crate) fn ensure_available(&self) -> Result<(), AuditError> {
        if self.is_halted() {
            Err(AuditError::Halted)
        } else {
            Ok(())
        }
    }

    /// Append one record. Returns it as stored.
    pub(crate) async fn record(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        self.ensure_available()?;
        let mut head = self.head.lock().await;
        let record = build(entry, &head, None)?;
        self.append(&record).await?;
        *head = ChainHead {
            sequence: record.sequence,
            hash: record.hash.clone(),
        };
        Ok(record)
    }

    /// Reset the sink and start it with a signed closing record linked to
    /// the old head.
    pub(crate) async fn close_and_reset(
        &self,
        entry: AuditEntry,
        signer: &dyn ChainSigner,
    ) -> Result<AuditRecord, AuditError> {
        self.ensure_available()?;
        let mut head = self.head.lock().await;
        let record = build(entry, &head, Some(signer))?;

        if let Err(e) = self.sink.reset().await {
            return Err(self.halt(e));
        }
        self.append(&record).await?;
        *head = ChainHead {
            sequence: record.sequence,
            hash: record.hash.clone(),
        };
        info!(sequence = record.sequence, "audit trail closed and restarted");
        Ok(record)
    }

    /// Re-read the sink and check every link.
    pub(crate) async fn verify(&self, signer: &dyn ChainSigner) -> Result<ChainStatus, AuditError> {
        let head = self.head.lock().await.clone();
        let lines = self.sink.read_all().await?;
        Ok(match walk(&lines, signer)? {
            Walk::Broken(at_sequence, reason) => ChainStatus::Corrupted {
                at_sequence,
                reason,
            },
            Walk::Intact(found, records) => {
                let found = found.unwrap_or_else(ChainHead::genesis);
                if found == head {
                    ChainStatus::Ok { records }
                } else {
                    ChainStatus::Corrupted {
                        at_sequence: found.sequence.saturating_add(1),
                        reason: format!(
                            "log ends at sequence {} but the trail is at {}",
                            found.sequence, head.sequence
                        ),
                    }
                }
            }
        })
    }

    /// Records matching `query`, oldest first. Nothing is returned from a
    /// log that fails verification.
    pub(crate) async fn query(
        &self,
        query: &AuditQuery,
        signer: &dyn ChainSigner,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let lines = self.sink.read_all().await?;
        if let Walk::Broken(at_sequence, reason) = walk(&lines, signer)? {
            return Err(AuditError::Corrupted { at_sequence, reason });
        }
        let mut matched = Vec::new();
        for line in &lines {
            let record: AuditRecord = serde_json::from_str(line).map_err(|e| AuditError::Serialization {
                reason: e.to_string(),
            })?;
            if query.matches(&record) {
                matched.push(record);
            }
        }
        if let Some(limit) = query.limit {
            matched = matched.split_off(matched.len().saturating_sub(limit));
        }
        Ok(matched)
    }

    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = record.to_line()?;
        let result = self
            .retry
            .run("audit append", |_| true, || self.sink.append(&line))
            .await;
        result.map_err(|e| self.halt(e))
    }

    fn halt(&self, cause: AuditError) -> AuditError {
        self.halted.store(true, Ordering::SeqCst);
        error!(sink = self.sink.name(), error = %cause, "audit trail halted; refusing further requests");
        cause
    }
}

fn build(
    entry: AuditEntry,
    head: &ChainHead,
    signer: Option<&dyn ChainSigner>,
) -> Result<AuditRecord, AuditError> {
    if entry.outcome != AuditOutcome::Allowed {
        warn!(
            identity = %entry.identity,
            operation = entry.operation.as_str(),
            target = %entry.target,
            reason = entry.reason.as_deref().unwrap_or("-"),
            "request refused"
        );
    }
    let mut record = AuditRecord {
        sequence: head.sequence.saturating_add(1),
        timestamp: Utc::now(),
        identity: entry.identity,
        token_id: entry
            .token_id
            .map_or_else(|| "none".to_owned(), |id| id.to_string()),
        operation: entry.operation,
        target: entry.target,
        outcome: entry.outcome,
        reason: entry.reason,
        corruption: entry.corruption,
        prev_hash: head.hash.clone(),
        hash: String::new(),
        signature: None,
    };
    record.hash = record.compute_hash()?;
    if let Some(signer) = signer {
        record.signature = Some(signer.sign(&record.hash).ok_or_else(|| {
            AuditError::Serialization {
                reason: "closing record could not be signed".to_owned(),
            }
        })?);
    }
    Ok(record)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;
    use crate::crypto::{CryptoEngine, EncryptionKey};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn signer() -> CryptoEngine {
        CryptoEngine::new(EncryptionKey::generate()).unwrap()
    }

    async fn trail(sink: &MemoryAuditSink, signer: &CryptoEngine) -> AuditTrail {
        AuditTrail::open(Arc::new(sink.clone()), signer, true, fast_retry())
            .await
            .unwrap()
            .unwrap()
    }

    fn entry(n: u32) -> AuditEntry {
        let base = AuditEntry::new("alden", Some(Uuid::new_v4()), AuditOperation::Write, format!("personal.alden.n{n}"));
        if n % 2 == 0 { base.allowed(None) } else { base.denied("token_expired") }
    }

    async fn filled(n: u32) -> (MemoryAuditSink, CryptoEngine, AuditTrail) {
        let sink = MemoryAuditSink::new();
        let signer = signer();
        let trail = trail(&sink, &signer).await;
        for i in 0..n {
            trail.record(entry(i)).await.unwrap();
        }
        (sink, signer, trail)
    }

    #[tokio::test]
    async fn records_chain_from_genesis() {
        let (sink, signer, trail) = filled(5).await;
        let lines = sink.lines().await;
        let first: AuditRecord = serde_json::from_str(&lines[0]).unwrap();
        let second: AuditRecord = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(trail.verify(&signer).await.unwrap(), ChainStatus::Ok { records: 5 });
    }

    #[tokio::test]
    async fn missing_token_is_recorded_as_none() {
        let (sink, _, trail) = filled(0).await;
        trail
            .record(AuditEntry::new("unknown", None, AuditOperation::Read, "communal.x").denied("unknown_token"))
            .await
            .unwrap();
        let record: AuditRecord = serde_json::from_str(&sink.lines().await[0]).unwrap();
        assert_eq!(record.token_id, "none");
        assert_eq!(record.outcome, AuditOutcome::Denied);
    }

    #[tokio::test]
    async fn every_single_byte_flip_is_detected() {
        let (sink, signer, trail) = filled(4).await;
        let original = sink.lines().await;
        let target = 2usize;
        let bytes = original[target].clone().into_bytes();

        for i in 0..bytes.len() {
            let mut damaged = bytes.clone();
            damaged[i] ^= 0x01;
            let mut lines = original.clone();
            lines[target] = String::from_utf8_lossy(&damaged).into_owned();
            *sink.lines.lock().await = lines;

            match trail.verify(&signer).await.unwrap() {
                ChainStatus::Corrupted { at_sequence, .. } => {
                    assert!(at_sequence >= 3, "byte {i}: reported {at_sequence}");
                }
                ChainStatus::Ok { .. } => panic!("flip at byte {i} went unnoticed"),
            }
        }
    }

    #[tokio::test]
    async fn dropped_tail_is_detected_while_open() {
        let (sink, signer, trail) = filled(3).await;
        sink.lines.lock().await.pop();
        assert!(matches!(
            trail.verify(&signer).await.unwrap(),
            ChainStatus::Corrupted { at_sequence: 3, .. }
        ));
    }

    #[tokio::test]
    async fn query_filters_and_keeps_the_newest() {
        let (_, signer, trail) = filled(6).await;
        trail
            .record(AuditEntry::new("bryn", None, AuditOperation::Read, "communal.x").allowed(None))
            .await
            .unwrap();

        let denied = AuditQuery {
            outcome: Some(AuditOutcome::Denied),
            ..AuditQuery::default()
        };
        let found = trail.query(&denied, &signer).await.unwrap();
        assert_eq!(found.iter().map(|r| r.sequence).collect::<Vec<_>>(), [2, 4, 6]);

        let newest_writes = AuditQuery {
            identity: Some("alden".to_owned()),
            operation: Some(AuditOperation::Write),
            limit: Some(2),
            ..AuditQuery::default()
        };
        let found = trail.query(&newest_writes, &signer).await.unwrap();
        assert_eq!(found.iter().map(|r| r.sequence).collect::<Vec<_>>(), [5, 6]);

        let future = AuditQuery {
            since: Some(Utc::now() + chrono::Duration::hours(1)),
            ..AuditQuery::default()
        };
        assert!(trail.query(&future, &signer).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_refuses_a_broken_log() {
        let (sink, signer, trail) = filled(3).await;
        let altered = sink.lines().await[1].replace("personal.alden.n1", "personal.alden.nX");
        sink.lines.lock().await[1] = altered;
        assert!(matches!(
            trail.query(&AuditQuery::default(), &signer).await,
            Err(AuditError::Corrupted { at_sequence: 2, .. })
        ));
    }

    #[tokio::test]
    async fn reopen_continues_the_sequence() {
        let (sink, signer, _) = filled(3).await;
        let reopened = trail(&sink, &signer).await;
        let record = reopened.record(entry(9)).await.unwrap();
        assert_eq!(record.sequence, 4);
        assert!(reopened.verify(&signer).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn open_refuses_a_broken_chain() {
        let (sink, signer, _) = filled(3).await;
        sink.lines.lock().await.remove(1);
        let result = AuditTrail::open(Arc::new(sink.clone()), &signer, true, fast_retry())
            .await
            .unwrap();
        assert!(matches!(result, Err(ChainStatus::Corrupted { at_sequence: 2, .. })));
    }

    #[tokio::test]
    async fn closing_record_starts_a_verifiable_chain() {
        let (sink, signer, trail) = filled(3).await;
        let old_head: AuditRecord = serde_json::from_str(&sink.lines().await[2]).unwrap();

        let closing = trail
            .close_and_reset(
                AuditEntry::new("root", Some(Uuid::new_v4()), AuditOperation::Wipe, "*").allowed(None),
                &signer,
            )
            .await
            .unwrap();
        assert_eq!(closing.sequence, 4);
        assert_eq!(closing.prev_hash, old_head.hash);
        assert!(closing.signature.is_some());

        trail.record(entry(10)).await.unwrap();
        assert_eq!(sink.lines().await.len(), 2);
        assert_eq!(trail.verify(&signer).await.unwrap(), ChainStatus::Ok { records: 2 });

        let stranger = CryptoEngine::new(EncryptionKey::generate()).unwrap();
        assert!(matches!(
            trail.verify(&stranger).await.unwrap(),
            ChainStatus::Corrupted { at_sequence: 4, .. }
        ));
    }

    struct FailingSink {
        attempts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl AuditSink for FailingSink {
        #[allow(clippy::unnecessary_literal_bound)]
        fn name(&self) -> &str {
            "failing"
        }

        async fn append(&self, _line: &str) -> Result<(), AuditError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(AuditError::SinkFailure {
                sink: "failing".to_owned(),
                reason: "disk full".to_owned(),
            })
        }

        async fn read_all(&self) -> Result<Vec<String>, AuditError> {
            Ok(Vec::new())
        }

        async fn reset(&self) -> Result<(), AuditError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_append_halts_the_trail() {
        let sink = Arc::new(FailingSink {
            attempts: AtomicU32::new(0),
        });
        let signer = signer();
        let trail = AuditTrail::open(sink.clone(), &signer, true, fast_retry())
            .await
            .unwrap()
            .unwrap();

        let first = trail.record(entry(0)).await;
        assert!(matches!(first, Err(AuditError::SinkFailure { .. })));
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert!(trail.is_halted());

        let second = trail.record(entry(1)).await;
        assert!(matches!(second, Err(AuditError::Halted)));
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    }
}
