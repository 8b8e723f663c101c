//! Memory slices: logical keys, prefixes and the views returned to callers.
//!
//! A logical key is a dot-separated path whose first segment names the slice
//! kind:
//!
//! - `personal.<owner>.<name>...` belongs to `<owner>`
//! - `communal.<name>...` belongs to whoever created it
//!
//! Segments are `[A-Za-z0-9_-]+`, at most 16 of them, 256 bytes in total.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::sha256_hex;
use crate::error::VaultError;

const MAX_KEY_BYTES: usize = 256;
const MAX_SEGMENTS: usize = 16;

/// Layout version of the stored slice record.
pub const SCHEMA_VERSION: u32 = 1;

/// Slice kind, taken from the first key segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceKind {
    Personal,
    Communal,
}

impl SliceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Communal => "communal",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "personal" => Some(Self::Personal),
            "communal" => Some(Self::Communal),
            _ => None,
        }
    }
}

impl fmt::Display for SliceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn invalid(reason: impl Into<String>) -> VaultError {
    VaultError::InvalidKey {
        reason: reason.into(),
    }
}

/// Validate the dot-separated segments of a key or prefix and return the kind.
fn check_segments(raw: &str) -> Result<(SliceKind, usize), VaultError> {
    if raw.is_empty() {
        return Err(invalid("key is empty"));
    }
    if raw.len() > MAX_KEY_BYTES {
        return Err(invalid(format!(
            "key is {} bytes, limit is {MAX_KEY_BYTES}",
            raw.len()
        )));
    }

    let mut count = 0usize;
    for segment in raw.split('.') {
        count += 1;
        if segment.is_empty() {
            return Err(invalid(format!("'{raw}' has an empty segment")));
        }
        if !is_segment(segment) {
            return Err(invalid(format!(
                "segment '{segment}' may only contain letters, digits, '-' and '_'"
            )));
        }
    }
    if count > MAX_SEGMENTS {
        return Err(invalid(format!(
            "key has {count} segments, limit is {MAX_SEGMENTS}"
        )));
    }

    let first = raw.split('.').next().unwrap_or_default();
    let kind = SliceKind::from_segment(first).ok_or_else(|| {
        invalid(format!(
            "first segment must be 'personal' or 'communal', got '{first}'"
        ))
    })?;
    Ok((kind, count))
}

/// Whether `s` is a valid key segment. Identity ids obey the same rule so
/// they can appear in personal keys.
#[must_use]
pub fn is_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A validated logical key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalKey {
    raw: String,
    kind: SliceKind,
}

impl LogicalKey {
    /// Parse and validate a key.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKey`] when the key is empty, too long,
    /// has bad segments, or names no owner and item.
    pub fn parse(raw: &str) -> Result<Self, VaultError> {
        let (kind, segments) = check_segments(raw)?;
        let minimum = match kind {
            SliceKind::Personal => 3,
            SliceKind::Communal => 2,
        };
        if segments < minimum {
            return Err(invalid(match kind {
                SliceKind::Personal => format!("'{raw}' must look like personal.<owner>.<name>"),
                SliceKind::Communal => format!("'{raw}' must look like communal.<name>"),
            }));
        }
        Ok(Self {
            raw: raw.to_owned(),
            kind,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn kind(&self) -> SliceKind {
        self.kind
    }

    /// Owner encoded in a personal key. Communal keys carry none.
    #[must_use]
    pub fn personal_owner(&self) -> Option<&str> {
        match self.kind {
            SliceKind::Personal => self.raw.split('.').nth(1),
            SliceKind::Communal => None,
        }
    }

    /// Opaque storage identifier for this key.
    #[must_use]
    pub fn slice_id(&self) -> SliceId {
        SliceId(sha256_hex(self.raw.as_bytes()))
    }
}

impl FromStr for LogicalKey {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A key prefix for `list` and `export`. Matches on whole segments:
/// `personal.alden` covers `personal.alden.notes` but not `personal.aldena.x`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix {
    raw: String,
    kind: SliceKind,
}

impl KeyPrefix {
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKey`] for malformed prefixes.
    pub fn parse(raw: &str) -> Result<Self, VaultError> {
        let (kind, _) = check_segments(raw)?;
        Ok(Self {
            raw: raw.to_owned(),
            kind,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn kind(&self) -> SliceKind {
        self.kind
    }

    #[must_use]
    pub fn matches(&self, key: &LogicalKey) -> bool {
        key.as_str()
            .strip_prefix(self.raw.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Opaque slice identifier (hex SHA-256 of the logical key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceId(String);

impl SliceId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who last changed a slice, and with which token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedBy {
    pub identity: String,
    pub token_id: Uuid,
}

/// A decrypted slice as returned by `read`.
#[derive(Clone)]
pub struct SliceView {
    pub key: LogicalKey,
    pub owner: String,
    pub plaintext: Zeroizing<Vec<u8>>,
    /// Pass this back as `expected_checksum` on the next write.
    pub checksum: String,
    pub revision: u64,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub modified_by: ModifiedBy,
}

impl SliceView {
    #[must_use]
    pub fn kind(&self) -> SliceKind {
        self.key.kind()
    }
}

impl fmt::Debug for SliceView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceView")
            .field("key", &self.key.as_str())
            .field("owner", &self.owner)
            .field("plaintext", &format_args!("[{} bytes]", self.plaintext.len()))
            .field("checksum", &self.checksum)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub key: LogicalKey,
    pub checksum: String,
    pub revision: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn personal_keys_carry_their_owner() {
        let key = LogicalKey::parse("personal.alden.journal.2024").unwrap();
        assert_eq!(key.kind(), SliceKind::Personal);
        assert_eq!(key.personal_owner(), Some("alden"));
    }

    #[test]
    fn communal_keys_have_no_owner_segment() {
        let key: LogicalKey = "communal.recipes".parse().unwrap();
        assert_eq!(key.kind(), SliceKind::Communal);
        assert_eq!(key.personal_owner(), None);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for raw in [
            "",
            "personal",
            "personal.alden",
            "communal",
            "shared.notes",
            "personal..x",
            "personal.alden.",
            "personal.al/den.x",
            "personal.alden.x y",
        ] {
            assert!(
                matches!(LogicalKey::parse(raw), Err(VaultError::InvalidKey { .. })),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn length_and_depth_limits() {
        let deep = format!("communal{}", ".a".repeat(16));
        assert!(LogicalKey::parse(&deep).is_err());
        let ok = format!("communal{}", ".a".repeat(15));
        assert!(LogicalKey::parse(&ok).is_ok());

        let long = format!("communal.{}", "x".repeat(250));
        assert!(LogicalKey::parse(&long).is_err());
    }

    #[test]
    fn slice_id_is_stable_and_opaque() {
        let a = LogicalKey::parse("personal.alden.notes").unwrap();
        let b = LogicalKey::parse("personal.alden.notes").unwrap();
        assert_eq!(a.slice_id(), b.slice_id());
        assert_eq!(a.slice_id().as_str().len(), 64);
        assert!(!a.slice_id().as_str().contains("alden"));
    }

    #[test]
    fn prefixes_match_whole_segments() {
        let prefix = KeyPrefix::parse("personal.alden").unwrap();
        assert!(prefix.matches(&LogicalKey::parse("personal.alden.notes").unwrap()));
        assert!(!prefix.matches(&LogicalKey::parse("personal.aldena.notes").unwrap()));
        assert!(!prefix.matches(&LogicalKey::parse("personal.bryn.notes").unwrap()));

        let kind_only = KeyPrefix::parse("communal").unwrap();
        assert!(kind_only.matches(&LogicalKey::parse("communal.x").unwrap()));
        assert!(KeyPrefix::parse("elsewhere").is_err());
    }

    #[test]
    fn view_debug_hides_plaintext() {
        let view = SliceView {
            key: LogicalKey::parse("communal.note").unwrap(),
            owner: "alden".to_owned(),
            plaintext: Zeroizing::new(b"hunter2".to_vec()),
            checksum: "c".to_owned(),
            revision: 1,
            schema_version: SCHEMA_VERSION,
            created_at: Utc::now(),
            modified_at: Utc::now(),
            modified_by: ModifiedBy {
                identity: "alden".to_owned(),
                token_id: Uuid::new_v4(),
            },
        };
        let rendered = format!("{view:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[7 bytes]"));
    }
}
