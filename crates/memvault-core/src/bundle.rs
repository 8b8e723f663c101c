//! Export bundles.
//!
//! A bundle is a manifest of entries (key, kind, owner, schema version,
//! checksum, sealed payload) sealed as a whole under the export key and
//! signed with HMAC-SHA256. Entry payloads are sealed individually too, bound
//! to their key, so a bundle is never plaintext at any layer. Export keys are
//! derived from the master key, not the data keyring, so bundles survive key
//! rotation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{CryptoEngine, sha256_hex};
use crate::error::VaultError;
use crate::slice::{LogicalKey, SliceKind};

const BUNDLE_FORMAT: u32 = 1;
const CONTAINER_CONTEXT: &[u8] = b"memvault-bundle-v1";

/// A sealed, signed export. Safe to write to disk or hand to another vault
/// opened with the same master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBundle {
    pub format: u32,
    #[serde(with = "crate::serde_b64")]
    pub sealed: Vec<u8>,
    /// Hex HMAC-SHA256 over `sealed`.
    pub signature: String,
}

impl SignedBundle {
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidBundle`] if serialization fails.
    pub fn to_json(&self) -> Result<String, VaultError> {
        serde_json::to_string(self).map_err(|e| invalid(format!("cannot encode bundle: {e}")))
    }

    /// # Errors
    ///
    /// Returns [`VaultError::InvalidBundle`] for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, VaultError> {
        serde_json::from_str(json).map_err(|e| invalid(format!("cannot decode bundle: {e}")))
    }
}

/// Outcome of an import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub written: Vec<LogicalKey>,
    /// Keys that already existed and were left untouched.
    pub conflicts: Vec<LogicalKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ManifestEntry {
    pub key: String,
    pub kind: SliceKind,
    pub owner: String,
    pub schema_version: u32,
    /// Hex SHA-256 of `sealed_payload`.
    pub checksum: String,
    #[serde(with = "crate::serde_b64")]
    pub sealed_payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub prefix: String,
    pub exported_at: DateTime<Utc>,
    pub exported_by: String,
    pub entries: Vec<ManifestEntry>,
}

fn invalid(reason: impl Into<String>) -> VaultError {
    VaultError::InvalidBundle {
        reason: reason.into(),
    }
}

fn internal(e: impl std::fmt::Display) -> VaultError {
    VaultError::Internal {
        reason: e.to_string(),
    }
}

/// Seal one slice's plaintext for inclusion in a manifest.
pub(crate) fn seal_entry(
    crypto: &CryptoEngine,
    key: &LogicalKey,
    owner: &str,
    schema_version: u32,
    plaintext: &[u8],
) -> Result<ManifestEntry, VaultError> {
    let sealed_payload = crypto
        .seal_export(plaintext, key.as_str().as_bytes())
        .map_err(internal)?;
    Ok(ManifestEntry {
        key: key.to_string(),
        kind: key.kind(),
        owner: owner.to_owned(),
        schema_version,
        checksum: sha256_hex(&sealed_payload),
        sealed_payload,
    })
}

/// Recover an entry's plaintext.
pub(crate) fn open_entry(
    crypto: &CryptoEngine,
    entry: &ManifestEntry,
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    crypto
        .open_export(&entry.sealed_payload, entry.key.as_bytes())
        .map(Zeroizing::new)
        .map_err(|_| invalid(format!("entry '{}' does not open", entry.key)))
}

pub(crate) fn seal_bundle(crypto: &CryptoEngine, manifest: &Manifest) -> Result<SignedBundle, VaultError> {
    let json = Zeroizing::new(serde_json::to_vec(manifest).map_err(internal)?);
    let sealed = crypto
        .seal_export(&json, CONTAINER_CONTEXT)
        .map_err(internal)?;
    let signature = crypto.sign_bundle(&sealed).map_err(internal)?;
    Ok(SignedBundle {
        format: BUNDLE_FORMAT,
        sealed,
        signature,
    })
}

/// Verify the signature, open the container and check every entry.
/// Returns the manifest with its keys parsed.
pub(crate) fn open_bundle(
    crypto: &CryptoEngine,
    bundle: &SignedBundle,
) -> Result<(Manifest, Vec<LogicalKey>), VaultError> {
    if bundle.format != BUNDLE_FORMAT {
        return Err(invalid(format!("unsupported bundle format {}", bundle.format)));
    }
    if !crypto.verify_bundle(&bundle.sealed, &bundle.signature) {
        return Err(invalid("signature does not verify"));
    }
    let json = Zeroizing::new(
        crypto
            .open_export(&bundle.sealed, CONTAINER_CONTEXT)
            .map_err(|_| invalid("container does not open"))?,
    );
    let manifest: Manifest =
        serde_json::from_slice(&json).map_err(|e| invalid(format!("manifest is malformed: {e}")))?;

    let mut keys = Vec::with_capacity(manifest.entries.len());
    for entry in &manifest.entries {
        if sha256_hex(&entry.sealed_payload) != entry.checksum {
            return Err(invalid(format!("entry '{}' fails its checksum", entry.key)));
        }
        let key = LogicalKey::parse(&entry.key)
            .map_err(|e| invalid(format!("entry key rejected: {e}")))?;
        if key.kind() != entry.kind {
            return Err(invalid(format!("entry '{}' has the wrong kind", entry.key)));
        }
        if key.personal_owner().is_some_and(|owner| owner != entry.owner) {
            return Err(invalid(format!("entry '{}' names another owner", entry.key)));
        }
        keys.push(key);
    }
    Ok((manifest, keys))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::slice::SCHEMA_VERSION;

    fn manifest(crypto: &CryptoEngine) -> Manifest {
        let key = LogicalKey::parse("personal.alden.notes").unwrap();
        Manifest {
            prefix: "personal.alden".to_owned(),
            exported_at: Utc::now(),
            exported_by: "alden".to_owned(),
            entries: vec![seal_entry(crypto, &key, "alden", SCHEMA_VERSION, b"dear diary").unwrap()],
        }
    }

    #[test]
    fn bundles_open_under_the_same_master() {
        let master = EncryptionKey::generate();
        let exporter = CryptoEngine::new(master.clone()).unwrap();
        let bundle = seal_bundle(&exporter, &manifest(&exporter)).unwrap();
        let json = bundle.to_json().unwrap();
        assert!(!json.contains("dear diary"));

        let importer = CryptoEngine::new(master).unwrap();
        let (opened, keys) = open_bundle(&importer, &SignedBundle::from_json(&json).unwrap()).unwrap();
        assert_eq!(keys[0].as_str(), "personal.alden.notes");
        assert_eq!(&*open_entry(&importer, &opened.entries[0]).unwrap(), b"dear diary");
    }

    #[test]
    fn foreign_or_altered_bundles_are_rejected() {
        let crypto = CryptoEngine::new(EncryptionKey::generate()).unwrap();
        let bundle = seal_bundle(&crypto, &manifest(&crypto)).unwrap();

        let stranger = CryptoEngine::new(EncryptionKey::generate()).unwrap();
        assert!(matches!(
            open_bundle(&stranger, &bundle),
            Err(VaultError::InvalidBundle { .. })
        ));

        let mut altered = bundle.clone();
        altered.sealed[20] ^= 0x01;
        assert!(matches!(
            open_bundle(&crypto, &altered),
            Err(VaultError::InvalidBundle { .. })
        ));

        let mut future = bundle;
        future.format = 9;
        assert!(open_bundle(&crypto, &future).is_err());
    }

    #[test]
    fn personal_entries_must_name_their_owner() {
        let crypto = CryptoEngine::new(EncryptionKey::generate()).unwrap();
        let key = LogicalKey::parse("personal.alden.notes").unwrap();
        let manifest = Manifest {
            prefix: "personal.alden".to_owned(),
            exported_at: Utc::now(),
            exported_by: "bryn".to_owned(),
            entries: vec![seal_entry(&crypto, &key, "bryn", SCHEMA_VERSION, b"x").unwrap()],
        };
        let bundle = seal_bundle(&crypto, &manifest).unwrap();
        assert!(matches!(
            open_bundle(&crypto, &bundle),
            Err(VaultError::InvalidBundle { .. })
        ));
    }
}
