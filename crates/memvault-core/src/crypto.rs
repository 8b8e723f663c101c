//! Crypto engine for `memvault`.
//!
//! AES-256-GCM authenticated encryption, HKDF-SHA256 key derivation and
//! HMAC-SHA256 signatures, plus the [`CryptoEngine`] that owns the vault's
//! master key and its versioned data-key ring.
//!
//! # Security model
//!
//! - The master key is a key-encryption key. It wraps the keyring and seeds
//!   the derived export/signing keys; it never encrypts slice data directly.
//! - Slice data is sealed with the active data key. Sealed blob layout:
//!   `key_version (u32 BE) || nonce (12) || ciphertext || tag (16)`.
//! - The caller's context (the slice's logical key) is bound as associated
//!   data, so a blob copied under another key fails to open.
//! - Every failure to open is an integrity failure. There is no partial
//!   plaintext.
//! - All key types zeroize on drop and redact themselves in `Debug`.

use std::collections::BTreeMap;
use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::audit::ChainSigner;
use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const VERSION_LEN: usize = 4;

/// Shortest blob [`CryptoEngine::open`] will attempt.
const MIN_SEALED_LEN: usize = VERSION_LEN + NONCE_LEN + TAG_LEN;

const HKDF_SALT: &[u8] = b"memvault-v1";
const EXPORT_INFO: &[u8] = b"memvault-export-seal-v1";
const BUNDLE_SIGN_INFO: &[u8] = b"memvault-bundle-sign-v1";
const AUDIT_SIGN_INFO: &[u8] = b"memvault-audit-seal-v1";
const KEYRING_CONTEXT: &[u8] = b"memvault-keyring";

/// A 256-bit key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Decode a base64 key (standard alphabet, padded).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the input is not base64 or does
    /// not decode to exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(BASE64.decode(encoded.trim()).map_err(|e| {
            CryptoError::InvalidKey {
                reason: format!("not base64: {e}"),
            }
        })?);
        let bytes: [u8; 32] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKey {
                    reason: format!("expected 32 bytes, got {}", decoded.len()),
                })?;
        Ok(Self(bytes))
    }

    /// Base64 encoding of the key. The caller owns the secrecy of the result.
    #[must_use]
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.0))
    }

    /// Borrow the raw key bytes. Never log or persist them.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt with AES-256-GCM under a fresh nonce, binding `aad`.
///
/// Returns `nonce || ciphertext || tag`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut out = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce || ciphertext || tag` produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::Integrity`] if the input is truncated or fails
/// authentication under `key` and `aad`.
pub fn decrypt(key: &EncryptionKey, combined: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if combined.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Integrity {
            reason: format!(
                "ciphertext too short: expected at least {} bytes, got {}",
                NONCE_LEN + TAG_LEN,
                combined.len()
            ),
        });
    }
    let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Integrity {
            reason: "authentication tag mismatch".to_owned(),
        })
}

/// Derive a purpose-specific key from `root` with HKDF-SHA256.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(
    root: &EncryptionKey,
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, root.as_bytes());
    let mut derived = [0u8; 32];
    hk.expand(info, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(derived))
}

/// Hex-encoded SHA-256.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// 32 random bytes from the OS CSPRNG, hex-encoded.
#[must_use]
pub(crate) fn random_secret() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(bytes.as_mut());
    Zeroizing::new(hex::encode(bytes.as_ref()))
}

fn hmac_hex(key: &EncryptionKey, data: &[u8]) -> Result<String, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes()).map_err(|e| {
        CryptoError::KeyDerivation {
            context: "hmac".to_owned(),
            reason: e.to_string(),
        }
    })?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn hmac_verify(key: &EncryptionKey, data: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key.as_bytes()) else {
        return false;
    };
    mac.update(data);
    mac.verify_slice(&expected).is_ok()
}

/// Versioned data keys. Exactly one version is active for sealing.
struct Keyring {
    active: u32,
    keys: BTreeMap<u32, EncryptionKey>,
}

#[derive(Serialize, Deserialize)]
struct StoredKeyring {
    active: u32,
    keys: BTreeMap<u32, String>,
}

impl Drop for StoredKeyring {
    fn drop(&mut self) {
        for key in self.keys.values_mut() {
            key.zeroize();
        }
    }
}

/// A data key generated by [`CryptoEngine::prepare_rotation`] and not yet in use.
pub struct PendingRotation {
    version: u32,
    key: EncryptionKey,
    wrapped: Vec<u8>,
}

impl PendingRotation {
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The keyring with this key active, sealed under the master key.
    #[must_use]
    pub fn wrapped_keyring(&self) -> &[u8] {
        &self.wrapped
    }
}

impl fmt::Debug for PendingRotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRotation")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Owner of the master key and every key derived from it.
///
/// Nothing outside this type observes key bytes. The facade holds the only
/// instance and passes it by reference.
pub struct CryptoEngine {
    master: EncryptionKey,
    export_key: EncryptionKey,
    bundle_sign_key: EncryptionKey,
    audit_sign_key: EncryptionKey,
    keyring: RwLock<Keyring>,
}

impl CryptoEngine {
    /// Build an engine with a fresh keyring holding data key version 1.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] if a derived key cannot be produced.
    pub fn new(master: EncryptionKey) -> Result<Self, CryptoError> {
        let mut keys = BTreeMap::new();
        keys.insert(1, EncryptionKey::generate());
        Self::with_keyring(master, Keyring { active: 1, keys })
    }

    /// Rebuild an engine from a keyring previously produced by
    /// [`wrap_keyring`](Self::wrap_keyring).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Integrity`] if `wrapped` was not sealed under
    /// this master key, and [`CryptoError::InvalidKey`] if its content is malformed.
    pub fn restore(master: EncryptionKey, wrapped: &[u8]) -> Result<Self, CryptoError> {
        let json = Zeroizing::new(decrypt(&master, wrapped, KEYRING_CONTEXT)?);
        let stored: StoredKeyring =
            serde_json::from_slice(&json).map_err(|e| CryptoError::InvalidKey {
                reason: format!("keyring is malformed: {e}"),
            })?;

        let mut keys = BTreeMap::new();
        for (version, encoded) in &stored.keys {
            keys.insert(*version, EncryptionKey::from_base64(encoded)?);
        }
        if !keys.contains_key(&stored.active) {
            return Err(CryptoError::InvalidKey {
                reason: format!("active key version {} missing from keyring", stored.active),
            });
        }
        Self::with_keyring(
            master,
            Keyring {
                active: stored.active,
                keys,
            },
        )
    }

    fn with_keyring(master: EncryptionKey, keyring: Keyring) -> Result<Self, CryptoError> {
        Ok(Self {
            export_key: derive_key(&master, Some(HKDF_SALT), EXPORT_INFO)?,
            bundle_sign_key: derive_key(&master, Some(HKDF_SALT), BUNDLE_SIGN_INFO)?,
            audit_sign_key: derive_key(&master, Some(HKDF_SALT), AUDIT_SIGN_INFO)?,
            master,
            keyring: RwLock::new(keyring),
        })
    }

    /// Serialize the keyring and seal it under the master key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if sealing fails.
    pub async fn wrap_keyring(&self) -> Result<Vec<u8>, CryptoError> {
        let ring = self.keyring.read().await;
        self.wrap(ring.active, &ring.keys)
    }

    fn wrap(&self, active: u32, keys: &BTreeMap<u32, EncryptionKey>) -> Result<Vec<u8>, CryptoError> {
        let stored = StoredKeyring {
            active,
            keys: keys
                .iter()
                .map(|(v, k)| (*v, BASE64.encode(k.as_bytes())))
                .collect(),
        };
        let json = Zeroizing::new(serde_json::to_vec(&stored).map_err(|e| {
            CryptoError::Encryption {
                reason: format!("keyring serialization failed: {e}"),
            }
        })?);
        encrypt(&self.master, &json, KEYRING_CONTEXT)
    }

    /// Seal `plaintext` under the active data key, bound to `context`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
    pub async fn seal(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ring = self.keyring.read().await;
        let key = ring
            .keys
            .get(&ring.active)
            .ok_or_else(|| CryptoError::Encryption {
                reason: format!("active key version {} missing", ring.active),
            })?;
        let body = encrypt(key, plaintext, context)?;
        let mut sealed = Vec::with_capacity(VERSION_LEN.saturating_add(body.len()));
        sealed.extend_from_slice(&ring.active.to_be_bytes());
        sealed.extend_from_slice(&body);
        Ok(sealed)
    }

    /// Open a blob produced by [`seal`](Self::seal) with the same `context`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Integrity`] for truncated blobs, unknown key
    /// versions, and authentication failures.
    pub async fn open(&self, sealed: &[u8], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let version = blob_version(sealed).ok_or_else(|| CryptoError::Integrity {
            reason: format!(
                "sealed blob too short: expected at least {MIN_SEALED_LEN} bytes, got {}",
                sealed.len()
            ),
        })?;
        let ring = self.keyring.read().await;
        let key = ring
            .keys
            .get(&version)
            .ok_or_else(|| CryptoError::Integrity {
                reason: format!("unknown key version {version}"),
            })?;
        decrypt(key, &sealed[VERSION_LEN..], context)
    }

    /// Version of the data key the blob was sealed under, if it is well formed.
    #[must_use]
    pub fn sealed_version(sealed: &[u8]) -> Option<u32> {
        blob_version(sealed)
    }

    pub async fn active_version(&self) -> u32 {
        self.keyring.read().await.active
    }

    /// Generate the next data key and wrap a keyring in which it is active.
    ///
    /// Nothing changes until [`commit_rotation`](Self::commit_rotation), so
    /// the wrapped keyring can be stored first.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the keyring cannot be sealed.
    pub async fn prepare_rotation(&self) -> Result<PendingRotation, CryptoError> {
        let ring = self.keyring.read().await;
        let version = ring.keys.keys().next_back().copied().unwrap_or(0).saturating_add(1);
        let key = EncryptionKey::generate();
        let mut keys = ring.keys.clone();
        keys.insert(version, key.clone());
        let wrapped = self.wrap(version, &keys)?;
        Ok(PendingRotation { version, key, wrapped })
    }

    /// Make a prepared key the one new data is sealed under.
    pub async fn commit_rotation(&self, pending: PendingRotation) -> u32 {
        let PendingRotation { version, key, .. } = pending;
        let mut ring = self.keyring.write().await;
        ring.keys.insert(version, key);
        ring.active = version;
        info!(version, "data key rotated");
        version
    }

    /// The keyring as it will be after [`retire_inactive`](Self::retire_inactive),
    /// sealed for storage.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the keyring cannot be sealed.
    pub async fn wrap_retired_keyring(&self) -> Result<Vec<u8>, CryptoError> {
        let ring = self.keyring.read().await;
        let active: BTreeMap<u32, EncryptionKey> = ring
            .keys
            .iter()
            .filter(|(v, _)| **v == ring.active)
            .map(|(v, k)| (*v, k.clone()))
            .collect();
        self.wrap(ring.active, &active)
    }

    /// Drop every data key except the active one. Returns the removed versions.
    pub async fn retire_inactive(&self) -> Vec<u32> {
        let mut ring = self.keyring.write().await;
        let active = ring.active;
        let retired: Vec<u32> = ring.keys.keys().copied().filter(|v| *v != active).collect();
        ring.keys.retain(|v, _| *v == active);
        retired
    }

    /// Seal export material under the export key. Independent of the data
    /// keyring, so bundles survive key rotation.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
    pub fn seal_export(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt(&self.export_key, plaintext, context)
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::Integrity`] if the blob fails authentication.
    pub fn open_export(&self, sealed: &[u8], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt(&self.export_key, sealed, context)
    }

    /// HMAC-SHA256 over a sealed bundle.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] if the MAC cannot be keyed.
    pub fn sign_bundle(&self, data: &[u8]) -> Result<String, CryptoError> {
        hmac_hex(&self.bundle_sign_key, data)
    }

    #[must_use]
    pub fn verify_bundle(&self, data: &[u8], signature: &str) -> bool {
        hmac_verify(&self.bundle_sign_key, data, signature)
    }
}

impl ChainSigner for CryptoEngine {
    fn sign(&self, digest: &str) -> Option<String> {
        hmac_hex(&self.audit_sign_key, digest.as_bytes()).ok()
    }

    fn verify(&self, digest: &str, signature: &str) -> bool {
        hmac_verify(&self.audit_sign_key, digest.as_bytes(), signature)
    }
}

fn blob_version(sealed: &[u8]) -> Option<u32> {
    if sealed.len() < MIN_SEALED_LEN {
        return None;
    }
    let prefix: [u8; VERSION_LEN] = sealed.get(..VERSION_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix))
}

impl fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("master", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
