//! Authenticated symmetric encryption for provider tokens and webhook
//! secrets.
//!
//! Ciphertexts are self-describing strings of the form
//! `v1.<key_id>.<base64(nonce || ciphertext)>`. The key id is stored
//! alongside the payload so that a future key rotation can route old
//! ciphertexts to the right key.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Size of the vault key in bytes (256 bits for AES-256).
pub const KEY_SIZE: usize = 32;

/// Size of the AES-GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Ciphertext format version prefix.
const FORMAT_VERSION: &str = "v1";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault key must be {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("vault key is not valid base64")]
    InvalidKeyEncoding,
    #[error("malformed ciphertext")]
    Malformed,
    #[error("ciphertext was encrypted under key {found}, this vault holds {expected}")]
    KeyMismatch { expected: String, found: String },
    #[error("decryption failed (wrong key or tampered ciphertext)")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

/// Process-wide vault for encrypting credentials at rest.
///
/// Constructed once at startup from configuration; a missing or invalid
/// key is a fatal startup error, which `Config` enforces by failing
/// `from_env`.
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
    key_id: String,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl Vault {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != KEY_SIZE {
            return Err(VaultError::InvalidKeyLength(key.len()));
        }

        let key_id = fingerprint(key);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

        Ok(Self { cipher, key_id })
    }

    /// Build a vault from a base64-encoded 32-byte key (the on-disk /
    /// environment representation).
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let key = Zeroizing::new(
            general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|_| VaultError::InvalidKeyEncoding)?,
        );
        Self::new(&key)
    }

    /// Short identifier of the key this vault holds.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Encrypt arbitrary bytes. Each call uses a fresh random nonce, so
    /// two encryptions of the same plaintext never produce the same
    /// ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VaultError::Encrypt)?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);

        Ok(format!(
            "{}.{}.{}",
            FORMAT_VERSION,
            self.key_id,
            general_purpose::STANDARD.encode(payload)
        ))
    }

    /// Decrypt a ciphertext produced by [`Vault::encrypt`].
    ///
    /// The plaintext buffer is zeroized when dropped; callers must not
    /// let decrypted material cross a serialization boundary.
    pub fn decrypt(&self, token: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let mut parts = token.splitn(3, '.');
        let version = parts.next().ok_or(VaultError::Malformed)?;
        let key_id = parts.next().ok_or(VaultError::Malformed)?;
        let payload = parts.next().ok_or(VaultError::Malformed)?;

        if version != FORMAT_VERSION {
            return Err(VaultError::Malformed);
        }
        if key_id != self.key_id {
            return Err(VaultError::KeyMismatch {
                expected: self.key_id.clone(),
                found: key_id.to_string(),
            });
        }

        let payload = general_purpose::STANDARD
            .decode(payload)
            .map_err(|_| VaultError::Malformed)?;
        if payload.len() < NONCE_SIZE {
            return Err(VaultError::Malformed);
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Decrypt)?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Encrypt a UTF-8 string (the common case for tokens and secrets).
    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, VaultError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt to a UTF-8 string.
    pub fn decrypt_str(&self, token: &str) -> Result<Zeroizing<String>, VaultError> {
        let bytes = self.decrypt(token)?;
        let s = std::str::from_utf8(&bytes).map_err(|_| VaultError::Malformed)?;
        Ok(Zeroizing::new(s.to_string()))
    }
}

/// Generate a fresh random vault key, base64-encoded. Used by operators
/// to provision `TOKEN_ENCRYPTION_KEY`.
pub fn generate_key_base64() -> String {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(key.as_mut());
    general_purpose::STANDARD.encode(key.as_ref())
}

/// First 8 hex chars of the SHA-256 of the key. Identifies the key
/// without revealing it.
fn fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", b);
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}
