//! Symmetric encryption of session payloads at rest.
//!
//! Uses ChaCha20-Poly1305 AEAD with a process-wide 256-bit key. Every call to
//! [`Vault::encrypt`] draws a fresh 96-bit nonce from the OS RNG; nonces are
//! never derived from counters or other state.
//!
//! Wire layout of an [`EncryptedBlob`]:
//!
//! ```text
//! +------+-----------+---------------------------+
//! | VCB1 | nonce(12) | ciphertext || tag(16)    |
//! +------+-----------+---------------------------+
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"VCB1";
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Associated data used for vault-encrypted credentials
const CREDENTIAL_AAD: &[u8] = b"vaultchat:credential";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    /// Authentication tag did not verify
    #[error("integrity check failed (tampered data or wrong key)")]
    Integrity,

    /// Blob is too short, has a bad header, or cannot be decoded
    #[error("malformed blob: {0}")]
    Malformed(String),

    /// Key material has the wrong length or encoding
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
}

/// Nonce + ciphertext + tag. The only on-disk representation of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    nonce: [u8; NONCE_LEN],
    /// Ciphertext with the 16-byte Poly1305 tag appended
    sealed: Vec<u8>,
}

impl EncryptedBlob {
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.sealed[..self.sealed.len() - TAG_LEN]
    }

    pub fn tag(&self) -> &[u8] {
        &self.sealed[self.sealed.len() - TAG_LEN..]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + self.sealed.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.sealed);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        let min = MAGIC.len() + NONCE_LEN + TAG_LEN;
        if bytes.len() < min {
            return Err(VaultError::Malformed(format!(
                "expected at least {} bytes, got {}",
                min,
                bytes.len()
            )));
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(VaultError::Malformed("unknown blob header".to_string()));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[MAGIC.len()..MAGIC.len() + NONCE_LEN]);
        Ok(Self {
            nonce,
            sealed: bytes[MAGIC.len() + NONCE_LEN..].to_vec(),
        })
    }
}

/// Process-wide encryption key. Cheap to share behind an `Arc`.
pub struct Vault {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Vault { key: <redacted> }")
    }
}

impl Vault {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != KEY_LEN {
            return Err(VaultError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        })
    }

    /// Build from a base64-encoded key (the form kept in the environment)
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::InvalidKey(format!("not valid base64: {}", e)))?;
        Self::new(&key)
    }

    /// Generate a fresh random key, base64-encoded
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        STANDARD.encode(key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, VaultError> {
        self.encrypt_bound(plaintext, &[])
    }

    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>, VaultError> {
        self.decrypt_bound(blob, &[])
    }

    /// Encrypt with associated data that must be presented again to decrypt
    pub fn encrypt_bound(
        &self,
        plaintext: &[u8],
        associated: &[u8],
    ) -> Result<EncryptedBlob, VaultError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: associated,
                },
            )
            .map_err(|_| VaultError::Malformed("plaintext too large to encrypt".to_string()))?;

        Ok(EncryptedBlob { nonce, sealed })
    }

    pub fn decrypt_bound(
        &self,
        blob: &EncryptedBlob,
        associated: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        self.cipher
            .decrypt(
                Nonce::from_slice(&blob.nonce),
                Payload {
                    msg: &blob.sealed,
                    aad: associated,
                },
            )
            .map_err(|_| VaultError::Integrity)
    }

    /// Encrypt a credential for storage in the environment (base64 of the blob bytes)
    pub fn encrypt_credential(&self, credential: &str) -> Result<String, VaultError> {
        let blob = self.encrypt_bound(credential.as_bytes(), CREDENTIAL_AAD)?;
        Ok(STANDARD.encode(blob.to_bytes()))
    }

    pub fn decrypt_credential(&self, encoded: &str) -> Result<String, VaultError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::Malformed(format!("credential is not valid base64: {}", e)))?;
        let blob = EncryptedBlob::from_bytes(&bytes)?;
        let plaintext = self.decrypt_bound(&blob, CREDENTIAL_AAD)?;
        String::from_utf8(plaintext)
            .map_err(|_| VaultError::Malformed("credential is not UTF-8".to_string()))
    }
}
