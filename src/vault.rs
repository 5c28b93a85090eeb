use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tracing::error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption key must decode to 32 bytes")]
    InvalidKey,
    #[error("ciphertext is not valid base64")]
    InvalidEncoding,
    #[error("ciphertext too short")]
    Truncated,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("decrypted secret is not valid utf-8")]
    InvalidUtf8,
}

/// Authenticated symmetric vault for server credentials.
///
/// Ciphertexts are `base64(nonce || aes-256-gcm ciphertext)`. The key is
/// accepted as base64 or hex so operators can generate it with either
/// `openssl rand -base64 32` or `openssl rand -hex 32`.
#[derive(Clone)]
pub struct SecretVault {
    cipher: Aes256Gcm,
}

impl SecretVault {
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("ENCRYPTION_KEY").ok()?;
        match Self::new(&key) {
            Ok(vault) => Some(vault),
            Err(err) => {
                error!(?err, "ENCRYPTION_KEY is set but unusable");
                None
            }
        }
    }

    pub fn new(key: &str) -> Result<Self, VaultError> {
        let bytes = decode_key(key)?;
        let cipher = Aes256Gcm::new_from_slice(&bytes).map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::DecryptFailed)?;
        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(framed))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let framed = BASE64
            .decode(ciphertext.trim())
            .map_err(|_| VaultError::InvalidEncoding)?;
        if framed.len() <= NONCE_LEN {
            return Err(VaultError::Truncated);
        }
        let (nonce, payload) = framed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| VaultError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::InvalidUtf8)
    }

    /// Decrypt an optional stored secret, degrading to `None` on failure the
    /// way credential resolution always has: a broken ciphertext means the
    /// target simply has no usable credential of that kind.
    pub fn decrypt_opt(&self, stored: Option<&str>, label: &str, hostname: &str) -> Option<String> {
        let ciphertext = stored?;
        if ciphertext.is_empty() {
            return None;
        }
        match self.decrypt(ciphertext) {
            Ok(secret) => Some(secret),
            Err(err) => {
                error!(?err, %label, %hostname, "failed to decrypt credential field");
                None
            }
        }
    }
}

fn decode_key(key: &str) -> Result<Vec<u8>, VaultError> {
    let trimmed = key.trim();
    if let Ok(bytes) = hex::decode(trimmed) {
        if bytes.len() == 32 {
            return Ok(bytes);
        }
    }
    if let Ok(bytes) = BASE64.decode(trimmed) {
        if bytes.len() == 32 {
            return Ok(bytes);
        }
    }
    Err(VaultError::InvalidKey)
}
