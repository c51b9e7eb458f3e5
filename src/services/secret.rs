//! Credential encryption at rest.
//!
//! Credentials are stored encrypted in the repository and decrypted lazily
//! into the routing snapshot. The provider is pluggable: a no-op passthrough
//! (default) and an AES-GCM implementation keyed from the gateway secret
//! file. Encryption is non-deterministic (random nonce per call), so
//! plaintext uniqueness checks must decrypt-and-compare.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::core::error::AppError;

/// Encrypt/decrypt credential values at rest.
pub trait SecretProvider: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, AppError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, AppError>;
}

/// Plaintext passthrough, used when no secret key file is configured.
pub struct NoopSecretProvider;

impl SecretProvider for NoopSecretProvider {
    fn encrypt(&self, plaintext: &str) -> Result<String, AppError> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, AppError> {
        Ok(ciphertext.to_string())
    }
}

enum GcmCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

/// AES-GCM provider. Stored form: base64(nonce || ciphertext).
pub struct AesGcmSecretProvider {
    cipher: GcmCipher,
}

impl AesGcmSecretProvider {
    /// Build from the secret-key file content: a hex string decoding to a
    /// 16- or 32-byte key (AES-128 / AES-256).
    pub fn from_hex_key(hex: &str) -> Result<Self, AppError> {
        let key = decode_hex(hex.trim())
            .ok_or_else(|| AppError::Internal("secret key file is not valid hex".into()))?;

        let cipher = match key.len() {
            16 => GcmCipher::Aes128(
                Aes128Gcm::new_from_slice(&key)
                    .map_err(|e| AppError::Internal(format!("invalid AES key: {}", e)))?,
            ),
            32 => GcmCipher::Aes256(
                Aes256Gcm::new_from_slice(&key)
                    .map_err(|e| AppError::Internal(format!("invalid AES key: {}", e)))?,
            ),
            n => {
                return Err(AppError::Internal(format!(
                    "invalid secret key length: {} bytes (expected 16 or 32)",
                    n
                )))
            }
        };

        Ok(Self { cipher })
    }
}

impl SecretProvider for AesGcmSecretProvider {
    fn encrypt(&self, plaintext: &str) -> Result<String, AppError> {
        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let sealed = match &self.cipher {
            GcmCipher::Aes128(c) => c.encrypt(&nonce, plaintext.as_bytes()),
            GcmCipher::Aes256(c) => c.encrypt(&nonce, plaintext.as_bytes()),
        }
        .map_err(|_| AppError::Internal("encryption failed".into()))?;

        let mut out = nonce.to_vec();
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, AppError> {
        let data = BASE64
            .decode(ciphertext)
            .map_err(|e| AppError::DecryptFailed(format!("not base64: {}", e)))?;

        const NONCE_LEN: usize = 12;
        if data.len() < NONCE_LEN {
            return Err(AppError::DecryptFailed("ciphertext too short".into()));
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);

        let plain = match &self.cipher {
            GcmCipher::Aes128(c) => c.decrypt(Nonce::from_slice(nonce), sealed),
            GcmCipher::Aes256(c) => c.decrypt(Nonce::from_slice(nonce), sealed),
        }
        .map_err(|_| AppError::DecryptFailed("authentication failed".into()))?;

        String::from_utf8(plain)
            .map_err(|_| AppError::DecryptFailed("plaintext is not valid UTF-8".into()))
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
