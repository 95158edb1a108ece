// Encryption for user LLM API keys at rest
//
// AES-256-GCM with a per-value random nonce. The key comes from
// PODEX_SECRETS_KEY (base64, 32 bytes) or, absent that, is derived from
// the JWT secret so development deployments work without extra setup.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

use podex_core::Settings;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Encrypts and decrypts small secrets (user API keys)
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Build from a raw 32-byte key
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            anyhow::bail!("Encryption key must be {} bytes, got {}", KEY_SIZE, key.len());
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Build from settings: PODEX_SECRETS_KEY if present, else a key
    /// derived from the JWT secret
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        match std::env::var("PODEX_SECRETS_KEY") {
            Ok(encoded) => {
                let key = BASE64
                    .decode(encoded)
                    .context("PODEX_SECRETS_KEY is not valid base64")?;
                Self::new(&key)
            }
            Err(_) => {
                let derived = Sha256::digest(settings.jwt_secret_key.as_bytes());
                Self::new(&derived)
            }
        }
    }

    /// Encrypt a secret; output is base64(nonce || ciphertext)
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypt a value produced by encrypt()
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = BASE64.decode(encoded).context("Invalid base64 payload")?;
        if combined.len() <= NONCE_SIZE {
            anyhow::bail!("Payload too short");
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))?;
        String::from_utf8(plaintext).context("Decrypted payload is not UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        EncryptionService::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let svc = service();
        let encrypted = svc.encrypt("sk-ant-user-key").unwrap();
        assert_ne!(encrypted, "sk-ant-user-key");
        assert_eq!(svc.decrypt(&encrypted).unwrap(), "sk-ant-user-key");
    }

    #[test]
    fn test_nonces_differ() {
        let svc = service();
        let a = svc.encrypt("same").unwrap();
        let b = svc.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = service().encrypt("secret").unwrap();
        let other = EncryptionService::new(&[9u8; 32]).unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let svc = service();
        let mut encrypted = svc.encrypt("secret").unwrap();
        encrypted.replace_range(4..5, if &encrypted[4..5] == "A" { "B" } else { "A" });
        assert!(svc.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(EncryptionService::new(&[1u8; 16]).is_err());
    }
}
