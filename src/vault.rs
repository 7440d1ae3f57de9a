//! OAuth token encryption at rest.
//!
//! Tokens stored in `user_oauth_tokens` are sealed with AES-256-GCM under
//! the `ENCRYPTION_KEY` master key (64-char hex). The OAuth flow itself
//! lives outside this service; only the sealed storage format is owned
//! here.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;

pub struct TokenCrypto {
    key: [u8; 32],
}

impl TokenCrypto {
    pub fn new(master_key_hex: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(master_key_hex.trim())
            .map_err(|_| anyhow::anyhow!("ENCRYPTION_KEY must be hex"))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("ENCRYPTION_KEY must be 32 bytes (64 hex chars)"))?;
        Ok(Self { key })
    }

    /// Seal a token. Output format: `base64(nonce) ":" base64(ciphertext)`,
    /// suitable for a single text column.
    pub fn encrypt_string(&self, plaintext: &str) -> anyhow::Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("invalid key length: {:?}", e))?;

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("token encryption failed: {}", e))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        Ok(format!("{}:{}", b64.encode(nonce_bytes), b64.encode(ciphertext)))
    }

    pub fn decrypt_string(&self, sealed: &str) -> anyhow::Result<String> {
        let (nonce_b64, ct_b64) = sealed
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed sealed token"))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        let nonce_bytes = b64.decode(nonce_b64)?;
        let ciphertext = b64.decode(ct_b64)?;

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("invalid key length: {:?}", e))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| anyhow::anyhow!("token decryption failed: {}", e))?;

        Ok(String::from_utf8(plaintext)?)
    }
}
