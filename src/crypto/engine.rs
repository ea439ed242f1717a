use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::SyncError;

type HmacSha256 = Hmac<Sha256>;

/// Helper to create an HMAC instance, resolving trait ambiguity.
fn new_hmac(key: &[u8]) -> Result<HmacSha256, SyncError> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| SyncError::Crypto(format!("HMAC init failed: {e}")))
}

/// Handles AES-256-GCM encryption for stored tokens and HMAC signing for
/// webhook channel tokens.
///
/// The channel token sent to the provider at subscription time is a signed
/// encoding of the owning (user, provider, resource) triple. Verifying it on
/// an inbound notification both authenticates the notification and resolves
/// the local user in O(1), with no account scan.
pub struct CryptoEngine {
    cipher: Aes256Gcm,
    hmac_key: Vec<u8>,
}

impl CryptoEngine {
    /// Create a new CryptoEngine from base64-encoded keys.
    pub fn new(master_key_b64: &str, hmac_secret_b64: &str) -> Result<Self, SyncError> {
        let master_key = base64::engine::general_purpose::STANDARD
            .decode(master_key_b64)
            .map_err(|e| SyncError::Crypto(format!("Invalid MASTER_KEY base64: {e}")))?;

        if master_key.len() != 32 {
            return Err(SyncError::Crypto(format!(
                "MASTER_KEY must be 32 bytes, got {}",
                master_key.len()
            )));
        }

        let hmac_key = base64::engine::general_purpose::STANDARD
            .decode(hmac_secret_b64)
            .map_err(|e| SyncError::Crypto(format!("Invalid HMAC_SECRET base64: {e}")))?;

        let cipher = Aes256Gcm::new_from_slice(&master_key)
            .map_err(|e| SyncError::Crypto(format!("Failed to init AES cipher: {e}")))?;

        Ok(Self { cipher, hmac_key })
    }

    /// Encrypt plaintext using AES-256-GCM. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SyncError> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {e}")))?;

        // Prepend nonce to ciphertext
        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt base64(nonce || ciphertext) back to plaintext.
    pub fn decrypt(&self, encrypted_b64: &str) -> Result<String, SyncError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .map_err(|e| SyncError::Crypto(format!("Invalid base64: {e}")))?;

        if combined.len() < 12 {
            return Err(SyncError::Crypto("Ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| SyncError::Crypto(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| SyncError::Crypto(format!("Invalid UTF-8 after decrypt: {e}")))
    }

    /// Sign a channel token payload with HMAC-SHA256. Returns base64url(hmac || payload).
    pub fn sign_channel_token(&self, payload: &str) -> Result<String, SyncError> {
        let mut mac = new_hmac(&self.hmac_key)?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();

        let mut combined = signature.to_vec();
        combined.extend_from_slice(payload.as_bytes());

        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&combined))
    }

    /// Verify a signed channel token and extract its payload.
    pub fn verify_channel_token(&self, signed: &str) -> Result<String, SyncError> {
        let combined = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(signed)
            .map_err(|_| SyncError::Unauthorized)?;

        if combined.len() < 32 {
            return Err(SyncError::Unauthorized);
        }

        let (signature, payload_bytes) = combined.split_at(32);

        let mut mac = new_hmac(&self.hmac_key)?;
        mac.update(payload_bytes);
        mac.verify_slice(signature)
            .map_err(|_| SyncError::Unauthorized)?;

        String::from_utf8(payload_bytes.to_vec()).map_err(|_| SyncError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> CryptoEngine {
        // 32-byte key for AES-256, base64 encoded
        let key = base64::engine::general_purpose::STANDARD.encode([0x42u8; 32]);
        let hmac = base64::engine::general_purpose::STANDARD.encode([0x43u8; 32]);
        CryptoEngine::new(&key, &hmac).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let engine = test_engine();
        let plaintext = "ya29.a0AfH6S-refresh-token-value";
        let encrypted = engine.encrypt(plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        let decrypted = engine.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_produces_different_ciphertexts() {
        let engine = test_engine();
        let plaintext = "same-input";
        let a = engine.encrypt(plaintext).unwrap();
        let b = engine.encrypt(plaintext).unwrap();
        // Different nonces, different ciphertexts
        assert_ne!(a, b);
    }

    #[test]
    fn test_channel_token_roundtrip() {
        let engine = test_engine();
        let payload = "usr_123:google:calendar";
        let signed = engine.sign_channel_token(payload).unwrap();
        let verified = engine.verify_channel_token(&signed).unwrap();
        assert_eq!(verified, payload);
    }

    #[test]
    fn test_channel_token_tamper_detection() {
        let engine = test_engine();
        let signed = engine.sign_channel_token("usr_123:google:calendar").unwrap();
        let tampered = format!("{}X", signed);
        assert!(engine.verify_channel_token(&tampered).is_err());
    }

    #[test]
    fn test_channel_token_rejects_unsigned_garbage() {
        let engine = test_engine();
        assert!(engine.verify_channel_token("not-a-token").is_err());
        assert!(engine.verify_channel_token("").is_err());
    }
}
