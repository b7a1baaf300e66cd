//! Password-at-rest encryption for gateway credentials (spec §4.6, §7).
//!
//! Grounded in `helpers/crypto.py`'s `encrypt_password`/`decrypt_password`:
//! AES-256-GCM with a random 96-bit nonce prepended to the ciphertext,
//! the whole thing base64-encoded for storage in `Lab::gateway_password_enc`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;

use crate::error::GatewayError;

const NONCE_LEN: usize = 12;

pub fn encrypt_password(key: &[u8], plaintext: &str) -> Result<String, GatewayError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| GatewayError::Crypto(e.to_string()))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| GatewayError::Crypto(e.to_string()))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(combined))
}

pub fn decrypt_password(key: &[u8], encoded: &str) -> Result<String, GatewayError> {
    let data = BASE64.decode(encoded).map_err(|e| GatewayError::Crypto(e.to_string()))?;
    if data.len() <= NONCE_LEN {
        return Err(GatewayError::Crypto("encrypted password is truncated".to_string()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| GatewayError::Crypto(e.to_string()))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| GatewayError::Crypto(e.to_string()))?;
    String::from_utf8(plaintext).map_err(|e| GatewayError::Crypto(e.to_string()))
}

/// A random alphanumeric password for the per-lab VNC/gateway credential.
pub fn generate_secure_password(length: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Vec<u8> {
        vec![7u8; 32]
    }

    #[test]
    fn password_roundtrips() {
        let key = test_key();
        let encrypted = encrypt_password(&key, "correct horse battery staple").unwrap();
        let decrypted = decrypt_password(&key, &encrypted).unwrap();
        assert_eq!(decrypted, "correct horse battery staple");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let encrypted = encrypt_password(&test_key(), "hunter2").unwrap();
        let wrong_key = vec![9u8; 32];
        assert!(decrypt_password(&wrong_key, &encrypted).is_err());
    }

    #[test]
    fn generated_passwords_have_requested_length() {
        assert_eq!(generate_secure_password(24).len(), 24);
    }
}
