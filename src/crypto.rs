//! Token hashing and at-rest credential encryption
//!
//! Two unrelated concerns share this module because both are tiny:
//!
//! - agent tokens are stored as salted SHA-256 hashes; the handshake verifies
//!   a presented plaintext token against every stored hash, so hashing must
//!   be deterministic given the stored salt
//! - backup repository credentials are stored AES-256-GCM encrypted under a
//!   single hub key and decrypted only in the moment a backup is triggered

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

const TOKEN_HASH_PREFIX: &str = "sha256";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const CIPHERTEXT_PREFIX: &str = "ENCv1:";

/// Hash a plaintext agent token with a fresh random salt.
///
/// Output format: `sha256$<base64 salt>$<base64 digest>`.
pub fn hash_token(token: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = salted_digest(&salt, token);
    format!(
        "{TOKEN_HASH_PREFIX}${}${}",
        BASE64.encode(salt),
        BASE64.encode(digest)
    )
}

/// Verify a presented token against a stored salted hash.
///
/// Unknown formats verify as false rather than erroring - the handshake
/// treats every non-match the same way.
pub fn verify_token(token: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(prefix), Some(salt), Some(digest)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if prefix != TOKEN_HASH_PREFIX || parts.next().is_some() {
        return false;
    }
    let (Ok(salt), Ok(digest)) = (BASE64.decode(salt), BASE64.decode(digest)) else {
        return false;
    };
    salted_digest(&salt, token).as_slice() == digest.as_slice()
}

fn salted_digest(salt: &[u8], token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Errors from the credential cipher.
#[derive(Debug)]
pub enum CipherError {
    /// The configured key is missing, not base64, or not 32 bytes.
    InvalidKey(String),
    /// Ciphertext is malformed or fails authentication.
    Decrypt(String),
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherError::InvalidKey(msg) => write!(f, "invalid credential key: {}", msg),
            CipherError::Decrypt(msg) => write!(f, "failed to decrypt credential: {}", msg),
        }
    }
}

impl std::error::Error for CipherError {}

/// AES-256-GCM cipher for backup credentials.
///
/// Ciphertext format: `ENCv1:<base64(nonce || ciphertext)>`. A fresh nonce is
/// drawn per encryption.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    /// Build a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(key_b64: &str) -> Result<Self, CipherError> {
        let trimmed = key_b64.trim();
        if trimmed.is_empty() {
            return Err(CipherError::InvalidKey("key cannot be empty".into()));
        }
        let bytes = BASE64
            .decode(trimmed)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(CipherError::InvalidKey(
                "key must decode to 32 bytes (256 bits)".into(),
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        // encryption with a valid key and fresh nonce cannot fail
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .expect("AES-GCM encryption");

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        format!("{CIPHERTEXT_PREFIX}{}", BASE64.encode(combined))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CipherError> {
        let encoded = stored
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or_else(|| CipherError::Decrypt("missing ciphertext prefix".into()))?;
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| CipherError::Decrypt(e.to_string()))?;
        if combined.len() <= NONCE_LEN {
            return Err(CipherError::Decrypt("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decrypt("authentication failed".into()))?;
        String::from_utf8(plaintext).map_err(|e| CipherError::Decrypt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> CredentialCipher {
        CredentialCipher::from_base64(&BASE64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn token_round_trip_verifies() {
        let hash = hash_token("s3cret-token");
        assert!(verify_token("s3cret-token", &hash));
        assert!(!verify_token("wrong-token", &hash));
    }

    #[test]
    fn same_token_hashes_differently_per_salt() {
        assert_ne!(hash_token("tok"), hash_token("tok"));
    }

    #[test]
    fn malformed_stored_hash_verifies_false() {
        assert!(!verify_token("tok", "not-a-hash"));
        assert!(!verify_token("tok", "sha256$!!$!!"));
        assert!(!verify_token("tok", "md5$AAAA$BBBB"));
    }

    #[test]
    fn credential_round_trip() {
        let cipher = test_cipher();
        let stored = cipher.encrypt("restic-repo-password");
        assert!(stored.starts_with("ENCv1:"));
        assert_eq!(cipher.decrypt(&stored).unwrap(), "restic-repo-password");
    }

    #[test]
    fn tampered_ciphertext_fails_decrypt() {
        let cipher = test_cipher();
        let mut stored = cipher.encrypt("secret");
        stored.pop();
        stored.push('A');
        assert!(cipher.decrypt(&stored).is_err());
    }

    #[test]
    fn short_key_rejected() {
        let err = CredentialCipher::from_base64(&BASE64.encode([1u8; 16])).unwrap_err();
        assert!(matches!(err, CipherError::InvalidKey(_)));
    }
}
