//! Credential encryption at rest
//!
//! Identity and secret material is sealed with XChaCha20-Poly1305 under a key
//! drawn from the OS RNG when the cipher is built. The key lives only in this
//! process: it is never written out or logged, so a restart leaves every
//! previously sealed session undecryptable. That is the intended trust model,
//! not a fault to paper over.

use std::fmt;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use zeroize::Zeroizing;

use crate::error::{RelayError, RelayResult};

/// Size of the random nonce prefixed to every ciphertext.
pub const NONCE_SIZE: usize = 24;

/// Symmetric cipher keyed once per process
pub struct CredentialCipher {
    aead: XChaCha20Poly1305,
}

impl CredentialCipher {
    /// Create a cipher with a fresh random key
    pub fn generate() -> Self {
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        Self {
            aead: XChaCha20Poly1305::new(&key),
        }
    }

    /// Seal plaintext. Output layout is `nonce || ciphertext+tag`.
    pub fn encrypt(&self, plaintext: &str) -> RelayResult<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| RelayError::Internal("credential encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a ciphertext produced by [`CredentialCipher::encrypt`].
    ///
    /// Fails with [`RelayError::Decryption`] on a wrong key, truncation or
    /// tampering; it never returns unauthenticated bytes.
    pub fn decrypt(&self, ciphertext: &[u8]) -> RelayResult<Zeroizing<String>> {
        if ciphertext.len() <= NONCE_SIZE {
            return Err(RelayError::Decryption("ciphertext truncated".to_string()));
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        let plain = Zeroizing::new(
            self.aead
                .decrypt(XNonce::from_slice(nonce), sealed)
                .map_err(|_| RelayError::Decryption("authentication tag mismatch".to_string()))?,
        );

        let text = std::str::from_utf8(&plain)
            .map_err(|_| RelayError::Decryption("plaintext is not UTF-8".to_string()))?;
        Ok(Zeroizing::new(text.to_owned()))
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialCipher { key: <redacted> }")
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cipher = CredentialCipher::generate();
        let sealed = cipher.encrypt("app-password-123").unwrap();

        assert_ne!(&sealed[NONCE_SIZE..], b"app-password-123");
        assert_eq!(cipher.decrypt(&sealed).unwrap().as_str(), "app-password-123");
    }

    #[test]
    fn test_nonce_is_fresh() {
        let cipher = CredentialCipher::generate();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_foreign_key_fails_loudly() {
        let sealed = CredentialCipher::generate().encrypt("secret").unwrap();
        let restarted = CredentialCipher::generate();

        let err = restarted.decrypt(&sealed).unwrap_err();
        assert!(matches!(err, RelayError::Decryption(_)));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let cipher = CredentialCipher::generate();
        let mut sealed = cipher.encrypt("secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(cipher.decrypt(&sealed), Err(RelayError::Decryption(_))));
        assert!(matches!(cipher.decrypt(&sealed[..10]), Err(RelayError::Decryption(_))));
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", CredentialCipher::generate());
        assert!(rendered.contains("redacted"));
    }
}
