//! Session token issuance and lookup-key derivation using HMAC-SHA256
//!
//! Raw tokens are 256 random bits, hex encoded behind a short prefix. The
//! store never sees them: it is indexed by an HMAC of the token under a
//! per-process key, so a dump of the store does not yield usable tokens.

use std::fmt;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix carried by every raw token
pub const TOKEN_PREFIX: &str = "rp_";

/// Random bytes behind each token
pub const TOKEN_ENTROPY_BYTES: usize = 32;

/// One-way store index derived from a raw token
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LookupKey(String);

impl LookupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form safe for logs
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Debug for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LookupKey({}..)", self.short())
    }
}

/// Issues raw tokens and maps them to lookup keys
pub struct TokenCodec {
    lookup_secret: [u8; 32],
}

impl TokenCodec {
    /// Create a codec with a random lookup secret
    pub fn generate() -> Self {
        let mut lookup_secret = [0u8; 32];
        OsRng.fill_bytes(&mut lookup_secret);
        Self { lookup_secret }
    }

    /// Generate a new unguessable raw token
    ///
    /// # Returns
    /// `rp_` followed by 64 hex characters (256 bits of entropy)
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        format!("{TOKEN_PREFIX}{}", hex::encode(bytes))
    }

    /// Derive the store index for a raw token
    pub fn lookup_key_of(&self, raw_token: &str) -> LookupKey {
        let mut mac = HmacSha256::new_from_slice(&self.lookup_secret)
            .expect("HMAC can take key of any size");
        mac.update(raw_token.trim().as_bytes());

        LookupKey(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenCodec { lookup_secret: <redacted> }")
    }
}

/// Check whether a string has the shape of an issued token
pub fn is_well_formed(token: &str) -> bool {
    token
        .strip_prefix(TOKEN_PREFIX)
        .map(|rest| rest.len() == TOKEN_ENTROPY_BYTES * 2 && rest.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_shape() {
        let codec = TokenCodec::generate();
        let token = codec.issue();

        assert!(token.starts_with(TOKEN_PREFIX));
        assert_eq!(token.len(), TOKEN_PREFIX.len() + 64);
        assert!(is_well_formed(&token));
        assert!(!is_well_formed("rp_not-hex"));
        assert!(!is_well_formed("regular-token"));
    }

    #[test]
    fn test_tokens_unique() {
        let codec = TokenCodec::generate();
        let tokens: HashSet<String> = (0..1000).map(|_| codec.issue()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn test_lookup_key_deterministic() {
        let codec = TokenCodec::generate();
        let token = codec.issue();

        let key1 = codec.lookup_key_of(&token);
        let key2 = codec.lookup_key_of(&token);

        assert_eq!(key1, key2);
        assert_eq!(key1.as_str().len(), 64);
        assert!(!key1.as_str().contains(&token[TOKEN_PREFIX.len()..]));
    }

    #[test]
    fn test_lookup_keys_distinct() {
        let codec = TokenCodec::generate();
        let keys: HashSet<LookupKey> = (0..1000)
            .map(|_| codec.lookup_key_of(&codec.issue()))
            .collect();
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn test_lookup_secret_is_per_process() {
        let token = TokenCodec::generate().issue();
        let a = TokenCodec::generate().lookup_key_of(&token);
        let b = TokenCodec::generate().lookup_key_of(&token);
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_does_not_leak() {
        let codec = TokenCodec::generate();
        let key = codec.lookup_key_of(&codec.issue());
        let rendered = format!("{key:?}");
        assert!(rendered.len() < key.as_str().len());
    }
}
