//! Session management for the RelayPass server
//!
//! Provides thread-safe storage of encrypted relay credentials, addressed
//! only through the lookup key of the token that was issued for them.
//!
//! Expiry is enforced lazily: [`SessionStore::resolve`] deletes and rejects
//! a session it finds past `expires_at`. Sweeping the whole map is only
//! memory reclamation and happens opportunistically on store access.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use zeroize::Zeroizing;

use crate::cipher::CredentialCipher;
use crate::error::{RelayError, RelayResult};
use crate::token::{self, LookupKey, TokenCodec};

/// A stored session. Credential fields are ciphertext only.
#[derive(Clone)]
pub struct Session {
    pub lookup_key: LookupKey,
    pub encrypted_identity: Vec<u8>,
    pub encrypted_secret: Vec<u8>,
    pub relay_host: String,
    pub relay_port: u16,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Check if session has expired
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("lookup_key", &self.lookup_key)
            .field("relay_host", &self.relay_host)
            .field("relay_port", &self.relay_port)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Credentials opened for the duration of one dispatch call.
pub struct DecryptedSession {
    pub identity: String,
    pub secret: Zeroizing<String>,
    pub relay_host: String,
    pub relay_port: u16,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for DecryptedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedSession")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .field("relay_host", &self.relay_host)
            .field("relay_port", &self.relay_port)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of a successful [`SessionStore::create`]
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

struct StoreInner {
    sessions: HashMap<LookupKey, Session>,
    last_sweep: DateTime<Utc>,
}

/// Thread-safe session store
pub struct SessionStore {
    inner: Mutex<StoreInner>,
    cipher: CredentialCipher,
    codec: TokenCodec,
    ttl: Duration,
    sweep_interval: Duration,
}

impl SessionStore {
    /// Create an empty store with a fresh process key
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self::with_parts(CredentialCipher::generate(), TokenCodec::generate(), ttl, sweep_interval)
    }

    pub fn with_parts(
        cipher: CredentialCipher,
        codec: TokenCodec,
        ttl: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                sessions: HashMap::new(),
                last_sweep: Utc::now(),
            }),
            cipher,
            codec,
            ttl,
            sweep_interval,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seal a credential and register it under a freshly issued token
    pub fn create(
        &self,
        identity: &str,
        secret: &str,
        relay_host: &str,
        relay_port: u16,
    ) -> RelayResult<IssuedToken> {
        self.create_at(identity, secret, relay_host, relay_port, Utc::now())
    }

    pub fn create_at(
        &self,
        identity: &str,
        secret: &str,
        relay_host: &str,
        relay_port: u16,
        now: DateTime<Utc>,
    ) -> RelayResult<IssuedToken> {
        let encrypted_identity = self.cipher.encrypt(identity)?;
        let encrypted_secret = self.cipher.encrypt(secret)?;
        let expires_at = now + self.ttl;

        let mut inner = self.lock();
        self.maybe_sweep(&mut inner, now);

        loop {
            let token = self.codec.issue();
            let lookup_key = self.codec.lookup_key_of(&token);
            if inner.sessions.contains_key(&lookup_key) {
                continue;
            }

            debug!(key = lookup_key.short(), relay_host, relay_port, "session created");
            inner.sessions.insert(
                lookup_key.clone(),
                Session {
                    lookup_key,
                    encrypted_identity,
                    encrypted_secret,
                    relay_host: relay_host.to_string(),
                    relay_port,
                    created_at: now,
                    expires_at,
                },
            );

            return Ok(IssuedToken { token, expires_at });
        }
    }

    /// Validate a raw token and open its credentials.
    ///
    /// This is the only authorization gate for dispatch; callers re-run it on
    /// every call instead of caching the result.
    pub fn resolve(&self, raw_token: &str) -> RelayResult<DecryptedSession> {
        self.resolve_at(raw_token, Utc::now())
    }

    pub fn resolve_at(&self, raw_token: &str, now: DateTime<Utc>) -> RelayResult<DecryptedSession> {
        let raw_token = raw_token.trim();
        if !token::is_well_formed(raw_token) {
            return Err(RelayError::InvalidToken);
        }
        let lookup_key = self.codec.lookup_key_of(raw_token);

        let session = {
            let mut inner = self.lock();

            // The caller's own entry is judged before any sweep can remove it.
            let found = match inner.sessions.get(&lookup_key) {
                None => Err(RelayError::InvalidToken),
                Some(session) if session.is_expired_at(now) => Err(RelayError::TokenExpired),
                Some(session) => Ok(session.clone()),
            };

            if matches!(found, Err(RelayError::TokenExpired)) {
                inner.sessions.remove(&lookup_key);
                debug!(key = lookup_key.short(), "expired session evicted on access");
            }

            self.maybe_sweep(&mut inner, now);
            found?
        };

        Ok(DecryptedSession {
            identity: self.cipher.decrypt(&session.encrypted_identity)?.to_string(),
            secret: self.cipher.decrypt(&session.encrypted_secret)?,
            relay_host: session.relay_host,
            relay_port: session.relay_port,
            expires_at: session.expires_at,
        })
    }

    /// Remove every expired session, returning how many were dropped
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        Self::sweep_locked(&mut inner, now)
    }

    fn maybe_sweep(&self, inner: &mut StoreInner, now: DateTime<Utc>) {
        if now - inner.last_sweep >= self.sweep_interval {
            Self::sweep_locked(inner, now);
        }
    }

    fn sweep_locked(inner: &mut StoreInner, now: DateTime<Utc>) -> usize {
        let before = inner.sessions.len();
        inner.sessions.retain(|_, session| !session.is_expired_at(now));
        inner.last_sweep = now;

        let removed = before - inner.sessions.len();
        if removed > 0 {
            debug!(removed, "swept expired sessions");
        }
        removed
    }

    /// Get count of stored sessions, expired or not
    pub fn active_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.active_count())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> SessionStore {
        SessionStore::new(Duration::hours(24), Duration::minutes(5))
    }

    #[test]
    fn test_create_then_resolve() {
        let store = store();
        let issued = store
            .create("user@example.com", "app password", "smtp.example.com", 465)
            .unwrap();

        let session = store.resolve(&issued.token).unwrap();
        assert_eq!(session.identity, "user@example.com");
        assert_eq!(session.secret.as_str(), "app password");
        assert_eq!(session.relay_host, "smtp.example.com");
        assert_eq!(session.relay_port, 465);
        assert_eq!(session.expires_at, issued.expires_at);
    }

    #[test]
    fn test_ciphertext_at_rest() {
        let store = store();
        let issued = store.create("user@example.com", "hunter2", "smtp.example.com", 465).unwrap();

        let inner = store.lock();
        let session = inner.sessions.values().next().unwrap();
        assert!(!session
            .encrypted_secret
            .windows(b"hunter2".len())
            .any(|w| w == b"hunter2"));
        assert!(!inner
            .sessions
            .keys()
            .any(|k| k.as_str().contains(&issued.token[token::TOKEN_PREFIX.len()..])));
    }

    #[test]
    fn test_unknown_and_malformed_tokens() {
        let store = store();
        store.create("user@example.com", "pw", "smtp.example.com", 465).unwrap();

        let foreign = TokenCodec::generate().issue();
        assert!(matches!(store.resolve(&foreign), Err(RelayError::InvalidToken)));
        assert!(matches!(store.resolve("garbage"), Err(RelayError::InvalidToken)));
        assert!(matches!(store.resolve(""), Err(RelayError::InvalidToken)));
    }

    #[test]
    fn test_expired_rejected_before_sweep() {
        let store = SessionStore::new(Duration::hours(1), Duration::days(365));
        let now = Utc::now();
        let issued = store.create_at("user@example.com", "pw", "smtp.example.com", 465, now).unwrap();

        let later = now + Duration::hours(1) + Duration::seconds(1);
        assert!(matches!(store.resolve_at(&issued.token, later), Err(RelayError::TokenExpired)));

        // Lazily evicted, so a second look no longer finds it at all.
        assert_eq!(store.active_count(), 0);
        assert!(matches!(store.resolve_at(&issued.token, later), Err(RelayError::InvalidToken)));
    }

    #[test]
    fn test_still_valid_at_boundary() {
        let store = SessionStore::new(Duration::hours(1), Duration::days(365));
        let now = Utc::now();
        let issued = store.create_at("user@example.com", "pw", "smtp.example.com", 465, now).unwrap();

        assert!(store.resolve_at(&issued.token, now + Duration::hours(1)).is_ok());
    }

    #[test]
    fn test_same_identity_twice() {
        let store = SessionStore::new(Duration::hours(1), Duration::days(365));
        let now = Utc::now();
        let first = store.create_at("user@example.com", "pw", "smtp.example.com", 465, now).unwrap();
        let second = store
            .create_at("user@example.com", "pw", "smtp.example.com", 465, now + Duration::minutes(30))
            .unwrap();

        assert_ne!(first.token, second.token);
        assert_eq!(store.active_count(), 2);

        let between = now + Duration::minutes(61);
        assert!(matches!(store.resolve_at(&first.token, between), Err(RelayError::TokenExpired)));
        assert!(store.resolve_at(&second.token, between).is_ok());
    }

    #[test]
    fn test_tokens_never_cross_resolve() {
        let store = store();
        let a = store.create("a@example.com", "pw-a", "smtp.example.com", 465).unwrap();
        let b = store.create("b@example.com", "pw-b", "smtp.example.com", 587).unwrap();

        assert_eq!(store.resolve(&a.token).unwrap().identity, "a@example.com");
        let resolved_b = store.resolve(&b.token).unwrap();
        assert_eq!(resolved_b.identity, "b@example.com");
        assert_eq!(resolved_b.relay_port, 587);
    }

    #[test]
    fn test_sweep_expired() {
        let store = SessionStore::new(Duration::hours(1), Duration::days(365));
        let now = Utc::now();
        store.create_at("old@example.com", "pw", "smtp.example.com", 465, now).unwrap();
        store
            .create_at("new@example.com", "pw", "smtp.example.com", 465, now + Duration::hours(2))
            .unwrap();

        assert_eq!(store.sweep_expired_at(now + Duration::hours(2)), 1);
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn test_opportunistic_sweep_on_unrelated_read() {
        let store = SessionStore::new(Duration::hours(1), Duration::minutes(5));
        let now = Utc::now();
        store.create_at("old@example.com", "pw", "smtp.example.com", 465, now).unwrap();
        let fresh = store
            .create_at("new@example.com", "pw", "smtp.example.com", 465, now)
            .unwrap();

        // Reading the fresh token two hours later would also expire it, so
        // read an unrelated token instead and check the map was reclaimed.
        let later = now + Duration::hours(2);
        let _ = store.resolve_at(&TokenCodec::generate().issue(), later);
        assert_eq!(store.active_count(), 0);
        assert!(matches!(store.resolve_at(&fresh.token, later), Err(RelayError::InvalidToken)));
    }

    #[test]
    fn test_expired_reported_when_own_read_triggers_sweep() {
        let store = SessionStore::new(Duration::hours(1), Duration::minutes(5));
        let now = Utc::now();
        let issued = store.create_at("user@example.com", "pw", "smtp.example.com", 465, now).unwrap();
        let bystander = store
            .create_at("other@example.com", "pw", "smtp.example.com", 465, now)
            .unwrap();

        let later = now + Duration::hours(2);
        assert!(matches!(store.resolve_at(&issued.token, later), Err(RelayError::TokenExpired)));

        // The same read also reclaimed every other expired entry.
        assert_eq!(store.active_count(), 0);
        assert!(matches!(store.resolve_at(&bystander.token, later), Err(RelayError::InvalidToken)));
    }

    #[test]
    fn test_concurrent_resolve_and_evict() {
        let store = Arc::new(SessionStore::new(Duration::hours(1), Duration::days(365)));
        let now = Utc::now();
        let issued = store.create_at("user@example.com", "pw", "smtp.example.com", 465, now).unwrap();
        let later = now + Duration::hours(2);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let token = issued.token.clone();
                std::thread::spawn(move || store.resolve_at(&token, later))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let expired = results
            .iter()
            .filter(|r| matches!(r, Err(RelayError::TokenExpired)))
            .count();

        // Exactly one caller observes and evicts; the rest find nothing.
        assert_eq!(expired, 1);
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(store.active_count(), 0);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let store = store();
        let issued = store.create("user@example.com", "hunter2", "smtp.example.com", 465).unwrap();
        let session = store.resolve(&issued.token).unwrap();

        let rendered = format!("{session:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("user@example.com"));
    }
}
