//! Custom error types for the RelayPass server

use thiserror::Error;

/// RelayPass error types
#[derive(Error, Debug)]
pub enum RelayError {
    /// The relay refused the identity/secret pair. Terminal for the session.
    #[error("Credential rejected: {0}")]
    CredentialRejected(String),

    /// Network or protocol fault while reaching the relay.
    #[error("Relay connection error: {0}")]
    RelayConnection(String),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Validation error: {0}")]
    Validation(String),

    /// Ciphertext could not be opened with the process key.
    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("TLS/Certificate error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Protocol error code for this error
    pub fn code(&self) -> u32 {
        match self {
            RelayError::Validation(_) => codes::INVALID_FORMAT,
            RelayError::InvalidToken => codes::INVALID_TOKEN,
            RelayError::TokenExpired => codes::SESSION_EXPIRED,
            RelayError::CredentialRejected(_) => codes::CREDENTIAL_REJECTED,
            RelayError::RelayConnection(_) => codes::RELAY_UNREACHABLE,
            RelayError::Decryption(_)
            | RelayError::Tls(_)
            | RelayError::Config(_)
            | RelayError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Whether the caller has to authenticate again before retrying
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidToken | RelayError::TokenExpired | RelayError::CredentialRejected(_)
        )
    }
}

/// Result type alias for RelayPass operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Outcome of a single delivery attempt that did not succeed.
///
/// Kept apart from [`RelayError`] because the dispatch loop treats the two
/// variants differently: one ends the batch, the other is counted and skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The relay no longer accepts the bound credential.
    #[error("Authorization lost: {0}")]
    AuthorizationLost(String),

    /// Timeout, refusal, bad address. Scoped to one attempt.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<DeliveryError> for RelayError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::AuthorizationLost(msg) => RelayError::CredentialRejected(msg),
            DeliveryError::Transport(msg) => RelayError::RelayConnection(msg),
        }
    }
}

/// Error codes for protocol responses
pub mod codes {
    // Parse / validation errors (1xxx)
    pub const MALFORMED_JSON: u32 = 1001;
    pub const UNKNOWN_COMMAND: u32 = 1002;
    pub const INVALID_FORMAT: u32 = 1004;

    // Authorization errors (2xxx)
    pub const AUTH_REQUIRED: u32 = 2002;
    pub const SESSION_EXPIRED: u32 = 2004;
    pub const INVALID_TOKEN: u32 = 2005;

    // Relay errors (3xxx)
    pub const CREDENTIAL_REJECTED: u32 = 3001;
    pub const RELAY_UNREACHABLE: u32 = 3002;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: u32 = 5000;
}

// ============================================================================
// TESTS
// ============================================================================
