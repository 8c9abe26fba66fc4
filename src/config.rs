//! Server configuration management
//!
//! Loads settings from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Hard ceiling on how many times one message may be repeated per recipient.
pub const REPEAT_CEILING: u32 = 50;

/// Server configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    /// Host address to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Domain name (for production)
    pub domain: String,

    /// Path to TLS certificate
    pub cert_path: PathBuf,

    /// Path to TLS private key
    pub key_path: PathBuf,

    /// Session time-to-live in hours
    pub session_ttl_hours: i64,

    /// Minimum gap between opportunistic expiry sweeps, in seconds
    pub sweep_interval_secs: u64,

    /// Fixed pause between delivery attempts, in milliseconds
    pub send_delay_ms: u64,

    /// Upper bound on the repeat count of one dispatch
    pub max_repeat: u32,

    /// Upper bound on recipients in one dispatch
    pub max_recipients: usize,

    /// Relay used when an issuance request names none
    pub default_relay_host: String,

    /// Relay port used when an issuance request names none
    pub default_relay_port: u16,

    /// Per-attempt relay connection timeout, in seconds
    pub relay_timeout_secs: u64,

    /// Heartbeat interval in seconds
    pub heartbeat_interval: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            host: env::var("RELAYPASS_HOST")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),

            port: env_or("RELAYPASS_PORT", 4433),

            domain: env::var("RELAYPASS_DOMAIN")
                .unwrap_or_else(|_| "localhost".to_string()),

            cert_path: PathBuf::from(
                env::var("RELAYPASS_CERT_PATH")
                    .unwrap_or_else(|_| "certs/cert.pem".to_string()),
            ),

            key_path: PathBuf::from(
                env::var("RELAYPASS_KEY_PATH")
                    .unwrap_or_else(|_| "certs/key.pem".to_string()),
            ),

            session_ttl_hours: env_or("RELAYPASS_SESSION_TTL_HOURS", 24),
            sweep_interval_secs: env_or("RELAYPASS_SWEEP_INTERVAL_SECS", 300),
            send_delay_ms: env_or("RELAYPASS_SEND_DELAY_MS", 1000),
            max_repeat: env_or("RELAYPASS_MAX_REPEAT", REPEAT_CEILING),
            max_recipients: env_or("RELAYPASS_MAX_RECIPIENTS", 100),

            default_relay_host: env::var("RELAYPASS_RELAY_HOST")
                .unwrap_or_else(|_| "smtp.gmail.com".to_string()),

            default_relay_port: env_or("RELAYPASS_RELAY_PORT", 465),
            relay_timeout_secs: env_or("RELAYPASS_RELAY_TIMEOUT_SECS", 30),
            heartbeat_interval: env_or("RELAYPASS_HEARTBEAT_INTERVAL", 5),
        }
    }

    /// Get full bind address as string
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours)
    }

    pub fn sweep_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sweep_interval_secs as i64)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    /// Validate the tunables that do not depend on the filesystem
    pub fn validate_limits(&self) -> Result<(), String> {
        if self.session_ttl_hours <= 0 {
            return Err("Session TTL must be at least one hour".to_string());
        }

        if self.max_repeat == 0 || self.max_repeat > REPEAT_CEILING {
            return Err(format!("Max repeat must be between 1 and {REPEAT_CEILING}"));
        }

        if self.max_recipients == 0 {
            return Err("Max recipients must be at least 1".to_string());
        }

        if self.default_relay_host.trim().is_empty() {
            return Err("Default relay host must not be empty".to_string());
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.cert_path.exists() {
            return Err(format!("Certificate not found: {:?}", self.cert_path));
        }

        if !self.key_path.exists() {
            return Err(format!("Private key not found: {:?}", self.key_path));
        }

        self.validate_limits()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

// ============================================================================
// TESTS
// ============================================================================
