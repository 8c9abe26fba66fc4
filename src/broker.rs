//! Credential session broker
//!
//! The two inbound operations of the service. `issue_session` checks a
//! credential against its relay and trades it for a token. `dispatch`
//! re-validates that token on every call and hands the opened session to the
//! dispatch engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch::{DispatchLimits, DispatchOutcome, DispatchRequest, Dispatcher};
use crate::error::{RelayError, RelayResult};
use crate::mailer::{MailTransport, RelayCredentials};
use crate::metrics::{self, CounterSnapshot, MetricsSink};
use crate::session::SessionStore;

/// Input of the issue operation
#[derive(Debug, Clone, Deserialize)]
pub struct IssueRequest {
    #[serde(alias = "email")]
    pub identity: String,
    #[serde(alias = "password")]
    pub secret: String,
    #[serde(default)]
    pub relay_host: Option<String>,
    #[serde(default)]
    pub relay_port: Option<u16>,
}

/// Response to a successful issue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedSession {
    pub token: String,
    pub ttl_hours: i64,
    pub expires_at: String,
    pub sender: String,
    pub message: String,
}

/// Store and counter totals for status output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerStats {
    pub active_sessions: usize,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}

/// Extract the token from an `Authorization`-style value.
///
/// Accepts `Bearer <token>` in any case as well as a bare token.
pub fn bearer_token(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        Some(_) => return None,
        None => value,
    };

    (!token.is_empty()).then_some(token)
}

pub struct RelayBroker<T: MailTransport> {
    store: Arc<SessionStore>,
    transport: Arc<T>,
    dispatcher: Dispatcher<T>,
    metrics: Arc<dyn MetricsSink>,
    default_relay_host: String,
    default_relay_port: u16,
}

impl<T: MailTransport> RelayBroker<T> {
    /// Build a broker from configuration with a fresh session store
    pub fn from_config(config: &Config, transport: Arc<T>, metrics: Arc<dyn MetricsSink>) -> Self {
        let store = Arc::new(SessionStore::new(config.session_ttl(), config.sweep_interval()));
        let dispatcher = Dispatcher::new(
            Arc::clone(&transport),
            config.send_delay(),
            DispatchLimits::from(config),
        )
        .with_metrics(Arc::clone(&metrics));

        Self {
            store,
            transport,
            dispatcher,
            metrics,
            default_relay_host: config.default_relay_host.clone(),
            default_relay_port: config.default_relay_port,
        }
    }

    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<T>,
        dispatcher: Dispatcher<T>,
        metrics: Arc<dyn MetricsSink>,
        default_relay_host: String,
        default_relay_port: u16,
    ) -> Self {
        Self {
            store,
            transport,
            dispatcher,
            metrics,
            default_relay_host,
            default_relay_port,
        }
    }

    /// Verify a credential with its relay and open a session for it
    pub async fn issue_session(&self, request: IssueRequest) -> RelayResult<IssuedSession> {
        let identity = request.identity.trim();
        if identity.parse::<lettre::Address>().is_err() {
            return Err(RelayError::Validation(format!("invalid identity {identity:?}")));
        }
        if request.secret.is_empty() {
            return Err(RelayError::Validation("secret must not be empty".to_string()));
        }

        let relay_host = request
            .relay_host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(self.default_relay_host.as_str());
        let relay_port = request.relay_port.unwrap_or(self.default_relay_port);
        if relay_port == 0 {
            return Err(RelayError::Validation("relay port must not be 0".to_string()));
        }

        let credentials = RelayCredentials {
            identity,
            secret: &request.secret,
            relay_host,
            relay_port,
        };

        if let Err(e) = self.transport.verify(credentials).await {
            warn!(relay_host, relay_port, "credential verification failed: {}", e);
            return Err(e);
        }

        let issued = self.store.create(identity, &request.secret, relay_host, relay_port)?;
        metrics::swallow("token_issued", self.metrics.on_token_issued());
        info!(relay_host, relay_port, "session issued");

        Ok(IssuedSession {
            token: issued.token,
            ttl_hours: self.store.ttl().num_hours(),
            expires_at: issued.expires_at.to_rfc3339(),
            sender: identity.to_string(),
            message: "Authentication successful".to_string(),
        })
    }

    /// Run a dispatch on behalf of the session behind `bearer`
    pub async fn dispatch(
        &self,
        bearer: Option<&str>,
        request: &DispatchRequest,
    ) -> RelayResult<DispatchOutcome> {
        let token = bearer.and_then(bearer_token).ok_or(RelayError::InvalidToken)?;
        request.validate(self.dispatcher.limits())?;

        let session = self.store.resolve(token)?;
        self.dispatcher.run(&session, request).await
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            active_sessions: self.store.active_count(),
            counters: self.metrics.snapshot().unwrap_or_default(),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }
}

// ============================================================================
// TESTS
// ============================================================================
