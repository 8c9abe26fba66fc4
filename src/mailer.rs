//! Outbound relay client
//!
//! One [`MailTransport::deliver`] call is one SMTP connection carrying one
//! message. Nothing is pooled, so a failure in one attempt never leaks into
//! the next.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, warn};

use crate::error::{DeliveryError, RelayError, RelayResult};
use crate::session::DecryptedSession;

/// Port on which relays expect implicit TLS rather than STARTTLS
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// SMTP replies that mean the relay rejected the credential
const AUTH_REJECTION_CODES: [&str; 3] = ["530", "534", "535"];

/// Credential and endpoint presented at issuance
#[derive(Clone, Copy)]
pub struct RelayCredentials<'a> {
    pub identity: &'a str,
    pub secret: &'a str,
    pub relay_host: &'a str,
    pub relay_port: u16,
}

impl<'a> From<&'a DecryptedSession> for RelayCredentials<'a> {
    fn from(session: &'a DecryptedSession) -> Self {
        Self {
            identity: &session.identity,
            secret: session.secret.as_str(),
            relay_host: &session.relay_host,
            relay_port: session.relay_port,
        }
    }
}

/// Optional parts of an outbound message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageOptions {
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub is_html: bool,
}

/// A single message addressed to one primary recipient
#[derive(Debug, Clone)]
pub struct OutboundMessage<'a> {
    pub recipient: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub options: &'a MessageOptions,
}

/// Relay client seam. Production uses [`SmtpRelay`]; tests script outcomes.
#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    /// Authenticate against the relay once and disconnect.
    async fn verify(&self, credentials: RelayCredentials<'_>) -> RelayResult<()>;

    /// Perform one authenticated delivery attempt.
    async fn deliver(
        &self,
        session: &DecryptedSession,
        message: &OutboundMessage<'_>,
    ) -> Result<(), DeliveryError>;
}

/// SMTP relay client backed by lettre
#[derive(Debug, Clone)]
pub struct SmtpRelay {
    timeout: Duration,
}

impl SmtpRelay {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn transport(
        &self,
        credentials: RelayCredentials<'_>,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
        let builder = if credentials.relay_port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(credentials.relay_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(credentials.relay_host)?
        };

        Ok(builder
            .port(credentials.relay_port)
            .credentials(Credentials::new(
                credentials.identity.to_owned(),
                credentials.secret.to_owned(),
            ))
            .timeout(Some(self.timeout))
            .build())
    }
}

#[async_trait]
impl MailTransport for SmtpRelay {
    async fn verify(&self, credentials: RelayCredentials<'_>) -> RelayResult<()> {
        let transport = self
            .transport(credentials)
            .map_err(|e| RelayError::RelayConnection(e.to_string()))?;

        match transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(RelayError::RelayConnection(
                "relay did not answer NOOP".to_string(),
            )),
            Err(e) => Err(verify_error(fault_of(&e), e.to_string())),
        }
    }

    async fn deliver(
        &self,
        session: &DecryptedSession,
        message: &OutboundMessage<'_>,
    ) -> Result<(), DeliveryError> {
        let email = build_message(&session.identity, message)?;
        let transport = self
            .transport(session.into())
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        match transport.send(email).await {
            Ok(_) => {
                debug!(relay_host = %session.relay_host, "message accepted by relay");
                Ok(())
            }
            Err(e) => {
                let err = classify(&e);
                warn!(relay_host = %session.relay_host, "delivery attempt failed: {}", err);
                Err(err)
            }
        }
    }
}

fn is_auth_rejection(code: &str) -> bool {
    AUTH_REJECTION_CODES.contains(&code)
}

/// How a relay failure should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultKind {
    /// The relay refused the credential.
    AuthRejected,
    /// Network, TLS, timeout, or a relay reply unrelated to auth.
    Connection,
    /// The client itself misbehaved or could not parse the relay.
    Unexpected,
}

fn fault_kind(status: Option<&str>, client_side: bool) -> FaultKind {
    if status.is_some_and(is_auth_rejection) {
        FaultKind::AuthRejected
    } else if client_side {
        FaultKind::Unexpected
    } else {
        FaultKind::Connection
    }
}

fn fault_of(err: &lettre::transport::smtp::Error) -> FaultKind {
    let status = err.status().map(|code| code.to_string());
    fault_kind(status.as_deref(), err.is_client() || err.is_response())
}

fn verify_error(kind: FaultKind, msg: String) -> RelayError {
    match kind {
        FaultKind::AuthRejected => RelayError::CredentialRejected(msg),
        FaultKind::Connection => RelayError::RelayConnection(msg),
        FaultKind::Unexpected => RelayError::Internal(msg),
    }
}

fn classify(err: &lettre::transport::smtp::Error) -> DeliveryError {
    match fault_of(err) {
        FaultKind::AuthRejected => DeliveryError::AuthorizationLost(err.to_string()),
        // Anything else is scoped to this attempt.
        FaultKind::Connection | FaultKind::Unexpected => DeliveryError::Transport(err.to_string()),
    }
}

fn mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .trim()
        .parse()
        .map_err(|e| DeliveryError::Transport(format!("malformed address {address:?}: {e}")))
}

/// Build the message for one attempt.
///
/// From is the session identity and To is the single recipient. Cc and
/// Reply-To become headers. Bcc addresses only reach the envelope.
pub fn build_message(identity: &str, message: &OutboundMessage<'_>) -> Result<Message, DeliveryError> {
    let mut builder = Message::builder()
        .from(mailbox(identity)?)
        .to(mailbox(message.recipient)?)
        .subject(message.subject);

    for cc in &message.options.cc {
        builder = builder.cc(mailbox(cc)?);
    }
    for bcc in &message.options.bcc {
        builder = builder.bcc(mailbox(bcc)?);
    }
    if let Some(reply_to) = &message.options.reply_to {
        builder = builder.reply_to(mailbox(reply_to)?);
    }

    let content_type = if message.options.is_html {
        ContentType::TEXT_HTML
    } else {
        ContentType::TEXT_PLAIN
    };

    builder
        .header(content_type)
        .body(message.body.to_string())
        .map_err(|e| DeliveryError::Transport(format!("message construction failed: {e}")))
}

// ============================================================================
// TESTS
// ============================================================================
