//! RelayPass Server Library
//!
//! Trades validated SMTP relay credentials for short-lived bearer tokens and
//! uses those tokens to authorize bulk deliveries through the same relay.
//!
//! Credentials are held encrypted in process memory under a key that is
//! generated at startup and never persisted. Restarting the process therefore
//! invalidates every outstanding token.

pub mod broker;
pub mod cipher;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mailer;
pub mod metrics;
pub mod server;
pub mod session;
pub mod token;

// Re-exports for convenience
pub use broker::{IssueRequest, IssuedSession, RelayBroker};
pub use config::Config;
pub use dispatch::{DispatchOutcome, DispatchRequest, Dispatcher};
pub use error::{DeliveryError, RelayError, RelayResult};
pub use mailer::{MailTransport, SmtpRelay};
pub use server::run_server;
pub use session::{DecryptedSession, SessionStore};
