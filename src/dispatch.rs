//! Bulk dispatch engine
//!
//! Walks recipients in input order, repeating each message `repeat_count`
//! times, one relay connection per attempt. Transport faults are counted and
//! skipped. A rejected credential ends the batch immediately, because every
//! attempt after it would fail the same way.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, REPEAT_CEILING};
use crate::error::{DeliveryError, RelayError, RelayResult};
use crate::mailer::{MailTransport, MessageOptions, OutboundMessage};
use crate::metrics::{self, MetricsSink, NoopMetrics};
use crate::session::DecryptedSession;

/// Bounds applied to every dispatch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    pub max_repeat: u32,
    pub max_recipients: usize,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_repeat: REPEAT_CEILING,
            max_recipients: 100,
        }
    }
}

impl From<&Config> for DispatchLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_repeat: config.max_repeat,
            max_recipients: config.max_recipients,
        }
    }
}

/// One bulk-send invocation
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Signed so that negative input reaches validation instead of a parser
    pub repeat_count: i64,
    pub options: MessageOptions,
}

fn check_address(field: &str, address: &str) -> RelayResult<()> {
    address
        .trim()
        .parse::<lettre::Address>()
        .map(|_| ())
        .map_err(|_| RelayError::Validation(format!("{field}: invalid address {address:?}")))
}

impl DispatchRequest {
    /// Reject malformed input before any network activity
    pub fn validate(&self, limits: &DispatchLimits) -> RelayResult<()> {
        if self.recipients.is_empty() {
            return Err(RelayError::Validation("at least one recipient is required".to_string()));
        }
        if self.recipients.len() > limits.max_recipients {
            return Err(RelayError::Validation(format!(
                "at most {} recipients per dispatch",
                limits.max_recipients
            )));
        }
        if self.repeat_count < 1 || self.repeat_count > i64::from(limits.max_repeat) {
            return Err(RelayError::Validation(format!(
                "repeat count must be between 1 and {}",
                limits.max_repeat
            )));
        }
        if self.subject.trim().is_empty() {
            return Err(RelayError::Validation("subject must not be empty".to_string()));
        }

        for recipient in &self.recipients {
            check_address("recipients", recipient)?;
        }
        for cc in &self.options.cc {
            check_address("cc", cc)?;
        }
        for bcc in &self.options.bcc {
            check_address("bcc", bcc)?;
        }
        if let Some(reply_to) = &self.options.reply_to {
            check_address("reply_to", reply_to)?;
        }

        Ok(())
    }

    /// Number of attempts a full run makes
    pub fn total_attempts(&self) -> u64 {
        self.recipients.len() as u64 * self.repeat_count.max(0) as u64
    }
}

/// Summary of one dispatch call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub sent: u64,
    pub failed: u64,
    pub success: bool,
    pub message: String,
}

impl DispatchOutcome {
    fn new(sent: u64, failed: u64) -> Self {
        let message = if failed == 0 {
            format!("Sent {sent} email(s)")
        } else {
            format!("Sent {sent} of {} email(s), {failed} failed", sent + failed)
        };

        Self {
            sent,
            failed,
            success: failed == 0,
            message,
        }
    }
}

/// Drives delivery attempts over a recipient set
pub struct Dispatcher<T: MailTransport> {
    transport: Arc<T>,
    pacing: Duration,
    limits: DispatchLimits,
    metrics: Arc<dyn MetricsSink>,
}

impl<T: MailTransport> Dispatcher<T> {
    pub fn new(transport: Arc<T>, pacing: Duration, limits: DispatchLimits) -> Self {
        Self {
            transport,
            pacing,
            limits,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Report delivered emails to `sink`
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    fn report_sent(&self, sent: u64) {
        if sent > 0 {
            metrics::swallow("emails_sent", self.metrics.on_emails_sent(sent));
        }
    }

    pub fn limits(&self) -> &DispatchLimits {
        &self.limits
    }

    /// Send the batch with an already resolved session.
    ///
    /// Returns a summary even under partial failure. The only error after
    /// validation is [`RelayError::CredentialRejected`], raised when the relay
    /// stops accepting the session's credential mid-batch.
    pub async fn run(
        &self,
        session: &DecryptedSession,
        request: &DispatchRequest,
    ) -> RelayResult<DispatchOutcome> {
        request.validate(&self.limits)?;

        let batch_id = uuid::Uuid::new_v4();
        let total = request.total_attempts();
        let mut sent = 0u64;
        let mut failed = 0u64;
        let mut attempt = 0u64;

        info!(%batch_id, recipients = request.recipients.len(), total, "dispatch started");

        for recipient in &request.recipients {
            let message = OutboundMessage {
                recipient: recipient.trim(),
                subject: &request.subject,
                body: &request.body,
                options: &request.options,
            };

            for _ in 0..request.repeat_count {
                attempt += 1;

                match self.transport.deliver(session, &message).await {
                    Ok(()) => sent += 1,
                    Err(DeliveryError::AuthorizationLost(reason)) => {
                        warn!(%batch_id, attempt, sent, failed, "credential rejected, aborting batch");
                        self.report_sent(sent);
                        return Err(RelayError::CredentialRejected(format!(
                            "{reason} (aborted after {sent} delivered, {failed} failed)"
                        )));
                    }
                    Err(DeliveryError::Transport(reason)) => {
                        debug!(%batch_id, attempt, "attempt failed: {}", reason);
                        failed += 1;
                    }
                }

                if attempt < total && !self.pacing.is_zero() {
                    tokio::time::sleep(self.pacing).await;
                }
            }
        }

        info!(%batch_id, sent, failed, "dispatch finished");
        self.report_sent(sent);
        Ok(DispatchOutcome::new(sent, failed))
    }
}

// ============================================================================
// TESTS
// ============================================================================
