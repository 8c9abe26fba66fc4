//! Display counters
//!
//! The broker reports issuances and delivered emails to a [`MetricsSink`].
//! Sinks are best-effort: a failing sink is logged and otherwise ignored.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Receiver for fire-and-forget counter events
pub trait MetricsSink: Send + Sync + 'static {
    fn on_token_issued(&self) -> anyhow::Result<()>;

    fn on_emails_sent(&self, count: u64) -> anyhow::Result<()>;

    /// Current totals, if the sink keeps any
    fn snapshot(&self) -> Option<CounterSnapshot> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub tokens_issued: u64,
    pub emails_sent: u64,
}

/// Process-local counters, reset on restart
#[derive(Debug, Default)]
pub struct InMemoryCounters {
    tokens_issued: AtomicU64,
    emails_sent: AtomicU64,
}

impl InMemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsSink for InMemoryCounters {
    fn on_token_issued(&self) -> anyhow::Result<()> {
        self.tokens_issued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_emails_sent(&self, count: u64) -> anyhow::Result<()> {
        self.emails_sent.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    fn snapshot(&self) -> Option<CounterSnapshot> {
        Some(CounterSnapshot {
            tokens_issued: self.tokens_issued.load(Ordering::Relaxed),
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
        })
    }
}

/// Log and discard a sink failure
pub fn swallow(event: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!(event, "metrics sink failed: {:#}", e);
    }
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn on_token_issued(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_emails_sent(&self, _count: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
