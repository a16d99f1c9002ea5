//! Boundary contracts for external collaborators.
//!
//! The messaging transport, the sentiment scorer, and the blackout window
//! source are consumed through these traits; their implementations
//! (WhatsApp Business API client, NLU service, observance timetable fetch)
//! live outside this core.

use crate::error::TableTalkResult;
use crate::types::{MessageStatus, SentimentReading};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// Outbound send capability. `idempotency_key` is the campaign-message id;
/// a retried call that already succeeded upstream must not produce a
/// duplicate customer-visible message.
#[async_trait::async_trait]
pub trait MessageTransport: Send + Sync {
    /// Returns the transport-assigned external message id.
    ///
    /// Failures are classified by the implementation: timeouts, 5xx and
    /// network errors as `TransientTransport`; invalid addresses and policy
    /// rejections as `PermanentTransport`.
    async fn send(
        &self,
        recipient_address: &str,
        rendered_content: &str,
        idempotency_key: Uuid,
    ) -> TableTalkResult<String>;
}

/// Asynchronous delivery-status callback payload from the transport.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub external_id: String,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
}

/// Sentiment/confidence scoring capability.
pub trait SentimentScorer: Send + Sync {
    fn score(&self, text: &str) -> SentimentReading;
}

/// One prohibited-send interval, endpoints exclusive of the configured
/// buffer (the provider applies the buffer on top).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlackoutInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
}

/// Supplies the per-locality, per-day blackout interval table (five or six
/// daily observance intervals for the localities served).
pub trait WindowSource: Send + Sync {
    fn day_table(&self, locality: &str, date: NaiveDate)
        -> anyhow::Result<Vec<BlackoutInterval>>;
}
