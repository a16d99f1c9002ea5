//! Dispatch worker — claims due messages, enforces the global rate cap,
//! calls the transport with retry/backoff, and applies delivery receipts.

use crate::throttle::DispatchThrottle;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tabletalk_core::boundary::{DeliveryReceipt, MessageTransport};
use tabletalk_core::config::DispatchConfig;
use tabletalk_core::error::{TableTalkError, TableTalkResult};
use tabletalk_core::events::DeliveryEvent;
use tabletalk_core::store::CampaignStore;
use tabletalk_core::types::{CampaignMessage, MessageStatus, RecipientStatus};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct DispatchWorker {
    store: Arc<CampaignStore>,
    transport: Arc<dyn MessageTransport>,
    throttle: Arc<DispatchThrottle>,
    config: DispatchConfig,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<CampaignStore>,
        transport: Arc<dyn MessageTransport>,
        throttle: Arc<DispatchThrottle>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            transport,
            throttle,
            config,
        }
    }

    /// One poll cycle: claims due messages and dispatches each. Returns
    /// the number sent and the operational events for the alert pipeline.
    pub async fn run_once(&self) -> (usize, Vec<DeliveryEvent>) {
        let now = Utc::now();
        let claimed = self
            .store
            .claim_due_messages(now, self.config.claim_batch_size);
        let mut sent = 0;
        let mut events = Vec::new();
        for message in claimed {
            match self.dispatch_message(message).await {
                Ok(None) => sent += 1,
                Ok(Some(event)) => events.push(event),
                Err(err) => error!(error = %err, "Dispatch bookkeeping failed"),
            }
        }
        (sent, events)
    }

    /// Worker loop. Several workers may run over the same store; claiming
    /// is the mutual-exclusion point.
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::UnboundedSender<DeliveryEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        info!("Dispatch worker started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let (_, emitted) = self.run_once().await;
                    for event in emitted {
                        let _ = events.send(event);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Dispatch worker stopping");
                    return;
                }
            }
        }
    }

    /// Sends one claimed message, retrying transient failures with capped
    /// exponential backoff and jitter. Returns the operational event when
    /// the message ends up failed.
    async fn dispatch_message(
        &self,
        message: CampaignMessage,
    ) -> TableTalkResult<Option<DeliveryEvent>> {
        let recipient =
            self.store
                .get_recipient(message.recipient_id)
                .ok_or_else(|| TableTalkError::NotFound {
                    entity: "recipient",
                    id: message.recipient_id.to_string(),
                })?;
        let campaign =
            self.store
                .get_campaign(message.campaign_id)
                .ok_or_else(|| TableTalkError::NotFound {
                    entity: "campaign",
                    id: message.campaign_id.to_string(),
                })?;
        let content = render_content(&message);
        let call_timeout = Duration::from_secs(self.config.call_timeout_secs);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.throttle.acquire().await;

            // The message id doubles as the idempotency key: a retry whose
            // earlier call actually succeeded upstream must not produce a
            // second customer-visible message.
            let call = self
                .transport
                .send(&recipient.phone_number, &content, message.id);
            let result = match tokio::time::timeout(call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(TableTalkError::TransientTransport(format!(
                    "send timed out after {}s",
                    self.config.call_timeout_secs
                ))),
            };

            match result {
                Ok(external_id) => {
                    self.store
                        .record_send_success(message.id, external_id, attempt, Utc::now())?;
                    if recipient.status == RecipientStatus::Pending {
                        self.store
                            .set_recipient_status(recipient.id, RecipientStatus::Sent)?;
                    }
                    debug!(message_id = %message.id, attempt, "Message sent");
                    return Ok(None);
                }
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        message_id = %message.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient send failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let permanent = !err.is_transient();
                    self.store
                        .record_send_failure(message.id, attempt, err.to_string())?;
                    self.store
                        .set_recipient_status(recipient.id, RecipientStatus::Failed)?;
                    warn!(
                        message_id = %message.id,
                        attempt,
                        permanent,
                        error = %err,
                        "Message failed"
                    );
                    return Ok(Some(DeliveryEvent::MessageFailed {
                        message_id: message.id,
                        campaign_id: message.campaign_id,
                        restaurant_id: campaign.restaurant_id,
                        attempts: attempt,
                        permanent,
                        error: err.to_string(),
                        at: Utc::now(),
                    }));
                }
            }
        }
    }

    /// Applies an asynchronous transport status callback. Only forward
    /// moves are accepted; the store rejects anything else.
    pub fn apply_receipt(&self, receipt: DeliveryReceipt) -> TableTalkResult<CampaignMessage> {
        let message = self
            .store
            .message_by_external_id(&receipt.external_id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "message",
                id: receipt.external_id.clone(),
            })?;
        let updated =
            self.store
                .advance_message_status(message.id, receipt.status, receipt.timestamp)?;
        if receipt.status == MessageStatus::Responded {
            self.store
                .set_recipient_status(message.recipient_id, RecipientStatus::Responded)?;
        }
        Ok(updated)
    }

    /// base * 2^(attempt-1), capped, with ±jitter_ratio spread.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_secs as f64;
        let cap = self.config.retry_cap_secs as f64;
        let raw = (base * 2f64.powi(attempt.saturating_sub(1) as i32)).min(cap);
        let spread = rand::thread_rng().gen_range(-self.config.jitter_ratio..=self.config.jitter_ratio);
        Duration::from_secs_f64((raw * (1.0 + spread)).max(0.0))
    }
}

/// Placeholder rendering; the template engine lives with the transport
/// adapter.
fn render_content(message: &CampaignMessage) -> String {
    match &message.variant_id {
        Some(variant) => format!("{}#{}@{}", message.template, message.step, variant),
        None => format!("{}#{}", message.template, message.step),
    }
}
