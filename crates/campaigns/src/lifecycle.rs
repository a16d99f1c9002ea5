//! Campaign lifecycle — status orchestration, recipient import, and
//! metrics aggregation.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tabletalk_conversations::ConversationEngine;
use tabletalk_core::error::{RejectReason, TableTalkError, TableTalkResult};
use tabletalk_core::events::ConversationEvent;
use tabletalk_core::store::CampaignStore;
use tabletalk_core::types::{
    Campaign, CampaignMetrics, CampaignStatus, ConversationKind, ImportSummary, ImportedRecipient,
    MessageStatus, Recipient, RecipientStatus, SentimentReading,
};
use tracing::info;
use uuid::Uuid;

pub struct CampaignLifecycleController {
    store: Arc<CampaignStore>,
    conversations: Arc<ConversationEngine>,
}

impl CampaignLifecycleController {
    pub fn new(store: Arc<CampaignStore>, conversations: Arc<ConversationEngine>) -> Self {
        Self {
            store,
            conversations,
        }
    }

    pub fn create_campaign(
        &self,
        restaurant_id: Uuid,
        name: &str,
        locality: &str,
        template_steps: Vec<String>,
        now: DateTime<Utc>,
    ) -> Campaign {
        let template_steps = if template_steps.is_empty() {
            vec!["feedback_request".to_string()]
        } else {
            template_steps
        };
        let campaign = Campaign {
            id: Uuid::new_v4(),
            restaurant_id,
            name: name.to_string(),
            locality: locality.to_string(),
            status: CampaignStatus::Draft,
            scheduled_start: None,
            scheduled_end: None,
            template_steps,
            experiment_id: None,
            settings: json!({}),
            metrics: CampaignMetrics::default(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        info!(campaign_id = %campaign.id, name, "Campaign created");
        self.store.insert_campaign(campaign.clone());
        campaign
    }

    /// Sets the start/end window, moving the campaign to `scheduled`.
    pub fn set_schedule(
        &self,
        id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TableTalkResult<Campaign> {
        if start >= end {
            return Err(TableTalkError::BusinessRule(
                RejectReason::InvalidCampaignWindow,
            ));
        }
        let campaign = self.require(id)?;
        if !matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        ) {
            return Err(TableTalkError::InvalidTransition {
                entity: "campaign",
                from: format!("{:?}", campaign.status),
                to: "Scheduled".to_string(),
            });
        }
        self.store.update_campaign(id, |c| {
            c.status = CampaignStatus::Scheduled;
            c.scheduled_start = Some(start);
            c.scheduled_end = Some(end);
        })
    }

    pub fn attach_experiment(&self, id: Uuid, experiment_id: Uuid) -> TableTalkResult<Campaign> {
        let campaign = self.require(id)?;
        if campaign.status.is_terminal() {
            return Err(TableTalkError::BusinessRule(
                RejectReason::CampaignNotSchedulable,
            ));
        }
        self.store
            .update_campaign(id, |c| c.experiment_id = Some(experiment_id))
    }

    /// Ingests validated import rows, enforcing the per-campaign phone
    /// uniqueness invariant and counting what was dropped.
    pub fn import_recipients(
        &self,
        id: Uuid,
        rows: Vec<ImportedRecipient>,
        now: DateTime<Utc>,
    ) -> TableTalkResult<ImportSummary> {
        let campaign = self.require(id)?;
        if campaign.status.is_terminal() {
            return Err(TableTalkError::BusinessRule(
                RejectReason::CampaignNotSchedulable,
            ));
        }
        let mut summary = ImportSummary::default();
        for row in rows {
            if !plausible_phone(&row.phone_number) {
                summary.invalid_skipped += 1;
                continue;
            }
            let recipient = Recipient {
                id: Uuid::new_v4(),
                campaign_id: id,
                phone_number: row.phone_number,
                visit_timestamp: row.visit_timestamp,
                scheduled_send_time: None,
                status: RecipientStatus::Pending,
                conversation_id: None,
                metadata: row.metadata,
                created_at: now,
            };
            if self.store.insert_recipient_unique(recipient) {
                summary.accepted += 1;
            } else {
                summary.duplicates_removed += 1;
            }
        }
        info!(
            campaign_id = %id,
            accepted = summary.accepted,
            duplicates = summary.duplicates_removed,
            invalid = summary.invalid_skipped,
            "Recipient import finished"
        );
        Ok(summary)
    }

    /// `scheduled -> active`: requires an open window and at least one
    /// recipient.
    pub fn activate(&self, id: Uuid, now: DateTime<Utc>) -> TableTalkResult<Campaign> {
        let campaign = self.require(id)?;
        if campaign.status != CampaignStatus::Scheduled {
            return Err(TableTalkError::InvalidTransition {
                entity: "campaign",
                from: format!("{:?}", campaign.status),
                to: "Active".to_string(),
            });
        }
        let in_window = campaign.scheduled_start.map_or(false, |start| start <= now)
            && campaign.scheduled_end.map_or(true, |end| now < end);
        if !in_window {
            return Err(TableTalkError::BusinessRule(
                RejectReason::OutsideCampaignWindow,
            ));
        }
        if self.store.recipients_for_campaign(id).is_empty() {
            return Err(TableTalkError::BusinessRule(RejectReason::NoRecipients));
        }
        self.store
            .update_campaign(id, |c| c.status = CampaignStatus::Active)
    }

    /// Periodic orchestration pass: opens scheduled campaigns whose window
    /// has arrived and completes active ones that are done. Returns the
    /// campaigns whose status changed.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<Campaign> {
        let mut changed = Vec::new();
        for campaign in self.store.list_campaigns() {
            match campaign.status {
                CampaignStatus::Scheduled => {
                    if self.activate(campaign.id, now).is_ok() {
                        changed.push(self.require(campaign.id).unwrap_or(campaign));
                    }
                }
                CampaignStatus::Active => {
                    let ended = campaign.scheduled_end.map_or(false, |end| end <= now);
                    if ended || self.all_recipients_settled(campaign.id) {
                        if let Ok(updated) = self.store.update_campaign(campaign.id, |c| {
                            c.status = CampaignStatus::Completed;
                        }) {
                            info!(campaign_id = %updated.id, "Campaign completed");
                            changed.push(updated);
                        }
                    }
                }
                _ => {}
            }
        }
        changed
    }

    /// Explicit operator cancellation from any non-terminal status. Every
    /// open message is cancelled; messages already sent keep their status
    /// and their delivery receipts keep applying.
    pub fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> TableTalkResult<(Campaign, usize)> {
        let campaign = self.require(id)?;
        if campaign.status.is_terminal() {
            return Err(TableTalkError::InvalidTransition {
                entity: "campaign",
                from: format!("{:?}", campaign.status),
                to: "Cancelled".to_string(),
            });
        }
        let cancelled = self.store.cancel_open_messages(id);
        let updated = self
            .store
            .update_campaign(id, |c| c.status = CampaignStatus::Cancelled)?;
        info!(
            campaign_id = %id,
            messages_cancelled = cancelled,
            at = %now,
            "Campaign cancelled"
        );
        Ok((updated, cancelled))
    }

    /// Soft delete: the campaign and its recipients stay queryable for the
    /// audit trail.
    pub fn soft_delete(&self, id: Uuid, now: DateTime<Utc>) -> TableTalkResult<Campaign> {
        let campaign = self.require(id)?;
        if campaign.status == CampaignStatus::Deleted {
            return Err(TableTalkError::InvalidTransition {
                entity: "campaign",
                from: "Deleted".to_string(),
                to: "Deleted".to_string(),
            });
        }
        self.store.cancel_open_messages(id);
        self.store.update_campaign(id, |c| {
            c.status = CampaignStatus::Deleted;
            c.deleted_at = Some(now);
        })
    }

    /// Recomputes the campaign metrics snapshot from message, recipient,
    /// and conversation state.
    pub fn refresh_metrics(&self, id: Uuid) -> TableTalkResult<CampaignMetrics> {
        self.require(id)?;
        let recipients = self.store.recipients_for_campaign(id);
        let messages = self.store.messages_for_campaign(id);

        let mut metrics = CampaignMetrics {
            total_recipients: recipients.len() as u64,
            ..CampaignMetrics::default()
        };
        for message in &messages {
            match message.status {
                MessageStatus::Scheduled | MessageStatus::Queued => metrics.scheduled += 1,
                MessageStatus::Sent => metrics.sent += 1,
                MessageStatus::Delivered | MessageStatus::Read => {
                    metrics.sent += 1;
                    metrics.delivered += 1;
                }
                MessageStatus::Responded => {
                    metrics.sent += 1;
                    metrics.delivered += 1;
                    metrics.responded += 1;
                }
                MessageStatus::Failed => metrics.failed += 1,
                MessageStatus::Cancelled => metrics.cancelled += 1,
            }
        }
        if metrics.sent > 0 {
            metrics.response_rate = metrics.responded as f64 / metrics.sent as f64;
        }
        metrics.escalated_conversations = self.conversations.escalated_count_for_campaign(id);

        let snapshot = metrics.clone();
        self.store.update_campaign(id, move |c| c.metrics = snapshot)?;
        Ok(metrics)
    }

    /// Routes an inbound customer reply to the conversation engine,
    /// linking recipient and conversation on first contact.
    pub fn handle_inbound(
        &self,
        campaign_id: Uuid,
        customer_phone: &str,
        content: &str,
        reading: Option<&SentimentReading>,
        now: DateTime<Utc>,
    ) -> TableTalkResult<(Uuid, Vec<ConversationEvent>)> {
        let campaign = self.require(campaign_id)?;
        let recipient = self
            .store
            .recipient_by_phone(campaign_id, customer_phone)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "recipient",
                id: customer_phone.to_string(),
            })?;

        let (conversation_id, events) = self.conversations.handle_inbound(
            customer_phone,
            campaign.restaurant_id,
            Some(campaign_id),
            Some(recipient.id),
            ConversationKind::Feedback,
            content,
            reading,
            now,
        )?;
        if recipient.conversation_id != Some(conversation_id) {
            self.store.update_recipient(recipient.id, |r| {
                r.conversation_id = Some(conversation_id);
                r.status = RecipientStatus::Responded;
            })?;
        }
        Ok((conversation_id, events))
    }

    fn all_recipients_settled(&self, id: Uuid) -> bool {
        let recipients = self.store.recipients_for_campaign(id);
        if recipients.is_empty() {
            return false;
        }
        recipients.iter().all(|r| {
            let messages = self.store.messages_for_recipient(r.id);
            !messages.is_empty()
                && messages.iter().all(|m| {
                    matches!(
                        m.status,
                        MessageStatus::Responded
                            | MessageStatus::Failed
                            | MessageStatus::Cancelled
                            | MessageStatus::Read
                            | MessageStatus::Delivered
                    )
                })
        })
    }

    fn require(&self, id: Uuid) -> TableTalkResult<Campaign> {
        self.store
            .get_campaign(id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "campaign",
                id: id.to_string(),
            })
    }
}

/// Import rows arrive pre-validated; this is a last-line sanity check, not
/// a parser.
fn plausible_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    digits.len() >= 8 && digits.chars().all(|c| c.is_ascii_digit())
}
