//! In-memory campaign store backed by DashMap.
//!
//! Production: replace with PostgreSQL (sqlx) or similar ACID store.
//! This provides the same API surface for development and testing,
//! including the three hot queries: due scheduled messages, inactive
//! conversations, and open alerts per (rule, conversation).

use crate::error::{TableTalkError, TableTalkResult};
use crate::types::{Campaign, CampaignMessage, MessageStatus, Recipient, RecipientStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Thread-safe store for campaigns, recipients, and tracked messages.
pub struct CampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
    recipients: DashMap<Uuid, Recipient>,
    messages: DashMap<Uuid, CampaignMessage>,
}

impl CampaignStore {
    pub fn new() -> Self {
        info!("Campaign store initialized (in-memory, development mode)");
        Self {
            campaigns: DashMap::new(),
            recipients: DashMap::new(),
            messages: DashMap::new(),
        }
    }

    // ─── Campaigns ─────────────────────────────────────────────────────────

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    pub fn get_campaign(&self, id: Uuid) -> Option<Campaign> {
        self.campaigns.get(&id).map(|r| r.value().clone())
    }

    pub fn list_campaigns(&self) -> Vec<Campaign> {
        let mut campaigns: Vec<Campaign> =
            self.campaigns.iter().map(|r| r.value().clone()).collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        campaigns
    }

    pub fn update_campaign<F>(&self, id: Uuid, apply: F) -> TableTalkResult<Campaign>
    where
        F: FnOnce(&mut Campaign),
    {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "campaign",
                id: id.to_string(),
            })?;
        apply(entry.value_mut());
        entry.updated_at = Utc::now();
        Ok(entry.value().clone())
    }

    // ─── Recipients ────────────────────────────────────────────────────────

    /// Inserts a recipient unless the campaign already targets that phone
    /// number. Returns whether the row was inserted.
    pub fn insert_recipient_unique(&self, recipient: Recipient) -> bool {
        if self.recipient_by_phone(recipient.campaign_id, &recipient.phone_number).is_some() {
            return false;
        }
        self.recipients.insert(recipient.id, recipient);
        true
    }

    pub fn get_recipient(&self, id: Uuid) -> Option<Recipient> {
        self.recipients.get(&id).map(|r| r.value().clone())
    }

    pub fn recipient_by_phone(&self, campaign_id: Uuid, phone: &str) -> Option<Recipient> {
        self.recipients
            .iter()
            .find(|r| r.campaign_id == campaign_id && r.phone_number == phone)
            .map(|r| r.value().clone())
    }

    pub fn recipients_for_campaign(&self, campaign_id: Uuid) -> Vec<Recipient> {
        let mut rows: Vec<Recipient> = self
            .recipients
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows
    }

    pub fn update_recipient<F>(&self, id: Uuid, apply: F) -> TableTalkResult<Recipient>
    where
        F: FnOnce(&mut Recipient),
    {
        let mut entry = self
            .recipients
            .get_mut(&id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "recipient",
                id: id.to_string(),
            })?;
        apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    pub fn set_recipient_status(&self, id: Uuid, status: RecipientStatus) -> TableTalkResult<()> {
        self.update_recipient(id, |r| r.status = status).map(|_| ())
    }

    // ─── Messages ──────────────────────────────────────────────────────────

    pub fn insert_message(&self, message: CampaignMessage) {
        self.messages.insert(message.id, message);
    }

    pub fn get_message(&self, id: Uuid) -> Option<CampaignMessage> {
        self.messages.get(&id).map(|r| r.value().clone())
    }

    pub fn message_by_external_id(&self, external_id: &str) -> Option<CampaignMessage> {
        self.messages
            .iter()
            .find(|m| m.external_id.as_deref() == Some(external_id))
            .map(|m| m.value().clone())
    }

    pub fn messages_for_campaign(&self, campaign_id: Uuid) -> Vec<CampaignMessage> {
        self.messages
            .iter()
            .filter(|m| m.campaign_id == campaign_id)
            .map(|m| m.value().clone())
            .collect()
    }

    pub fn messages_for_recipient(&self, recipient_id: Uuid) -> Vec<CampaignMessage> {
        let mut rows: Vec<CampaignMessage> = self
            .messages
            .iter()
            .filter(|m| m.recipient_id == recipient_id)
            .map(|m| m.value().clone())
            .collect();
        rows.sort_by_key(|m| m.step);
        rows
    }

    /// Atomically claims scheduled messages whose send time has passed,
    /// flipping them to `Queued`. A step N message is only claimable once
    /// the same recipient's step N-1 reached at least `Sent`; claiming is
    /// the idempotent-consumption point for the worker pool.
    pub fn claim_due_messages(&self, now: DateTime<Utc>, limit: usize) -> Vec<CampaignMessage> {
        let mut prior_steps: HashMap<(Uuid, u32), MessageStatus> = HashMap::new();
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = Vec::new();
        for m in self.messages.iter() {
            prior_steps.insert((m.recipient_id, m.step), m.status);
            if m.status == MessageStatus::Scheduled && m.scheduled_send_time <= now {
                candidates.push((m.scheduled_send_time, m.id));
            }
        }
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, id) in candidates {
            if claimed.len() >= limit {
                break;
            }
            let Some(mut entry) = self.messages.get_mut(&id) else {
                continue;
            };
            if entry.status != MessageStatus::Scheduled {
                continue;
            }
            if entry.step > 0 {
                let gate = prior_steps.get(&(entry.recipient_id, entry.step - 1));
                let sent = matches!(
                    gate,
                    Some(
                        MessageStatus::Sent
                            | MessageStatus::Delivered
                            | MessageStatus::Read
                            | MessageStatus::Responded
                    )
                );
                if !sent {
                    continue;
                }
            }
            entry.status = MessageStatus::Queued;
            claimed.push(entry.value().clone());
        }
        claimed
    }

    /// Advances a message status forward-only; any other move is an
    /// invalid-transition error.
    pub fn advance_message_status(
        &self,
        id: Uuid,
        next: MessageStatus,
        at: DateTime<Utc>,
    ) -> TableTalkResult<CampaignMessage> {
        let mut entry = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "message",
                id: id.to_string(),
            })?;
        if !entry.status.can_advance_to(next) {
            return Err(TableTalkError::InvalidTransition {
                entity: "message",
                from: format!("{:?}", entry.status),
                to: format!("{next:?}"),
            });
        }
        entry.status = next;
        match next {
            MessageStatus::Sent => entry.sent_at = Some(at),
            MessageStatus::Delivered => entry.delivered_at = Some(at),
            MessageStatus::Read => entry.read_at = Some(at),
            MessageStatus::Responded => entry.responded_at = Some(at),
            _ => {}
        }
        Ok(entry.value().clone())
    }

    /// Records a successful send. A message cancelled while the call was in
    /// flight is still recorded as sent: the cancelled label must never
    /// mask a message the customer actually received.
    pub fn record_send_success(
        &self,
        id: Uuid,
        external_id: String,
        attempts: u32,
        at: DateTime<Utc>,
    ) -> TableTalkResult<CampaignMessage> {
        let mut entry = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "message",
                id: id.to_string(),
            })?;
        if entry.status == MessageStatus::Cancelled {
            warn!(
                message_id = %id,
                campaign_id = %entry.campaign_id,
                "Message cancelled mid-flight but delivered; recording as sent"
            );
        }
        entry.status = MessageStatus::Sent;
        entry.external_id = Some(external_id);
        entry.attempts = attempts;
        entry.sent_at = Some(at);
        entry.last_error = None;
        Ok(entry.value().clone())
    }

    pub fn record_send_failure(
        &self,
        id: Uuid,
        attempts: u32,
        error: String,
    ) -> TableTalkResult<CampaignMessage> {
        let mut entry = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "message",
                id: id.to_string(),
            })?;
        entry.status = MessageStatus::Failed;
        entry.attempts = attempts;
        entry.last_error = Some(error);
        Ok(entry.value().clone())
    }

    /// Cancels every non-terminal message of a campaign; already-sent
    /// messages keep their status. Returns the number cancelled.
    pub fn cancel_open_messages(&self, campaign_id: Uuid) -> usize {
        let mut cancelled = 0;
        for mut m in self.messages.iter_mut() {
            if m.campaign_id == campaign_id
                && matches!(m.status, MessageStatus::Scheduled | MessageStatus::Queued)
            {
                m.status = MessageStatus::Cancelled;
                cancelled += 1;
            }
        }
        cancelled
    }
}

impl Default for CampaignStore {
    fn default() -> Self {
        Self::new()
    }
}
