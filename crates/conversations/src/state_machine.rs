//! Conversation lifecycle — a finite set of valid transitions driven by
//! AI confidence, sentiment, operator actions, and inactivity.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tabletalk_core::config::ConversationConfig;
use tabletalk_core::error::{RejectReason, TableTalkError, TableTalkResult};
use tabletalk_core::events::{ConversationEvent, EscalationReason};
use tabletalk_core::types::{
    Conversation, ConversationKind, ConversationMessage, ConversationStatus, MessageSender,
    SentimentReading,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Describes a single valid state transition for a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: ConversationStatus,
    pub to: ConversationStatus,
    pub trigger: &'static str,
}

fn valid_transitions() -> Vec<StateTransition> {
    vec![
        // Active ->
        StateTransition {
            from: ConversationStatus::Active,
            to: ConversationStatus::Escalated,
            trigger: "low_confidence",
        },
        StateTransition {
            from: ConversationStatus::Active,
            to: ConversationStatus::Escalated,
            trigger: "negative_sentiment",
        },
        StateTransition {
            from: ConversationStatus::Active,
            to: ConversationStatus::Escalated,
            trigger: "operator_escalate",
        },
        StateTransition {
            from: ConversationStatus::Active,
            to: ConversationStatus::Resolved,
            trigger: "operator_close",
        },
        StateTransition {
            from: ConversationStatus::Active,
            to: ConversationStatus::Resolved,
            trigger: "terminal_signal",
        },
        StateTransition {
            from: ConversationStatus::Active,
            to: ConversationStatus::Abandoned,
            trigger: "inactivity_timeout",
        },
        // Escalated -> resolution needs a human; a confidence recovery
        // alone never closes the loop.
        StateTransition {
            from: ConversationStatus::Escalated,
            to: ConversationStatus::Resolved,
            trigger: "operator_close",
        },
    ]
}

/// Owns conversation state and enforces the transition table. Mutating
/// calls return the domain events for the caller to feed into the alert
/// pipeline synchronously.
pub struct ConversationEngine {
    conversations: DashMap<Uuid, Conversation>,
    transitions: Vec<StateTransition>,
    config: ConversationConfig,
}

impl ConversationEngine {
    pub fn new(config: ConversationConfig) -> Self {
        Self {
            conversations: DashMap::new(),
            transitions: valid_transitions(),
            config,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Conversation> {
        self.conversations.get(&id).map(|c| c.value().clone())
    }

    /// The open (non-closed) conversation for a customer at a restaurant,
    /// if one exists.
    pub fn open_conversation(&self, restaurant_id: Uuid, customer_phone: &str) -> Option<Conversation> {
        self.conversations
            .iter()
            .find(|c| {
                c.restaurant_id == restaurant_id
                    && c.customer_phone == customer_phone
                    && !c.status.is_closed()
            })
            .map(|c| c.value().clone())
    }

    /// Conversations with no customer activity since `cutoff`; the index
    /// behind the abandonment sweep.
    pub fn inactive_since(&self, cutoff: DateTime<Utc>) -> Vec<Conversation> {
        self.conversations
            .iter()
            .filter(|c| c.status == ConversationStatus::Active && c.last_activity_at < cutoff)
            .map(|c| c.value().clone())
            .collect()
    }

    pub fn escalated_count_for_campaign(&self, campaign_id: Uuid) -> u64 {
        self.conversations
            .iter()
            .filter(|c| {
                c.campaign_id == Some(campaign_id) && c.status == ConversationStatus::Escalated
            })
            .count() as u64
    }

    /// Starts a new active conversation on the first message.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        customer_phone: &str,
        restaurant_id: Uuid,
        campaign_id: Option<Uuid>,
        recipient_id: Option<Uuid>,
        kind: ConversationKind,
        now: DateTime<Utc>,
    ) -> (Conversation, Vec<ConversationEvent>) {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            customer_phone: customer_phone.to_string(),
            restaurant_id,
            campaign_id,
            recipient_id,
            status: ConversationStatus::Active,
            kind,
            confidence: None,
            messages: Vec::new(),
            started_at: now,
            last_activity_at: now,
            escalated_at: None,
            resolved_at: None,
        };
        info!(conversation_id = %conversation.id, %restaurant_id, "Conversation started");
        self.conversations
            .insert(conversation.id, conversation.clone());
        let event = ConversationEvent::Started {
            conversation_id: conversation.id,
            restaurant_id,
            at: now,
        };
        (conversation, vec![event])
    }

    /// Routes an inbound customer message: appends to the customer's open
    /// conversation, or starts a new one. A message arriving after
    /// resolution always starts a new conversation; it never reopens the
    /// closed one.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_inbound(
        &self,
        customer_phone: &str,
        restaurant_id: Uuid,
        campaign_id: Option<Uuid>,
        recipient_id: Option<Uuid>,
        kind: ConversationKind,
        content: &str,
        reading: Option<&SentimentReading>,
        now: DateTime<Utc>,
    ) -> TableTalkResult<(Uuid, Vec<ConversationEvent>)> {
        match self.open_conversation(restaurant_id, customer_phone) {
            Some(open) => {
                let events = self.record_customer_message(open.id, content, reading, now)?;
                Ok((open.id, events))
            }
            None => {
                let (conversation, mut events) = self.start(
                    customer_phone,
                    restaurant_id,
                    campaign_id,
                    recipient_id,
                    kind,
                    now,
                );
                events.extend(self.record_customer_message(conversation.id, content, reading, now)?);
                Ok((conversation.id, events))
            }
        }
    }

    pub fn record_customer_message(
        &self,
        id: Uuid,
        content: &str,
        reading: Option<&SentimentReading>,
        now: DateTime<Utc>,
    ) -> TableTalkResult<Vec<ConversationEvent>> {
        let mut entry = self.entry(id)?;
        if entry.status.is_closed() {
            return Err(TableTalkError::BusinessRule(RejectReason::ConversationClosed));
        }
        entry.messages.push(ConversationMessage {
            id: Uuid::new_v4(),
            sender: MessageSender::Customer,
            content: content.to_string(),
            sentiment: reading.map(|r| r.label),
            sentiment_score: reading.map(|r| r.score),
            confidence: None,
            timestamp: now,
        });
        entry.last_activity_at = now;
        Ok(Vec::new())
    }

    /// Records an assistant turn. The conversation's rolling confidence is
    /// this turn's confidence, not an average: escalation is gated by the
    /// most recent turn alone. An active conversation escalates when the
    /// turn's confidence drops below the threshold or its sentiment is
    /// strongly negative.
    pub fn record_ai_turn(
        &self,
        id: Uuid,
        content: &str,
        reading: &SentimentReading,
        now: DateTime<Utc>,
    ) -> TableTalkResult<Vec<ConversationEvent>> {
        let mut entry = self.entry(id)?;
        if entry.status.is_closed() {
            return Err(TableTalkError::BusinessRule(RejectReason::ConversationClosed));
        }
        entry.messages.push(ConversationMessage {
            id: Uuid::new_v4(),
            sender: MessageSender::Assistant,
            content: content.to_string(),
            sentiment: Some(reading.label),
            sentiment_score: Some(reading.score),
            confidence: Some(reading.confidence),
            timestamp: now,
        });
        entry.confidence = Some(reading.confidence);

        if entry.status != ConversationStatus::Active {
            return Ok(Vec::new());
        }
        let reason = if reading.confidence < self.config.confidence_threshold {
            Some(EscalationReason::LowConfidence {
                confidence: reading.confidence,
            })
        } else if reading.score <= self.config.negative_sentiment_threshold {
            Some(EscalationReason::NegativeSentiment {
                score: reading.score,
            })
        } else {
            None
        };
        match reason {
            Some(reason) => {
                let trigger = match reason {
                    EscalationReason::LowConfidence { .. } => "low_confidence",
                    EscalationReason::NegativeSentiment { .. } => "negative_sentiment",
                    EscalationReason::Operator => unreachable!(),
                };
                let event = Self::apply(
                    &self.transitions,
                    &mut entry,
                    ConversationStatus::Escalated,
                    trigger,
                    reason,
                    now,
                )?;
                Ok(vec![event])
            }
            None => Ok(Vec::new()),
        }
    }

    /// Records a human staff reply; does not change state.
    pub fn record_staff_message(
        &self,
        id: Uuid,
        content: &str,
        now: DateTime<Utc>,
    ) -> TableTalkResult<()> {
        let mut entry = self.entry(id)?;
        if entry.status.is_closed() {
            return Err(TableTalkError::BusinessRule(RejectReason::ConversationClosed));
        }
        entry.messages.push(ConversationMessage {
            id: Uuid::new_v4(),
            sender: MessageSender::Staff,
            content: content.to_string(),
            sentiment: None,
            sentiment_score: None,
            confidence: None,
            timestamp: now,
        });
        Ok(())
    }

    pub fn operator_escalate(&self, id: Uuid, now: DateTime<Utc>) -> TableTalkResult<Vec<ConversationEvent>> {
        let mut entry = self.entry(id)?;
        let event = Self::apply(
            &self.transitions,
            &mut entry,
            ConversationStatus::Escalated,
            "operator_escalate",
            EscalationReason::Operator,
            now,
        )?;
        Ok(vec![event])
    }

    pub fn operator_resolve(&self, id: Uuid, now: DateTime<Utc>) -> TableTalkResult<Vec<ConversationEvent>> {
        self.resolve(id, "operator_close", now)
    }

    /// Closes the loop on a detected terminal customer signal (a thank-you
    /// after a completed feedback flow). Only valid while active; an
    /// escalated conversation stays open for a human.
    pub fn resolve_on_terminal_signal(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> TableTalkResult<Vec<ConversationEvent>> {
        self.resolve(id, "terminal_signal", now)
    }

    fn resolve(
        &self,
        id: Uuid,
        trigger: &'static str,
        now: DateTime<Utc>,
    ) -> TableTalkResult<Vec<ConversationEvent>> {
        let mut entry = self.entry(id)?;
        let from = entry.status;
        if !self
            .transitions
            .iter()
            .any(|t| t.from == from && t.to == ConversationStatus::Resolved && t.trigger == trigger)
        {
            return Err(TableTalkError::InvalidTransition {
                entity: "conversation",
                from: format!("{from:?}"),
                to: "Resolved".to_string(),
            });
        }
        entry.status = ConversationStatus::Resolved;
        entry.resolved_at = Some(now);
        info!(conversation_id = %id, trigger, "Conversation resolved");
        Ok(vec![ConversationEvent::Resolved {
            conversation_id: id,
            restaurant_id: entry.restaurant_id,
            at: now,
        }])
    }

    /// Periodic sweep: abandons active conversations with no customer
    /// reply inside the inactivity window. Escalated conversations are
    /// exempt; they wait for a human.
    pub fn sweep_inactive(&self, now: DateTime<Utc>) -> Vec<ConversationEvent> {
        let cutoff = now - Duration::hours(self.config.inactivity_timeout_hours);
        let stale = self.inactive_since(cutoff);
        let mut events = Vec::new();
        for conversation in stale {
            let Ok(mut entry) = self.entry(conversation.id) else {
                continue;
            };
            // Re-check under the lock; an inbound message may have raced
            // the sweep.
            if entry.status != ConversationStatus::Active || entry.last_activity_at >= cutoff {
                continue;
            }
            entry.status = ConversationStatus::Abandoned;
            warn!(conversation_id = %entry.id, "Conversation abandoned after inactivity");
            events.push(ConversationEvent::Abandoned {
                conversation_id: entry.id,
                restaurant_id: entry.restaurant_id,
                at: now,
            });
        }
        events
    }

    /// Drives the abandonment sweep, forwarding the resulting events to
    /// the caller's channel for the alert pipeline.
    pub async fn run_sweeper(
        self: std::sync::Arc<Self>,
        events: tokio::sync::mpsc::UnboundedSender<ConversationEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            self.config.sweep_interval_secs,
        ));
        info!("Conversation sweep started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for event in self.sweep_inactive(Utc::now()) {
                        let _ = events.send(event);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Conversation sweep stopping");
                    return;
                }
            }
        }
    }

    fn entry(
        &self,
        id: Uuid,
    ) -> TableTalkResult<dashmap::mapref::one::RefMut<'_, Uuid, Conversation>> {
        self.conversations
            .get_mut(&id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "conversation",
                id: id.to_string(),
            })
    }

    fn apply(
        transitions: &[StateTransition],
        conversation: &mut Conversation,
        to: ConversationStatus,
        trigger: &'static str,
        reason: EscalationReason,
        now: DateTime<Utc>,
    ) -> TableTalkResult<ConversationEvent> {
        let from = conversation.status;
        if !transitions
            .iter()
            .any(|t| t.from == from && t.to == to && t.trigger == trigger)
        {
            return Err(TableTalkError::InvalidTransition {
                entity: "conversation",
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            });
        }
        conversation.status = to;
        conversation.escalated_at = Some(now);
        info!(
            conversation_id = %conversation.id,
            trigger,
            "Conversation escalated"
        );
        Ok(ConversationEvent::Escalated {
            conversation_id: conversation.id,
            restaurant_id: conversation.restaurant_id,
            reason,
            at: now,
        })
    }
}
