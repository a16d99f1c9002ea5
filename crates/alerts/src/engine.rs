//! Alert rule engine — deterministic rule evaluation, deduplication
//! against open alerts, and the acknowledge/resolve/dismiss workflow.

use crate::rules::AlertRule;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tabletalk_core::config::AlertConfig;
use tabletalk_core::error::{RejectReason, TableTalkError, TableTalkResult};
use tabletalk_core::events::{ConversationEvent, DeliveryEvent, EscalationReason};
use tabletalk_core::types::{
    Alert, AlertPriority, AlertStatus, Campaign, FeedbackEvent,
};
use tracing::{info, warn};
use uuid::Uuid;

pub struct AlertRuleEngine {
    /// Sorted by rule id so evaluation order is deterministic and tests
    /// are reproducible.
    rules: Vec<AlertRule>,
    alerts: DashMap<Uuid, Alert>,
    /// Recent feedback events per restaurant, for frequency predicates.
    history: Mutex<Vec<FeedbackEvent>>,
    history_horizon: Duration,
    config: AlertConfig,
}

impl AlertRuleEngine {
    pub fn new(mut rules: Vec<AlertRule>, config: AlertConfig) -> Self {
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        let horizon_hours = rules
            .iter()
            .map(|r| r.predicate.horizon_hours())
            .max()
            .unwrap_or(0)
            .max(config.dedup_cooldown_hours);
        Self {
            rules,
            alerts: DashMap::new(),
            history: Mutex::new(Vec::new()),
            history_horizon: Duration::hours(horizon_hours),
            config,
        }
    }

    /// Evaluates every rule against the event, in rule-id lexical order.
    /// One event may fire several rules. A rule that already has an open
    /// alert for the same conversation inside the cool-down appends to
    /// that alert's payload instead of duplicating it. Returns only newly
    /// created alerts.
    pub fn evaluate(
        &self,
        event: &FeedbackEvent,
        campaign: Option<&Campaign>,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let history = {
            let mut history = self.history.lock();
            history.retain(|e| e.occurred_at >= now - self.history_horizon);
            history.push(event.clone());
            history
                .iter()
                .filter(|e| e.restaurant_id == event.restaurant_id)
                .cloned()
                .collect::<Vec<_>>()
        };

        let cooldown = self.cooldown(campaign);
        let mut created = Vec::new();
        for rule in &self.rules {
            if !rule.predicate.matches(event, &history, now) {
                continue;
            }
            if let Some(open) = self.open_duplicate(&rule.id, event.conversation_id, cooldown, now)
            {
                self.append_occurrence(open, event);
                continue;
            }
            let alert = self.create_alert(rule, event, now);
            created.push(alert);
        }
        created
    }

    /// Consumes a conversation state-machine event. Escalations surface as
    /// high-priority alerts, deduplicated per conversation like rule
    /// firings; other lifecycle events carry no alerting duty.
    pub fn conversation_event(
        &self,
        event: &ConversationEvent,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let ConversationEvent::Escalated {
            conversation_id,
            restaurant_id,
            reason,
            ..
        } = event
        else {
            return None;
        };
        let cooldown = Duration::hours(self.config.dedup_cooldown_hours);
        if let Some(open) =
            self.open_duplicate("conversation_escalated", Some(*conversation_id), cooldown, now)
        {
            if let Some(mut alert) = self.alerts.get_mut(&open) {
                alert.occurrences += 1;
            }
            return None;
        }
        let (message, priority) = match reason {
            EscalationReason::LowConfidence { confidence } => (
                format!("Assistant confidence dropped to {confidence:.2}; a human should take over"),
                AlertPriority::High,
            ),
            EscalationReason::NegativeSentiment { score } => (
                format!("Customer sentiment fell to {score:.2}; a human should take over"),
                AlertPriority::High,
            ),
            EscalationReason::Operator => (
                "Conversation escalated by an operator".to_string(),
                AlertPriority::Medium,
            ),
        };
        let alert = Alert {
            id: Uuid::new_v4(),
            restaurant_id: *restaurant_id,
            conversation_id: Some(*conversation_id),
            campaign_id: None,
            rule_id: "conversation_escalated".to_string(),
            priority,
            title: "Conversation needs attention".to_string(),
            message,
            details: json!({ "reason": reason }),
            occurrences: 1,
            status: AlertStatus::Pending,
            acknowledged_by: None,
            acknowledged_at: None,
            acknowledgment_notes: None,
            resolved_at: None,
            dismissed_at: None,
            created_at: now,
        };
        info!(alert_id = %alert.id, conversation_id = %conversation_id, "Escalation alert raised");
        self.alerts.insert(alert.id, alert.clone());
        Some(alert)
    }

    /// Surfaces a dispatch failure as a low-priority operational alert.
    pub fn operational(&self, event: &DeliveryEvent, now: DateTime<Utc>) -> Alert {
        let DeliveryEvent::MessageFailed {
            message_id,
            campaign_id,
            restaurant_id,
            attempts,
            permanent,
            error,
            ..
        } = event;
        let alert = Alert {
            id: Uuid::new_v4(),
            restaurant_id: *restaurant_id,
            conversation_id: None,
            campaign_id: Some(*campaign_id),
            rule_id: "delivery_failure".to_string(),
            priority: AlertPriority::Low,
            title: "Message delivery failed".to_string(),
            message: format!(
                "A campaign message could not be delivered after {attempts} attempt(s)"
            ),
            details: json!({
                "message_id": message_id,
                "permanent": permanent,
                "error": error,
            }),
            occurrences: 1,
            status: AlertStatus::Pending,
            acknowledged_by: None,
            acknowledged_at: None,
            acknowledgment_notes: None,
            resolved_at: None,
            dismissed_at: None,
            created_at: now,
        };
        warn!(alert_id = %alert.id, campaign_id = %campaign_id, "Operational alert raised");
        self.alerts.insert(alert.id, alert.clone());
        alert
    }

    /// `pending -> acknowledged`. Notes are an enforced contract, not UI
    /// validation: empty notes are rejected.
    pub fn acknowledge(
        &self,
        id: Uuid,
        actor: &str,
        notes: &str,
        now: DateTime<Utc>,
    ) -> TableTalkResult<Alert> {
        if notes.trim().is_empty() {
            return Err(TableTalkError::BusinessRule(
                RejectReason::EmptyAcknowledgmentNotes,
            ));
        }
        self.workflow_step(id, AlertStatus::Pending, AlertStatus::Acknowledged, |alert| {
            alert.acknowledged_by = Some(actor.to_string());
            alert.acknowledged_at = Some(now);
            alert.acknowledgment_notes = Some(notes.to_string());
        })
    }

    /// `acknowledged -> resolved`; terminal thereafter.
    pub fn resolve(&self, id: Uuid, now: DateTime<Utc>) -> TableTalkResult<Alert> {
        self.workflow_step(id, AlertStatus::Acknowledged, AlertStatus::Resolved, |alert| {
            alert.resolved_at = Some(now);
        })
    }

    /// `pending -> dismissed`; terminal thereafter.
    pub fn dismiss(&self, id: Uuid, now: DateTime<Utc>) -> TableTalkResult<Alert> {
        self.workflow_step(id, AlertStatus::Pending, AlertStatus::Dismissed, |alert| {
            alert.dismissed_at = Some(now);
        })
    }

    pub fn get(&self, id: Uuid) -> Option<Alert> {
        self.alerts.get(&id).map(|a| a.value().clone())
    }

    /// Open (pending or acknowledged) alerts for a restaurant, newest
    /// first, optionally filtered by priority.
    pub fn open_alerts(&self, restaurant_id: Uuid, priority: Option<AlertPriority>) -> Vec<Alert> {
        let mut open: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| {
                a.restaurant_id == restaurant_id
                    && !a.status.is_terminal()
                    && priority.map_or(true, |p| a.priority == p)
            })
            .map(|a| a.value().clone())
            .collect();
        open.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        open
    }

    pub fn statistics(
        &self,
        restaurant_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AlertStatistics {
        let alerts: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| {
                a.restaurant_id == restaurant_id && a.created_at >= from && a.created_at <= to
            })
            .map(|a| a.value().clone())
            .collect();

        let mut by_priority = HashMap::new();
        let mut by_status = HashMap::new();
        let mut rule_counts: HashMap<String, u64> = HashMap::new();
        let mut ack_latencies = Vec::new();
        for alert in &alerts {
            *by_priority.entry(alert.priority).or_insert(0u64) += 1;
            *by_status.entry(alert.status).or_insert(0u64) += 1;
            *rule_counts.entry(alert.rule_id.clone()).or_insert(0) += 1;
            if let Some(acknowledged_at) = alert.acknowledged_at {
                ack_latencies.push((acknowledged_at - alert.created_at).num_seconds());
            }
        }
        let average_ack_seconds = if ack_latencies.is_empty() {
            None
        } else {
            Some(ack_latencies.iter().sum::<i64>() as f64 / ack_latencies.len() as f64)
        };
        let mut top_rules: Vec<(String, u64)> = rule_counts.into_iter().collect();
        top_rules.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_rules.truncate(5);

        AlertStatistics {
            total: alerts.len() as u64,
            by_priority,
            by_status,
            average_ack_seconds,
            top_rules,
        }
    }

    fn cooldown(&self, campaign: Option<&Campaign>) -> Duration {
        campaign
            .and_then(|c| match (c.scheduled_start, c.scheduled_end) {
                (Some(start), Some(end)) if end > start => Some(end - start),
                _ => None,
            })
            .unwrap_or_else(|| Duration::hours(self.config.dedup_cooldown_hours))
    }

    fn open_duplicate(
        &self,
        rule_id: &str,
        conversation_id: Option<Uuid>,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Option<Uuid> {
        let conversation_id = conversation_id?;
        self.alerts
            .iter()
            .find(|a| {
                a.rule_id == rule_id
                    && a.conversation_id == Some(conversation_id)
                    && !a.status.is_terminal()
                    && a.created_at >= now - cooldown
            })
            .map(|a| a.id)
    }

    fn append_occurrence(&self, alert_id: Uuid, event: &FeedbackEvent) {
        if let Some(mut alert) = self.alerts.get_mut(&alert_id) {
            alert.occurrences += 1;
            if let Some(occurrences) = alert
                .details
                .get_mut("occurrences")
                .and_then(|v| v.as_array_mut())
            {
                occurrences.push(event_payload(event));
            }
            info!(
                alert_id = %alert_id,
                occurrences = alert.occurrences,
                "Duplicate alert condition folded into open alert"
            );
        }
    }

    fn create_alert(&self, rule: &AlertRule, event: &FeedbackEvent, now: DateTime<Utc>) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            restaurant_id: event.restaurant_id,
            conversation_id: event.conversation_id,
            campaign_id: event.campaign_id,
            rule_id: rule.id.clone(),
            priority: rule.priority,
            title: rule.title.clone(),
            message: render_message(event),
            details: json!({ "occurrences": [event_payload(event)] }),
            occurrences: 1,
            status: AlertStatus::Pending,
            acknowledged_by: None,
            acknowledged_at: None,
            acknowledgment_notes: None,
            resolved_at: None,
            dismissed_at: None,
            created_at: now,
        };
        info!(
            alert_id = %alert.id,
            rule_id = %rule.id,
            priority = ?rule.priority,
            "Alert raised"
        );
        self.alerts.insert(alert.id, alert.clone());
        alert
    }

    fn workflow_step<F>(
        &self,
        id: Uuid,
        from: AlertStatus,
        to: AlertStatus,
        apply: F,
    ) -> TableTalkResult<Alert>
    where
        F: FnOnce(&mut Alert),
    {
        let mut entry = self
            .alerts
            .get_mut(&id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "alert",
                id: id.to_string(),
            })?;
        if entry.status.is_terminal() {
            return Err(TableTalkError::BusinessRule(RejectReason::AlertTerminal));
        }
        if entry.status != from {
            return Err(TableTalkError::InvalidTransition {
                entity: "alert",
                from: format!("{:?}", entry.status),
                to: format!("{to:?}"),
            });
        }
        entry.status = to;
        apply(entry.value_mut());
        Ok(entry.value().clone())
    }
}

fn render_message(event: &FeedbackEvent) -> String {
    match (event.rating, event.sentiment_score) {
        (Some(rating), _) => format!(
            "Customer {} rated their visit {rating}/5",
            event.customer_phone
        ),
        (None, Some(score)) => format!(
            "Customer {} left feedback with sentiment {score:.2}",
            event.customer_phone
        ),
        (None, None) => format!("Customer {} left feedback", event.customer_phone),
    }
}

fn event_payload(event: &FeedbackEvent) -> serde_json::Value {
    json!({
        "customer_phone": event.customer_phone,
        "rating": event.rating,
        "sentiment_score": event.sentiment_score,
        "topics": event.topics,
        "message": event.message,
        "occurred_at": event.occurred_at,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStatistics {
    pub total: u64,
    pub by_priority: HashMap<AlertPriority, u64>,
    pub by_status: HashMap<AlertStatus, u64>,
    pub average_ack_seconds: Option<f64>,
    pub top_rules: Vec<(String, u64)>,
}
