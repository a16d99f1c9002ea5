//! Domain events returned from state transitions.
//!
//! Transition side effects are modeled as a list of events returned to the
//! caller and consumed synchronously (conversation events feed the alert
//! rule engine), keeping ordering explicit instead of hiding it behind
//! callbacks or pub/sub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ConversationEvent {
    Started {
        conversation_id: Uuid,
        restaurant_id: Uuid,
        at: DateTime<Utc>,
    },
    Escalated {
        conversation_id: Uuid,
        restaurant_id: Uuid,
        reason: EscalationReason,
        at: DateTime<Utc>,
    },
    Resolved {
        conversation_id: Uuid,
        restaurant_id: Uuid,
        at: DateTime<Utc>,
    },
    Abandoned {
        conversation_id: Uuid,
        restaurant_id: Uuid,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EscalationReason {
    LowConfidence { confidence: f64 },
    NegativeSentiment { score: f64 },
    Operator,
}

/// Operational events emitted by the dispatch worker, surfaced as
/// low-priority alerts rather than silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DeliveryEvent {
    MessageFailed {
        message_id: Uuid,
        campaign_id: Uuid,
        restaurant_id: Uuid,
        attempts: u32,
        permanent: bool,
        error: String,
        at: DateTime<Utc>,
    },
}
