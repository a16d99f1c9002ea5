use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named outreach effort owned by one restaurant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub restaurant_id: Uuid,
    pub name: String,
    /// Locality used for blackout-window lookups (e.g. "riyadh").
    pub locality: String,
    pub status: CampaignStatus,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    /// Template identifiers, one per message step, dispatched in order.
    pub template_steps: Vec<String>,
    /// Experiment attached to this campaign, if any.
    pub experiment_id: Option<Uuid>,
    pub settings: serde_json::Value,
    pub metrics: CampaignMetrics,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Active,
    Completed,
    Cancelled,
    Deleted,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Deleted
        )
    }
}

/// Aggregated campaign counters, recomputed on demand from message and
/// conversation state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignMetrics {
    pub total_recipients: u64,
    pub scheduled: u64,
    pub sent: u64,
    pub delivered: u64,
    pub responded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub response_rate: f64,
    pub escalated_conversations: u64,
}

/// One customer entry targeted by a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub phone_number: String,
    pub visit_timestamp: DateTime<Utc>,
    pub scheduled_send_time: Option<DateTime<Utc>>,
    pub status: RecipientStatus,
    pub conversation_id: Option<Uuid>,
    /// Extra columns carried through from the import file.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Responded,
    Failed,
}

/// One tracked outbound message tied to a recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignMessage {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub recipient_id: Uuid,
    pub template: String,
    /// Zero-based position in the campaign's template steps.
    pub step: u32,
    pub variant_id: Option<String>,
    pub external_id: Option<String>,
    pub attempts: u32,
    pub scheduled_send_time: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Scheduled,
    Queued,
    Sent,
    Delivered,
    Read,
    Responded,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Failed | MessageStatus::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Scheduled => 0,
            MessageStatus::Queued => 1,
            MessageStatus::Sent => 2,
            MessageStatus::Delivered => 3,
            MessageStatus::Read => 4,
            MessageStatus::Responded => 5,
            MessageStatus::Failed | MessageStatus::Cancelled => u8::MAX,
        }
    }

    /// Statuses only move forward along the delivery order. `Failed` and
    /// `Cancelled` are reachable from any non-terminal status and are
    /// themselves terminal.
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        next.rank() > self.rank()
    }
}

/// An A/B experiment over message template variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub name: String,
    pub description: String,
    pub variants: Vec<ExperimentVariant>,
    pub status: ExperimentStatus,
    pub strategy: AssignmentStrategy,
    pub min_sample_size: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Archived,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    Random,
    Weighted,
    HashBased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentVariant {
    pub id: String,
    pub name: String,
    /// Relative traffic weight; normalized to sum 1.0 at registration.
    pub weight: f64,
    pub template: String,
    pub metrics: VariantMetrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantMetrics {
    pub participants: u64,
    pub responses: u64,
    pub response_rate: f64,
    pub average_rating: f64,
}

/// Binding of one customer to one variant within one experiment. Created
/// at most once per (experiment, customer) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantAssignment {
    pub experiment_id: Uuid,
    pub customer_key: String,
    pub variant_id: String,
    pub assigned_at: DateTime<Utc>,
}

/// The stateful thread for one customer interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub customer_phone: String,
    pub restaurant_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub status: ConversationStatus,
    pub kind: ConversationKind,
    /// Confidence of the most recent assistant turn. Recency gates
    /// escalation: one low-confidence turn after many good ones must still
    /// trigger it.
    pub confidence: Option<f64>,
    pub messages: Vec<ConversationMessage>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Escalated,
    Resolved,
    Abandoned,
}

impl ConversationStatus {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            ConversationStatus::Resolved | ConversationStatus::Abandoned
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Feedback,
    Order,
    Support,
    General,
}

/// Closed set of message authors. Adding a sender type is a compile-checked
/// change at every match site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    Customer,
    Assistant,
    Staff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub sender: MessageSender,
    pub content: String,
    pub sentiment: Option<SentimentLabel>,
    pub sentiment_score: Option<f64>,
    pub confidence: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

/// Output of the external sentiment/confidence scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentReading {
    pub label: SentimentLabel,
    /// Sentiment polarity in [-1, 1].
    pub score: f64,
    /// Model confidence in [0, 1].
    pub confidence: f64,
}

/// A surfaced notification requiring human attention. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub restaurant_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub rule_id: String,
    pub priority: AlertPriority,
    pub title: String,
    pub message: String,
    pub details: serde_json::Value,
    /// How many times the triggering condition fired within the
    /// deduplication cool-down.
    pub occurrences: u32,
    pub status: AlertStatus,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledgment_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub dismissed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    Low,
    Medium,
    High,
    Immediate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Acknowledged,
    Resolved,
    Dismissed,
}

impl AlertStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::Dismissed)
    }
}

/// Structured feedback extracted from a conversation, evaluated by the
/// alert rule engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub restaurant_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub customer_phone: String,
    /// Overall rating on a 1-5 scale, when the customer gave one.
    pub rating: Option<u8>,
    pub sentiment_score: Option<f64>,
    pub topics: Vec<String>,
    pub message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// One validated row handed over by the import boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedRecipient {
    pub phone_number: String,
    pub visit_timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Outcome of a recipient import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportSummary {
    pub accepted: u64,
    pub duplicates_removed: u64,
    pub invalid_skipped: u64,
}
