use thiserror::Error;

pub type TableTalkResult<T> = Result<T, TableTalkError>;

#[derive(Error, Debug)]
pub enum TableTalkError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Synchronous rejection with a specific reason code. Never retried.
    #[error("Business rule rejected: {0}")]
    BusinessRule(RejectReason),

    /// Programming error, distinct from a business-rule rejection: the
    /// attempted transition is not in the state machine at all.
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Timeout, 5xx, network error. Retried with backoff up to the
    /// configured attempt budget.
    #[error("Transient transport failure: {0}")]
    TransientTransport(String),

    /// Invalid recipient address, policy rejection. Never retried.
    #[error("Permanent transport failure: {0}")]
    PermanentTransport(String),

    /// Fatal integrity error. The system must not proceed with ambiguous
    /// state; logged with full context and surfaced to operators.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    #[error("campaign is not schedulable in its current status")]
    CampaignNotSchedulable,

    #[error("campaign is cancelled")]
    CampaignCancelled,

    #[error("campaign window is invalid (start must precede end)")]
    InvalidCampaignWindow,

    #[error("campaign has no recipients")]
    NoRecipients,

    #[error("current time is outside the campaign window")]
    OutsideCampaignWindow,

    #[error("experiment is not running")]
    ExperimentNotRunning,

    #[error("experiment has no variants")]
    NoVariants,

    #[error("conversation is closed and immutable")]
    ConversationClosed,

    #[error("acknowledgment notes must not be empty")]
    EmptyAcknowledgmentNotes,

    #[error("alert is in a terminal status")]
    AlertTerminal,
}

impl TableTalkError {
    /// Transient failures are the only errors the dispatch retry loop is
    /// allowed to absorb.
    pub fn is_transient(&self) -> bool {
        matches!(self, TableTalkError::TransientTransport(_))
    }
}
