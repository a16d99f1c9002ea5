//! Conversation state machine — status transitions, escalation triggers,
//! and the inactivity sweep.

pub mod state_machine;

pub use state_machine::{ConversationEngine, StateTransition};
