//! Alerting — declarative rule evaluation over feedback events, alert
//! deduplication, and the acknowledgment workflow.

pub mod engine;
pub mod rules;

pub use engine::{AlertRuleEngine, AlertStatistics};
pub use rules::{default_rules, AlertRule, RulePredicate};
