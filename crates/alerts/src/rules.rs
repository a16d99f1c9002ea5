//! Declarative alert rules over feedback events.
//!
//! Predicates are a closed, tagged set evaluated by a dispatcher over the
//! tag. Rules stay configurable without an open-ended expression
//! interpreter, and every evaluation path is auditable.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tabletalk_core::types::{AlertPriority, FeedbackEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RulePredicate {
    /// Overall rating at or below the bound.
    RatingAtMost { rating: u8 },
    /// Overall rating exactly equal to the value.
    RatingEquals { rating: u8 },
    /// Sentiment score strictly below the bound.
    SentimentBelow { bound: f64 },
    /// The topic was discussed and sentiment fell below the bound.
    TopicSentiment { topic: String, below: f64 },
    /// The inner predicate matched at least `at_least` times (including
    /// this event) within the trailing window.
    Frequency {
        of: Box<RulePredicate>,
        at_least: u32,
        within_hours: i64,
    },
    AllOf { all: Vec<RulePredicate> },
    AnyOf { any: Vec<RulePredicate> },
}

impl RulePredicate {
    /// `history` is the engine's record of recent events for the same
    /// restaurant, most recent last, including `event` itself.
    pub fn matches(
        &self,
        event: &FeedbackEvent,
        history: &[FeedbackEvent],
        now: DateTime<Utc>,
    ) -> bool {
        match self {
            RulePredicate::RatingAtMost { rating } => {
                event.rating.map_or(false, |r| r <= *rating)
            }
            RulePredicate::RatingEquals { rating } => event.rating == Some(*rating),
            RulePredicate::SentimentBelow { bound } => {
                event.sentiment_score.map_or(false, |s| s < *bound)
            }
            RulePredicate::TopicSentiment { topic, below } => {
                event.topics.iter().any(|t| t == topic)
                    && event.sentiment_score.map_or(false, |s| s < *below)
            }
            RulePredicate::Frequency {
                of,
                at_least,
                within_hours,
            } => {
                if !of.matches(event, history, now) {
                    return false;
                }
                let cutoff = now - Duration::hours(*within_hours);
                let count = history
                    .iter()
                    .filter(|past| past.occurred_at >= cutoff && of.matches(past, history, now))
                    .count();
                count as u32 >= *at_least
            }
            RulePredicate::AllOf { all } => all.iter().all(|p| p.matches(event, history, now)),
            RulePredicate::AnyOf { any } => any.iter().any(|p| p.matches(event, history, now)),
        }
    }

    /// Widest trailing window this predicate can look back over, used by
    /// the engine to prune its event history.
    pub fn horizon_hours(&self) -> i64 {
        match self {
            RulePredicate::Frequency {
                of, within_hours, ..
            } => (*within_hours).max(of.horizon_hours()),
            RulePredicate::AllOf { all } => {
                all.iter().map(RulePredicate::horizon_hours).max().unwrap_or(0)
            }
            RulePredicate::AnyOf { any } => {
                any.iter().map(RulePredicate::horizon_hours).max().unwrap_or(0)
            }
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub title: String,
    pub priority: AlertPriority,
    pub predicate: RulePredicate,
}

/// The stock rule set for restaurant feedback.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            id: "low_rating_immediate".to_string(),
            title: "Very low rating (1-2 stars)".to_string(),
            priority: AlertPriority::Immediate,
            predicate: RulePredicate::RatingAtMost { rating: 2 },
        },
        AlertRule {
            id: "medium_rating".to_string(),
            title: "Medium rating (3 stars)".to_string(),
            priority: AlertPriority::Medium,
            predicate: RulePredicate::RatingEquals { rating: 3 },
        },
        AlertRule {
            id: "negative_sentiment".to_string(),
            title: "Strong negative sentiment detected".to_string(),
            priority: AlertPriority::High,
            predicate: RulePredicate::SentimentBelow { bound: -0.5 },
        },
        AlertRule {
            id: "food_quality_issue".to_string(),
            title: "Food quality complaint".to_string(),
            priority: AlertPriority::High,
            predicate: RulePredicate::TopicSentiment {
                topic: "food_quality".to_string(),
                below: 0.0,
            },
        },
        AlertRule {
            id: "service_complaint".to_string(),
            title: "Service complaint".to_string(),
            priority: AlertPriority::High,
            predicate: RulePredicate::TopicSentiment {
                topic: "service".to_string(),
                below: 0.0,
            },
        },
        AlertRule {
            id: "repeated_issue".to_string(),
            title: "Repeated customer complaint".to_string(),
            priority: AlertPriority::High,
            predicate: RulePredicate::Frequency {
                of: Box::new(RulePredicate::SentimentBelow { bound: 0.0 }),
                at_least: 3,
                within_hours: 72,
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(rating: Option<u8>, sentiment: Option<f64>, topics: &[&str]) -> FeedbackEvent {
        FeedbackEvent {
            restaurant_id: Uuid::new_v4(),
            conversation_id: None,
            campaign_id: None,
            customer_phone: "+966501234567".to_string(),
            rating,
            sentiment_score: sentiment,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            message: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_rating_predicates() {
        let now = Utc::now();
        let low = RulePredicate::RatingAtMost { rating: 2 };
        assert!(low.matches(&event(Some(1), None, &[]), &[], now));
        assert!(low.matches(&event(Some(2), None, &[]), &[], now));
        assert!(!low.matches(&event(Some(3), None, &[]), &[], now));
        assert!(!low.matches(&event(None, None, &[]), &[], now));
    }

    #[test]
    fn test_topic_sentiment_requires_both() {
        let now = Utc::now();
        let predicate = RulePredicate::TopicSentiment {
            topic: "service".to_string(),
            below: 0.0,
        };
        assert!(predicate.matches(&event(None, Some(-0.2), &["service"]), &[], now));
        assert!(!predicate.matches(&event(None, Some(0.4), &["service"]), &[], now));
        assert!(!predicate.matches(&event(None, Some(-0.2), &["ambience"]), &[], now));
    }

    #[test]
    fn test_frequency_counts_within_window() {
        let now = Utc::now();
        let predicate = RulePredicate::Frequency {
            of: Box::new(RulePredicate::SentimentBelow { bound: 0.0 }),
            at_least: 3,
            within_hours: 72,
        };
        let current = event(None, Some(-0.4), &[]);
        let mut history = vec![
            FeedbackEvent {
                occurred_at: now - Duration::hours(10),
                ..event(None, Some(-0.3), &[])
            },
            FeedbackEvent {
                // Outside the window; must not count.
                occurred_at: now - Duration::hours(100),
                ..event(None, Some(-0.9), &[])
            },
            current.clone(),
        ];
        assert!(!predicate.matches(&current, &history, now));

        history.push(FeedbackEvent {
            occurred_at: now - Duration::hours(1),
            ..event(None, Some(-0.6), &[])
        });
        assert!(predicate.matches(&current, &history, now));
    }

    #[test]
    fn test_composites() {
        let now = Utc::now();
        let both = RulePredicate::AllOf {
            all: vec![
                RulePredicate::RatingAtMost { rating: 3 },
                RulePredicate::SentimentBelow { bound: 0.0 },
            ],
        };
        assert!(both.matches(&event(Some(2), Some(-0.1), &[]), &[], now));
        assert!(!both.matches(&event(Some(2), Some(0.4), &[]), &[], now));

        let either = RulePredicate::AnyOf {
            any: vec![
                RulePredicate::RatingAtMost { rating: 1 },
                RulePredicate::SentimentBelow { bound: -0.9 },
            ],
        };
        assert!(either.matches(&event(Some(1), Some(0.5), &[]), &[], now));
        assert!(!either.matches(&event(Some(4), Some(0.0), &[]), &[], now));
    }

    #[test]
    fn test_default_rules_sorted_ids_are_stable() {
        let mut ids: Vec<String> = default_rules().into_iter().map(|r| r.id).collect();
        let original = ids.clone();
        ids.sort();
        // The stock set happens not to be pre-sorted; the engine sorts.
        assert_eq!(ids.len(), original.len());
        assert!(ids.contains(&"low_rating_immediate".to_string()));
        assert!(ids.contains(&"repeated_issue".to_string()));
    }
}
