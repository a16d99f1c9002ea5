//! End-to-end campaign flow: import, blackout-aware scheduling, dispatch
//! with retry, inbound handling, escalation, and alerting.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tabletalk_alerts::{default_rules, AlertRuleEngine};
use tabletalk_campaigns::CampaignLifecycleController;
use tabletalk_conversations::ConversationEngine;
use tabletalk_core::boundary::{
    BlackoutInterval, DeliveryReceipt, MessageTransport, SentimentScorer, WindowSource,
};
use tabletalk_core::config::AppConfig;
use tabletalk_core::error::TableTalkResult;
use tabletalk_core::events::ConversationEvent;
use tabletalk_core::store::CampaignStore;
use tabletalk_core::types::{
    AlertPriority, AlertStatus, AssignmentStrategy, CampaignStatus, Experiment, ExperimentStatus,
    ExperimentVariant, FeedbackEvent, ImportedRecipient, MessageStatus, SentimentLabel,
    SentimentReading, VariantMetrics,
};
use tabletalk_delivery::{
    BlackoutWindowProvider, DeliveryScheduler, DispatchThrottle, DispatchWorker,
};
use tabletalk_experiments::ExperimentEngine;
use uuid::Uuid;

struct OpenCalendar;

impl WindowSource for OpenCalendar {
    fn day_table(
        &self,
        _locality: &str,
        _date: chrono::NaiveDate,
    ) -> anyhow::Result<Vec<BlackoutInterval>> {
        Ok(Vec::new())
    }
}

/// Fails each message's first attempt with a transient error, then
/// succeeds.
struct FlakyTransport {
    failures_left: AtomicU32,
    calls: parking_lot::Mutex<Vec<Uuid>>,
}

#[async_trait::async_trait]
impl MessageTransport for FlakyTransport {
    async fn send(
        &self,
        _recipient_address: &str,
        _rendered_content: &str,
        idempotency_key: Uuid,
    ) -> TableTalkResult<String> {
        self.calls.lock().push(idempotency_key);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(tabletalk_core::TableTalkError::TransientTransport(
                "gateway returned 503".to_string(),
            ));
        }
        Ok(format!("wamid.{idempotency_key}"))
    }
}

fn reading(score: f64, confidence: f64) -> SentimentReading {
    SentimentReading {
        label: if score <= -0.3 {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        },
        score,
        confidence,
    }
}

/// Stand-in for the NLU service: flags complaints about cold or late food.
struct KeywordScorer;

impl SentimentScorer for KeywordScorer {
    fn score(&self, text: &str) -> SentimentReading {
        if text.contains("بارد") || text.contains("متأخر") {
            reading(-0.6, 0.9)
        } else {
            reading(0.1, 0.8)
        }
    }
}

#[tokio::test]
async fn test_full_campaign_flow() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let mut config = AppConfig::default();
    config.blackout.fail_open = true;
    config.dispatch.retry_base_secs = 0;

    let store = Arc::new(CampaignStore::new());
    let conversations = Arc::new(ConversationEngine::new(config.conversation.clone()));
    let experiments = Arc::new(ExperimentEngine::new());
    let blackout = Arc::new(BlackoutWindowProvider::new(
        Arc::new(OpenCalendar),
        config.blackout.clone(),
    ));
    let controller = CampaignLifecycleController::new(store.clone(), conversations.clone());
    let scheduler = DeliveryScheduler::new(
        store.clone(),
        blackout,
        experiments.clone(),
        config.scheduler.clone(),
    );
    let transport = Arc::new(FlakyTransport {
        failures_left: AtomicU32::new(1),
        calls: parking_lot::Mutex::new(Vec::new()),
    });
    let worker = DispatchWorker::new(
        store.clone(),
        transport.clone(),
        Arc::new(DispatchThrottle::new(&config.dispatch)),
        config.dispatch.clone(),
    );
    let alerts = AlertRuleEngine::new(default_rules(), config.alerts.clone());

    let now = Utc::now();
    let restaurant_id = Uuid::new_v4();

    // Campaign setup: draft -> scheduled -> active, with an experiment.
    let campaign =
        controller.create_campaign(restaurant_id, "Post-visit feedback", "riyadh", vec![], now);
    controller
        .set_schedule(campaign.id, now - Duration::hours(1), now + Duration::hours(48))
        .unwrap();
    let experiment_id = experiments
        .register(Experiment {
            id: Uuid::new_v4(),
            campaign_id: Some(campaign.id),
            name: "greeting-tone".to_string(),
            description: "Formal vs casual".to_string(),
            variants: vec![
                ExperimentVariant {
                    id: "formal".to_string(),
                    name: "Formal".to_string(),
                    weight: 0.5,
                    template: "feedback_formal".to_string(),
                    metrics: VariantMetrics::default(),
                },
                ExperimentVariant {
                    id: "casual".to_string(),
                    name: "Casual".to_string(),
                    weight: 0.5,
                    template: "feedback_casual".to_string(),
                    metrics: VariantMetrics::default(),
                },
            ],
            status: ExperimentStatus::Draft,
            strategy: AssignmentStrategy::HashBased,
            min_sample_size: 10,
            created_at: now,
            started_at: None,
            ended_at: None,
        })
        .unwrap();
    experiments.start(experiment_id, now).unwrap();
    controller.attach_experiment(campaign.id, experiment_id).unwrap();

    let visit = now - Duration::hours(4);
    let summary = controller
        .import_recipients(
            campaign.id,
            vec![
                ImportedRecipient {
                    phone_number: "+966501111111".to_string(),
                    visit_timestamp: visit,
                    metadata: json!({"table": "4"}),
                },
                ImportedRecipient {
                    phone_number: "+966502222222".to_string(),
                    visit_timestamp: visit,
                    metadata: json!({}),
                },
                ImportedRecipient {
                    phone_number: "+966501111111".to_string(),
                    visit_timestamp: visit,
                    metadata: json!({}),
                },
                ImportedRecipient {
                    phone_number: "garbage".to_string(),
                    visit_timestamp: visit,
                    metadata: json!({}),
                },
            ],
            now,
        )
        .unwrap();
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.duplicates_removed, 1);
    assert_eq!(summary.invalid_skipped, 1);

    controller.activate(campaign.id, now).unwrap();

    // Scheduling: the visit was four hours ago, so resolved times clamp to
    // "now" and the messages are immediately due.
    let scheduled = scheduler.schedule_campaign(campaign.id, now).unwrap();
    assert_eq!(scheduled.len(), 2);
    assert!(scheduled.iter().all(|m| m.status == MessageStatus::Scheduled));
    assert!(scheduled.iter().all(|m| m.variant_id.is_some()));

    // Dispatch: one transient failure is absorbed by the retry budget.
    let (sent, events) = worker.run_once().await;
    assert_eq!(sent, 2);
    assert!(events.is_empty());
    assert_eq!(transport.calls.lock().len(), 3);

    // Delivery receipts flow in from the transport.
    let first = store
        .recipient_by_phone(campaign.id, "+966501111111")
        .unwrap();
    let first_messages = store.messages_for_recipient(first.id);
    let external_id = store
        .get_message(first_messages[0].id)
        .unwrap()
        .external_id
        .unwrap();
    worker
        .apply_receipt(DeliveryReceipt {
            external_id: external_id.clone(),
            status: MessageStatus::Delivered,
            timestamp: now,
        })
        .unwrap();
    worker
        .apply_receipt(DeliveryReceipt {
            external_id,
            status: MessageStatus::Responded,
            timestamp: now,
        })
        .unwrap();

    // The customer replies; the assistant fumbles; the conversation
    // escalates and the alert pipeline picks it up.
    let scorer = KeywordScorer;
    let complaint = "الطلب وصل متأخراً والطعام بارد";
    let inbound_reading = scorer.score(complaint);
    assert_eq!(inbound_reading.label, SentimentLabel::Negative);
    let (conversation_id, events) = controller
        .handle_inbound(campaign.id, "+966501111111", complaint, Some(&inbound_reading), now)
        .unwrap();
    assert!(matches!(events[0], ConversationEvent::Started { .. }));

    let events = conversations
        .record_ai_turn(conversation_id, "Could you rephrase?", &reading(0.0, 0.3), now)
        .unwrap();
    assert_eq!(events.len(), 1);
    let escalation_alert = alerts.conversation_event(&events[0], now).unwrap();
    assert_eq!(escalation_alert.priority, AlertPriority::High);

    // Extracted feedback fires the rating rules too.
    let fired = alerts.evaluate(
        &FeedbackEvent {
            restaurant_id,
            conversation_id: Some(conversation_id),
            campaign_id: Some(campaign.id),
            customer_phone: "+966501111111".to_string(),
            rating: Some(1),
            sentiment_score: Some(-0.6),
            topics: vec!["food_quality".to_string()],
            message: Some("الطعام بارد".to_string()),
            occurred_at: now,
        },
        store.get_campaign(campaign.id).as_ref(),
        now,
    );
    let rule_ids: Vec<&str> = fired.iter().map(|a| a.rule_id.as_str()).collect();
    assert!(rule_ids.contains(&"low_rating_immediate"));
    assert!(rule_ids.contains(&"food_quality_issue"));

    experiments
        .record_response(experiment_id, "+966501111111", true, Some(1))
        .unwrap();

    // The operator closes the loop.
    alerts
        .acknowledge(
            escalation_alert.id,
            "manager@branch",
            "Called the customer and comped the meal",
            now,
        )
        .unwrap();
    conversations.operator_resolve(conversation_id, now).unwrap();
    assert_eq!(
        alerts.get(escalation_alert.id).unwrap().status,
        AlertStatus::Acknowledged
    );

    // Metrics reflect the whole run.
    let metrics = controller.refresh_metrics(campaign.id).unwrap();
    assert_eq!(metrics.total_recipients, 2);
    assert_eq!(metrics.sent, 2);
    assert_eq!(metrics.responded, 1);
    assert!((metrics.response_rate - 0.5).abs() < 1e-9);

    // Window closes: the next orchestration pass completes the campaign.
    let changed = controller.tick(now + Duration::hours(49));
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].status, CampaignStatus::Completed);
}
