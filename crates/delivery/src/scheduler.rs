//! Delivery scheduling — computes blackout-aware send times for campaign
//! recipients and persists the tracked messages.

use crate::blackout::BlackoutWindowProvider;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tabletalk_core::config::SchedulerConfig;
use tabletalk_core::error::{RejectReason, TableTalkError, TableTalkResult};
use tabletalk_core::store::CampaignStore;
use tabletalk_core::types::{Campaign, CampaignMessage, CampaignStatus, MessageStatus, Recipient};
use tabletalk_experiments::ExperimentEngine;
use tracing::{debug, info};
use uuid::Uuid;

pub struct DeliveryScheduler {
    store: Arc<CampaignStore>,
    blackout: Arc<BlackoutWindowProvider>,
    experiments: Arc<ExperimentEngine>,
    config: SchedulerConfig,
}

impl DeliveryScheduler {
    pub fn new(
        store: Arc<CampaignStore>,
        blackout: Arc<BlackoutWindowProvider>,
        experiments: Arc<ExperimentEngine>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            blackout,
            experiments,
            config,
        }
    }

    /// Computes the send time for one recipient and persists one tracked
    /// message per campaign template step. Messages whose resolved time
    /// falls past the campaign end are created directly in `cancelled` and
    /// never enqueued.
    pub fn schedule_recipient(
        &self,
        campaign_id: Uuid,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> TableTalkResult<Vec<CampaignMessage>> {
        let campaign = self
            .store
            .get_campaign(campaign_id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "campaign",
                id: campaign_id.to_string(),
            })?;
        if campaign.status == CampaignStatus::Cancelled {
            return Err(TableTalkError::BusinessRule(RejectReason::CampaignCancelled));
        }
        if !matches!(
            campaign.status,
            CampaignStatus::Scheduled | CampaignStatus::Active
        ) {
            return Err(TableTalkError::BusinessRule(
                RejectReason::CampaignNotSchedulable,
            ));
        }
        let recipient = self
            .store
            .get_recipient(recipient_id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "recipient",
                id: recipient_id.to_string(),
            })?;

        let resolved = self.resolve_send_time(&campaign, &recipient, now);
        let past_end = campaign
            .scheduled_end
            .map_or(false, |end| resolved > end);

        let variant = self.resolve_variant(&campaign, &recipient, now)?;

        let mut messages = Vec::with_capacity(campaign.template_steps.len());
        for (step, template) in campaign.template_steps.iter().enumerate() {
            let template = match (&variant, step) {
                (Some((_, variant_template)), 0) => variant_template.clone(),
                _ => template.clone(),
            };
            let message = CampaignMessage {
                id: Uuid::new_v4(),
                campaign_id,
                recipient_id,
                template,
                step: step as u32,
                variant_id: variant.as_ref().map(|(id, _)| id.clone()),
                external_id: None,
                attempts: 0,
                scheduled_send_time: resolved,
                sent_at: None,
                delivered_at: None,
                read_at: None,
                responded_at: None,
                status: if past_end {
                    MessageStatus::Cancelled
                } else {
                    MessageStatus::Scheduled
                },
                last_error: None,
                created_at: now,
            };
            self.store.insert_message(message.clone());
            messages.push(message);
        }

        self.store
            .update_recipient(recipient_id, |r| r.scheduled_send_time = Some(resolved))?;

        if past_end {
            info!(
                campaign_id = %campaign_id,
                recipient_id = %recipient_id,
                "Resolved send time past campaign end; messages cancelled"
            );
        } else {
            debug!(
                campaign_id = %campaign_id,
                recipient_id = %recipient_id,
                send_time = %resolved,
                "Recipient scheduled"
            );
        }
        Ok(messages)
    }

    /// Schedules every pending recipient of a campaign.
    pub fn schedule_campaign(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> TableTalkResult<Vec<CampaignMessage>> {
        let mut all = Vec::new();
        for recipient in self.store.recipients_for_campaign(campaign_id) {
            if recipient.scheduled_send_time.is_none() {
                all.extend(self.schedule_recipient(campaign_id, recipient.id, now)?);
            }
        }
        Ok(all)
    }

    /// Naive target (visit + offset, clamped into the min/max delay
    /// window), shifted past any blackout window, then clamped to `now`
    /// when the scheduler ran late. The late clamp re-checks blackout so a
    /// delayed sweep can never land inside a window.
    fn resolve_send_time(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let visit = recipient.visit_timestamp;
        let naive = visit + Duration::hours(self.config.send_offset_hours);
        let min = visit + Duration::hours(self.config.min_delay_hours);
        let max = visit + Duration::hours(self.config.max_delay_hours);
        let clamped = naive.clamp(min, max);

        let mut resolved = self
            .blackout
            .check(&campaign.locality, clamped)
            .next_permissible;
        if resolved < now {
            resolved = self.blackout.check(&campaign.locality, now).next_permissible;
        }
        resolved
    }

    /// Picks the recipient's experiment arm when the campaign carries one.
    /// A non-running experiment schedules without a variant rather than
    /// failing the recipient.
    fn resolve_variant(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        now: DateTime<Utc>,
    ) -> TableTalkResult<Option<(String, String)>> {
        let Some(experiment_id) = campaign.experiment_id else {
            return Ok(None);
        };
        match self
            .experiments
            .assign_or_get(experiment_id, &recipient.phone_number, now)
        {
            Ok(assignment) => {
                let template = self
                    .experiments
                    .get(experiment_id)
                    .and_then(|e| {
                        e.variants
                            .iter()
                            .find(|v| v.id == assignment.variant_id)
                            .map(|v| v.template.clone())
                    })
                    .ok_or_else(|| {
                        TableTalkError::InvariantViolation(format!(
                            "variant {} missing from experiment {experiment_id}",
                            assignment.variant_id
                        ))
                    })?;
                Ok(Some((assignment.variant_id, template)))
            }
            Err(TableTalkError::BusinessRule(reason)) => {
                debug!(
                    experiment_id = %experiment_id,
                    %reason,
                    "Experiment not assignable; scheduling without variant"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Periodic sweep: cancels open messages of campaigns whose end time
    /// has passed. Runs independently of dispatch.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut cancelled = 0;
        for campaign in self.store.list_campaigns() {
            if matches!(
                campaign.status,
                CampaignStatus::Scheduled | CampaignStatus::Active
            ) && campaign.scheduled_end.map_or(false, |end| end < now)
            {
                cancelled += self.store.cancel_open_messages(campaign.id);
            }
        }
        if cancelled > 0 {
            info!(cancelled, "Scheduler sweep cancelled overdue messages");
        }
        cancelled
    }

    /// Drives the periodic sweep. Independent of dispatch: a slow
    /// transport never delays campaign-end cancellation.
    pub async fn run_sweeper(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            self.config.sweep_interval_secs,
        ));
        info!("Scheduler sweep started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sweep(Utc::now());
                }
                _ = shutdown.changed() => {
                    info!("Scheduler sweep stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tabletalk_core::boundary::{BlackoutInterval, WindowSource};
    use tabletalk_core::config::BlackoutConfig;
    use tabletalk_core::types::{
        AssignmentStrategy, CampaignMetrics, Experiment, ExperimentVariant, RecipientStatus,
        VariantMetrics,
    };

    struct EmptySource;

    impl WindowSource for EmptySource {
        fn day_table(
            &self,
            _locality: &str,
            _date: chrono::NaiveDate,
        ) -> anyhow::Result<Vec<BlackoutInterval>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        store: Arc<CampaignStore>,
        blackout: Arc<BlackoutWindowProvider>,
        experiments: Arc<ExperimentEngine>,
        scheduler: DeliveryScheduler,
    }

    fn fixture(offset_hours: i64) -> Fixture {
        let store = Arc::new(CampaignStore::new());
        // Tests seed windows through the seasonal set; fail open so days
        // without a refreshed table pass through.
        let blackout = Arc::new(BlackoutWindowProvider::new(
            Arc::new(EmptySource),
            BlackoutConfig {
                fail_open: true,
                ..BlackoutConfig::default()
            },
        ));
        let experiments = Arc::new(ExperimentEngine::new());
        let scheduler = DeliveryScheduler::new(
            store.clone(),
            blackout.clone(),
            experiments.clone(),
            SchedulerConfig {
                send_offset_hours: offset_hours,
                min_delay_hours: offset_hours.min(2),
                max_delay_hours: 4,
                sweep_interval_secs: 300,
            },
        );
        Fixture {
            store,
            blackout,
            experiments,
            scheduler,
        }
    }

    fn seed_campaign(fixture: &Fixture, end: Option<DateTime<Utc>>) -> Campaign {
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            restaurant_id: Uuid::new_v4(),
            name: "Post-visit feedback".to_string(),
            locality: "riyadh".to_string(),
            status: CampaignStatus::Active,
            scheduled_start: Some(now - Duration::hours(1)),
            scheduled_end: end,
            template_steps: vec!["feedback_request".to_string()],
            experiment_id: None,
            settings: json!({}),
            metrics: CampaignMetrics::default(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        fixture.store.insert_campaign(campaign.clone());
        campaign
    }

    fn seed_recipient(fixture: &Fixture, campaign_id: Uuid, visit: DateTime<Utc>) -> Recipient {
        let recipient = Recipient {
            id: Uuid::new_v4(),
            campaign_id,
            phone_number: "+966501234567".to_string(),
            visit_timestamp: visit,
            scheduled_send_time: None,
            status: RecipientStatus::Pending,
            conversation_id: None,
            metadata: json!({}),
            created_at: visit,
        };
        fixture.store.insert_recipient_unique(recipient.clone());
        recipient
    }

    #[test]
    fn test_plain_schedule_lands_at_visit_plus_offset() {
        let fixture = fixture(3);
        let campaign = seed_campaign(&fixture, None);
        let visit = Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap();
        let recipient = seed_recipient(&fixture, campaign.id, visit);

        let messages = fixture
            .scheduler
            .schedule_recipient(campaign.id, recipient.id, visit)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Scheduled);
        assert_eq!(
            messages[0].scheduled_send_time,
            visit + Duration::hours(3)
        );
    }

    #[test]
    fn test_blackout_shift_lands_exactly_at_window_end_plus_buffer() {
        let fixture = fixture(2);
        let campaign = seed_campaign(&fixture, None);
        let visit = Utc.with_ymd_and_hms(2024, 6, 10, 10, 0, 0).unwrap();
        let naive_target = visit + Duration::hours(2);
        // Window opens 5 minutes before the naive target and runs 30
        // minutes past it.
        fixture.blackout.set_seasonal(
            "riyadh",
            vec![BlackoutInterval {
                start: naive_target - Duration::minutes(5),
                end: naive_target + Duration::minutes(30),
                label: "midday".to_string(),
            }],
        );
        let recipient = seed_recipient(&fixture, campaign.id, visit);

        let messages = fixture
            .scheduler
            .schedule_recipient(campaign.id, recipient.id, visit)
            .unwrap();
        assert_eq!(
            messages[0].scheduled_send_time,
            naive_target + Duration::minutes(30) + Duration::minutes(10)
        );
    }

    #[test]
    fn test_late_scheduler_clamps_to_now() {
        let fixture = fixture(3);
        let campaign = seed_campaign(&fixture, None);
        let visit = Utc.with_ymd_and_hms(2024, 6, 10, 1, 0, 0).unwrap();
        let recipient = seed_recipient(&fixture, campaign.id, visit);

        let late_now = visit + Duration::hours(8);
        let messages = fixture
            .scheduler
            .schedule_recipient(campaign.id, recipient.id, late_now)
            .unwrap();
        assert_eq!(messages[0].scheduled_send_time, late_now);
        assert_eq!(messages[0].status, MessageStatus::Scheduled);
    }

    #[test]
    fn test_send_time_past_campaign_end_cancels_message() {
        let fixture = fixture(3);
        let visit = Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap();
        let campaign = seed_campaign(&fixture, Some(visit + Duration::hours(1)));
        let recipient = seed_recipient(&fixture, campaign.id, visit);

        let messages = fixture
            .scheduler
            .schedule_recipient(campaign.id, recipient.id, visit)
            .unwrap();
        assert_eq!(messages[0].status, MessageStatus::Cancelled);
        assert!(fixture.store.claim_due_messages(visit + Duration::hours(5), 10).is_empty());
    }

    #[test]
    fn test_draft_campaign_is_rejected() {
        let fixture = fixture(3);
        let mut campaign = seed_campaign(&fixture, None);
        campaign.status = CampaignStatus::Draft;
        fixture.store.insert_campaign(campaign.clone());
        let recipient = seed_recipient(&fixture, campaign.id, Utc::now());

        let err = fixture
            .scheduler
            .schedule_recipient(campaign.id, recipient.id, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            TableTalkError::BusinessRule(RejectReason::CampaignNotSchedulable)
        ));
    }

    #[test]
    fn test_cancelled_campaign_gets_specific_reason() {
        let fixture = fixture(3);
        let mut campaign = seed_campaign(&fixture, None);
        campaign.status = CampaignStatus::Cancelled;
        fixture.store.insert_campaign(campaign.clone());
        let recipient = seed_recipient(&fixture, campaign.id, Utc::now());

        let err = fixture
            .scheduler
            .schedule_recipient(campaign.id, recipient.id, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            TableTalkError::BusinessRule(RejectReason::CampaignCancelled)
        ));
    }

    #[test]
    fn test_attached_experiment_binds_variant_template() {
        let fixture = fixture(3);
        let mut campaign = seed_campaign(&fixture, None);
        let experiment = Experiment {
            id: Uuid::new_v4(),
            campaign_id: Some(campaign.id),
            name: "tone".to_string(),
            description: String::new(),
            variants: vec![ExperimentVariant {
                id: "formal".to_string(),
                name: "Formal".to_string(),
                weight: 1.0,
                template: "feedback_formal".to_string(),
                metrics: VariantMetrics::default(),
            }],
            status: tabletalk_core::types::ExperimentStatus::Draft,
            strategy: AssignmentStrategy::HashBased,
            min_sample_size: 10,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        let experiment_id = fixture.experiments.register(experiment).unwrap();
        fixture.experiments.start(experiment_id, Utc::now()).unwrap();
        campaign.experiment_id = Some(experiment_id);
        fixture.store.insert_campaign(campaign.clone());
        let recipient = seed_recipient(&fixture, campaign.id, Utc::now());

        let messages = fixture
            .scheduler
            .schedule_recipient(campaign.id, recipient.id, Utc::now())
            .unwrap();
        assert_eq!(messages[0].variant_id.as_deref(), Some("formal"));
        assert_eq!(messages[0].template, "feedback_formal");
    }

    #[test]
    fn test_sweep_cancels_messages_of_ended_campaigns() {
        let fixture = fixture(3);
        let visit = Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap();
        let campaign = seed_campaign(&fixture, Some(visit + Duration::hours(6)));
        let recipient = seed_recipient(&fixture, campaign.id, visit);
        fixture
            .scheduler
            .schedule_recipient(campaign.id, recipient.id, visit)
            .unwrap();

        assert_eq!(fixture.scheduler.sweep(visit + Duration::hours(5)), 0);
        assert_eq!(fixture.scheduler.sweep(visit + Duration::hours(7)), 1);
    }
}
