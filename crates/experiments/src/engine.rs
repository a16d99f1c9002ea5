//! Experiment registry and variant assignment for A/B testing.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tabletalk_core::error::{RejectReason, TableTalkError, TableTalkResult};
use tabletalk_core::types::{
    AssignmentStrategy, Experiment, ExperimentStatus, ExperimentVariant, VariantAssignment,
};
use tracing::{error, info};
use uuid::Uuid;

/// Experimentation engine for A/B/n testing over message template variants.
///
/// Assignment is idempotent and linearizable per (experiment, customer):
/// the first writer wins and every later caller observes the winner's
/// variant, so a customer's arm never changes mid-experiment.
pub struct ExperimentEngine {
    experiments: DashMap<Uuid, Experiment>,
    assignments: DashMap<(Uuid, String), VariantAssignment>,
}

impl ExperimentEngine {
    pub fn new() -> Self {
        Self {
            experiments: DashMap::new(),
            assignments: DashMap::new(),
        }
    }

    /// Registers an experiment in `Draft`, normalizing variant weights to
    /// sum 1.0. Variants with no usable weights fall back to equal shares.
    pub fn register(&self, mut experiment: Experiment) -> TableTalkResult<Uuid> {
        if experiment.variants.is_empty() {
            return Err(TableTalkError::BusinessRule(RejectReason::NoVariants));
        }
        let total: f64 = experiment.variants.iter().map(|v| v.weight).sum();
        if total <= 0.0 {
            let equal = 1.0 / experiment.variants.len() as f64;
            for variant in &mut experiment.variants {
                variant.weight = equal;
            }
        } else if (total - 1.0).abs() > 1e-3 {
            for variant in &mut experiment.variants {
                variant.weight /= total;
            }
        }
        experiment.status = ExperimentStatus::Draft;
        let id = experiment.id;
        info!(experiment_id = %id, name = %experiment.name, "Experiment registered");
        self.experiments.insert(id, experiment);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<Experiment> {
        self.experiments.get(&id).map(|e| e.value().clone())
    }

    pub fn start(&self, id: Uuid, now: DateTime<Utc>) -> TableTalkResult<()> {
        self.transition(id, ExperimentStatus::Draft, ExperimentStatus::Running, |e| {
            e.started_at = Some(now)
        })
    }

    pub fn pause(&self, id: Uuid) -> TableTalkResult<()> {
        self.transition(id, ExperimentStatus::Running, ExperimentStatus::Paused, |_| {})
    }

    pub fn resume(&self, id: Uuid) -> TableTalkResult<()> {
        self.transition(id, ExperimentStatus::Paused, ExperimentStatus::Running, |_| {})
    }

    pub fn complete(&self, id: Uuid, now: DateTime<Utc>) -> TableTalkResult<()> {
        self.transition(
            id,
            ExperimentStatus::Running,
            ExperimentStatus::Completed,
            |e| e.ended_at = Some(now),
        )
    }

    pub fn archive(&self, id: Uuid) -> TableTalkResult<()> {
        self.transition(
            id,
            ExperimentStatus::Completed,
            ExperimentStatus::Archived,
            |_| {},
        )
    }

    fn transition<F>(
        &self,
        id: Uuid,
        from: ExperimentStatus,
        to: ExperimentStatus,
        apply: F,
    ) -> TableTalkResult<()>
    where
        F: FnOnce(&mut Experiment),
    {
        let mut entry = self
            .experiments
            .get_mut(&id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "experiment",
                id: id.to_string(),
            })?;
        if entry.status != from {
            return Err(TableTalkError::InvalidTransition {
                entity: "experiment",
                from: format!("{:?}", entry.status),
                to: format!("{to:?}"),
            });
        }
        entry.status = to;
        apply(entry.value_mut());
        Ok(())
    }

    /// Returns the customer's variant for the experiment, assigning one on
    /// first call. Re-invocation never changes an existing assignment.
    pub fn assign_or_get(
        &self,
        experiment_id: Uuid,
        customer_key: &str,
        now: DateTime<Utc>,
    ) -> TableTalkResult<VariantAssignment> {
        let experiment = self
            .experiments
            .get(&experiment_id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "experiment",
                id: experiment_id.to_string(),
            })?;

        let key = (experiment_id, customer_key.to_string());
        if let Some(existing) = self.assignments.get(&key) {
            let existing = existing.value().clone();
            self.check_consistency(&experiment, &existing)?;
            return Ok(existing);
        }

        if experiment.status != ExperimentStatus::Running {
            return Err(TableTalkError::BusinessRule(
                RejectReason::ExperimentNotRunning,
            ));
        }

        let variant_id = pick_variant(&experiment, customer_key).to_string();
        drop(experiment);

        // Entry locking makes concurrent first assignments race to exactly
        // one winner; losers return the winner's variant.
        let (assignment, inserted) = match self.assignments.entry(key) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let assignment = VariantAssignment {
                    experiment_id,
                    customer_key: customer_key.to_string(),
                    variant_id,
                    assigned_at: now,
                };
                vacant.insert(assignment.clone());
                (assignment, true)
            }
        };

        if inserted {
            if let Some(mut experiment) = self.experiments.get_mut(&experiment_id) {
                if let Some(variant) = experiment
                    .variants
                    .iter_mut()
                    .find(|v| v.id == assignment.variant_id)
                {
                    variant.metrics.participants += 1;
                }
            }
        }

        let experiment = self.experiments.get(&experiment_id).ok_or_else(|| {
            TableTalkError::NotFound {
                entity: "experiment",
                id: experiment_id.to_string(),
            }
        })?;
        self.check_consistency(&experiment, &assignment)?;
        Ok(assignment)
    }

    pub fn assignment(&self, experiment_id: Uuid, customer_key: &str) -> Option<VariantAssignment> {
        self.assignments
            .get(&(experiment_id, customer_key.to_string()))
            .map(|a| a.value().clone())
    }

    /// Records a customer's outcome against their assigned variant.
    pub fn record_response(
        &self,
        experiment_id: Uuid,
        customer_key: &str,
        responded: bool,
        rating: Option<u8>,
    ) -> TableTalkResult<()> {
        let assignment = self.assignment(experiment_id, customer_key).ok_or_else(|| {
            TableTalkError::NotFound {
                entity: "variant assignment",
                id: format!("{experiment_id}:{customer_key}"),
            }
        })?;
        let mut experiment = self
            .experiments
            .get_mut(&experiment_id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "experiment",
                id: experiment_id.to_string(),
            })?;
        let Some(variant) = experiment
            .variants
            .iter_mut()
            .find(|v| v.id == assignment.variant_id)
        else {
            return Err(self.integrity_error(&assignment));
        };
        if responded {
            variant.metrics.responses += 1;
        }
        if let Some(rating) = rating {
            let responses = variant.metrics.responses.max(1) as f64;
            variant.metrics.average_rating = (variant.metrics.average_rating * (responses - 1.0)
                + f64::from(rating))
                / responses;
        }
        if variant.metrics.participants > 0 {
            variant.metrics.response_rate =
                variant.metrics.responses as f64 / variant.metrics.participants as f64;
        }
        Ok(())
    }

    /// Reports whether the experiment has enough participants to call, and
    /// which variant currently leads on response rate.
    pub fn significance(&self, id: Uuid) -> TableTalkResult<SignificanceResult> {
        let experiment = self
            .experiments
            .get(&id)
            .ok_or_else(|| TableTalkError::NotFound {
                entity: "experiment",
                id: id.to_string(),
            })?;
        let total_participants: u64 = experiment
            .variants
            .iter()
            .map(|v| v.metrics.participants)
            .sum();
        let leading_variant_id = experiment
            .variants
            .iter()
            .max_by(|a, b| {
                a.metrics
                    .response_rate
                    .partial_cmp(&b.metrics.response_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|v| v.id.clone());
        Ok(SignificanceResult {
            experiment_id: id,
            is_significant: total_participants >= experiment.min_sample_size,
            leading_variant_id,
            total_participants,
            required_samples: experiment.min_sample_size,
        })
    }

    fn check_consistency(
        &self,
        experiment: &Experiment,
        assignment: &VariantAssignment,
    ) -> TableTalkResult<()> {
        if experiment
            .variants
            .iter()
            .any(|v| v.id == assignment.variant_id)
        {
            Ok(())
        } else {
            Err(self.integrity_error(assignment))
        }
    }

    fn integrity_error(&self, assignment: &VariantAssignment) -> TableTalkError {
        error!(
            experiment_id = %assignment.experiment_id,
            customer_key = %assignment.customer_key,
            variant_id = %assignment.variant_id,
            "Variant assignment references a variant unknown to its experiment"
        );
        TableTalkError::InvariantViolation(format!(
            "assignment for {}:{} references unknown variant {}",
            assignment.experiment_id, assignment.customer_key, assignment.variant_id
        ))
    }
}

impl Default for ExperimentEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceResult {
    pub experiment_id: Uuid,
    pub is_significant: bool,
    pub leading_variant_id: Option<String>,
    pub total_participants: u64,
    pub required_samples: u64,
}

/// Walks variants in declaration order, accumulating weights, and selects
/// the first whose cumulative weight exceeds the draw. Hash-based and
/// weighted strategies share the deterministic hash; random draws fresh at
/// assignment time but persists identically.
fn pick_variant<'a>(experiment: &'a Experiment, customer_key: &str) -> &'a str {
    let unit = match experiment.strategy {
        AssignmentStrategy::HashBased | AssignmentStrategy::Weighted => {
            stable_unit_hash(experiment.id, customer_key)
        }
        AssignmentStrategy::Random => rand::random::<f64>(),
    };
    let mut cumulative = 0.0;
    for variant in &experiment.variants {
        cumulative += variant.weight;
        if unit < cumulative {
            return &variant.id;
        }
    }
    // Rounding shortfall: the last variant absorbs the tail.
    &experiment
        .variants
        .last()
        .expect("experiments are registered with at least one variant")
        .id
}

/// Stable hash of (experiment, customer) mapped to [0, 1).
fn stable_unit_hash(experiment_id: Uuid, customer_key: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(experiment_id.as_bytes());
    hasher.update(b":");
    hasher.update(customer_key.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) as f64 / 18_446_744_073_709_551_616.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tabletalk_core::types::VariantMetrics;

    fn make_experiment(strategy: AssignmentStrategy, weights: &[f64]) -> Experiment {
        Experiment {
            id: Uuid::new_v4(),
            campaign_id: None,
            name: "greeting-tone".to_string(),
            description: "Formal vs casual greeting".to_string(),
            variants: weights
                .iter()
                .enumerate()
                .map(|(i, w)| ExperimentVariant {
                    id: format!("variant_{i}"),
                    name: format!("Variant {}", i + 1),
                    weight: *w,
                    template: format!("greeting_v{i}"),
                    metrics: VariantMetrics::default(),
                })
                .collect(),
            status: ExperimentStatus::Draft,
            strategy,
            min_sample_size: 100,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    fn running_engine(strategy: AssignmentStrategy, weights: &[f64]) -> (ExperimentEngine, Uuid) {
        let engine = ExperimentEngine::new();
        let id = engine.register(make_experiment(strategy, weights)).unwrap();
        engine.start(id, Utc::now()).unwrap();
        (engine, id)
    }

    #[test]
    fn test_assignment_is_idempotent() {
        let (engine, id) = running_engine(AssignmentStrategy::HashBased, &[0.5, 0.5]);
        let first = engine.assign_or_get(id, "+966501234567", Utc::now()).unwrap();
        for _ in 0..10 {
            let again = engine.assign_or_get(id, "+966501234567", Utc::now()).unwrap();
            assert_eq!(again.variant_id, first.variant_id);
        }
    }

    #[test]
    fn test_random_strategy_still_persists_first_draw() {
        let (engine, id) = running_engine(AssignmentStrategy::Random, &[0.5, 0.5]);
        let first = engine.assign_or_get(id, "+966500000001", Utc::now()).unwrap();
        for _ in 0..20 {
            let again = engine.assign_or_get(id, "+966500000001", Utc::now()).unwrap();
            assert_eq!(again.variant_id, first.variant_id);
        }
    }

    #[test]
    fn test_concurrent_first_assignment_single_winner() {
        let (engine, id) = running_engine(AssignmentStrategy::Random, &[0.5, 0.5]);
        let engine = Arc::new(engine);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    engine
                        .assign_or_get(id, "+966509999999", Utc::now())
                        .unwrap()
                        .variant_id
                })
            })
            .collect();
        let variants: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(variants.windows(2).all(|w| w[0] == w[1]));
        // Exactly one persisted assignment, one participant counted.
        let experiment = engine.get(id).unwrap();
        let participants: u64 = experiment
            .variants
            .iter()
            .map(|v| v.metrics.participants)
            .sum();
        assert_eq!(participants, 1);
    }

    #[test]
    fn test_weighted_distribution_converges() {
        let (engine, id) = running_engine(AssignmentStrategy::Weighted, &[0.7, 0.3]);
        let mut first = 0u32;
        let total = 2000u32;
        for i in 0..total {
            let assignment = engine
                .assign_or_get(id, &format!("+96650{i:07}"), Utc::now())
                .unwrap();
            if assignment.variant_id == "variant_0" {
                first += 1;
            }
        }
        let share = f64::from(first) / f64::from(total);
        assert!((0.65..=0.75).contains(&share), "share was {share}");
    }

    #[test]
    fn test_weights_normalized_at_registration() {
        let engine = ExperimentEngine::new();
        let id = engine
            .register(make_experiment(AssignmentStrategy::HashBased, &[2.0, 2.0]))
            .unwrap();
        let experiment = engine.get(id).unwrap();
        assert!((experiment.variants[0].weight - 0.5).abs() < 1e-9);
        assert!((experiment.variants[1].weight - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_assignment_rejected_unless_running() {
        let engine = ExperimentEngine::new();
        let id = engine
            .register(make_experiment(AssignmentStrategy::HashBased, &[1.0]))
            .unwrap();
        let err = engine
            .assign_or_get(id, "+966501111111", Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            TableTalkError::BusinessRule(RejectReason::ExperimentNotRunning)
        ));
    }

    #[test]
    fn test_existing_assignment_survives_pause() {
        let (engine, id) = running_engine(AssignmentStrategy::HashBased, &[0.5, 0.5]);
        let first = engine.assign_or_get(id, "+966502222222", Utc::now()).unwrap();
        engine.pause(id).unwrap();
        let again = engine.assign_or_get(id, "+966502222222", Utc::now()).unwrap();
        assert_eq!(again.variant_id, first.variant_id);

        // New customers wait out the pause.
        assert!(engine.assign_or_get(id, "+966504444444", Utc::now()).is_err());
        engine.resume(id).unwrap();
        assert!(engine.assign_or_get(id, "+966504444444", Utc::now()).is_ok());
    }

    #[test]
    fn test_significance_needs_min_sample_size() {
        let (engine, id) = running_engine(AssignmentStrategy::HashBased, &[0.5, 0.5]);
        for i in 0..99 {
            engine
                .assign_or_get(id, &format!("+96650{i:07}"), Utc::now())
                .unwrap();
        }
        assert!(!engine.significance(id).unwrap().is_significant);

        engine.assign_or_get(id, "+966599999999", Utc::now()).unwrap();
        let result = engine.significance(id).unwrap();
        assert!(result.is_significant);
        assert_eq!(result.total_participants, 100);
        assert!(result.leading_variant_id.is_some());
    }

    #[test]
    fn test_archive_only_after_completion() {
        let (engine, id) = running_engine(AssignmentStrategy::HashBased, &[1.0]);
        assert!(engine.archive(id).is_err());
        engine.complete(id, Utc::now()).unwrap();
        engine.archive(id).unwrap();
        assert_eq!(engine.get(id).unwrap().status, ExperimentStatus::Archived);
    }

    #[test]
    fn test_record_response_updates_variant_metrics() {
        let (engine, id) = running_engine(AssignmentStrategy::HashBased, &[1.0]);
        engine.assign_or_get(id, "+966503333333", Utc::now()).unwrap();
        engine
            .record_response(id, "+966503333333", true, Some(4))
            .unwrap();
        let experiment = engine.get(id).unwrap();
        let metrics = &experiment.variants[0].metrics;
        assert_eq!(metrics.participants, 1);
        assert_eq!(metrics.responses, 1);
        assert!((metrics.response_rate - 1.0).abs() < 1e-9);
        assert!((metrics.average_rating - 4.0).abs() < 1e-9);
    }
}
