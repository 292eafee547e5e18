use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::{
    accumulation_rate_for, describe_motivation, intensity_for_priority, motivation_id, Motivation,
    MotivationStatus, DEFAULT_MOTIVATION_THRESHOLD,
};
use crate::events::{DomainEvent, EventBus};
use crate::needs::{clamp_value, Need, NeedType, NeedsEngine};
use crate::store::MotivationStore;

pub const MOTIVATION_MAX_VALUE: f64 = 100.0;
pub const DEFAULT_SUCCESS_PROBABILITY: f64 = 50.0;
pub const DEFAULT_RESOURCE_COST: f64 = 10.0;

/// Engine-wide creation parameters.
#[derive(Debug, Clone)]
pub struct MotivationSettings {
    pub threshold: f64,
    pub accumulation_rates: HashMap<NeedType, f64>,
    pub success_probability: f64,
    pub resource_cost: f64,
    /// Lifetime given to new motivations; `None` means they never expire.
    pub ttl: Option<ChronoDuration>,
}

impl Default for MotivationSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MOTIVATION_THRESHOLD,
            accumulation_rates: HashMap::new(),
            success_probability: DEFAULT_SUCCESS_PROBABILITY,
            resource_cost: DEFAULT_RESOURCE_COST,
            ttl: None,
        }
    }
}

/// Per-call overrides for [`MotivationEngine::create_motivation`].
#[derive(Debug, Clone, Default)]
pub struct MotivationOverrides {
    pub accumulation_rate: Option<f64>,
    pub success_probability: Option<f64>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The motivation is missing or no longer active. Nothing was attempted.
    Blocked { reason: String },
    Success {
        character_id: i64,
        motivation_id: String,
        related_need: NeedType,
        reward_value: f64,
    },
    Failure { motivation_id: String, roll: f64 },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }
}

/// Uniform draw in `[0, 100)` compared against a 0-100 probability.
pub fn roll_success<R: Rng + ?Sized>(rng: &mut R, probability: f64) -> (bool, f64) {
    let roll = rng.gen_range(0.0..100.0);
    (roll < probability, roll)
}

pub struct MotivationEngine {
    store: Arc<dyn MotivationStore>,
    needs: Arc<NeedsEngine>,
    bus: Arc<EventBus>,
    settings: MotivationSettings,
    rng: Mutex<StdRng>,
}

impl MotivationEngine {
    pub fn new(
        store: Arc<dyn MotivationStore>,
        needs: Arc<NeedsEngine>,
        bus: Arc<EventBus>,
        settings: MotivationSettings,
    ) -> Self {
        Self {
            store,
            needs,
            bus,
            settings,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replace the entropy-seeded generator with a deterministic one.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn settings(&self) -> &MotivationSettings {
        &self.settings
    }

    /// Spawn one motivation per unfulfilled need that has no active one yet.
    pub async fn generate_motivations_from_needs(&self, character_id: i64) -> Result<Vec<Motivation>> {
        let needs = self.needs.get_unfulfilled_needs(character_id).await?;
        let mut created = Vec::new();

        for need in needs {
            if self
                .store
                .find_active_motivation(character_id, need.need_type)
                .await?
                .is_some()
            {
                continue;
            }
            if let Some(motivation) = self
                .create_motivation(character_id, &need, MotivationOverrides::default())
                .await?
            {
                created.push(motivation);
            }
        }

        if !created.is_empty() {
            tracing::info!(
                "Generated {} motivation(s) for character {}",
                created.len(),
                character_id
            );
        }
        Ok(created)
    }

    /// Create a motivation for `need` unless one is already active for the
    /// same character and need type, in which case `None` is returned.
    pub async fn create_motivation(
        &self,
        character_id: i64,
        need: &Need,
        overrides: MotivationOverrides,
    ) -> Result<Option<Motivation>> {
        let now = Utc::now();
        let motivation = Motivation {
            motivation_id: motivation_id(need.need_type, character_id, now),
            character_id,
            related_need: need.need_type,
            description: describe_motivation(need.need_type, need.current_value),
            current_value: 0.0,
            threshold_value: self.settings.threshold,
            accumulation_rate: overrides.accumulation_rate.unwrap_or_else(|| {
                accumulation_rate_for(need.need_type, &self.settings.accumulation_rates)
            }),
            status: MotivationStatus::Active,
            priority: need.priority,
            intensity: intensity_for_priority(need.priority),
            success_probability: overrides
                .success_probability
                .unwrap_or(self.settings.success_probability)
                .clamp(0.0, 100.0),
            resource_cost: self.settings.resource_cost,
            created_at: now,
            last_updated: now,
            expires_at: overrides
                .expires_at
                .or_else(|| self.settings.ttl.and_then(|ttl| now.checked_add_signed(ttl))),
        };

        if !self.store.insert_motivation_if_absent(&motivation).await? {
            tracing::debug!(
                "Active {} motivation already exists for character {}",
                need.need_type,
                character_id
            );
            return Ok(None);
        }

        self.bus.publish(DomainEvent::MotivationCreated {
            character_id,
            motivation_id: motivation.motivation_id.clone(),
            related_need: motivation.related_need,
            intensity: motivation.intensity,
            description: motivation.description.clone(),
        });
        Ok(Some(motivation))
    }

    /// Add `delta` to an active motivation. Returns `None` without writing
    /// when the motivation is missing or already terminal.
    pub async fn update_motivation_value(
        &self,
        motivation_id: &str,
        delta: f64,
    ) -> Result<Option<Motivation>> {
        let Some(motivation) = self.load_active(motivation_id).await? else {
            return Ok(None);
        };
        let updated = self.apply_delta(motivation, delta, Utc::now()).await?;
        Ok(Some(updated))
    }

    pub async fn execute_motivation_action(&self, motivation_id: &str) -> Result<ExecutionOutcome> {
        let Some(mut motivation) = self.load_active(motivation_id).await? else {
            return Ok(ExecutionOutcome::Blocked {
                reason: format!("motivation {} is missing or inactive", motivation_id),
            });
        };

        let (success, roll) = {
            let mut rng = self
                .rng
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            roll_success(&mut *rng, motivation.success_probability)
        };

        let outcome = if success {
            motivation.status = MotivationStatus::Fulfilled;
            motivation.last_updated = Utc::now();
            self.store.save_motivation(&motivation).await?;
            self.bus.publish(DomainEvent::MotivationStatusChanged {
                character_id: motivation.character_id,
                motivation_id: motivation.motivation_id.clone(),
                from: MotivationStatus::Active,
                to: MotivationStatus::Fulfilled,
            });
            ExecutionOutcome::Success {
                character_id: motivation.character_id,
                motivation_id: motivation.motivation_id.clone(),
                related_need: motivation.related_need,
                reward_value: motivation.current_value,
            }
        } else {
            ExecutionOutcome::Failure {
                motivation_id: motivation.motivation_id.clone(),
                roll,
            }
        };

        tracing::debug!(
            "Executed motivation {} (p={:.0}, roll={:.1}): {}",
            motivation.motivation_id,
            motivation.success_probability,
            roll,
            if success { "success" } else { "failure" }
        );
        self.bus.publish(DomainEvent::MotivationExecuted {
            character_id: motivation.character_id,
            motivation_id: motivation.motivation_id.clone(),
            related_need: motivation.related_need,
            success,
        });
        Ok(outcome)
    }

    pub async fn update_motivations_background(&self) -> Result<usize> {
        self.update_motivations_background_at(Utc::now()).await
    }

    /// Accumulate every active motivation by whole minutes elapsed before
    /// `now`. Failures on one motivation are logged and skipped.
    pub async fn update_motivations_background_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let motivations = self.store.list_active_motivations().await?;
        let mut updated = 0;

        for motivation in motivations {
            if motivation.is_expired_at(now) {
                continue;
            }
            let minutes = (now - motivation.last_updated).num_minutes();
            if minutes <= 0 {
                continue;
            }
            let delta = minutes as f64 * motivation.accumulation_rate;
            let stamp = motivation.last_updated + ChronoDuration::minutes(minutes);
            let id = motivation.motivation_id.clone();
            match self.apply_delta(motivation, delta, stamp).await {
                Ok(_) => updated += 1,
                Err(e) => tracing::warn!("Failed to accumulate motivation {}: {:#}", id, e),
            }
        }

        if updated > 0 {
            tracing::debug!("Accumulated {} active motivation(s)", updated);
        }
        Ok(updated)
    }

    /// Expire active motivations whose deadline has passed.
    pub async fn cleanup_expired_motivations(&self) -> Result<usize> {
        let expired = self.store.expire_motivations(Utc::now()).await?;
        if expired > 0 {
            tracing::info!("Expired {} motivation(s)", expired);
        }
        Ok(expired)
    }

    pub async fn get_active_motivations(&self, character_id: i64) -> Result<Vec<Motivation>> {
        self.store.list_active_motivations_for(character_id).await
    }

    pub async fn get_motivation(&self, motivation_id: &str) -> Result<Option<Motivation>> {
        self.store.get_motivation(motivation_id).await
    }

    /// Active and not past its deadline. An expired row the daily sweep has
    /// not reached yet is treated as inactive.
    async fn load_active(&self, motivation_id: &str) -> Result<Option<Motivation>> {
        let now = Utc::now();
        Ok(self
            .store
            .get_motivation(motivation_id)
            .await?
            .filter(|motivation| motivation.is_active() && !motivation.is_expired_at(now)))
    }

    async fn apply_delta(
        &self,
        mut motivation: Motivation,
        delta: f64,
        stamp: DateTime<Utc>,
    ) -> Result<Motivation> {
        let old_value = motivation.current_value;
        let old_status = motivation.status;
        motivation.current_value = clamp_value(old_value + delta, MOTIVATION_MAX_VALUE);
        motivation.last_updated = stamp;

        let reached = motivation.current_value >= motivation.threshold_value;
        if reached {
            motivation.status = MotivationStatus::Fulfilled;
        }
        self.store.save_motivation(&motivation).await?;

        if reached {
            self.bus.publish(DomainEvent::MotivationThresholdReached {
                character_id: motivation.character_id,
                motivation_id: motivation.motivation_id.clone(),
                related_need: motivation.related_need,
                value: motivation.current_value,
                threshold: motivation.threshold_value,
                description: motivation.description.clone(),
            });
        }
        if motivation.status != old_status {
            self.bus.publish(DomainEvent::MotivationStatusChanged {
                character_id: motivation.character_id,
                motivation_id: motivation.motivation_id.clone(),
                from: old_status,
                to: motivation.status,
            });
        }
        self.bus.publish(DomainEvent::MotivationUpdated {
            character_id: motivation.character_id,
            motivation_id: motivation.motivation_id.clone(),
            old_value,
            new_value: motivation.current_value,
            status: motivation.status,
        });
        Ok(motivation)
    }
}
