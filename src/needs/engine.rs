use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{Need, NeedType, DEFAULT_NEEDS, MAX_FRUSTRATION_LEVEL};
use crate::error::CoreError;
use crate::events::{DomainEvent, EventBus};
use crate::store::NeedStore;

/// A signed change requested by a caller outside the periodic tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeedUpdate {
    pub need_type: NeedType,
    pub change: f64,
    pub reason: String,
}

pub struct NeedsEngine {
    store: Arc<dyn NeedStore>,
    bus: Arc<EventBus>,
    tick_length: ChronoDuration,
}

impl NeedsEngine {
    pub fn new(store: Arc<dyn NeedStore>, bus: Arc<EventBus>, tick_length: ChronoDuration) -> Self {
        Self {
            store,
            bus,
            tick_length,
        }
    }

    pub fn tick_length(&self) -> ChronoDuration {
        self.tick_length
    }

    pub async fn grow_needs(&self, character_id: i64) -> Result<Vec<Need>> {
        self.grow_needs_at(character_id, Utc::now()).await
    }

    /// Advance every growable need by the whole ticks elapsed before `now`.
    ///
    /// Blocked needs are skipped without any write. Time spent blocked never
    /// counts toward growth, and a partial tick is carried over by advancing
    /// `last_updated` only by the consumed ticks. Returns the needs that changed.
    pub async fn grow_needs_at(&self, character_id: i64, now: DateTime<Utc>) -> Result<Vec<Need>> {
        let needs = self.store.list_needs(character_id).await?;
        let mut grown = Vec::new();

        for mut need in needs {
            if !need.can_grow(now) {
                continue;
            }

            let since = match need.blocked_until {
                Some(until) if until > need.last_updated => until,
                _ => need.last_updated,
            };
            let ticks = elapsed_ticks(since, now, self.tick_length);
            if ticks == 0 {
                continue;
            }

            let old_value = need.current_value;
            need.apply_change(need.growth_rate * ticks as f64);
            if need.current_value >= need.max_value && old_value < need.max_value {
                need.frustration_level = (need.frustration_level + 1).min(MAX_FRUSTRATION_LEVEL);
            }
            need.last_updated = since + self.tick_length * ticks as i32;

            self.store.save_need(&need).await?;
            tracing::debug!(
                "Grew {} for character {}: {:.1} -> {:.1} ({} tick(s))",
                need.need_type,
                character_id,
                old_value,
                need.current_value,
                ticks
            );
            grown.push(need);
        }

        Ok(grown)
    }

    pub async fn update_need(&self, character_id: i64, update: NeedUpdate) -> Result<Need> {
        let need = self.require_need(character_id, update.need_type).await?;
        self.apply_change(need, update.change, &update.reason).await
    }

    /// Recover a need by `ticks` worth of its decay rate.
    pub async fn satisfy_need(
        &self,
        character_id: i64,
        need_type: NeedType,
        ticks: f64,
    ) -> Result<Need> {
        let need = self.require_need(character_id, need_type).await?;
        let change = -(need.decay_rate * ticks.max(0.0));
        self.apply_change(need, change, "satisfied").await
    }

    pub async fn reset_need(&self, character_id: i64, need_type: NeedType) -> Result<Need> {
        let mut need = self.require_need(character_id, need_type).await?;
        let old_value = need.current_value;
        need.current_value = 0.0;
        need.frustration_level = 0;
        need.last_updated = Utc::now();
        self.store.save_need(&need).await?;

        self.bus.publish(DomainEvent::NeedReset {
            character_id,
            need_type,
            old_value,
        });
        Ok(need)
    }

    pub async fn block_need(
        &self,
        character_id: i64,
        need_type: NeedType,
        hours: f64,
        reason: &str,
    ) -> Result<Need> {
        let blocked_until = block_deadline(Utc::now(), hours)?;
        let mut need = self.require_need(character_id, need_type).await?;
        need.blocked_until = Some(blocked_until);
        need.block_reason = Some(reason.to_string());
        self.store.save_need(&need).await?;

        tracing::info!(
            "Blocked {} for character {} until {} ({})",
            need_type,
            character_id,
            blocked_until,
            reason
        );
        self.bus.publish(DomainEvent::NeedBlocked {
            character_id,
            need_type,
            blocked_until,
            reason: reason.to_string(),
        });
        Ok(need)
    }

    pub async fn unblock_need(&self, character_id: i64, need_type: NeedType) -> Result<Need> {
        let mut need = self.require_need(character_id, need_type).await?;
        let now = Utc::now();
        if need.is_blocked(now) {
            // Growth resumes from the moment the block is lifted.
            need.last_updated = now;
        }
        need.blocked_until = None;
        need.block_reason = None;
        self.store.save_need(&need).await?;

        self.bus.publish(DomainEvent::NeedUnblocked {
            character_id,
            need_type,
        });
        Ok(need)
    }

    pub async fn get_needs(&self, character_id: i64) -> Result<Vec<Need>> {
        self.store.list_needs(character_id).await
    }

    /// Active, unblocked needs at or past their threshold.
    pub async fn get_unfulfilled_needs(&self, character_id: i64) -> Result<Vec<Need>> {
        let now = Utc::now();
        let mut needs = self.store.list_needs(character_id).await?;
        needs.retain(|need| need.is_past_threshold() && !need.is_blocked(now));
        Ok(needs)
    }

    /// Critical needs, most urgent first: priority desc, then value asc.
    pub async fn get_critical_needs(&self, character_id: i64) -> Result<Vec<Need>> {
        let mut needs = self.store.list_needs(character_id).await?;
        needs.retain(Need::is_critical);
        needs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.current_value.total_cmp(&b.current_value))
        });
        Ok(needs)
    }

    /// Insert any default need type the character is missing. Returns the
    /// newly created rows.
    pub async fn create_default_needs(&self, character_id: i64) -> Result<Vec<Need>> {
        let existing = self
            .store
            .list_needs(character_id)
            .await?
            .into_iter()
            .map(|need| need.need_type)
            .collect::<HashSet<_>>();

        let now = Utc::now();
        let mut created = Vec::new();
        for defaults in DEFAULT_NEEDS {
            if existing.contains(&defaults.need_type) {
                continue;
            }
            let mut need = Need::from_defaults(character_id, defaults, now);
            need.id = self.store.insert_need(&need).await?;
            created.push(need);
        }

        if !created.is_empty() {
            tracing::debug!(
                "Created {} default need(s) for character {}",
                created.len(),
                character_id
            );
        }
        Ok(created)
    }

    async fn require_need(&self, character_id: i64, need_type: NeedType) -> Result<Need> {
        let need = self
            .store
            .get_active_need(character_id, need_type)
            .await?
            .ok_or(CoreError::NeedNotFound {
                character_id,
                need_type,
            })?;
        Ok(need)
    }

    async fn apply_change(&self, mut need: Need, change: f64, reason: &str) -> Result<Need> {
        let old_value = need.current_value;
        let new_value = need.apply_change(change);
        if change < 0.0 {
            need.frustration_level = 0;
        }
        need.last_updated = Utc::now();
        self.store.save_need(&need).await?;

        self.bus.publish(DomainEvent::NeedUpdated {
            character_id: need.character_id,
            need_type: need.need_type,
            old_value,
            new_value,
            reason: reason.to_string(),
        });
        Ok(need)
    }
}

/// Latest representable block: the end of year 9999, the last instant that
/// still stores as a plain RFC3339 timestamp.
pub fn latest_block_deadline() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|date| date.and_hms_milli_opt(23, 59, 59, 999))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// When a block of `hours` starting at `now` ends. Negative spans end
/// immediately and spans past the representable range (including infinity)
/// are capped at [`latest_block_deadline`].
pub fn block_deadline(now: DateTime<Utc>, hours: f64) -> Result<DateTime<Utc>> {
    if hours.is_nan() {
        bail!("block duration must be a number of hours, got NaN");
    }
    let latest = latest_block_deadline();
    let millis = hours.max(0.0) * 3_600_000.0;
    if millis >= i64::MAX as f64 {
        return Ok(latest);
    }
    let deadline = ChronoDuration::try_milliseconds(millis as i64)
        .and_then(|span| now.checked_add_signed(span))
        .unwrap_or(latest);
    Ok(deadline.min(latest))
}

/// Whole ticks between `since` and `now`; zero for non-positive spans or ticks.
pub fn elapsed_ticks(since: DateTime<Utc>, now: DateTime<Utc>, tick_length: ChronoDuration) -> i64 {
    let tick_ms = tick_length.num_milliseconds();
    if tick_ms <= 0 {
        return 0;
    }
    ((now - since).num_milliseconds() / tick_ms).max(0)
}
