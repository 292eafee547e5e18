use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::characters::CharacterDirectory;
use crate::config::CompanionConfig;
use crate::database::CompanionDatabase;
use crate::events::{DomainEvent, EventBus};
use crate::monitoring::MonitoringCollector;
use crate::motivation::{ExecutionOutcome, MotivationEngine};
use crate::needs::{NeedUpdate, NeedsEngine};
use crate::scheduler::{JobSchedule, Scheduler};
use crate::telegram::TelegramNotifier;

pub const NEEDS_GROWTH_JOB: &str = "needs_growth";
pub const MOTIVATION_ACCUMULATION_JOB: &str = "motivation_accumulation";
pub const MOTIVATION_CLEANUP_JOB: &str = "motivation_cleanup";
pub const MONITORING_PURGE_JOB: &str = "monitoring_purge";
pub const MONITORING_REPORT_JOB: &str = "monitoring_report";

/// Outcome of one needs-growth pass over all active characters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GrowthSummary {
    pub characters: usize,
    pub failed: usize,
    pub needs_grown: usize,
    pub motivations_created: usize,
}

pub struct CompanionRuntime {
    pub config: CompanionConfig,
    pub database: Arc<CompanionDatabase>,
    pub bus: Arc<EventBus>,
    pub needs: Arc<NeedsEngine>,
    pub motivations: Arc<MotivationEngine>,
    pub monitoring: Arc<MonitoringCollector>,
    pub characters: Arc<CharacterDirectory>,
}

pub struct CompanionRuntimeBuilder {
    config: CompanionConfig,
    database: Option<Arc<CompanionDatabase>>,
    rng_seed: Option<u64>,
}

impl CompanionRuntimeBuilder {
    pub fn new(config: CompanionConfig) -> Self {
        Self {
            config,
            database: None,
            rng_seed: None,
        }
    }

    /// Use an already opened database instead of `config.database_path`.
    pub fn with_database(mut self, database: Arc<CompanionDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<CompanionRuntime> {
        let config = self.config;
        let database = match self.database {
            Some(database) => database,
            None => Arc::new(
                CompanionDatabase::new(&config.database_path).with_context(|| {
                    format!("Failed to open companion database {}", config.database_path)
                })?,
            ),
        };

        let bus = Arc::new(EventBus::new());
        let monitoring = Arc::new(MonitoringCollector::new());
        monitoring.register(&bus);

        let needs = Arc::new(NeedsEngine::new(
            database.clone(),
            bus.clone(),
            config.needs_tick(),
        ));
        let mut motivations = MotivationEngine::new(
            database.clone(),
            needs.clone(),
            bus.clone(),
            config.motivation_settings(),
        );
        if let Some(seed) = self.rng_seed {
            motivations = motivations.with_seed(seed);
        }
        let characters = Arc::new(CharacterDirectory::new(
            database.clone(),
            needs.clone(),
            config.character_cache_ttl(),
        ));

        tracing::info!(
            "Companion runtime ready (database: {}, needs tick: {} min, motivation threshold: {})",
            config.database_path,
            needs.tick_length().num_minutes(),
            motivations.settings().threshold
        );

        Ok(CompanionRuntime {
            config,
            database,
            bus,
            needs,
            motivations: Arc::new(motivations),
            monitoring,
            characters,
        })
    }
}

impl CompanionRuntime {
    pub fn bootstrap(config: CompanionConfig) -> Result<Self> {
        CompanionRuntimeBuilder::new(config).build()
    }

    /// A scheduler with every periodic job registered.
    pub fn build_scheduler(self: &Arc<Self>) -> Scheduler {
        let mut scheduler = Scheduler::new(self.bus.clone()).with_tick(self.config.scheduler_tick());

        let runtime = self.clone();
        scheduler.add_job(
            NEEDS_GROWTH_JOB,
            JobSchedule::Every(self.config.needs_tick()),
            move || {
                let runtime = runtime.clone();
                async move { runtime.run_needs_growth().await.map(|_| ()) }
            },
        );

        let runtime = self.clone();
        scheduler.add_job(
            MOTIVATION_ACCUMULATION_JOB,
            JobSchedule::every_minutes(
                self.config
                    .character
                    .motivation
                    .accumulation_interval_minutes
                    .max(1),
            ),
            move || {
                let runtime = runtime.clone();
                async move {
                    runtime
                        .motivations
                        .update_motivations_background()
                        .await
                        .map(|_| ())
                }
            },
        );

        let runtime = self.clone();
        scheduler.add_job(
            MOTIVATION_CLEANUP_JOB,
            JobSchedule::daily_at_midnight(),
            move || {
                let runtime = runtime.clone();
                async move {
                    runtime
                        .motivations
                        .cleanup_expired_motivations()
                        .await
                        .map(|_| ())
                }
            },
        );

        let runtime = self.clone();
        scheduler.add_job(
            MONITORING_PURGE_JOB,
            JobSchedule::every_minutes(60),
            move || {
                let runtime = runtime.clone();
                async move {
                    let purged = runtime.monitoring.purge_old_events();
                    let evicted = runtime.characters.purge_cache().await;
                    tracing::debug!(
                        "Purged {} monitoring event(s), {} cached character(s)",
                        purged,
                        evicted
                    );
                    Ok(())
                }
            },
        );

        let runtime = self.clone();
        scheduler.add_job(
            MONITORING_REPORT_JOB,
            JobSchedule::every_minutes(60),
            move || {
                let runtime = runtime.clone();
                async move { runtime.log_monitoring_report() }
            },
        );

        scheduler
    }

    /// Start the Telegram notifier when a token and chat are configured.
    pub fn spawn_telegram_notifier(&self) -> Result<Option<JoinHandle<()>>> {
        let notifier =
            TelegramNotifier::from_config(&self.config.telegram, self.config.retry.policy())?;
        Ok(notifier.map(|notifier| notifier.spawn(&self.bus)))
    }

    /// Grow needs and generate motivations for every active character,
    /// `growth_batch_size` characters at a time. One character failing is
    /// logged and reported without aborting the pass.
    pub async fn run_needs_growth(&self) -> Result<GrowthSummary> {
        let characters = self.characters.list_active_characters().await?;
        let mut summary = GrowthSummary {
            characters: characters.len(),
            ..GrowthSummary::default()
        };

        for batch in characters.chunks(self.config.growth_batch_size.max(1)) {
            let results = join_all(batch.iter().map(|c| async move {
                let started = Instant::now();
                let result = self.grow_character(c.id).await;
                (result, started.elapsed().as_secs_f64() * 1000.0)
            }))
            .await;
            for (character, (result, duration_ms)) in batch.iter().zip(results) {
                let error = match result {
                    Ok((grown, created)) => {
                        summary.needs_grown += grown;
                        summary.motivations_created += created;
                        None
                    }
                    Err(e) => {
                        summary.failed += 1;
                        tracing::error!(
                            "Needs growth failed for character {}: {:#}",
                            character.id,
                            e
                        );
                        let message = format!("{:#}", e);
                        self.bus.publish(DomainEvent::MonitoringError {
                            character_id: Some(character.id),
                            source: NEEDS_GROWTH_JOB.to_string(),
                            message: message.clone(),
                        });
                        Some(message)
                    }
                };
                self.bus.publish(DomainEvent::SchedulerExecution {
                    job: NEEDS_GROWTH_JOB.to_string(),
                    character_id: Some(character.id),
                    success: error.is_none(),
                    duration_ms,
                    error,
                });
            }
        }

        tracing::info!(
            "Needs growth: {} character(s), {} need(s) grown, {} motivation(s) created, {} failure(s)",
            summary.characters,
            summary.needs_grown,
            summary.motivations_created,
            summary.failed
        );
        Ok(summary)
    }

    async fn grow_character(&self, character_id: i64) -> Result<(usize, usize)> {
        let grown = self.needs.grow_needs(character_id).await?;
        let created = self
            .motivations
            .generate_motivations_from_needs(character_id)
            .await?;
        Ok((grown.len(), created.len()))
    }

    /// Execute a motivation and, on success, relieve its need by the
    /// accumulated reward (one decay tick when nothing has accumulated).
    /// A need that can no longer be relieved does not hide the outcome.
    pub async fn act_on_motivation(&self, motivation_id: &str) -> Result<ExecutionOutcome> {
        let outcome = self
            .motivations
            .execute_motivation_action(motivation_id)
            .await?;

        if let ExecutionOutcome::Success {
            character_id,
            related_need,
            reward_value,
            ..
        } = &outcome
        {
            let relief = if *reward_value > 0.0 {
                self.needs
                    .update_need(
                        *character_id,
                        NeedUpdate {
                            need_type: *related_need,
                            change: -reward_value,
                            reason: format!("motivation {} fulfilled", motivation_id),
                        },
                    )
                    .await
            } else {
                self.needs
                    .satisfy_need(*character_id, *related_need, 1.0)
                    .await
            };
            // The motivation is already fulfilled; a failed relief is reported, not returned.
            if let Err(e) = relief {
                tracing::warn!(
                    "Motivation {} succeeded but {} could not be relieved: {:#}",
                    motivation_id,
                    related_need,
                    e
                );
                self.bus.publish(DomainEvent::MonitoringError {
                    character_id: Some(*character_id),
                    source: "motivation_relief".to_string(),
                    message: format!("{:#}", e),
                });
            }
        }
        Ok(outcome)
    }

    /// Record an interaction so the monitoring counters see it.
    pub fn record_activity(&self, character_id: i64, activity: &str, response_time_ms: Option<f64>) {
        self.bus.publish(DomainEvent::CharacterActivity {
            character_id,
            activity: activity.to_string(),
            response_time_ms,
        });
    }

    pub fn record_emotional_state_change(&self, character_id: i64, previous: &str, current: &str) {
        self.bus.publish(DomainEvent::EmotionalStateChanged {
            character_id,
            previous: previous.to_string(),
            current: current.to_string(),
        });
    }

    pub fn log_monitoring_report(&self) -> Result<()> {
        let report = self.monitoring.report();
        let json = serde_json::to_string(&report).context("Failed to serialize monitoring report")?;
        tracing::info!("Monitoring report: {}", json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motivation::{MotivationOverrides, MotivationStatus};
    use crate::needs::NeedType;
    use crate::store::NeedStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    fn runtime_at(dir: &TempDir) -> (Arc<CompanionRuntime>, std::path::PathBuf) {
        let path = dir.path().join("companion.db");
        let config = CompanionConfig {
            database_path: path.to_string_lossy().to_string(),
            growth_batch_size: 2,
            ..CompanionConfig::default()
        };
        let runtime = CompanionRuntimeBuilder::new(config)
            .with_rng_seed(11)
            .build()
            .expect("runtime");
        (Arc::new(runtime), path)
    }

    async fn backdate(runtime: &CompanionRuntime, character_id: i64, need_type: NeedType, value: f64) {
        let mut need = runtime
            .database
            .get_active_need(character_id, need_type)
            .await
            .expect("query")
            .expect("need");
        need.current_value = value;
        need.last_updated = Utc::now() - ChronoDuration::hours(2);
        runtime.database.save_need(&need).await.expect("save");
    }

    #[tokio::test]
    async fn runtime_uses_sanitised_settings() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = CompanionConfig {
            database_path: dir.path().join("companion.db").to_string_lossy().to_string(),
            needs_tick_minutes: 0,
            ..CompanionConfig::default()
        };
        config.character.motivation.threshold = 150.0;
        let runtime = CompanionRuntime::bootstrap(config).expect("runtime");

        assert_eq!(runtime.needs.tick_length(), ChronoDuration::minutes(1));
        assert_eq!(runtime.motivations.settings().threshold, 100.0);

        let mira = runtime.characters.create_character("Mira").await.expect("create");
        let need = runtime
            .database
            .get_active_need(mira.id, NeedType::Fun)
            .await
            .expect("query")
            .expect("need");
        let motivation = runtime
            .motivations
            .create_motivation(mira.id, &need, MotivationOverrides::default())
            .await
            .expect("create")
            .expect("created");
        let mut statuses = Vec::new();
        for _ in 0..2 {
            let updated = runtime
                .motivations
                .update_motivation_value(&motivation.motivation_id, 50.0)
                .await
                .expect("update")
                .expect("still active");
            statuses.push(updated.status);
        }
        assert_eq!(
            statuses,
            vec![MotivationStatus::Active, MotivationStatus::Fulfilled]
        );
    }

    #[tokio::test]
    async fn scheduler_registers_every_job() {
        let dir = TempDir::new().expect("tempdir");
        let (runtime, _) = runtime_at(&dir);
        let names = runtime.build_scheduler().job_names();
        assert_eq!(
            names,
            vec![
                NEEDS_GROWTH_JOB,
                MOTIVATION_ACCUMULATION_JOB,
                MOTIVATION_CLEANUP_JOB,
                MONITORING_PURGE_JOB,
                MONITORING_REPORT_JOB,
            ]
        );
    }

    #[tokio::test]
    async fn growth_pass_spawns_motivations_for_needs_past_threshold() {
        let dir = TempDir::new().expect("tempdir");
        let (runtime, _) = runtime_at(&dir);
        let mira = runtime.characters.create_character("Mira").await.expect("create");
        let theo = runtime.characters.create_character("Theo").await.expect("create");
        let idle = runtime.characters.create_character("Idle").await.expect("create");
        runtime
            .characters
            .deactivate_character(idle.id)
            .await
            .expect("deactivate");

        // 66 + 3.0 × 2 ticks crosses the threshold of 70.
        backdate(&runtime, mira.id, NeedType::SocialConnection, 66.0).await;

        let summary = runtime.run_needs_growth().await.expect("growth");
        assert_eq!(summary.characters, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.needs_grown, 1);
        assert_eq!(summary.motivations_created, 1);

        let active = runtime
            .motivations
            .get_active_motivations(mira.id)
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].related_need, NeedType::SocialConnection);
        assert!(runtime
            .motivations
            .get_active_motivations(theo.id)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn one_broken_character_does_not_abort_the_batch() {
        let dir = TempDir::new().expect("tempdir");
        let (runtime, path) = runtime_at(&dir);
        let ok = runtime.characters.create_character("Ok").await.expect("create");
        let broken = runtime.characters.create_character("Broken").await.expect("create");
        backdate(&runtime, ok.id, NeedType::Fun, 69.0).await;

        let raw = rusqlite::Connection::open(&path).expect("open raw");
        raw.execute(
            "INSERT INTO needs (character_id, need_type, growth_rate, decay_rate, priority,
                                threshold, last_updated)
             VALUES (?1, 'boredom', 1.0, 1.0, 1, 70.0, '2024-01-01T00:00:00.000Z')",
            [broken.id],
        )
        .expect("insert bad row");

        let summary = runtime.run_needs_growth().await.expect("growth");
        assert_eq!(summary.characters, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.motivations_created, 1);

        let metrics = runtime
            .monitoring
            .character_metrics(broken.id)
            .expect("error recorded");
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.scheduler_executions, 1);
        let ok_metrics = runtime.monitoring.character_metrics(ok.id).expect("metrics");
        assert_eq!(ok_metrics.scheduler_executions, 1);
        assert_eq!(ok_metrics.error_count, 0);
    }

    #[tokio::test]
    async fn retired_need_does_not_hide_a_successful_action() {
        let dir = TempDir::new().expect("tempdir");
        let (runtime, path) = runtime_at(&dir);
        let mira = runtime.characters.create_character("Mira").await.expect("create");
        let need = runtime
            .database
            .get_active_need(mira.id, NeedType::Rest)
            .await
            .expect("query")
            .expect("need");
        let motivation = runtime
            .motivations
            .create_motivation(
                mira.id,
                &need,
                MotivationOverrides {
                    success_probability: Some(100.0),
                    ..MotivationOverrides::default()
                },
            )
            .await
            .expect("create")
            .expect("created");

        let raw = rusqlite::Connection::open(&path).expect("open raw");
        raw.execute(
            "UPDATE needs SET is_active = 0 WHERE character_id = ?1 AND need_type = 'rest'",
            [mira.id],
        )
        .expect("retire need");

        let outcome = runtime
            .act_on_motivation(&motivation.motivation_id)
            .await
            .expect("outcome still returned");
        assert!(outcome.is_success());
        let metrics = runtime.monitoring.character_metrics(mira.id).expect("metrics");
        assert_eq!(metrics.error_count, 1);
    }

    #[tokio::test]
    async fn scheduled_growth_counts_per_character_executions() {
        let dir = TempDir::new().expect("tempdir");
        let (runtime, _) = runtime_at(&dir);
        let mira = runtime.characters.create_character("Mira").await.expect("create");
        let theo = runtime.characters.create_character("Theo").await.expect("create");

        let mut scheduler = runtime.build_scheduler();
        for handle in scheduler.run_due(Utc::now() + ChronoDuration::hours(2)) {
            handle.await.expect("join");
        }

        for id in [mira.id, theo.id] {
            let metrics = runtime.monitoring.character_metrics(id).expect("metrics");
            assert_eq!(metrics.scheduler_executions, 1);
            assert_eq!(metrics.error_count, 0);
        }
        let report = runtime.monitoring.report();
        assert!(report.counters.scheduler_executions >= 3);
        assert_eq!(
            report.counters.scheduler_executions,
            report.counters.scheduler_successes
        );
    }

    #[tokio::test]
    async fn acting_on_a_motivation_relieves_its_need() {
        let dir = TempDir::new().expect("tempdir");
        let (runtime, _) = runtime_at(&dir);
        let mira = runtime.characters.create_character("Mira").await.expect("create");
        backdate(&runtime, mira.id, NeedType::Hunger, 90.0).await;
        let need = runtime
            .database
            .get_active_need(mira.id, NeedType::Hunger)
            .await
            .expect("query")
            .expect("need");

        let motivation = runtime
            .motivations
            .create_motivation(
                mira.id,
                &need,
                MotivationOverrides {
                    success_probability: Some(100.0),
                    ..MotivationOverrides::default()
                },
            )
            .await
            .expect("create")
            .expect("created");
        runtime
            .motivations
            .update_motivation_value(&motivation.motivation_id, 25.0)
            .await
            .expect("accumulate");

        let outcome = runtime
            .act_on_motivation(&motivation.motivation_id)
            .await
            .expect("act");
        assert!(outcome.is_success());

        let relieved = runtime
            .database
            .get_active_need(mira.id, NeedType::Hunger)
            .await
            .expect("query")
            .expect("need");
        assert_eq!(relieved.current_value, 65.0);

        let stored = runtime
            .motivations
            .get_motivation(&motivation.motivation_id)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(stored.status, MotivationStatus::Fulfilled);

        let again = runtime
            .act_on_motivation(&motivation.motivation_id)
            .await
            .expect("act again");
        assert!(matches!(again, ExecutionOutcome::Blocked { .. }));

        let metrics = runtime.monitoring.character_metrics(mira.id).expect("metrics");
        assert_eq!(metrics.motivation_executions, 1);
        assert_eq!(metrics.motivation_successes, 1);
    }

    #[tokio::test]
    async fn activity_reaches_the_report() {
        let dir = TempDir::new().expect("tempdir");
        let (runtime, _) = runtime_at(&dir);
        runtime.record_activity(3, "message", Some(120.0));
        runtime.record_emotional_state_change(3, "calm", "playful");

        let report = runtime.monitoring.report();
        assert_eq!(report.counters.messages, 1);
        assert_eq!(report.counters.emotional_state_changes, 1);
        runtime.log_monitoring_report().expect("report");
        assert!(runtime.spawn_telegram_notifier().expect("notifier").is_none());
    }
}
