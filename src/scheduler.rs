//! Periodic job runner.
//!
//! A single timer loop checks every job once per tick and spawns the ones
//! that are due. A job whose previous run is still in flight is skipped
//! rather than stacked.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::events::{DomainEvent, EventBus};

pub const DEFAULT_SCHEDULER_TICK: Duration = Duration::from_secs(1);

pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSchedule {
    Every(ChronoDuration),
    /// Once a day at the given UTC wall-clock time.
    DailyAt(NaiveTime),
}

impl JobSchedule {
    pub fn every_minutes(minutes: i64) -> Self {
        JobSchedule::Every(ChronoDuration::minutes(minutes))
    }

    pub fn daily_at_midnight() -> Self {
        JobSchedule::DailyAt(NaiveTime::default())
    }

    /// First run strictly after `after`.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            JobSchedule::Every(interval) => {
                let interval = if *interval <= ChronoDuration::zero() {
                    ChronoDuration::seconds(1)
                } else {
                    *interval
                };
                after + interval
            }
            JobSchedule::DailyAt(time) => {
                let today = Utc.from_utc_datetime(&after.date_naive().and_time(*time));
                if today > after {
                    today
                } else {
                    today + ChronoDuration::days(1)
                }
            }
        }
    }
}

struct ScheduledJob {
    name: String,
    schedule: JobSchedule,
    run: JobFn,
    running: Arc<AtomicBool>,
    next_run: DateTime<Utc>,
}

pub struct Scheduler {
    bus: Arc<EventBus>,
    jobs: Vec<ScheduledJob>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            jobs: Vec::new(),
            tick: DEFAULT_SCHEDULER_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn add_job<F, Fut>(&mut self, name: &str, schedule: JobSchedule, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let run: JobFn = Arc::new(move || job().boxed());
        let next_run = schedule.next_run_after(Utc::now());
        tracing::info!("Scheduled job '{}' ({:?}), first run at {}", name, schedule, next_run);
        self.jobs.push(ScheduledJob {
            name: name.to_string(),
            schedule,
            run,
            running: Arc::new(AtomicBool::new(false)),
            next_run,
        });
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|job| job.name.clone()).collect()
    }

    /// Drive the timer loop until `shutdown` flips to `true` or its sender
    /// is dropped. In-flight job runs are left to finish on their own.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            "Scheduler started with {} job(s), tick {:?}",
            self.jobs.len(),
            self.tick
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_due(Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }

    /// Spawn every job due at `now`. Returns handles of the spawned runs.
    pub fn run_due(&mut self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let mut spawned = Vec::new();
        for job in &mut self.jobs {
            if now < job.next_run {
                continue;
            }
            job.next_run = job.schedule.next_run_after(now);

            if job.running.swap(true, Ordering::SeqCst) {
                tracing::warn!("Job '{}' is still running; skipping this run", job.name);
                continue;
            }
            spawned.push(spawn_run(
                job.name.clone(),
                job.run.clone(),
                job.running.clone(),
                self.bus.clone(),
            ));
        }
        spawned
    }
}

fn spawn_run(
    name: String,
    run: JobFn,
    running: Arc<AtomicBool>,
    bus: Arc<EventBus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(run()).catch_unwind().await;
        running.store(false, Ordering::SeqCst);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let error = match outcome {
            Ok(Ok(())) => {
                tracing::debug!("Job '{}' finished in {:.1}ms", name, duration_ms);
                None
            }
            Ok(Err(e)) => {
                tracing::error!("Job '{}' failed after {:.1}ms: {:#}", name, duration_ms, e);
                Some(format!("{:#}", e))
            }
            Err(_) => {
                tracing::error!("Job '{}' panicked", name);
                Some("job panicked".to_string())
            }
        };

        bus.publish(DomainEvent::SchedulerExecution {
            job: name,
            character_id: None,
            success: error.is_none(),
            duration_ms,
            error,
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn executions(bus: &EventBus) -> Arc<Mutex<Vec<(String, bool)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(EventKind::SchedulerExecution, "test", move |event| {
            if let DomainEvent::SchedulerExecution { job, success, .. } = event {
                sink.lock().unwrap().push((job.clone(), *success));
            }
            Ok(())
        });
        seen
    }

    #[test]
    fn next_run_for_interval_and_daily_schedules() {
        let now = at("2024-03-10T13:45:00Z");
        assert_eq!(
            JobSchedule::every_minutes(5).next_run_after(now),
            at("2024-03-10T13:50:00Z")
        );
        assert_eq!(
            JobSchedule::daily_at_midnight().next_run_after(now),
            at("2024-03-11T00:00:00Z")
        );

        let morning = JobSchedule::DailyAt(NaiveTime::from_hms_opt(6, 30, 0).expect("time"));
        assert_eq!(
            morning.next_run_after(at("2024-03-10T05:00:00Z")),
            at("2024-03-10T06:30:00Z")
        );
        // Exactly on the boundary rolls to the next day.
        assert_eq!(
            morning.next_run_after(at("2024-03-10T06:30:00Z")),
            at("2024-03-11T06:30:00Z")
        );
    }

    #[tokio::test]
    async fn due_jobs_run_and_report_outcome() {
        let bus = Arc::new(EventBus::new());
        let seen = executions(&bus);
        let mut scheduler = Scheduler::new(bus.clone());
        scheduler.add_job("ok", JobSchedule::every_minutes(1), || async { Ok(()) });
        scheduler.add_job("fails", JobSchedule::every_minutes(1), || async {
            Err(anyhow::anyhow!("database unavailable"))
        });
        scheduler.add_job("later", JobSchedule::every_minutes(60), || async { Ok(()) });

        let handles = scheduler.run_due(Utc::now() + ChronoDuration::minutes(2));
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.await.expect("join");
        }

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![("fails".to_string(), false), ("ok".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn overlapping_run_is_skipped() {
        let bus = Arc::new(EventBus::new());
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(bus);
        {
            let release = release.clone();
            let calls = calls.clone();
            scheduler.add_job("slow", JobSchedule::every_minutes(1), move || {
                let release = release.clone();
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(())
                }
            });
        }

        let now = Utc::now();
        let first = scheduler.run_due(now + ChronoDuration::minutes(1));
        assert_eq!(first.len(), 1);
        let second = scheduler.run_due(now + ChronoDuration::minutes(3));
        assert!(second.is_empty());

        release.notify_one();
        for handle in first {
            handle.await.expect("join");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let third = scheduler.run_due(now + ChronoDuration::minutes(5));
        assert_eq!(third.len(), 1);
        release.notify_one();
        for handle in third {
            handle.await.expect("join");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_job_does_not_wedge_the_scheduler() {
        let bus = Arc::new(EventBus::new());
        let seen = executions(&bus);
        let mut scheduler = Scheduler::new(bus);
        scheduler.add_job("explodes", JobSchedule::every_minutes(1), || async {
            let broken = true;
            if broken {
                panic!("job bug");
            }
            Ok(())
        });

        let now = Utc::now();
        for handle in scheduler.run_due(now + ChronoDuration::minutes(1)) {
            handle.await.expect("join");
        }
        let again = scheduler.run_due(now + ChronoDuration::minutes(2));
        assert_eq!(again.len(), 1);
        for handle in again {
            handle.await.expect("join");
        }
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[
                ("explodes".to_string(), false),
                ("explodes".to_string(), false)
            ]
        );
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(bus).with_tick(Duration::from_millis(10));
        {
            let calls = calls.clone();
            scheduler.add_job(
                "fast",
                JobSchedule::Every(ChronoDuration::milliseconds(20)),
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
            );
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler stopped")
            .expect("join");

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
