//! Scheduler: runs jobs on interval or calendar triggers.
//!
//! A job never overlaps itself. A tick that comes due while the previous
//! run is still active is skipped (logged and audited), never queued.
//! Different jobs run concurrently. A failing or panicking check is audited
//! and the loop carries on.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::audit::{AuditDigest, AuditEvent, AuditLog, AuditRecord};
use crate::cron::CronSchedule;
use crate::error::HitlError;
use crate::pipeline::Dispatcher;
use crate::retry::RetryEngine;
use crate::state_machine::Actor;
use crate::status::StatusSummary;
use crate::store::ItemStore;
use crate::watcher::SourceWatcher;

#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(Duration),
    Calendar(CronSchedule),
}

impl Schedule {
    /// First due time for a freshly registered job.
    fn first_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(_) => Some(now),
            Schedule::Calendar(cron) => cron.next_after(now),
        }
    }

    /// Next due time after a tick that was due at `due` fired at `now`.
    pub fn next_due(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(every) => {
                let step = chrono::Duration::from_std(*every).ok()?;
                if step <= chrono::Duration::zero() {
                    return Some(now);
                }
                let mut next = due + step;
                while next <= now {
                    next += step;
                }
                Some(next)
            }
            Schedule::Calendar(cron) => cron.next_after(now),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval(every) => write!(f, "every {}s", every.as_secs()),
            Schedule::Calendar(cron) => write!(f, "cron '{}'", cron.expression()),
        }
    }
}

/// The closed set of things the scheduler can run.
pub enum Job {
    Watch(Arc<SourceWatcher>),
    Dispatch(Arc<Dispatcher>),
    RetrySweep(Arc<RetryEngine>),
    StatusSnapshot(Arc<ItemStore>),
    AuditDigest {
        audit: Arc<AuditLog>,
        window: chrono::Duration,
    },
}

impl Job {
    /// Runs one check; returns a one-line summary.
    pub async fn check_for_updates(&self) -> Result<String, HitlError> {
        match self {
            Job::Watch(watcher) => {
                let created = watcher.check_for_updates().await?;
                Ok(format!("{} new item(s)", created.len()))
            }
            Job::Dispatch(dispatcher) => {
                let r = dispatcher.dispatch().await?;
                Ok(format!(
                    "completed {}, held {}, failed {}, conflicts {}",
                    r.completed, r.held, r.failed, r.conflicts
                ))
            }
            Job::RetrySweep(engine) => {
                let r = engine.sweep(Utc::now())?;
                Ok(format!(
                    "retried {}, unrecoverable {}, waiting {}, held {}",
                    r.retried.len(),
                    r.unrecoverable.len(),
                    r.waiting,
                    r.held
                ))
            }
            Job::StatusSnapshot(store) => {
                let summary = StatusSummary::project(&store.list_all()?);
                tracing::info!(
                    total = summary.total,
                    unrecoverable = summary.unrecoverable,
                    awaiting_human = summary.awaiting_human,
                    "status: {}",
                    serde_json::to_string(&summary.by_state)?
                );
                Ok(format!("{} item(s)", summary.total))
            }
            Job::AuditDigest { audit, window } => {
                let to = Utc::now();
                let from = to - *window;
                let digest = AuditDigest::build(&audit.since(from)?, from, to);
                tracing::info!(
                    total = digest.total,
                    failures = digest.failures.len(),
                    "audit digest: {}",
                    serde_json::to_string(&digest.by_event)?
                );
                Ok(format!("{} record(s)", digest.total))
            }
        }
    }
}

/// Wall-clock time that follows tokio's clock, so paused tests see it move.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin_utc: Utc::now(),
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub id: String,
    pub schedule: String,
    pub enabled: bool,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_due: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Runtime {
    enabled: bool,
    running: bool,
    last_run_at: Option<DateTime<Utc>>,
    next_due: Option<DateTime<Utc>>,
}

struct ScheduledJob {
    id: String,
    schedule: Schedule,
    job: Arc<Job>,
    runtime: Mutex<Runtime>,
}

impl ScheduledJob {
    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        // Runtime holds plain flags; a panic elsewhere cannot leave it torn.
        self.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub started: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct Scheduler {
    jobs: Vec<Arc<ScheduledJob>>,
    audit: Arc<AuditLog>,
    clock: Clock,
    tick_interval: Duration,
}

impl Scheduler {
    /// Empty scheduler that wakes every `tick_interval`.
    pub fn new(audit: Arc<AuditLog>, tick_interval: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            audit,
            clock: Clock::new(),
            tick_interval,
        }
    }

    /// Registers a job. Interval jobs are due at once; calendar jobs at
    /// their next match.
    pub fn add(&mut self, id: impl Into<String>, schedule: Schedule, job: Job, enabled: bool) {
        let id = id.into();
        let next_due = schedule.first_due(self.clock.now());
        tracing::info!(job_id = %id, %schedule, enabled, "job registered");
        self.jobs.push(Arc::new(ScheduledJob {
            id,
            schedule,
            job: Arc::new(job),
            runtime: Mutex::new(Runtime {
                enabled,
                running: false,
                last_run_at: None,
                next_due,
            }),
        }));
    }

    /// The clock ticks are read from.
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Enables or disables a job. Items it already produced are untouched.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let Some(job) = self.jobs.iter().find(|j| j.id == id) else {
            return false;
        };
        let mut rt = job.runtime();
        if enabled && !rt.enabled {
            rt.next_due = job.schedule.first_due(self.clock.now());
        }
        rt.enabled = enabled;
        tracing::info!(job_id = %id, enabled, "job toggled");
        true
    }

    /// Snapshot of every registered job.
    pub fn jobs(&self) -> Vec<JobStatus> {
        self.jobs
            .iter()
            .map(|job| {
                let rt = job.runtime();
                JobStatus {
                    id: job.id.clone(),
                    schedule: job.schedule.to_string(),
                    enabled: rt.enabled,
                    running: rt.running,
                    last_run_at: rt.last_run_at,
                    next_due: rt.next_due,
                }
            })
            .collect()
    }

    /// Starts every due, idle job; skips due jobs that are still running.
    pub fn tick(&self, now: DateTime<Utc>, tasks: &mut JoinSet<()>) -> TickReport {
        let mut report = TickReport::default();

        for job in &self.jobs {
            let was_running = {
                let mut rt = job.runtime();
                let Some(due) = rt.next_due else { continue };
                if !rt.enabled || due > now {
                    continue;
                }
                rt.next_due = job.schedule.next_due(due, now);
                let was_running = rt.running;
                rt.running = true;
                was_running
            };

            if was_running {
                tracing::warn!(job_id = %job.id, "previous run still active; tick skipped");
                self.record(AuditEvent::JobSkipped { job_id: job.id.clone() }, "previous run still active");
                report.skipped.push(job.id.clone());
                continue;
            }

            report.started.push(job.id.clone());
            tasks.spawn(run_job(job.clone(), self.audit.clone(), self.clock));
        }
        report
    }

    /// Ticks until `shutdown` resolves, then stops in-flight checks.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tracing::info!(jobs = self.jobs.len(), tick_secs = self.tick_interval.as_secs_f64(), "scheduler started");
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.tick(self.clock.now(), &mut tasks);
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        tracing::info!(in_flight = tasks.len(), "scheduler stopping");
        tasks.shutdown().await;
    }

    fn record(&self, event: AuditEvent, reason: impl Into<String>) {
        record(&self.audit, event, reason);
    }
}

fn record(audit: &AuditLog, event: AuditEvent, reason: impl Into<String>) {
    if let Err(e) = audit.append(&AuditRecord::new(Actor::Scheduler, event, reason)) {
        tracing::error!("audit append failed: {e}");
    }
}

/// Clears the job's running flag however the run ends, abort included.
struct RunningGuard {
    job: Arc<ScheduledJob>,
    clock: Clock,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut rt = self.job.runtime();
        rt.running = false;
        rt.last_run_at = Some(self.clock.now());
    }
}

/// Aborts the spawned check when the owning run is dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_job(job: Arc<ScheduledJob>, audit: Arc<AuditLog>, clock: Clock) {
    let _running = RunningGuard { job: job.clone(), clock };
    let check = job.job.clone();
    // Separate task so a panic in the check surfaces as a JoinError.
    let mut handle = AbortOnDrop(tokio::spawn(async move { check.check_for_updates().await }));

    match (&mut handle.0).await {
        Ok(Ok(summary)) => tracing::debug!(job_id = %job.id, "check done: {summary}"),
        Ok(Err(e)) => {
            tracing::error!(job_id = %job.id, "check failed: {e}");
            record(&audit, AuditEvent::JobFailed { job_id: job.id.clone() }, e.to_string());
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, "check panicked: {e}");
            record(&audit, AuditEvent::JobFailed { job_id: job.id.clone() }, format!("panicked: {e}"));
        }
    }
}
