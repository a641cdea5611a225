//! Persistent catalogue of recurring cron triggers.
//!
//! Each scheduled entry stores a full pipeline snapshot under
//! `scheduler:job:<id>` in the state store, so the catalogue survives
//! restart without reloading configuration files. One timer task is armed
//! per entry; a fire that arrives while the previous run of the same entry
//! is still in flight is dropped, not queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pipevine_state::StateStore;
use pipevine_types::{Pipeline, Trigger};

use crate::cron::CronSchedule;
use crate::errors::EngineError;
use crate::executor::Executor;

/// Key prefix for persisted entries.
const ENTRY_PREFIX: &str = "scheduler:job:";

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Run records older than this many days are deleted by the daily
    /// housekeeping pass.
    pub retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

/// A persisted cron-plus-pipeline record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEntry {
    pub id: String,
    pub pipeline: Pipeline,
    pub trigger: Trigger,
    pub enabled: bool,
}

/// Best-effort snapshot of scheduler state.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub entry_count: usize,
    pub next_runs: Vec<UpcomingRun>,
}

/// One upcoming fire time.
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingRun {
    pub entry_id: String,
    pub pipeline: String,
    pub at: DateTime<Utc>,
}

struct ArmedTimer {
    entry: SchedulerEntry,
    schedule: CronSchedule,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    running: bool,
    timers: HashMap<String, ArmedTimer>,
    housekeeping: Option<tokio::task::JoinHandle<()>>,
}

/// Fires pipeline executions at cron-specified times.
pub struct Scheduler {
    state: Arc<dyn StateStore>,
    executor: Arc<Executor>,
    config: SchedulerConfig,
    inner: Mutex<Inner>,
}

impl Scheduler {
    /// Build a scheduler over its collaborators.
    #[must_use]
    pub fn new(
        state: Arc<dyn StateStore>,
        executor: Arc<Executor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            state,
            executor,
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create, persist, and arm a new entry. Valid only for cron triggers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for non-cron triggers or an
    /// unparseable expression, and [`EngineError::State`] when the entry
    /// cannot be persisted.
    pub async fn schedule_pipeline(
        &self,
        pipeline: Pipeline,
        trigger: Trigger,
    ) -> Result<String, EngineError> {
        let Trigger::Cron {
            expression,
            timezone,
        } = &trigger
        else {
            return Err(EngineError::validation(
                "scheduler",
                vec![format!(
                    "only cron triggers can be scheduled, got '{}'",
                    trigger.kind()
                )],
            ));
        };
        let schedule = CronSchedule::parse(expression)
            .map_err(|e| EngineError::validation("scheduler", vec![e.to_string()]))?;
        if let Some(tz) = timezone {
            if !tz.eq_ignore_ascii_case("utc") {
                tracing::warn!(
                    timezone = tz.as_str(),
                    "non-UTC trigger timezones are evaluated in UTC"
                );
            }
        }

        let id = Uuid::new_v4().to_string();
        let entry = SchedulerEntry {
            id: id.clone(),
            pipeline,
            trigger,
            enabled: true,
        };
        self.put_entry(&entry).await?;
        self.arm(entry, schedule);
        tracing::info!(entry = id, "pipeline scheduled");
        Ok(id)
    }

    /// Stop the entry's timer and remove it from memory and the store.
    /// Returns whether an entry was removed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::State`] when the store cannot be reached.
    pub async fn unschedule_pipeline(&self, entry_id: &str) -> Result<bool, EngineError> {
        let in_memory = {
            let mut inner = self.lock_inner();
            match inner.timers.remove(entry_id) {
                Some(timer) => {
                    timer.handle.abort();
                    true
                }
                None => false,
            }
        };

        let key = entry_key(entry_id);
        let state = Arc::clone(&self.state);
        let in_store = spawn_store(move || {
            let existed = state.get(&key)?.is_some();
            state.delete(&key)?;
            Ok(existed)
        })
        .await?;

        if in_memory || in_store {
            tracing::info!(entry = entry_id, "pipeline unscheduled");
        }
        Ok(in_memory || in_store)
    }

    /// Load every persisted enabled entry, re-arm timers, and arm the
    /// daily housekeeping pass. A second call is a no-op with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::State`] when the catalogue cannot be read.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.lock_inner().running {
            tracing::warn!("scheduler already running; start ignored");
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        let entries = spawn_store(move || {
            let mut entries = Vec::new();
            for key in state.list(ENTRY_PREFIX)? {
                if let Some(value) = state.get(&key)? {
                    entries.push((key, value));
                }
            }
            Ok(entries)
        })
        .await?;

        let mut armed = 0usize;
        for (key, value) in entries {
            let entry: SchedulerEntry = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(key, "skipping corrupt scheduler entry: {e}");
                    continue;
                }
            };
            if !entry.enabled {
                continue;
            }
            let Trigger::Cron { expression, .. } = &entry.trigger else {
                tracing::warn!(entry = entry.id, "skipping non-cron scheduler entry");
                continue;
            };
            match CronSchedule::parse(expression) {
                Ok(schedule) => {
                    self.arm(entry, schedule);
                    armed += 1;
                }
                Err(e) => tracing::warn!(entry = entry.id, "skipping entry: {e}"),
            }
        }

        let mut inner = self.lock_inner();
        inner.housekeeping = Some(self.spawn_housekeeping());
        inner.running = true;
        tracing::info!(entries = armed, "scheduler started");
        Ok(())
    }

    /// Stop every armed timer and the housekeeping pass.
    pub fn stop(&self) {
        let mut inner = self.lock_inner();
        for (_, timer) in inner.timers.drain() {
            timer.handle.abort();
        }
        if let Some(handle) = inner.housekeeping.take() {
            handle.abort();
        }
        inner.running = false;
        tracing::info!("scheduler stopped");
    }

    /// Snapshot of the armed entries and the next five fire times.
    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        let inner = self.lock_inner();
        let now = Utc::now();
        let mut next_runs: Vec<UpcomingRun> = inner
            .timers
            .values()
            .filter_map(|timer| {
                timer.schedule.next_after(now).map(|at| UpcomingRun {
                    entry_id: timer.entry.id.clone(),
                    pipeline: timer.entry.pipeline.name.clone(),
                    at,
                })
            })
            .collect();
        next_runs.sort_by_key(|r| r.at);
        next_runs.truncate(5);
        SchedulerStatus {
            running: inner.running,
            entry_count: inner.timers.len(),
            next_runs,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn put_entry(&self, entry: &SchedulerEntry) -> Result<(), EngineError> {
        let key = entry_key(&entry.id);
        let value = serde_json::to_value(entry)
            .map_err(|e| EngineError::State(pipevine_state::StateError::Serde(e)))?;
        let state = Arc::clone(&self.state);
        spawn_store(move || state.set(&key, &value)).await
    }

    fn arm(&self, entry: SchedulerEntry, schedule: CronSchedule) {
        let mut inner = self.lock_inner();
        if inner.timers.contains_key(&entry.id) {
            return;
        }
        let handle = tokio::spawn(timer_loop(
            Arc::clone(&self.executor),
            entry.clone(),
            schedule.clone(),
        ));
        inner.timers.insert(
            entry.id.clone(),
            ArmedTimer {
                entry,
                schedule,
                handle,
            },
        );
    }

    fn spawn_housekeeping(&self) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let retention_days = self.config.retention_days;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(24 * 60 * 60)).await;
                let state = Arc::clone(&state);
                let outcome = tokio::task::spawn_blocking(move || {
                    state.cleanup_old_runs(retention_days)
                })
                .await;
                match outcome {
                    Ok(Ok(deleted)) => {
                        tracing::info!(deleted, retention_days, "run retention pass complete");
                    }
                    Ok(Err(e)) => tracing::warn!("run retention pass failed: {e}"),
                    Err(e) => tracing::warn!("run retention worker panicked: {e}"),
                }
            }
        })
    }
}

fn entry_key(entry_id: &str) -> String {
    format!("{ENTRY_PREFIX}{entry_id}")
}

/// Run a blocking store closure on the blocking pool.
async fn spawn_store<T: Send + 'static>(
    op: impl FnOnce() -> Result<T, pipevine_state::StateError> + Send + 'static,
) -> Result<T, EngineError> {
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| EngineError::Execution(format!("state worker panicked: {e}")))?
        .map_err(EngineError::from)
}

/// Sleep until each fire time; drop fires that overlap the previous run.
async fn timer_loop(executor: Arc<Executor>, entry: SchedulerEntry, schedule: CronSchedule) {
    let in_flight = Arc::new(AtomicBool::new(false));
    loop {
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            tracing::warn!(entry = entry.id, "cron has no future fire times; disarming");
            return;
        };
        let wait = (next - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::time::sleep(wait).await;

        if in_flight.load(Ordering::SeqCst) {
            tracing::warn!(
                entry = entry.id,
                pipeline = entry.pipeline.name,
                "previous run still in flight; dropping this fire"
            );
            continue;
        }
        in_flight.store(true, Ordering::SeqCst);
        let executor = Arc::clone(&executor);
        let entry = entry.clone();
        let flag = Arc::clone(&in_flight);
        tokio::spawn(async move {
            fire(&executor, &entry).await;
            flag.store(false, Ordering::SeqCst);
        });
    }
}

/// Execute one scheduled firing with a fresh run id, recording the actual
/// cron trigger on the run. Failures never remove the entry.
async fn fire(executor: &Executor, entry: &SchedulerEntry) -> String {
    let run_id = Uuid::new_v4().to_string();
    tracing::info!(
        entry = entry.id,
        pipeline = entry.pipeline.name,
        run = run_id,
        "cron trigger fired"
    );
    match executor
        .execute_pipeline(
            Arc::new(entry.pipeline.clone()),
            &run_id,
            entry.trigger.clone(),
        )
        .await
    {
        Ok(run) => tracing::info!(
            entry = entry.id,
            run = run_id,
            status = run.status.as_str(),
            "scheduled run finished"
        ),
        Err(e) => tracing::error!(entry = entry.id, run = run_id, "scheduled run errored: {e}"),
    }
    run_id
}
