//! Job scheduler
//!
//! Each job is a small state machine stepped by [`Scheduler::tick`]. There is
//! no background loop here; an external clock (the CLI's `jobs run`, cron, a
//! test) decides when to tick. A job never runs twice at once: a tick that
//! finds it running returns [`TickOutcome::Deferred`].

mod clock;
mod interval;

pub use clock::{Clock, ManualClock, SystemClock};
pub use interval::{next_run_after, parse_interval};

use crate::ast::{CreateJob, Query, Statement};
use crate::catalog::{Catalog, JobRecord, RunStatus, Watermarks};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Idle,
    Running,
    /// Last run failed; the next tick starts over from Idle
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TickOutcome {
    Completed { rows: usize },
    /// Already running; nothing was started
    Deferred,
    NotDue,
    /// `if_query` returned no rows
    Skipped,
    /// Past `end_at` or out of `max_runs`
    Finished,
    Failed { error: String },
}

/// What a finished run reports back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    pub rows_processed: usize,
    /// Highest value seen per `LAST` column
    pub watermarks: Watermarks,
}

/// Executes job bodies; implemented by the engine
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Current maximum of every `LAST` column, used to seed a new job
    async fn current_watermarks(&self, job: &CreateJob) -> Result<Watermarks>;

    /// Whether `query` returns at least one row
    async fn condition_holds(&self, query: &Query) -> Result<bool>;

    /// Run the job's statements with `LAST` bound to `watermarks`
    async fn run(&self, job: &CreateJob, watermarks: &Watermarks) -> Result<JobOutcome>;
}

/// Validate and store a new job. Unless `backfill` is set, `LAST` starts at
/// the current maximum so only rows arriving from now on are processed.
pub async fn create_job(
    catalog: &Catalog,
    runner: &dyn JobRunner,
    job: &CreateJob,
    now: DateTime<Utc>,
) -> Result<JobRecord> {
    parse_interval(&job.every)?;
    if let (Some(start), Some(end)) = (job.start_at, job.end_at) {
        if end <= start {
            return Err(Error::Config("job end_at must be after start_at".into()));
        }
    }

    let record = JobRecord::new(job, job.start_at.unwrap_or(now))?;
    catalog.insert_job(&record).await?;

    let uses_last = job.statements.iter().any(Statement::contains_last);
    if uses_last && !job.backfill {
        let seeded = runner.current_watermarks(job).await?;
        debug!("Seeding {} watermarks for job {}", seeded.len(), record.name);
        catalog.init_watermarks(&record.name, &seeded).await?;
    }
    info!("Created job '{}' (every {})", record.name, job.every);
    Ok(record)
}

/// Keep the higher of old and new per column; NULL never wins
fn advance_watermarks(current: &Watermarks, observed: &Watermarks) -> Watermarks {
    let mut merged = current.clone();
    for (column, value) in observed {
        if value.is_null() {
            continue;
        }
        let newer = match merged.get(column) {
            Some(old) => value.compare(old) == Some(Ordering::Greater),
            None => true,
        };
        if newer {
            merged.insert(column.clone(), value.clone());
        }
    }
    merged
}

pub struct Scheduler {
    catalog: Catalog,
    runner: Arc<dyn JobRunner>,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, JobState>>,
    max_run_history: usize,
}

/// Holds a job in `Running`; whatever happens, the state is released on drop
struct RunningGuard<'a> {
    states: &'a Mutex<HashMap<String, JobState>>,
    name: String,
    finish: JobState,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.name.clone(), self.finish);
    }
}

impl Scheduler {
    pub fn new(
        catalog: Catalog,
        runner: Arc<dyn JobRunner>,
        clock: Arc<dyn Clock>,
        max_run_history: usize,
    ) -> Self {
        Self {
            catalog,
            runner,
            clock,
            states: Mutex::new(HashMap::new()),
            max_run_history: max_run_history.max(1),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn create_job(&self, job: &CreateJob) -> Result<JobRecord> {
        create_job(&self.catalog, self.runner.as_ref(), job, self.clock.now()).await
    }

    pub fn state(&self, name: &str) -> JobState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or_default()
    }

    /// Run the job if it is due
    pub async fn tick(&self, name: &str) -> Result<TickOutcome> {
        self.step(name, false).await
    }

    /// Run the job now, whatever its schedule says
    pub async fn run_now(&self, name: &str) -> Result<TickOutcome> {
        self.step(name, true).await
    }

    /// Names of jobs whose next run is at or before the clock's now
    pub async fn due_jobs(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut due = Vec::new();
        for job in self.catalog.list_jobs().await? {
            if job.next_run()? <= now {
                due.push(job.name);
            }
        }
        Ok(due)
    }

    /// Tick for a sweep: an error becomes that job's failed outcome so the
    /// other jobs' outcomes are still reported
    pub async fn tick_settled(&self, name: &str) -> TickOutcome {
        self.tick(name).await.unwrap_or_else(|e| {
            warn!("Job {} tick failed: {}", name, e);
            TickOutcome::Failed { error: e.to_string() }
        })
    }

    /// Tick every job whose next run is due, concurrently
    pub async fn tick_due(&self) -> Result<Vec<(String, TickOutcome)>> {
        let due = self.due_jobs().await?;
        let outcomes = futures::future::join_all(due.iter().map(|name| self.tick_settled(name))).await;
        Ok(due.into_iter().zip(outcomes).collect())
    }

    fn try_start(&self, name: &str) -> Option<RunningGuard<'_>> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if states.get(name) == Some(&JobState::Running) {
            return None;
        }
        states.insert(name.to_string(), JobState::Running);
        Some(RunningGuard {
            states: &self.states,
            name: name.to_string(),
            finish: JobState::Idle,
        })
    }

    async fn step(&self, name: &str, force: bool) -> Result<TickOutcome> {
        let name = name.to_lowercase();
        let Some(mut guard) = self.try_start(&name) else {
            debug!("Job {} is already running, deferring", name);
            return Ok(TickOutcome::Deferred);
        };

        let record = self
            .catalog
            .get_job(&name)
            .await?
            .ok_or_else(|| Error::JobNotFound(name.clone()))?;
        let job = record.definition()?;
        let now = self.clock.now();
        let scheduled = record.next_run()?;

        if !force && scheduled > now {
            return Ok(TickOutcome::NotDue);
        }
        let out_of_runs = job
            .max_runs
            .is_some_and(|max| record.run_count >= i64::from(max));
        if job.end_at.is_some_and(|end| now > end) || out_of_runs {
            return Ok(TickOutcome::Finished);
        }
        let next_run = next_run_after(scheduled, parse_interval(&job.every)?, now);

        let run = self.catalog.start_run(&name).await?;
        // Once a run row exists every exit has to close it
        match self.run_job(&job, &run.id, &name, next_run).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.fail(&mut guard, &run.id, &name, e, next_run).await,
        }
    }

    async fn run_job(
        &self,
        job: &CreateJob,
        run_id: &str,
        name: &str,
        next_run: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        if let Some(condition) = &job.if_query {
            if !self.runner.condition_holds(condition).await? {
                debug!("Job {} condition returned no rows", name);
                self.catalog
                    .close_run(run_id, name, RunStatus::Skipped, None, next_run)
                    .await?;
                return Ok(TickOutcome::Skipped);
            }
        }

        let current = self.catalog.get_watermarks(name).await?;
        let outcome = self.runner.run(job, &current).await?;
        let advanced = advance_watermarks(&current, &outcome.watermarks);
        self.catalog
            .complete_run(run_id, name, outcome.rows_processed, &advanced, next_run)
            .await?;
        info!("Job {} processed {} rows", name, outcome.rows_processed);
        if let Err(e) = self.catalog.prune_runs(name, self.max_run_history).await {
            warn!("Job {}: pruning run history failed: {}", name, e);
        }
        Ok(TickOutcome::Completed {
            rows: outcome.rows_processed,
        })
    }

    async fn fail(
        &self,
        guard: &mut RunningGuard<'_>,
        run_id: &str,
        name: &str,
        error: Error,
        next_run: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        warn!("Job {} failed: {}", name, error);
        guard.finish = JobState::Failed;
        let message = error.to_string();
        self.catalog
            .close_run(run_id, name, RunStatus::Failed, Some(&message), next_run)
            .await?;
        Ok(TickOutcome::Failed { error: message })
    }
}
