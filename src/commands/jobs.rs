//! Job commands: list, tick, history and the polling loop

use crate::catalog::{Catalog, JobRun};
use crate::error::{Error, Result};
use crate::progress::sweep_bar;
use crate::scheduler::{Scheduler, TickOutcome};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub every: String,
    pub next_run_at: String,
    pub last_run_at: Option<String>,
    pub run_count: i64,
    pub last_status: Option<String>,
}

pub async fn cmd_jobs_list(catalog: &Catalog) -> Result<Vec<JobSummary>> {
    let mut jobs = Vec::new();
    for record in catalog.list_jobs().await? {
        let definition = record.definition()?;
        let last_status = catalog
            .list_runs(&record.name, 1)
            .await?
            .into_iter()
            .next()
            .map(|run| run.status);
        jobs.push(JobSummary {
            every: definition.every,
            name: record.name,
            next_run_at: record.next_run_at,
            last_run_at: record.last_run_at,
            run_count: record.run_count,
            last_status,
        });
    }
    Ok(jobs)
}

/// Tick one job; `force` runs it even when it is not due
pub async fn cmd_jobs_tick(scheduler: &Scheduler, name: &str, force: bool) -> Result<TickOutcome> {
    if force {
        scheduler.run_now(name).await
    } else {
        scheduler.tick(name).await
    }
}

pub async fn cmd_jobs_history(catalog: &Catalog, name: &str, limit: usize) -> Result<Vec<JobRun>> {
    if catalog.get_job(name).await?.is_none() {
        return Err(Error::JobNotFound(name.to_string()));
    }
    catalog.list_runs(name, limit).await
}

/// One pass over every due job, with a progress bar
pub async fn sweep(scheduler: &Scheduler) -> Result<Vec<(String, TickOutcome)>> {
    let due = scheduler.due_jobs().await?;
    if due.is_empty() {
        return Ok(Vec::new());
    }

    let bar = sweep_bar(due.len() as u64);
    let outcomes = futures::future::join_all(due.iter().map(|name| {
        let bar = &bar;
        async move {
            let outcome = scheduler.tick_settled(name).await;
            bar.set_message(name.clone());
            bar.inc(1);
            outcome
        }
    }))
    .await;
    bar.finish_and_clear();

    Ok(due.into_iter().zip(outcomes).collect())
}

/// Sweep due jobs every `poll_interval` until interrupted, or once
pub async fn cmd_jobs_run(
    scheduler: &Scheduler,
    poll_interval: Duration,
    once: bool,
    mut report: impl FnMut(&[(String, TickOutcome)]),
) -> Result<()> {
    info!("Job loop started, polling every {:?}", poll_interval);
    loop {
        match sweep(scheduler).await {
            Ok(outcomes) => report(&outcomes),
            Err(e) if once => return Err(e),
            Err(e) => warn!("Job sweep failed: {}", e),
        }
        if once {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Job loop stopped");
                return Ok(());
            }
        }
    }
}

pub fn print_jobs(jobs: &[JobSummary]) {
    println!("\n⏱  Jobs\n");
    if jobs.is_empty() {
        println!("No jobs defined. Run a create_job statement to add one.");
        return;
    }
    for job in jobs {
        println!("• {} (every {})", job.name, job.every);
        println!("  Next run: {}", job.next_run_at);
        if let Some(last) = &job.last_run_at {
            println!(
                "  Last run: {} [{}]",
                last,
                job.last_status.as_deref().unwrap_or("unknown")
            );
        }
        println!("  Runs: {}", job.run_count);
    }
}

pub fn print_tick(name: &str, outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Completed { rows } => println!("✓ {}: processed {} rows", name, rows),
        TickOutcome::Deferred => println!("{}: already running", name),
        TickOutcome::NotDue => println!("{}: not due", name),
        TickOutcome::Skipped => println!("{}: condition not met, skipped", name),
        TickOutcome::Finished => println!("{}: schedule finished", name),
        TickOutcome::Failed { error } => println!("✗ {}: {}", name, error),
    }
}

pub fn print_history(runs: &[JobRun]) {
    if runs.is_empty() {
        println!("No runs recorded.");
        return;
    }
    for run in runs {
        print!("{} {:<9} rows={}", run.started_at, run.status, run.rows_processed);
        if let Some(error) = &run.error {
            print!(" error={}", error);
        }
        println!();
    }
}
