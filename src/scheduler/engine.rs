use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::cron::{Job, JobSchedule, Scheduler};
use crate::clock::Clock;
use crate::detect::PolicyEngine;
use crate::enforce::CleanupSweeper;

/// What each job calls into.
#[derive(Clone)]
pub struct JobRunner {
    pub engine: Arc<PolicyEngine>,
    pub sweeper: Arc<CleanupSweeper>,
}

impl JobRunner {
    /// Run one job to completion. Failures are logged inside the callees,
    /// so a run always completes.
    pub async fn run(&self, job: Job) {
        match job {
            Job::Evaluate => {
                let results = self.engine.evaluate_all_policies().await;
                let incidents = results.iter().filter(|r| r.incident_id.is_some()).count();
                debug!(policies = results.len(), incidents, "scheduled evaluation finished");
            }
            Job::Cleanup => {
                let report = self.sweeper.run_once().await;
                debug!(?report, "scheduled cleanup finished");
            }
        }
    }
}

/// Spawn one loop per scheduled job. The loops stop when `shutdown` flips
/// to `true`.
pub fn spawn_loops(
    scheduler: &Scheduler,
    runner: JobRunner,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    scheduler
        .jobs()
        .iter()
        .cloned()
        .map(|entry| {
            let runner = runner.clone();
            let clock = clock.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(run_job_loop(entry, runner, clock, shutdown))
        })
        .collect()
}

/// Sleep until the next fire time, run, repeat.
pub async fn run_job_loop(
    entry: JobSchedule,
    runner: JobRunner,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(job = %entry.job, cron = %entry.expr, "scheduler loop started");

    loop {
        let now = clock.now();
        let Some(next) = entry.next_after(now) else {
            error!(job = %entry.job, cron = %entry.expr, "cron expression has no future runs; loop stopping");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(job = %entry.job, "scheduler loop stopping");
                    return;
                }
                continue;
            }
        }

        runner.run(entry.job).await;
    }
}
