use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use serde::Serialize;

use crate::config::SchedulerConfig;

/// The periodic jobs Guardian runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    /// Evaluate every enabled policy.
    Evaluate,
    /// Expire actions and purge old events.
    Cleanup,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Evaluate => f.write_str("evaluate"),
            Job::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// One job bound to its cron expression.
#[derive(Debug, Clone)]
pub struct JobSchedule {
    pub job: Job,
    pub expr: String,
    schedule: CronSchedule,
}

impl JobSchedule {
    pub fn parse(job: Job, expr: &str) -> Result<Self> {
        let schedule = CronSchedule::from_str(expr)
            .map_err(|e| anyhow!("Invalid cron expression '{}' for {}: {}", expr, job, e))?;
        Ok(Self {
            job,
            expr: expr.to_string(),
            schedule,
        })
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}

/// A planned run, as shown by the dry-run preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub job: Job,
}

/// The evaluate and cleanup schedules.
#[derive(Debug, Clone)]
pub struct Scheduler {
    jobs: Vec<JobSchedule>,
}

impl Scheduler {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        Ok(Self {
            jobs: vec![
                JobSchedule::parse(Job::Evaluate, &config.evaluate_cron)?,
                JobSchedule::parse(Job::Cleanup, &config.cleanup_cron)?,
            ],
        })
    }

    pub fn jobs(&self) -> &[JobSchedule] {
        &self.jobs
    }

    /// Every run in `(from, from + hours]`, in time order.
    /// This is strictly a dry-run preview, not the execution loop.
    pub fn preview_next_runs(&self, from: DateTime<Utc>, hours: u64) -> Vec<PlannedRun> {
        let end = from + Duration::hours(i64::try_from(hours).unwrap_or(i64::MAX / 3600));
        let mut preview = Vec::new();

        for entry in &self.jobs {
            for at in entry.schedule.after(&from) {
                if at > end {
                    break;
                }
                preview.push(PlannedRun { at, job: entry.job });
            }
        }

        preview.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| (a.job as u8).cmp(&(b.job as u8))));
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(evaluate: &str, cleanup: &str) -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            evaluate_cron: evaluate.to_string(),
            cleanup_cron: cleanup.to_string(),
        }
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let err = Scheduler::from_config(&config("every minute", "0 * * * * *")).unwrap_err();
        assert!(err.to_string().contains("evaluate"));
    }

    #[test]
    fn test_preview_interleaves_jobs() {
        let scheduler = Scheduler::from_config(&config("0 */20 * * * *", "0 30 * * * *")).unwrap();
        let from = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let runs = scheduler.preview_next_runs(from, 1);
        let jobs: Vec<Job> = runs.iter().map(|r| r.job).collect();
        // 12:20, 12:30, 12:40, 13:00
        assert_eq!(jobs, vec![Job::Evaluate, Job::Cleanup, Job::Evaluate, Job::Evaluate]);
        assert_eq!(runs[0].at, Utc.with_ymd_and_hms(2026, 3, 1, 12, 20, 0).unwrap());
    }

    #[test]
    fn test_next_after_is_strict() {
        let entry = JobSchedule::parse(Job::Cleanup, "0 * * * * *").unwrap();
        let on_the_minute = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            entry.next_after(on_the_minute),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap())
        );
    }
}
