//! Cron-driven evaluation and cleanup loops.

pub mod cron;
pub mod engine;

pub use self::cron::{Job, JobSchedule, PlannedRun, Scheduler};
pub use self::engine::{run_job_loop, spawn_loops, JobRunner};
