use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{error, info};

use super::ActionEnforcer;
use crate::clock::Clock;
use crate::storage::{run_blocking, SharedStore};

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub expired_logs: usize,
    pub deleted_states: usize,
    pub purged_events: usize,
}

/// Periodic housekeeping: expire actions, drop dead enforcement rows and
/// purge events past retention.
#[derive(Clone)]
pub struct CleanupSweeper {
    enforcer: Arc<ActionEnforcer>,
    store: SharedStore,
    clock: Arc<dyn Clock>,
    retention_days: u32,
}

impl CleanupSweeper {
    /// `retention_days == 0` keeps events forever.
    pub fn new(enforcer: Arc<ActionEnforcer>, store: SharedStore, clock: Arc<dyn Clock>, retention_days: u32) -> Self {
        Self {
            enforcer,
            store,
            clock,
            retention_days,
        }
    }

    pub async fn run_once(&self) -> CleanupReport {
        let outcome = self.enforcer.cleanup_expired().await;
        let mut report = CleanupReport {
            expired_logs: outcome.expired_logs,
            deleted_states: outcome.deleted_states,
            purged_events: 0,
        };

        if self.retention_days > 0 {
            let cutoff = self.clock.now() - Duration::days(i64::from(self.retention_days));
            match run_blocking(&self.store, move |s| s.purge_events_before(cutoff)).await {
                Ok(n) => report.purged_events = n,
                Err(e) => error!(error = %e, "failed to purge old security events"),
            }
        }

        if report.purged_events > 0 {
            info!(purged_events = report.purged_events, retention_days = self.retention_days, "old events purged");
        }
        report
    }
}
