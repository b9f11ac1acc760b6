//! Persistence contract and its SQLite implementation.
//!
//! The engine talks to storage only through [`SecurityStore`]. The trait is
//! synchronous; async callers go through [`run_blocking`] so pool checkouts
//! and queries never stall the runtime.

pub mod schema;
pub mod sqlite;

pub use self::sqlite::SqliteStore;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;
use uuid::Uuid;

use crate::detect::{Incident, IncidentStatus, Policy};
use crate::enforce::{ActionLog, ActionScope, ActionStatus, EnforcementState, TargetType};
use crate::events::{SecurityEvent, SecurityEventType};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Shared handle to whichever store backs the engine.
pub type SharedStore = Arc<dyn SecurityStore>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Everything the engine needs from a backing store.
///
/// Implementations must make each method a single atomic statement (or
/// transaction); the engine adds no locking of its own and may call these
/// concurrently from several instances.
pub trait SecurityStore: Send + Sync {
    // -- events --------------------------------------------------------------

    fn insert_event(&self, event: &SecurityEvent) -> StoreResult<()>;

    /// Events of `event_type` with `created_at >= since`, oldest first.
    fn events_since(&self, event_type: SecurityEventType, since: DateTime<Utc>) -> StoreResult<Vec<SecurityEvent>>;

    /// Delete events created before `before`; returns the number removed.
    fn purge_events_before(&self, before: DateTime<Utc>) -> StoreResult<usize>;

    // -- policies ------------------------------------------------------------

    fn insert_policy(&self, policy: &Policy) -> StoreResult<()>;

    /// Replace a policy row; `false` if no such policy.
    fn update_policy(&self, policy: &Policy) -> StoreResult<bool>;

    fn set_policy_enabled(&self, id: Uuid, enabled: bool, at: DateTime<Utc>) -> StoreResult<bool>;

    fn get_policy(&self, id: Uuid) -> StoreResult<Option<Policy>>;

    fn list_policies(&self, enabled_only: bool) -> StoreResult<Vec<Policy>>;

    // -- incidents -----------------------------------------------------------

    fn insert_incident(&self, incident: &Incident) -> StoreResult<()>;

    /// Whether any incident for `policy_id` was created at or after `since`.
    fn incident_created_since(&self, policy_id: Uuid, since: DateTime<Utc>) -> StoreResult<bool>;

    fn get_incident(&self, id: Uuid) -> StoreResult<Option<Incident>>;

    /// Most recent first.
    fn list_incidents(&self, status: Option<IncidentStatus>, limit: usize) -> StoreResult<Vec<Incident>>;

    /// `OPEN -> ACK`; `false` if the incident is missing or not open.
    fn acknowledge_incident(&self, id: Uuid, by: &str, at: DateTime<Utc>) -> StoreResult<bool>;

    /// `OPEN|ACK -> RESOLVED`; `false` if missing or already resolved.
    fn resolve_incident(&self, id: Uuid, by: &str, notes: Option<&str>, at: DateTime<Utc>) -> StoreResult<bool>;

    // -- action logs ---------------------------------------------------------

    fn insert_action_log(&self, log: &ActionLog) -> StoreResult<()>;

    fn get_action_log(&self, id: Uuid) -> StoreResult<Option<ActionLog>>;

    /// Most recent first.
    fn list_action_logs(&self, status: Option<ActionStatus>, limit: usize) -> StoreResult<Vec<ActionLog>>;

    /// `APPLIED -> REVERTED`; `false` if missing or already terminal.
    fn mark_action_reverted(&self, id: Uuid, revoked_by: &str, reason: &str, at: DateTime<Utc>) -> StoreResult<bool>;

    /// `APPLIED -> EXPIRED` for every log whose expiry is before `now`.
    fn expire_action_logs(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    // -- enforcement state ---------------------------------------------------

    /// Insert the live row for an action; rewriting the same action's row
    /// is a no-op.
    fn upsert_enforcement(&self, state: &EnforcementState) -> StoreResult<()>;

    /// Single indexed lookup of the most restrictive unexpired row.
    fn find_enforcement(
        &self,
        target_type: TargetType,
        target_id: &str,
        scope: Option<ActionScope>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<EnforcementState>>;

    fn delete_enforcement_for_action(&self, action_log_id: Uuid) -> StoreResult<usize>;

    fn delete_expired_enforcement(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    fn list_active_enforcement(&self, now: DateTime<Utc>) -> StoreResult<Vec<EnforcementState>>;
}

/// Run a store call on the blocking pool.
pub async fn run_blocking<T, F>(store: &SharedStore, f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn SecurityStore) -> StoreResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref())).await?
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Open the database at `path` and wrap it as a shared store.
pub fn open_store(path: &str) -> Result<SharedStore> {
    let pool = open_pool(path)?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

/// Fixed-width UTC timestamp; lexical order equals time order.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ts_is_sortable() {
        let early = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(ts(early), "2026-01-09T23:59:59.000Z");
        assert!(ts(early) < ts(late));
    }

    #[test]
    fn test_open_pool_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/guardian.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();
        assert!(pool.get().is_ok());
        assert!(path.exists());
    }
}
