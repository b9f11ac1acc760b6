//! [`SecurityStore`] over an r2d2 pool of SQLite connections.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{ts, Pool, SecurityStore, StoreResult};
use crate::detect::{Incident, IncidentStatus, Policy};
use crate::enforce::{ActionLog, ActionScope, ActionStatus, EnforcementState, TargetType};
use crate::events::{SecurityEvent, SecurityEventType};

const EVENT_COLUMNS: &str = "id, tenant_id, actor_type, actor_id, ip_hash, user_agent, route, method,
     status_code, error_code, event_type, metadata_json, created_at";

const POLICY_COLUMNS: &str = "id, name, description, enabled, event_type, severity, window_seconds,
     threshold, group_by, action_type, action_params_json, cooldown_seconds, created_at, updated_at";

const INCIDENT_COLUMNS: &str = "id, policy_id, severity, summary, evidence_json, first_seen_at,
     last_seen_at, status, acknowledged_by, acknowledged_at, resolved_by, resolved_at,
     resolution_notes, created_at";

const ACTION_COLUMNS: &str = "id, incident_id, action_type, target_type, target_id, scope,
     params_json, reason, status, created_by_type, created_by, created_at, expires_at, ended_at,
     revoked_by, revoke_reason";

const STATE_COLUMNS: &str = "id, action_log_id, action_type, target_type, target_id, scope_key,
     params_json, created_at, expires_at";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Column decoding
// ---------------------------------------------------------------------------

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Decode a TEXT column through `FromStr`.
fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

fn parsed_opt<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.filter(|s| !s.is_empty())
        .map(|s| s.parse::<T>().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn scope_key(scope: Option<ActionScope>) -> &'static str {
    scope.map(|s| s.as_str()).unwrap_or("")
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<SecurityEvent> {
    Ok(SecurityEvent {
        id: parsed(row, 0)?,
        tenant_id: row.get(1)?,
        actor_type: parsed(row, 2)?,
        actor_id: row.get(3)?,
        ip_hash: row.get(4)?,
        user_agent: row.get(5)?,
        route: row.get(6)?,
        method: row.get(7)?,
        status_code: row.get(8)?,
        error_code: row.get(9)?,
        event_type: parsed(row, 10)?,
        metadata: json_col(row, 11)?,
        created_at: parsed(row, 12)?,
    })
}

fn policy_from_row(row: &Row<'_>) -> rusqlite::Result<Policy> {
    Ok(Policy {
        id: parsed(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        event_type: parsed(row, 4)?,
        severity: parsed(row, 5)?,
        window_seconds: row.get(6)?,
        threshold: row.get(7)?,
        group_by: parsed(row, 8)?,
        action_type: parsed_opt(row, 9)?,
        action_params: json_col(row, 10)?,
        cooldown_seconds: row.get(11)?,
        created_at: parsed(row, 12)?,
        updated_at: parsed(row, 13)?,
    })
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: parsed(row, 0)?,
        policy_id: parsed(row, 1)?,
        severity: parsed(row, 2)?,
        summary: row.get(3)?,
        evidence: json_col(row, 4)?,
        first_seen_at: parsed(row, 5)?,
        last_seen_at: parsed(row, 6)?,
        status: parsed(row, 7)?,
        acknowledged_by: row.get(8)?,
        acknowledged_at: parsed_opt(row, 9)?,
        resolved_by: row.get(10)?,
        resolved_at: parsed_opt(row, 11)?,
        resolution_notes: row.get(12)?,
        created_at: parsed(row, 13)?,
    })
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<ActionLog> {
    Ok(ActionLog {
        id: parsed(row, 0)?,
        incident_id: parsed_opt(row, 1)?,
        action_type: parsed(row, 2)?,
        target_type: parsed(row, 3)?,
        target_id: row.get(4)?,
        scope: parsed_opt(row, 5)?,
        params: json_col(row, 6)?,
        reason: row.get(7)?,
        status: parsed(row, 8)?,
        created_by_type: parsed(row, 9)?,
        created_by: row.get(10)?,
        created_at: parsed(row, 11)?,
        expires_at: parsed(row, 12)?,
        ended_at: parsed_opt(row, 13)?,
        revoked_by: row.get(14)?,
        revoke_reason: row.get(15)?,
    })
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<EnforcementState> {
    Ok(EnforcementState {
        id: parsed(row, 0)?,
        action_log_id: parsed(row, 1)?,
        action_type: parsed(row, 2)?,
        target_type: parsed(row, 3)?,
        target_id: row.get(4)?,
        scope: parsed_opt(row, 5)?,
        params: json_col(row, 6)?,
        created_at: parsed(row, 7)?,
        expires_at: parsed(row, 8)?,
    })
}

// ---------------------------------------------------------------------------
// SecurityStore
// ---------------------------------------------------------------------------

impl SecurityStore for SqliteStore {
    fn insert_event(&self, event: &SecurityEvent) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT INTO security_events ({EVENT_COLUMNS})
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
            params![
                event.id.to_string(),
                event.tenant_id,
                event.actor_type.as_str(),
                event.actor_id,
                event.ip_hash,
                event.user_agent,
                event.route,
                event.method,
                event.status_code,
                event.error_code,
                event.event_type.as_str(),
                serde_json::to_string(&event.metadata)?,
                ts(event.created_at),
            ],
        )?;
        Ok(())
    }

    fn events_since(&self, event_type: SecurityEventType, since: DateTime<Utc>) -> StoreResult<Vec<SecurityEvent>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM security_events
             WHERE event_type = ?1 AND created_at >= ?2
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let events = stmt
            .query_map(params![event_type.as_str(), ts(since)], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn purge_events_before(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM security_events WHERE created_at < ?1",
            params![ts(before)],
        )?;
        Ok(removed)
    }

    fn insert_policy(&self, policy: &Policy) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT INTO security_policies ({POLICY_COLUMNS})
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
            params![
                policy.id.to_string(),
                policy.name,
                policy.description,
                policy.enabled as i64,
                policy.event_type.as_str(),
                policy.severity.as_str(),
                policy.window_seconds,
                policy.threshold,
                policy.group_by.as_str(),
                policy.action_type.map(|a| a.as_str()),
                serde_json::to_string(&policy.action_params)?,
                policy.cooldown_seconds,
                ts(policy.created_at),
                ts(policy.updated_at),
            ],
        )?;
        Ok(())
    }

    fn update_policy(&self, policy: &Policy) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE security_policies SET
                name = ?2, description = ?3, enabled = ?4, event_type = ?5, severity = ?6,
                window_seconds = ?7, threshold = ?8, group_by = ?9, action_type = ?10,
                action_params_json = ?11, cooldown_seconds = ?12, updated_at = ?13
             WHERE id = ?1",
            params![
                policy.id.to_string(),
                policy.name,
                policy.description,
                policy.enabled as i64,
                policy.event_type.as_str(),
                policy.severity.as_str(),
                policy.window_seconds,
                policy.threshold,
                policy.group_by.as_str(),
                policy.action_type.map(|a| a.as_str()),
                serde_json::to_string(&policy.action_params)?,
                policy.cooldown_seconds,
                ts(policy.updated_at),
            ],
        )?;
        Ok(changed > 0)
    }

    fn set_policy_enabled(&self, id: Uuid, enabled: bool, at: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE security_policies SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), enabled as i64, ts(at)],
        )?;
        Ok(changed > 0)
    }

    fn get_policy(&self, id: Uuid) -> StoreResult<Option<Policy>> {
        let conn = self.pool.get()?;
        let policy = conn
            .query_row(
                &format!("SELECT {POLICY_COLUMNS} FROM security_policies WHERE id = ?1"),
                params![id.to_string()],
                policy_from_row,
            )
            .optional()?;
        Ok(policy)
    }

    fn list_policies(&self, enabled_only: bool) -> StoreResult<Vec<Policy>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {POLICY_COLUMNS} FROM security_policies
             WHERE (?1 = 0 OR enabled = 1)
             ORDER BY created_at ASC, name ASC"
        ))?;
        let policies = stmt
            .query_map(params![enabled_only as i64], policy_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(policies)
    }

    fn insert_incident(&self, incident: &Incident) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT INTO security_incidents ({INCIDENT_COLUMNS})
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
            params![
                incident.id.to_string(),
                incident.policy_id.to_string(),
                incident.severity.as_str(),
                incident.summary,
                serde_json::to_string(&incident.evidence)?,
                ts(incident.first_seen_at),
                ts(incident.last_seen_at),
                incident.status.as_str(),
                incident.acknowledged_by,
                incident.acknowledged_at.map(ts),
                incident.resolved_by,
                incident.resolved_at.map(ts),
                incident.resolution_notes,
                ts(incident.created_at),
            ],
        )?;
        Ok(())
    }

    fn incident_created_since(&self, policy_id: Uuid, since: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM security_incidents WHERE policy_id = ?1 AND created_at >= ?2
             )",
            params![policy_id.to_string(), ts(since)],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    fn get_incident(&self, id: Uuid) -> StoreResult<Option<Incident>> {
        let conn = self.pool.get()?;
        let incident = conn
            .query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM security_incidents WHERE id = ?1"),
                params![id.to_string()],
                incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }

    fn list_incidents(&self, status: Option<IncidentStatus>, limit: usize) -> StoreResult<Vec<Incident>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM security_incidents
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let incidents = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                incident_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(incidents)
    }

    fn acknowledge_incident(&self, id: Uuid, by: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE security_incidents
             SET status = 'ACK', acknowledged_by = ?2, acknowledged_at = ?3
             WHERE id = ?1 AND status = 'OPEN'",
            params![id.to_string(), by, ts(at)],
        )?;
        Ok(changed > 0)
    }

    fn resolve_incident(&self, id: Uuid, by: &str, notes: Option<&str>, at: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE security_incidents
             SET status = 'RESOLVED', resolved_by = ?2, resolution_notes = ?3, resolved_at = ?4
             WHERE id = ?1 AND status IN ('OPEN', 'ACK')",
            params![id.to_string(), by, notes, ts(at)],
        )?;
        Ok(changed > 0)
    }

    fn insert_action_log(&self, log: &ActionLog) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT INTO security_action_logs ({ACTION_COLUMNS})
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"),
            params![
                log.id.to_string(),
                log.incident_id.map(|id| id.to_string()),
                log.action_type.as_str(),
                log.target_type.as_str(),
                log.target_id,
                log.scope.map(|s| s.as_str()),
                serde_json::to_string(&log.params)?,
                log.reason,
                log.status.as_str(),
                log.created_by_type.as_str(),
                log.created_by,
                ts(log.created_at),
                ts(log.expires_at),
                log.ended_at.map(ts),
                log.revoked_by,
                log.revoke_reason,
            ],
        )?;
        Ok(())
    }

    fn get_action_log(&self, id: Uuid) -> StoreResult<Option<ActionLog>> {
        let conn = self.pool.get()?;
        let log = conn
            .query_row(
                &format!("SELECT {ACTION_COLUMNS} FROM security_action_logs WHERE id = ?1"),
                params![id.to_string()],
                action_from_row,
            )
            .optional()?;
        Ok(log)
    }

    fn list_action_logs(&self, status: Option<ActionStatus>, limit: usize) -> StoreResult<Vec<ActionLog>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTION_COLUMNS} FROM security_action_logs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let logs = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                action_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    fn mark_action_reverted(&self, id: Uuid, revoked_by: &str, reason: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE security_action_logs
             SET status = 'REVERTED', ended_at = ?2, revoked_by = ?3, revoke_reason = ?4
             WHERE id = ?1 AND status = 'APPLIED'",
            params![id.to_string(), ts(at), revoked_by, reason],
        )?;
        Ok(changed > 0)
    }

    fn expire_action_logs(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE security_action_logs
             SET status = 'EXPIRED', ended_at = ?1
             WHERE status = 'APPLIED' AND expires_at < ?1",
            params![ts(now)],
        )?;
        Ok(changed)
    }

    fn upsert_enforcement(&self, state: &EnforcementState) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT INTO security_enforcement_state ({STATE_COLUMNS})
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
              ON CONFLICT (action_log_id) DO UPDATE SET
                params_json = excluded.params_json,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at"),
            params![
                state.id.to_string(),
                state.action_log_id.to_string(),
                state.action_type.as_str(),
                state.target_type.as_str(),
                state.target_id,
                scope_key(state.scope),
                serde_json::to_string(&state.params)?,
                ts(state.created_at),
                ts(state.expires_at),
            ],
        )?;
        Ok(())
    }

    fn find_enforcement(
        &self,
        target_type: TargetType,
        target_id: &str,
        scope: Option<ActionScope>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<EnforcementState>> {
        let conn = self.pool.get()?;
        // A scoped check also honours unscoped and GLOBAL rows; an unscoped
        // check matches anything on the target.
        let state = conn
            .query_row(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM security_enforcement_state
                     WHERE target_type = ?1 AND target_id = ?2 AND expires_at > ?3
                       AND (?4 IS NULL OR scope_key IN (?4, '', 'GLOBAL'))
                     ORDER BY CASE action_type
                                WHEN 'LOCK_USER_TEMP' THEN 0
                                WHEN 'REQUIRE_REAUTH' THEN 1
                                ELSE 2
                              END,
                              expires_at DESC
                     LIMIT 1"
                ),
                params![
                    target_type.as_str(),
                    target_id,
                    ts(now),
                    scope.map(|s| s.as_str()),
                ],
                state_from_row,
            )
            .optional()?;
        Ok(state)
    }

    fn delete_enforcement_for_action(&self, action_log_id: Uuid) -> StoreResult<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM security_enforcement_state WHERE action_log_id = ?1",
            params![action_log_id.to_string()],
        )?;
        Ok(removed)
    }

    fn delete_expired_enforcement(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM security_enforcement_state WHERE expires_at < ?1",
            params![ts(now)],
        )?;
        Ok(removed)
    }

    fn list_active_enforcement(&self, now: DateTime<Utc>) -> StoreResult<Vec<EnforcementState>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM security_enforcement_state
             WHERE expires_at > ?1
             ORDER BY expires_at ASC"
        ))?;
        let states = stmt
            .query_map(params![ts(now)], state_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(states)
    }
}
