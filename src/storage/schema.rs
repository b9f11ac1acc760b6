//! Database schema and migrations.

use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS security_events (
            id TEXT PRIMARY KEY,
            tenant_id TEXT,
            actor_type TEXT NOT NULL,
            actor_id TEXT,
            ip_hash TEXT,
            user_agent TEXT,
            route TEXT,
            method TEXT,
            status_code INTEGER,
            error_code TEXT,
            event_type TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_security_events_type_created
            ON security_events(event_type, created_at);
        CREATE INDEX IF NOT EXISTS idx_security_events_created
            ON security_events(created_at);

        CREATE TABLE IF NOT EXISTS security_policies (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            window_seconds INTEGER NOT NULL CHECK (window_seconds > 0),
            threshold INTEGER NOT NULL CHECK (threshold >= 1),
            group_by TEXT NOT NULL,
            action_type TEXT,
            action_params_json TEXT NOT NULL DEFAULT '{}',
            cooldown_seconds INTEGER NOT NULL DEFAULT 0 CHECK (cooldown_seconds >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS security_incidents (
            id TEXT PRIMARY KEY,
            policy_id TEXT NOT NULL REFERENCES security_policies(id),
            severity TEXT NOT NULL,
            summary TEXT NOT NULL,
            evidence_json TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'OPEN',
            acknowledged_by TEXT,
            acknowledged_at TEXT,
            resolved_by TEXT,
            resolved_at TEXT,
            resolution_notes TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_security_incidents_policy_created
            ON security_incidents(policy_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_security_incidents_created
            ON security_incidents(created_at);

        CREATE TABLE IF NOT EXISTS security_action_logs (
            id TEXT PRIMARY KEY,
            incident_id TEXT REFERENCES security_incidents(id),
            action_type TEXT NOT NULL,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            scope TEXT,
            params_json TEXT NOT NULL DEFAULT '{}',
            reason TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'APPLIED',
            created_by_type TEXT NOT NULL,
            created_by TEXT,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            ended_at TEXT,
            revoked_by TEXT,
            revoke_reason TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_security_action_logs_status_expires
            ON security_action_logs(status, expires_at);
        CREATE INDEX IF NOT EXISTS idx_security_action_logs_created
            ON security_action_logs(created_at);

        CREATE TABLE IF NOT EXISTS security_enforcement_state (
            id TEXT PRIMARY KEY,
            action_log_id TEXT NOT NULL,
            action_type TEXT NOT NULL,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            scope_key TEXT NOT NULL DEFAULT '',
            params_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            UNIQUE (target_type, target_id, action_type, scope_key)
        );
        CREATE INDEX IF NOT EXISTS idx_security_enforcement_lookup
            ON security_enforcement_state(target_type, target_id, expires_at);
        CREATE INDEX IF NOT EXISTS idx_security_enforcement_expires
            ON security_enforcement_state(expires_at);
        CREATE INDEX IF NOT EXISTS idx_security_enforcement_action
            ON security_enforcement_state(action_log_id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    let version: i64 = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    if version < 2 {
        // v2: one enforcement row per action log instead of per
        // (target, action type, scope)
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE security_enforcement_state_v2 (
                id TEXT PRIMARY KEY,
                action_log_id TEXT NOT NULL UNIQUE,
                action_type TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                scope_key TEXT NOT NULL DEFAULT '',
                params_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            INSERT INTO security_enforcement_state_v2
                SELECT id, action_log_id, action_type, target_type, target_id,
                       scope_key, params_json, created_at, expires_at
                FROM security_enforcement_state;
            DROP TABLE security_enforcement_state;
            ALTER TABLE security_enforcement_state_v2 RENAME TO security_enforcement_state;
            CREATE INDEX idx_security_enforcement_lookup
                ON security_enforcement_state(target_type, target_id, expires_at);
            CREATE INDEX idx_security_enforcement_expires
                ON security_enforcement_state(expires_at);
            CREATE INDEX idx_security_enforcement_action
                ON security_enforcement_state(action_log_id);
            INSERT INTO schema_version (version) VALUES (2);
            COMMIT;",
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in [
            "security_events",
            "security_policies",
            "security_incidents",
            "security_action_logs",
            "security_enforcement_state",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should start empty");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_enforcement_rows_are_keyed_per_action() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let insert = |id: &str, log: &str| {
            conn.execute(
                "INSERT INTO security_enforcement_state (id, action_log_id, action_type, target_type,
                    target_id, scope_key, created_at, expires_at)
                 VALUES (?1, ?2, 'LOCK_USER_TEMP', 'TENANT_USER', 'u1', '', 'x', 'y')",
                [id, log],
            )
        };
        // two actions on the same target, type and scope coexist
        insert("s1", "a1").unwrap();
        insert("s2", "a2").unwrap();
        // but one action never has two rows
        assert!(insert("s3", "a1").is_err());
    }

    #[test]
    fn test_policy_checks_are_enforced_by_schema() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO security_policies (id, name, event_type, severity, window_seconds,
                threshold, group_by, created_at, updated_at)
             VALUES ('p1', 'bad', 'LOGIN_FAILED', 'LOW', 60, 0, 'IP', 'x', 'x')",
            [],
        );
        assert!(result.is_err());
    }
}
