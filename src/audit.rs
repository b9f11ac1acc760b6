//! Operator audit trail.
//!
//! Every manual change made through the API or CLI (applying or revoking an
//! action, moving an incident along its lifecycle, editing a policy) is
//! appended as one JSON line. Writes are serialized through a
//! `tokio::sync::Mutex` and the file is opened in append mode.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// What the operator did.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ActionApplied,
    ActionRevoked,
    IncidentAcknowledged,
    IncidentResolved,
    PolicyCreated,
    PolicyUpdated,
    PolicyEnabled,
    PolicyDisabled,
}

/// A single audit record. Inapplicable fields are omitted from the JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub action: AuditAction,
    /// Operator identity, or `"cli"` for local commands.
    pub operator: String,
    /// Id of the action log, incident or policy acted on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    /// `at` comes from the caller's clock so entries line up with the
    /// records they describe.
    pub fn new(action: AuditAction, operator: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: crate::storage::ts(at),
            action,
            operator: operator.into(),
            subject_id: None,
            target: None,
            justification: None,
            details: None,
        }
    }

    pub fn with_subject(mut self, id: impl ToString) -> Self {
        self.subject_id = Some(id.to_string());
        self
    }

    /// `target_type:target_id` of an enforcement action.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Append-only audit log backed by a JSON-lines file.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl AuditLog {
    /// Open (or create) the audit log at `path` in append mode.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create audit log directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open audit log: {}", path.display()))?;

        debug!(path = %path.display(), "audit log opened");

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Append one entry as a JSON line.
    pub async fn log(&self, entry: AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry).context("failed to serialize audit entry")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write to audit log: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush audit log: {}", self.path.display()))?;

        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Best-effort append: a failed audit write is logged, never surfaced.
pub async fn record(log: Option<&AuditLog>, entry: AuditEntry) {
    let Some(log) = log else {
        return;
    };
    let action = entry.action;
    if let Err(e) = log.log(entry).await {
        warn!(?action, error = %e, "failed to write audit entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 12, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn test_entries_are_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit/operator.jsonl");
        let log = AuditLog::open(path.clone()).await.unwrap();

        log.log(
            AuditEntry::new(AuditAction::ActionApplied, "ops-7", at())
                .with_subject("5d4c")
                .with_target("TENANT_USER:u1")
                .with_justification("confirmed credential stuffing")
                .with_details(serde_json::json!({"durationMinutes": 30})),
        )
        .await
        .unwrap();
        log.log(AuditEntry::new(AuditAction::IncidentResolved, "ops-7", at()))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.action, AuditAction::ActionApplied);
        assert_eq!(first.timestamp, "2026-03-09T12:30:00.000Z");
        assert_eq!(first.target.as_deref(), Some("TENANT_USER:u1"));
        assert_eq!(first.details.unwrap()["durationMinutes"], 30);

        assert!(!lines[1].contains("\"justification\""));
        assert!(lines[1].contains("\"incident_resolved\""));
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");

        for operator in ["a", "b"] {
            let log = AuditLog::open(path.clone()).await.unwrap();
            record(Some(&log), AuditEntry::new(AuditAction::PolicyUpdated, operator, at())).await;
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_record_without_log_is_noop() {
        record(None, AuditEntry::new(AuditAction::ActionRevoked, "ops", at())).await;
    }
}
