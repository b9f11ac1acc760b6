use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::detect::{DetectError, Incident, IncidentStatus, Severity};
use crate::events::SecurityEvent;
use crate::storage::{run_blocking, SharedStore};

/// Records incidents and drives their `OPEN -> ACK -> RESOLVED` lifecycle.
#[derive(Clone)]
pub struct IncidentManager {
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl IncidentManager {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Persist a new OPEN incident for `policy_id` with `evidence` as proof.
    pub async fn record_incident(
        &self,
        policy_id: Uuid,
        severity: Severity,
        summary: String,
        evidence: &[&SecurityEvent],
    ) -> Result<Incident, DetectError> {
        let now = self.clock.now();
        let first_seen_at = evidence.iter().map(|e| e.created_at).min().unwrap_or(now);
        let last_seen_at = evidence.iter().map(|e| e.created_at).max().unwrap_or(now);

        let incident = Incident {
            id: Uuid::new_v4(),
            policy_id,
            severity,
            summary,
            evidence: evidence.iter().map(|e| e.id).collect(),
            first_seen_at,
            last_seen_at,
            status: IncidentStatus::Open,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
            created_at: now,
        };

        let row = incident.clone();
        run_blocking(&self.store, move |s| s.insert_incident(&row)).await?;
        Ok(incident)
    }

    /// Whether `policy_id` raised any incident at or after `since`.
    pub async fn raised_since(&self, policy_id: Uuid, since: DateTime<Utc>) -> Result<bool, DetectError> {
        let raised = run_blocking(&self.store, move |s| s.incident_created_since(policy_id, since)).await?;
        Ok(raised)
    }

    pub async fn get(&self, id: Uuid) -> Result<Incident, DetectError> {
        run_blocking(&self.store, move |s| s.get_incident(id))
            .await?
            .ok_or(DetectError::IncidentNotFound(id))
    }

    pub async fn list_recent(&self, status: Option<IncidentStatus>, limit: usize) -> Result<Vec<Incident>, DetectError> {
        let incidents = run_blocking(&self.store, move |s| s.list_incidents(status, limit)).await?;
        Ok(incidents)
    }

    /// `OPEN -> ACK`.
    pub async fn acknowledge(&self, id: Uuid, by: &str) -> Result<Incident, DetectError> {
        let now = self.clock.now();
        let operator = by.to_string();
        let moved = run_blocking(&self.store, move |s| s.acknowledge_incident(id, &operator, now)).await?;
        if !moved {
            return Err(self.transition_error(id, IncidentStatus::Ack).await);
        }
        tracing::info!(incident = %id, by = %by, "incident acknowledged");
        self.get(id).await
    }

    /// `OPEN|ACK -> RESOLVED`, recording who resolved it and why.
    pub async fn resolve(&self, id: Uuid, by: &str, notes: Option<&str>) -> Result<Incident, DetectError> {
        let now = self.clock.now();
        let operator = by.to_string();
        let notes = notes.map(str::to_string);
        let moved = run_blocking(&self.store, move |s| {
            s.resolve_incident(id, &operator, notes.as_deref(), now)
        })
        .await?;
        if !moved {
            return Err(self.transition_error(id, IncidentStatus::Resolved).await);
        }
        tracing::info!(incident = %id, by = %by, "incident resolved");
        self.get(id).await
    }

    async fn transition_error(&self, id: Uuid, to: IncidentStatus) -> DetectError {
        match self.get(id).await {
            Ok(current) => DetectError::InvalidTransition {
                id,
                from: current.status,
                to,
            },
            Err(e) => e,
        }
    }
}
