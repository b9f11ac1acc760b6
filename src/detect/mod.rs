//! Threshold policies, incident lifecycle and the policy evaluation engine.

pub mod engine;
pub mod incident;
pub mod policy;

pub use self::engine::{EvaluationResult, PolicyEngine};
pub use self::incident::IncidentManager;
pub use self::policy::{Policy, PolicyGroupBy, PolicyInput};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::StoreError;
use crate::wire::wire_enum;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("policy {0} not found")]
    PolicyNotFound(Uuid),

    #[error("incident {0} not found")]
    IncidentNotFound(Uuid),

    #[error("incident {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: IncidentStatus,
        to: IncidentStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

wire_enum! {
    /// Severity assigned to incidents raised by a policy.
    #[derive(PartialOrd, Ord)]
    pub enum Severity {
        Low => "LOW",
        Medium => "MEDIUM",
        High => "HIGH",
        Critical => "CRITICAL",
    }
}

wire_enum! {
    /// Incident lifecycle: `OPEN -> ACK -> RESOLVED`.
    pub enum IncidentStatus {
        Open => "OPEN",
        Ack => "ACK",
        Resolved => "RESOLVED",
    }
}

/// The record of a policy firing. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub id: Uuid,
    pub policy_id: Uuid,
    pub severity: Severity,
    pub summary: String,
    /// Ids of the events that crossed the threshold.
    pub evidence: Vec<Uuid>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: IncidentStatus,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}
