//! Automated countermeasures: action logs, live enforcement state and the
//! admission gate that consults it.

pub mod enforcer;
pub mod gate;
pub mod params;
pub mod sweeper;

pub use self::enforcer::{ActionEnforcer, ActionRequest, CleanupOutcome};
pub use self::gate::{Admission, AdmissionGate, EnforcementLookup, Subject};
pub use self::sweeper::{CleanupReport, CleanupSweeper};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::StoreError;
use crate::wire::{wire_enum, UnknownVariant};

#[derive(Debug, Error)]
pub enum EnforceError {
    #[error(transparent)]
    UnknownActionType(UnknownVariant),

    #[error("invalid parameters for {action}: {reason}")]
    InvalidParams { action: ActionType, reason: String },

    #[error("action log {0} not found")]
    ActionNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EnforceError {
    /// True for failures caused by the request itself rather than the
    /// backing store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EnforceError::UnknownActionType(_) | EnforceError::InvalidParams { .. }
        )
    }
}

wire_enum! {
    /// The closed set of temporary countermeasures.
    pub enum ActionType {
        LockUserTemp => "LOCK_USER_TEMP",
        RateLimit => "RATE_LIMIT",
        RequireReauth => "REQUIRE_REAUTH",
    }
}

impl ActionType {
    /// Parse a wire name, reporting unknown names as an enforcement error.
    pub fn parse(raw: &str) -> Result<Self, EnforceError> {
        raw.parse().map_err(EnforceError::UnknownActionType)
    }
}

wire_enum! {
    /// What an action is applied to.
    pub enum TargetType {
        TenantUser => "TENANT_USER",
        Tenant => "TENANT",
        Ip => "IP",
        EndpointGroup => "ENDPOINT_GROUP",
    }
}

wire_enum! {
    /// Named scope distinguishing parallel rate limits on one target.
    pub enum ActionScope {
        Auth => "AUTH",
        Ai => "AI",
        Exports => "EXPORTS",
        Global => "GLOBAL",
    }
}

wire_enum! {
    /// `APPLIED` is the only initial state; the other three are terminal.
    pub enum ActionStatus {
        Applied => "APPLIED",
        Expired => "EXPIRED",
        Reverted => "REVERTED",
        Failed => "FAILED",
    }
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionStatus::Applied)
    }
}

wire_enum! {
    pub enum CreatedByType {
        System => "SYSTEM",
        SaasUser => "SAAS_USER",
    }
}

/// Durable record of an enforcement action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionLog {
    pub id: Uuid,
    pub incident_id: Option<Uuid>,
    pub action_type: ActionType,
    pub target_type: TargetType,
    pub target_id: String,
    pub scope: Option<ActionScope>,
    pub params: serde_json::Value,
    pub reason: String,
    pub status: ActionStatus,
    pub created_by_type: CreatedByType,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
    pub revoke_reason: Option<String>,
}

/// Live projection of an applied action, looked up on the request path.
///
/// Derived from [`ActionLog`]; one row per `(target, action type, scope)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnforcementState {
    pub id: Uuid,
    pub action_log_id: Uuid,
    pub action_type: ActionType,
    pub target_type: TargetType,
    pub target_id: String,
    pub scope: Option<ActionScope>,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EnforcementState {
    /// Seconds until expiry, clamped at zero.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> i64 {
        let remaining = (self.expires_at - now).num_milliseconds();
        // round up so clients never retry early
        ((remaining + 999) / 1000).max(0)
    }
}
