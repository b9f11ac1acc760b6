//! Applying, checking, revoking and expiring enforcement actions.
//!
//! Public entry points keep a "never throw to the request path" contract:
//! store failures are logged and turned into `None`/`false`. The `try_*`
//! variants expose the underlying [`EnforceError`] for callers that need to
//! tell a validation failure from an outage.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::gate::EnforcementLookup;
use super::params;
use super::{
    ActionLog, ActionScope, ActionStatus, ActionType, CreatedByType, EnforceError, EnforcementState,
    TargetType,
};
use crate::clock::Clock;
use crate::storage::{run_blocking, SharedStore};

/// Everything needed to apply one action.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action_type: ActionType,
    pub target_type: TargetType,
    pub target_id: String,
    /// Explicit scope; for rate limits `params.scope` is used when unset.
    pub scope: Option<ActionScope>,
    pub params: Value,
    pub reason: String,
    /// Operator identity for manual actions; `None` for automation.
    pub created_by: Option<String>,
    pub incident_id: Option<Uuid>,
}

impl ActionRequest {
    pub fn new(action_type: ActionType, target_type: TargetType, target_id: impl Into<String>) -> Self {
        Self {
            action_type,
            target_type,
            target_id: target_id.into(),
            scope: None,
            params: Value::Object(Default::default()),
            reason: String::new(),
            created_by: None,
            incident_id: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_scope(mut self, scope: ActionScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn created_by(mut self, operator: impl Into<String>) -> Self {
        self.created_by = Some(operator.into());
        self
    }

    pub fn for_incident(mut self, incident_id: Uuid) -> Self {
        self.incident_id = Some(incident_id);
        self
    }
}

/// Counts from one expiry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupOutcome {
    /// Action logs moved from APPLIED to EXPIRED.
    pub expired_logs: usize,
    /// Enforcement rows deleted.
    pub deleted_states: usize,
}

/// Persists actions and answers "is this target enforced right now".
#[derive(Clone)]
pub struct ActionEnforcer {
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl ActionEnforcer {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Apply an action. Returns the action log id, or `None` if nothing
    /// was recorded.
    pub async fn apply_action(&self, request: ActionRequest) -> Option<Uuid> {
        let action = request.action_type;
        let target = request.target_id.clone();
        match self.try_apply_action(request).await {
            Ok(id) => Some(id),
            Err(e) if e.is_validation() => {
                warn!(%action, target = %target, error = %e, "action rejected");
                None
            }
            Err(e) => {
                error!(%action, target = %target, error = %e, "failed to apply action");
                None
            }
        }
    }

    /// Apply an action, surfacing why it was not applied.
    ///
    /// The enforcement row is written after the log; if that second write
    /// fails the log id is still returned and the next cleanup pass or an
    /// operator reconciles.
    pub async fn try_apply_action(&self, request: ActionRequest) -> Result<Uuid, EnforceError> {
        let now = self.clock.now();
        let resolved = params::resolve(request.action_type, &request.params, now)?;
        let scope = request.scope.or(resolved.scope);

        let log = ActionLog {
            id: Uuid::new_v4(),
            incident_id: request.incident_id,
            action_type: request.action_type,
            target_type: request.target_type,
            target_id: request.target_id.clone(),
            scope,
            params: request.params.clone(),
            reason: request.reason,
            status: ActionStatus::Applied,
            created_by_type: if request.created_by.is_some() {
                CreatedByType::SaasUser
            } else {
                CreatedByType::System
            },
            created_by: request.created_by,
            created_at: now,
            expires_at: resolved.expires_at,
            ended_at: None,
            revoked_by: None,
            revoke_reason: None,
        };
        let state = EnforcementState {
            id: Uuid::new_v4(),
            action_log_id: log.id,
            action_type: log.action_type,
            target_type: log.target_type,
            target_id: log.target_id.clone(),
            scope,
            params: request.params,
            created_at: now,
            expires_at: resolved.expires_at,
        };

        let log_id = log.id;
        run_blocking(&self.store, move |s| s.insert_action_log(&log)).await?;

        if let Err(e) = run_blocking(&self.store, move |s| s.upsert_enforcement(&state)).await {
            error!(
                action_log_id = %log_id,
                error = %e,
                "action logged but enforcement state write failed"
            );
        }

        info!(
            action_log_id = %log_id,
            action = %request.action_type,
            target_type = %request.target_type,
            target = %request.target_id,
            scope = ?scope,
            expires_at = %resolved.expires_at,
            "action applied"
        );
        Ok(log_id)
    }

    /// The live enforcement for a target, if any.
    ///
    /// Fails open: a store error is logged and reported as "not enforced".
    pub async fn check_enforcement(
        &self,
        target_type: TargetType,
        target_id: &str,
        scope: Option<ActionScope>,
    ) -> Option<EnforcementState> {
        match self.try_check_enforcement(target_type, target_id, scope).await {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    %target_type,
                    target = %target_id,
                    error = %e,
                    "enforcement check failed; admitting (fail-open)"
                );
                None
            }
        }
    }

    pub async fn try_check_enforcement(
        &self,
        target_type: TargetType,
        target_id: &str,
        scope: Option<ActionScope>,
    ) -> Result<Option<EnforcementState>, EnforceError> {
        let now = self.clock.now();
        let target = target_id.to_string();
        let state = run_blocking(&self.store, move |s| {
            s.find_enforcement(target_type, &target, scope, now)
        })
        .await?;
        Ok(state)
    }

    /// Revoke an action: mark the log REVERTED and drop its live row.
    ///
    /// Revoking an already-terminal action changes nothing in the log and
    /// still reports success. `false` means the log does not exist or the
    /// store failed.
    pub async fn revoke_action(&self, action_log_id: Uuid, reason: &str, revoked_by: &str) -> bool {
        match self.try_revoke_action(action_log_id, reason, revoked_by).await {
            Ok(()) => true,
            Err(EnforceError::ActionNotFound(_)) => {
                debug!(action_log_id = %action_log_id, "revoke of unknown action");
                false
            }
            Err(e) => {
                error!(action_log_id = %action_log_id, error = %e, "failed to revoke action");
                false
            }
        }
    }

    pub async fn try_revoke_action(&self, action_log_id: Uuid, reason: &str, revoked_by: &str) -> Result<(), EnforceError> {
        let now = self.clock.now();
        let by = revoked_by.to_string();
        let why = reason.to_string();
        let reverted = run_blocking(&self.store, move |s| {
            s.mark_action_reverted(action_log_id, &by, &why, now)
        })
        .await?;

        if !reverted {
            let existing = run_blocking(&self.store, move |s| s.get_action_log(action_log_id)).await?;
            match existing {
                None => return Err(EnforceError::ActionNotFound(action_log_id)),
                Some(log) => debug!(
                    action_log_id = %action_log_id,
                    status = %log.status,
                    "action already terminal; revoke is a no-op"
                ),
            }
        }

        let removed = run_blocking(&self.store, move |s| s.delete_enforcement_for_action(action_log_id)).await?;
        info!(
            action_log_id = %action_log_id,
            revoked_by = %revoked_by,
            removed_states = removed,
            "action revoked"
        );
        Ok(())
    }

    /// Expire stale logs and delete expired enforcement rows.
    ///
    /// The phases are independent: a failure to update the logs never
    /// stops the enforcement rows from being swept.
    pub async fn cleanup_expired(&self) -> CleanupOutcome {
        let now = self.clock.now();
        let mut outcome = CleanupOutcome::default();

        match run_blocking(&self.store, move |s| s.expire_action_logs(now)).await {
            Ok(n) => outcome.expired_logs = n,
            Err(e) => error!(error = %e, "failed to expire action logs"),
        }

        match run_blocking(&self.store, move |s| s.delete_expired_enforcement(now)).await {
            Ok(n) => outcome.deleted_states = n,
            Err(e) => error!(error = %e, "failed to delete expired enforcement state"),
        }

        if outcome.expired_logs > 0 || outcome.deleted_states > 0 {
            info!(
                expired_logs = outcome.expired_logs,
                deleted_states = outcome.deleted_states,
                "expired enforcement cleaned up"
            );
        }
        outcome
    }

    pub async fn get_action(&self, id: Uuid) -> Result<ActionLog, EnforceError> {
        run_blocking(&self.store, move |s| s.get_action_log(id))
            .await?
            .ok_or(EnforceError::ActionNotFound(id))
    }

    pub async fn list_actions(&self, status: Option<ActionStatus>, limit: usize) -> Result<Vec<ActionLog>, EnforceError> {
        let logs = run_blocking(&self.store, move |s| s.list_action_logs(status, limit)).await?;
        Ok(logs)
    }

    pub async fn list_active(&self) -> Result<Vec<EnforcementState>, EnforceError> {
        let now = self.clock.now();
        let states = run_blocking(&self.store, move |s| s.list_active_enforcement(now)).await?;
        Ok(states)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[async_trait]
impl EnforcementLookup for ActionEnforcer {
    async fn lookup(
        &self,
        target_type: TargetType,
        target_id: &str,
        scope: Option<ActionScope>,
    ) -> Result<Option<EnforcementState>, EnforceError> {
        self.try_check_enforcement(target_type, target_id, scope).await
    }
}
