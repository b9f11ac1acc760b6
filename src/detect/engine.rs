//! Threshold evaluation: window, group, count, raise, act.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::detect::incident::IncidentManager;
use crate::detect::policy::{default_policies, enforcement_target, group_events, Policy, PolicyInput};
use crate::detect::DetectError;
use crate::enforce::{ActionEnforcer, ActionRequest, ActionType};
use crate::events::SecurityEvent;
use crate::storage::{run_blocking, SharedStore};

const ENABLED_POLICIES: &str = "enabled";

/// `now - secs`, or `None` when that is not a representable instant.
fn seconds_before(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_seconds(secs).and_then(|d| now.checked_sub_signed(d))
}

/// Outcome of evaluating one policy.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvaluationResult {
    pub policy_id: Uuid,
    pub policy_name: String,
    /// A group reached the threshold, whether or not an incident was raised.
    pub triggered: bool,
    /// Triggered inside the cooldown period; no incident was raised.
    pub suppressed: bool,
    /// Size of the triggering group, or every event in the window when
    /// nothing triggered.
    pub event_count: usize,
    pub group_key: Option<String>,
    pub incident_id: Option<Uuid>,
    pub action_log_id: Option<Uuid>,
    /// Why evaluation did not complete normally.
    pub reason: Option<String>,
}

impl EvaluationResult {
    fn quiet(policy: &Policy, event_count: usize) -> Self {
        Self {
            policy_id: policy.id,
            policy_name: policy.name.clone(),
            triggered: false,
            suppressed: false,
            event_count,
            group_key: None,
            incident_id: None,
            action_log_id: None,
            reason: None,
        }
    }

    fn failed(policy: &Policy, reason: String) -> Self {
        Self {
            reason: Some(reason),
            ..Self::quiet(policy, 0)
        }
    }
}

/// Evaluates policies against recent events and owns policy administration.
pub struct PolicyEngine {
    store: SharedStore,
    incidents: IncidentManager,
    enforcer: Arc<ActionEnforcer>,
    clock: Arc<dyn Clock>,
    policy_cache: TtlCache<&'static str, Vec<Policy>>,
}

impl PolicyEngine {
    pub fn new(
        store: SharedStore,
        enforcer: Arc<ActionEnforcer>,
        clock: Arc<dyn Clock>,
        policy_cache_ttl: Duration,
    ) -> Self {
        let incidents = IncidentManager::new(store.clone(), clock.clone());
        Self {
            store,
            incidents,
            enforcer,
            clock,
            policy_cache: TtlCache::new(policy_cache_ttl),
        }
    }

    pub fn incidents(&self) -> &IncidentManager {
        &self.incidents
    }

    /// Evaluate one policy. Never fails: store errors come back as an
    /// untriggered result carrying a reason.
    pub async fn evaluate_policy(&self, policy: &Policy) -> EvaluationResult {
        let now = self.clock.now();
        let Some(window_start) = seconds_before(now, policy.window_seconds) else {
            warn!(policy = %policy.name, window_seconds = policy.window_seconds, "window out of range");
            return EvaluationResult::failed(policy, format!("window_seconds {} out of range", policy.window_seconds));
        };
        let event_type = policy.event_type;

        let events = match run_blocking(&self.store, move |s| s.events_since(event_type, window_start)).await {
            Ok(events) => events,
            Err(e) => {
                warn!(policy = %policy.name, error = %e, "failed to fetch events for policy");
                return EvaluationResult::failed(policy, format!("event fetch failed: {e}"));
            }
        };

        if events.is_empty() {
            return EvaluationResult::quiet(policy, 0);
        }

        let threshold = usize::try_from(policy.threshold).unwrap_or(usize::MAX);
        let groups = group_events(policy.group_by, &events);
        let Some((key, members)) = groups.into_iter().find(|(_, members)| members.len() >= threshold) else {
            debug!(policy = %policy.name, events = events.len(), "below threshold");
            return EvaluationResult::quiet(policy, events.len());
        };

        let mut result = EvaluationResult {
            triggered: true,
            event_count: members.len(),
            group_key: Some(key.clone()),
            ..EvaluationResult::quiet(policy, 0)
        };

        let Some(cooldown_start) = seconds_before(now, policy.cooldown_seconds) else {
            warn!(policy = %policy.name, cooldown_seconds = policy.cooldown_seconds, "cooldown out of range");
            result.reason = Some(format!("cooldown_seconds {} out of range", policy.cooldown_seconds));
            return result;
        };
        match self.incidents.raised_since(policy.id, cooldown_start).await {
            Ok(true) => {
                debug!(policy = %policy.name, group = %key, "incident suppressed by cooldown");
                result.suppressed = true;
                return result;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(policy = %policy.name, error = %e, "cooldown check failed");
                result.reason = Some(format!("cooldown check failed: {e}"));
                return result;
            }
        }

        let summary = format!(
            "{}: {} {} events for {} within {}s (threshold {})",
            policy.name,
            members.len(),
            policy.event_type,
            key,
            policy.window_seconds,
            policy.threshold
        );
        let incident = match self
            .incidents
            .record_incident(policy.id, policy.severity, summary, &members)
            .await
        {
            Ok(incident) => incident,
            Err(e) => {
                warn!(policy = %policy.name, error = %e, "failed to record incident");
                result.reason = Some(format!("incident write failed: {e}"));
                return result;
            }
        };
        result.incident_id = Some(incident.id);

        info!(
            policy = %policy.name,
            incident = %incident.id,
            severity = %policy.severity,
            group = %key,
            count = members.len(),
            "incident raised"
        );

        if let Some(action_type) = policy.action_type {
            result.action_log_id = self.act(policy, action_type, &key, &members, incident.id).await;
        }
        result
    }

    async fn act(
        &self,
        policy: &Policy,
        action_type: ActionType,
        key: &str,
        members: &[&SecurityEvent],
        incident_id: Uuid,
    ) -> Option<Uuid> {
        let Some((target_type, target_id)) = enforcement_target(policy.group_by, key, members) else {
            info!(policy = %policy.name, group = %key, "no concrete target; skipping automated action");
            return None;
        };

        let request = ActionRequest::new(action_type, target_type, target_id)
            .with_params(policy.action_params.clone())
            .with_reason(format!("policy {} triggered", policy.name))
            .for_incident(incident_id);
        self.enforcer.apply_action(request).await
    }

    /// Evaluate every enabled policy in turn.
    pub async fn evaluate_all_policies(&self) -> Vec<EvaluationResult> {
        let policies = match self.enabled_policies().await {
            Ok(policies) => policies,
            Err(e) => {
                warn!(error = %e, "failed to load enabled policies");
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(policies.len());
        for policy in &policies {
            results.push(self.evaluate_policy(policy).await);
        }

        let triggered = results.iter().filter(|r| r.triggered).count();
        info!(policies = results.len(), triggered, "evaluation pass complete");
        results
    }

    async fn enabled_policies(&self) -> Result<Vec<Policy>, DetectError> {
        if let Some(cached) = self.policy_cache.get(&ENABLED_POLICIES) {
            return Ok(cached);
        }
        let policies = run_blocking(&self.store, |s| s.list_policies(true)).await?;
        self.policy_cache.insert(ENABLED_POLICIES, policies.clone());
        Ok(policies)
    }

    /// Drop the cached policy list so the next pass re-reads the store.
    pub fn invalidate_policies(&self) {
        self.policy_cache.invalidate_all();
    }

    // -- administration ------------------------------------------------------

    pub async fn create_policy(&self, input: PolicyInput) -> Result<Policy, DetectError> {
        let policy = Policy::create(input, self.clock.now())?;
        let row = policy.clone();
        run_blocking(&self.store, move |s| s.insert_policy(&row)).await?;
        self.invalidate_policies();
        info!(policy = %policy.name, id = %policy.id, "policy created");
        Ok(policy)
    }

    pub async fn update_policy(&self, id: Uuid, input: PolicyInput) -> Result<Policy, DetectError> {
        let current = self.get_policy(id).await?;
        let updated = current.apply(input, self.clock.now())?;
        let row = updated.clone();
        if !run_blocking(&self.store, move |s| s.update_policy(&row)).await? {
            return Err(DetectError::PolicyNotFound(id));
        }
        self.invalidate_policies();
        info!(policy = %updated.name, id = %id, "policy updated");
        Ok(updated)
    }

    pub async fn set_policy_enabled(&self, id: Uuid, enabled: bool) -> Result<Policy, DetectError> {
        let now = self.clock.now();
        if !run_blocking(&self.store, move |s| s.set_policy_enabled(id, enabled, now)).await? {
            return Err(DetectError::PolicyNotFound(id));
        }
        self.invalidate_policies();
        info!(id = %id, enabled, "policy toggled");
        self.get_policy(id).await
    }

    pub async fn get_policy(&self, id: Uuid) -> Result<Policy, DetectError> {
        run_blocking(&self.store, move |s| s.get_policy(id))
            .await?
            .ok_or(DetectError::PolicyNotFound(id))
    }

    pub async fn list_policies(&self, enabled_only: bool) -> Result<Vec<Policy>, DetectError> {
        let policies = run_blocking(&self.store, move |s| s.list_policies(enabled_only)).await?;
        Ok(policies)
    }

    /// Insert the default policy set if the store holds no policies yet.
    /// Returns how many were inserted.
    pub async fn seed_defaults(&self) -> Result<usize, DetectError> {
        if !self.list_policies(false).await?.is_empty() {
            return Ok(0);
        }
        let mut inserted = 0;
        for input in default_policies() {
            self.create_policy(input).await?;
            inserted += 1;
        }
        info!(inserted, "default policies seeded");
        Ok(inserted)
    }
}
