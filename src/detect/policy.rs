//! Threshold policies, event grouping and the out-of-box policy set.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::detect::{DetectError, Severity};
use crate::enforce::{params, ActionType, TargetType};
use crate::events::{ActorType, SecurityEvent, SecurityEventType};
use crate::wire::wire_enum;

pub const UNKNOWN_IP: &str = "unknown_ip";
pub const UNKNOWN_ACTOR: &str = "unknown_actor";
pub const UNKNOWN_TENANT: &str = "unknown_tenant";
pub const UNKNOWN: &str = "unknown";

/// Cooldown applied when a policy is created without one.
pub const DEFAULT_COOLDOWN_SECONDS: i64 = 900;

/// Longest window or cooldown a policy may declare: one year.
pub const MAX_POLICY_SECONDS: i64 = 365 * 24 * 60 * 60;

wire_enum! {
    /// The dimension events are counted over.
    pub enum PolicyGroupBy {
        Ip => "IP",
        Actor => "ACTOR",
        Tenant => "TENANT",
        IpOrActor => "IP_OR_ACTOR",
    }
}

/// A named threshold rule over one event type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub window_seconds: i64,
    pub threshold: i64,
    pub group_by: PolicyGroupBy,
    pub action_type: Option<ActionType>,
    pub action_params: Value,
    pub cooldown_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Administrator-supplied fields for creating or replacing a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub window_seconds: i64,
    pub threshold: i64,
    pub group_by: PolicyGroupBy,
    #[serde(default)]
    pub action_type: Option<ActionType>,
    #[serde(default)]
    pub action_params: Value,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: i64,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown() -> i64 {
    DEFAULT_COOLDOWN_SECONDS
}

impl Policy {
    /// Build a new policy from admin input. The result is validated.
    pub fn create(input: PolicyInput, now: DateTime<Utc>) -> Result<Self, DetectError> {
        let policy = Self {
            id: Uuid::new_v4(),
            name: input.name,
            description: input.description,
            enabled: input.enabled,
            event_type: input.event_type,
            severity: input.severity,
            window_seconds: input.window_seconds,
            threshold: input.threshold,
            group_by: input.group_by,
            action_type: input.action_type,
            action_params: normalize_params(input.action_params),
            cooldown_seconds: input.cooldown_seconds,
            created_at: now,
            updated_at: now,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Replace every admin-editable field, keeping identity and creation time.
    pub fn apply(&self, input: PolicyInput, now: DateTime<Utc>) -> Result<Self, DetectError> {
        let updated = Self {
            id: self.id,
            created_at: self.created_at,
            ..Self::create(input, now)?
        };
        Ok(updated)
    }

    pub fn validate(&self) -> Result<(), DetectError> {
        if self.name.trim().is_empty() {
            return Err(DetectError::InvalidPolicy("name must not be empty".into()));
        }
        if self.threshold < 1 {
            return Err(DetectError::InvalidPolicy(format!(
                "threshold must be at least 1, got {}",
                self.threshold
            )));
        }
        if self.window_seconds <= 0 || self.window_seconds > MAX_POLICY_SECONDS {
            return Err(DetectError::InvalidPolicy(format!(
                "window_seconds must be between 1 and {MAX_POLICY_SECONDS}, got {}",
                self.window_seconds
            )));
        }
        if self.cooldown_seconds < 0 || self.cooldown_seconds > MAX_POLICY_SECONDS {
            return Err(DetectError::InvalidPolicy(format!(
                "cooldown_seconds must be between 0 and {MAX_POLICY_SECONDS}, got {}",
                self.cooldown_seconds
            )));
        }
        if let Some(action) = self.action_type {
            params::validate(action, &self.action_params)
                .map_err(|e| DetectError::InvalidPolicy(e.to_string()))?;
        }
        Ok(())
    }
}

fn normalize_params(params: Value) -> Value {
    if params.is_null() {
        json!({})
    } else {
        params
    }
}

/// The key an event is counted under for `group_by`.
pub fn group_key(group_by: PolicyGroupBy, event: &SecurityEvent) -> String {
    match group_by {
        PolicyGroupBy::Ip => event.ip_hash.clone().unwrap_or_else(|| UNKNOWN_IP.to_string()),
        PolicyGroupBy::Actor => event
            .actor_id
            .clone()
            .unwrap_or_else(|| UNKNOWN_ACTOR.to_string()),
        PolicyGroupBy::Tenant => event
            .tenant_id
            .clone()
            .unwrap_or_else(|| UNKNOWN_TENANT.to_string()),
        PolicyGroupBy::IpOrActor => event
            .actor_id
            .clone()
            .or_else(|| event.ip_hash.clone())
            .unwrap_or_else(|| UNKNOWN.to_string()),
    }
}

/// Partition events by group key, preserving first-seen order of the keys.
pub fn group_events(group_by: PolicyGroupBy, events: &[SecurityEvent]) -> Vec<(String, Vec<&SecurityEvent>)> {
    let mut groups: Vec<(String, Vec<&SecurityEvent>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for event in events {
        let key = group_key(group_by, event);
        match index.get(&key).copied() {
            Some(i) => groups[i].1.push(event),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![event]));
            }
        }
    }
    groups
}

/// Derive what to enforce against for a triggering group.
///
/// Returns `None` when the group has no concrete identity to act on (the
/// key is one of the `unknown*` fallbacks).
pub fn enforcement_target(group_by: PolicyGroupBy, key: &str, members: &[&SecurityEvent]) -> Option<(TargetType, String)> {
    let first = members.first()?;
    let target = match group_by {
        PolicyGroupBy::Ip => (TargetType::Ip, key.to_string()),
        PolicyGroupBy::Tenant => (TargetType::Tenant, key.to_string()),
        PolicyGroupBy::Actor | PolicyGroupBy::IpOrActor => {
            if first.actor_type == ActorType::TenantUser && first.actor_id.is_some() {
                (TargetType::TenantUser, key.to_string())
            } else {
                (TargetType::Ip, first.ip_hash.clone()?)
            }
        }
    };

    if [UNKNOWN_IP, UNKNOWN_ACTOR, UNKNOWN_TENANT, UNKNOWN].contains(&target.1.as_str()) {
        return None;
    }
    Some(target)
}

/// Out-of-box policies seeded into an empty store.
pub fn default_policies() -> Vec<PolicyInput> {
    vec![
        PolicyInput {
            name: "brute-force-login-actor".to_string(),
            description: Some("Repeated failed logins for one account".to_string()),
            enabled: true,
            event_type: SecurityEventType::LoginFailed,
            severity: Severity::High,
            window_seconds: 300,
            threshold: 5,
            group_by: PolicyGroupBy::Actor,
            action_type: Some(ActionType::LockUserTemp),
            action_params: json!({"durationMinutes": 15}),
            cooldown_seconds: 900,
        },
        PolicyInput {
            name: "login-spray-ip".to_string(),
            description: Some("Failed logins across accounts from one address".to_string()),
            enabled: true,
            event_type: SecurityEventType::LoginFailed,
            severity: Severity::Medium,
            window_seconds: 300,
            threshold: 20,
            group_by: PolicyGroupBy::Ip,
            action_type: Some(ActionType::RateLimit),
            action_params: json!({"durationHours": 1, "scope": "AUTH"}),
            cooldown_seconds: 900,
        },
        PolicyInput {
            name: "cross-tenant-probing".to_string(),
            description: Some("Attempts to reach another tenant's data".to_string()),
            enabled: true,
            event_type: SecurityEventType::CrossTenantAttempt,
            severity: Severity::Critical,
            window_seconds: 600,
            threshold: 3,
            group_by: PolicyGroupBy::IpOrActor,
            action_type: Some(ActionType::RequireReauth),
            action_params: json!({}),
            cooldown_seconds: 1800,
        },
        PolicyInput {
            name: "ai-abuse".to_string(),
            description: Some("AI request burst from one account".to_string()),
            enabled: true,
            event_type: SecurityEventType::AiRequest,
            severity: Severity::Medium,
            window_seconds: 60,
            threshold: 60,
            group_by: PolicyGroupBy::Actor,
            action_type: Some(ActionType::RateLimit),
            action_params: json!({"durationHours": 1, "scope": "AI"}),
            cooldown_seconds: 600,
        },
        PolicyInput {
            name: "export-abuse".to_string(),
            description: Some("Bulk exports from one tenant".to_string()),
            enabled: true,
            event_type: SecurityEventType::ExportRequested,
            severity: Severity::High,
            window_seconds: 3600,
            threshold: 20,
            group_by: PolicyGroupBy::Tenant,
            action_type: Some(ActionType::RateLimit),
            action_params: json!({"durationHours": 2, "scope": "EXPORTS"}),
            cooldown_seconds: 3600,
        },
        PolicyInput {
            name: "impersonation-burst".to_string(),
            description: Some("Unusual number of impersonation sessions by one admin".to_string()),
            enabled: true,
            event_type: SecurityEventType::ImpersonationStart,
            severity: Severity::High,
            window_seconds: 3600,
            threshold: 10,
            group_by: PolicyGroupBy::Actor,
            action_type: None,
            action_params: json!({}),
            cooldown_seconds: 3600,
        },
    ]
}
