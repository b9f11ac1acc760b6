//! Security event model and fire-and-forget ingestion.

pub mod emitter;

pub use self::emitter::EventEmitter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::wire::wire_enum;

wire_enum! {
    /// The closed set of security-relevant occurrences the engine understands.
    pub enum SecurityEventType {
        LoginFailed => "LOGIN_FAILED",
        LoginSuccess => "LOGIN_SUCCESS",
        AuthDenied => "AUTH_DENIED",
        FeatureBlocked => "FEATURE_BLOCKED",
        SubscriptionBlocked => "SUBSCRIPTION_BLOCKED",
        CrossTenantAttempt => "CROSS_TENANT_ATTEMPT",
        ExportRequested => "EXPORT_REQUESTED",
        AiRequest => "AI_REQUEST",
        ImpersonationStart => "IMPERSONATION_START",
        ImpersonationEnd => "IMPERSONATION_END",
    }
}

wire_enum! {
    /// Who performed the action that produced an event.
    pub enum ActorType {
        TenantUser => "TENANT_USER",
        SaasAdmin => "SAAS_ADMIN",
        Anonymous => "ANONYMOUS",
        System => "SYSTEM",
    }
}

/// An immutable security fact recorded by the request pipeline.
///
/// Events are never mutated after creation. Optional fields are `None`
/// when the producing request did not carry that context (anonymous or
/// global events have no tenant, background jobs have no IP).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityEvent {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tenant_id: Option<String>,
    pub actor_type: ActorType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub actor_id: Option<String>,
    /// Salted SHA-256 of the client IP, see [`hash_ip`].
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ip_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<String>,
    pub event_type: SecurityEventType,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    /// Create an event of `event_type` at `created_at` with every optional
    /// field unset.
    pub fn new(event_type: SecurityEventType, actor_type: ActorType, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: None,
            actor_type,
            actor_id: None,
            ip_hash: None,
            user_agent: None,
            route: None,
            method: None,
            status_code: None,
            error_code: None,
            event_type,
            metadata: serde_json::Value::Object(Default::default()),
            created_at,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Set an already-hashed IP.
    pub fn with_ip_hash(mut self, ip_hash: impl Into<String>) -> Self {
        self.ip_hash = Some(ip_hash.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the route, HTTP method and response status in one go.
    pub fn with_request(mut self, method: impl Into<String>, route: impl Into<String>, status: u16) -> Self {
        self.method = Some(method.into());
        self.route = Some(route.into());
        self.status_code = Some(status);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Hash a client IP with a deployment salt. Raw IPs are never stored.
pub fn hash_ip(ip: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(ip.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_builder() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let event = SecurityEvent::new(SecurityEventType::LoginFailed, ActorType::TenantUser, at)
            .with_tenant("t1")
            .with_actor_id("u1")
            .with_ip_hash("abc")
            .with_request("POST", "/api/auth/login", 401)
            .with_error_code("INVALID_PASSWORD");

        assert_eq!(event.tenant_id.as_deref(), Some("t1"));
        assert_eq!(event.actor_id.as_deref(), Some("u1"));
        assert_eq!(event.status_code, Some(401));
        assert_eq!(event.created_at, at);
        assert!(event.user_agent.is_none());
    }

    #[test]
    fn test_event_json_uses_wire_names_and_omits_unset_fields() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let event = SecurityEvent::new(SecurityEventType::CrossTenantAttempt, ActorType::Anonymous, at);
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"CROSS_TENANT_ATTEMPT\""));
        assert!(json.contains("\"ANONYMOUS\""));
        assert!(!json.contains("\"tenant_id\""));
        assert!(!json.contains("\"ip_hash\""));
    }

    #[test]
    fn test_hash_ip_is_salted_and_stable() {
        let a = hash_ip("203.0.113.7", "pepper");
        let b = hash_ip(" 203.0.113.7 ", "pepper");
        let c = hash_ip("203.0.113.7", "other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_ip_is_lowercase_sha256_hex() {
        assert_eq!(
            hash_ip("10.0.0.1", "salt"),
            "0b11fb3ea84146284459a65b8708edb5fb1e0235b18e7a8b9231d09adaacf94b"
        );
    }
}
