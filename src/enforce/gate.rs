//! Request-path admission: "is this caller currently restricted?"
//!
//! The gate is the consumer side of enforcement state. It never blocks on
//! writers and treats a failed lookup as "not enforced" unless the request
//! scope is configured to fail closed.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, warn};

use super::{ActionScope, ActionType, EnforceError, EnforcementState, TargetType};
use crate::clock::Clock;
use crate::events::{hash_ip, ActorType};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_TYPE_HEADER: &str = "x-actor-type";
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const SCOPE_HEADER: &str = "x-guardian-scope";

/// Read access to live enforcement state.
#[async_trait]
pub trait EnforcementLookup: Send + Sync {
    async fn lookup(
        &self,
        target_type: TargetType,
        target_id: &str,
        scope: Option<ActionScope>,
    ) -> Result<Option<EnforcementState>, EnforceError>;
}

/// Who is making a request, as far as enforcement is concerned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subject {
    pub actor_type: Option<ActorType>,
    pub actor_id: Option<String>,
    pub tenant_id: Option<String>,
    pub ip_hash: Option<String>,
    pub scope: Option<ActionScope>,
}

impl Subject {
    /// Build a subject from request headers. Unparseable values are ignored.
    pub fn from_headers(headers: &HeaderMap, ip_hash_salt: &str) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let ip_hash = text(FORWARDED_FOR_HEADER)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(|ip| hash_ip(ip, ip_hash_salt));

        Self {
            actor_type: text(ACTOR_TYPE_HEADER).and_then(|v| v.parse().ok()),
            actor_id: text(ACTOR_ID_HEADER).map(str::to_string),
            tenant_id: text(TENANT_ID_HEADER).map(str::to_string),
            ip_hash,
            scope: text(SCOPE_HEADER).and_then(|v| v.parse().ok()),
        }
    }

    /// Targets to check, most specific first.
    fn targets(&self) -> Vec<(TargetType, &str)> {
        let mut targets = Vec::with_capacity(3);
        if let Some(actor) = self.actor_id.as_deref() {
            if matches!(self.actor_type, None | Some(ActorType::TenantUser)) {
                targets.push((TargetType::TenantUser, actor));
            }
        }
        if let Some(tenant) = self.tenant_id.as_deref() {
            targets.push((TargetType::Tenant, tenant));
        }
        if let Some(ip) = self.ip_hash.as_deref() {
            targets.push((TargetType::Ip, ip));
        }
        targets
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    Restricted {
        state: EnforcementState,
        retry_after_secs: i64,
    },
    /// The lookup failed for a fail-closed scope.
    Unavailable,
}

impl IntoResponse for Admission {
    fn into_response(self) -> Response {
        match self {
            Admission::Admitted => StatusCode::NO_CONTENT.into_response(),
            Admission::Restricted {
                state,
                retry_after_secs,
            } => {
                let status = match state.action_type {
                    ActionType::RateLimit => StatusCode::TOO_MANY_REQUESTS,
                    ActionType::LockUserTemp | ActionType::RequireReauth => StatusCode::LOCKED,
                };
                let body = Json(json!({
                    "error": "temporarily restricted",
                    "retry_after": state.expires_at,
                }));
                let mut response = (status, body).into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            Admission::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "enforcement check unavailable"})),
            )
                .into_response(),
        }
    }
}

/// Decides whether a request may proceed.
#[derive(Clone)]
pub struct AdmissionGate {
    lookup: Arc<dyn EnforcementLookup>,
    clock: Arc<dyn Clock>,
    fail_closed_scopes: Vec<ActionScope>,
    ip_hash_salt: String,
}

impl AdmissionGate {
    pub fn new(lookup: Arc<dyn EnforcementLookup>, clock: Arc<dyn Clock>) -> Self {
        Self {
            lookup,
            clock,
            fail_closed_scopes: Vec::new(),
            ip_hash_salt: String::new(),
        }
    }

    pub fn with_fail_closed_scopes(mut self, scopes: Vec<ActionScope>) -> Self {
        self.fail_closed_scopes = scopes;
        self
    }

    pub fn with_ip_hash_salt(mut self, salt: impl Into<String>) -> Self {
        self.ip_hash_salt = salt.into();
        self
    }

    pub fn ip_hash_salt(&self) -> &str {
        &self.ip_hash_salt
    }

    /// Check every target the subject maps to; the first restriction wins.
    pub async fn check(&self, subject: &Subject) -> Admission {
        for (target_type, target_id) in subject.targets() {
            match self.lookup.lookup(target_type, target_id, subject.scope).await {
                Ok(Some(state)) => {
                    let retry_after_secs = state.retry_after_secs(self.clock.now());
                    debug!(
                        %target_type,
                        target = %target_id,
                        action = %state.action_type,
                        retry_after_secs,
                        "request restricted"
                    );
                    return Admission::Restricted {
                        state,
                        retry_after_secs,
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    let fail_closed = subject
                        .scope
                        .is_some_and(|scope| self.fail_closed_scopes.contains(&scope));
                    warn!(
                        %target_type,
                        target = %target_id,
                        scope = ?subject.scope,
                        fail_closed,
                        error = %e,
                        "enforcement lookup failed"
                    );
                    if fail_closed {
                        return Admission::Unavailable;
                    }
                }
            }
        }
        Admission::Admitted
    }
}

/// Axum middleware: reject restricted callers before the handler runs.
///
/// ```ignore
/// router.layer(axum::middleware::from_fn_with_state(gate, require_admission))
/// ```
pub async fn require_admission(State(gate): State<Arc<AdmissionGate>>, request: Request, next: Next) -> Response {
    let subject = Subject::from_headers(request.headers(), gate.ip_hash_salt());
    match gate.check(&subject).await {
        Admission::Admitted => next.run(request).await,
        denied => denied.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::StoreError;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use chrono::{Duration, TimeZone, Utc};
    use tower::ServiceExt;
    use uuid::Uuid;

    enum Stub {
        Nothing,
        Restricted(ActionType),
        Broken,
    }

    #[async_trait]
    impl EnforcementLookup for Stub {
        async fn lookup(
            &self,
            target_type: TargetType,
            target_id: &str,
            scope: Option<ActionScope>,
        ) -> Result<Option<EnforcementState>, EnforceError> {
            match self {
                Stub::Nothing => Ok(None),
                Stub::Restricted(action_type) => {
                    let created_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
                    Ok(Some(EnforcementState {
                        id: Uuid::new_v4(),
                        action_log_id: Uuid::new_v4(),
                        action_type: *action_type,
                        target_type,
                        target_id: target_id.to_string(),
                        scope,
                        params: json!({}),
                        created_at,
                        expires_at: created_at + Duration::minutes(10),
                    }))
                }
                Stub::Broken => Err(EnforceError::Store(StoreError::Sqlite(
                    rusqlite::Error::InvalidQuery,
                ))),
            }
        }
    }

    fn gate(stub: Stub) -> AdmissionGate {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
        AdmissionGate::new(Arc::new(stub), clock)
    }

    fn user(scope: Option<ActionScope>) -> Subject {
        Subject {
            actor_type: Some(ActorType::TenantUser),
            actor_id: Some("u1".to_string()),
            scope,
            ..Subject::default()
        }
    }

    #[tokio::test]
    async fn test_no_enforcement_admits() {
        assert_eq!(gate(Stub::Nothing).check(&user(None)).await, Admission::Admitted);
    }

    #[tokio::test]
    async fn test_restriction_reports_retry_after() {
        let admission = gate(Stub::Restricted(ActionType::LockUserTemp)).check(&user(None)).await;
        match admission {
            Admission::Restricted {
                state,
                retry_after_secs,
            } => {
                assert_eq!(state.target_type, TargetType::TenantUser);
                assert_eq!(retry_after_secs, 600);
            }
            other => panic!("expected restriction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_open_by_default() {
        let admission = gate(Stub::Broken).check(&user(Some(ActionScope::Exports))).await;
        assert_eq!(admission, Admission::Admitted);
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_closed_for_listed_scope() {
        let gate = gate(Stub::Broken).with_fail_closed_scopes(vec![ActionScope::Exports]);
        assert_eq!(gate.check(&user(Some(ActionScope::Exports))).await, Admission::Unavailable);
        assert_eq!(gate.check(&user(Some(ActionScope::Ai))).await, Admission::Admitted);
    }

    #[test]
    fn test_subject_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_ID_HEADER, HeaderValue::from_static("u1"));
        headers.insert(ACTOR_TYPE_HEADER, HeaderValue::from_static("TENANT_USER"));
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert(SCOPE_HEADER, HeaderValue::from_static("AI"));

        let subject = Subject::from_headers(&headers, "salt");
        assert_eq!(subject.actor_type, Some(ActorType::TenantUser));
        assert_eq!(subject.actor_id.as_deref(), Some("u1"));
        assert_eq!(subject.ip_hash, Some(hash_ip("203.0.113.9", "salt")));
        assert_eq!(subject.scope, Some(ActionScope::Ai));
        assert!(subject.tenant_id.is_none());
    }

    #[test]
    fn test_admin_actor_is_not_a_user_target() {
        let subject = Subject {
            actor_type: Some(ActorType::SaasAdmin),
            actor_id: Some("admin".to_string()),
            ip_hash: Some("h".to_string()),
            ..Subject::default()
        };
        assert_eq!(subject.targets(), vec![(TargetType::Ip, "h")]);
    }

    async fn status_through_middleware(stub: Stub) -> (StatusCode, Option<String>) {
        let gate = Arc::new(gate(stub));
        let app = Router::new()
            .route("/export", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(gate, require_admission));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/export")
                    .header(ACTOR_ID_HEADER, "u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .map(|v| v.to_str().unwrap().to_string());
        (response.status(), retry_after)
    }

    #[tokio::test]
    async fn test_middleware_status_codes() {
        assert_eq!(status_through_middleware(Stub::Nothing).await, (StatusCode::OK, None));
        assert_eq!(
            status_through_middleware(Stub::Restricted(ActionType::RateLimit)).await,
            (StatusCode::TOO_MANY_REQUESTS, Some("600".to_string()))
        );
        assert_eq!(
            status_through_middleware(Stub::Restricted(ActionType::RequireReauth)).await,
            (StatusCode::LOCKED, Some("600".to_string()))
        );
    }
}
