//! API route definitions.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::error::ApiError;
use super::state::AppState;
use crate::audit::{self, AuditAction, AuditEntry};
use crate::detect::{DetectError, IncidentStatus, PolicyInput};
use crate::enforce::{ActionRequest, ActionScope, ActionStatus, ActionType, TargetType};
use crate::events::{hash_ip, ActorType, SecurityEvent, SecurityEventType};

pub const OPERATOR_HEADER: &str = "x-operator-id";

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest_event))
        .route("/policies", get(list_policies).post(create_policy))
        .route("/policies/{id}", get(get_policy).put(update_policy))
        .route("/policies/{id}/enable", post(enable_policy))
        .route("/policies/{id}/disable", post(disable_policy))
        .route("/incidents", get(list_incidents))
        .route("/incidents/{id}", get(get_incident))
        .route("/incidents/{id}/ack", post(acknowledge_incident))
        .route("/incidents/{id}/resolve", post(resolve_incident))
        .route("/actions", get(list_actions).post(apply_action))
        .route("/actions/{id}", get(get_action))
        .route("/actions/{id}/revoke", post(revoke_action))
        .route("/enforcement", get(check_enforcement))
        .route("/enforcement/active", get(active_enforcement))
        .route("/evaluate", post(evaluate))
        .route("/cleanup", post(cleanup))
}

fn ok(status: StatusCode, data: Value, meta: Value) -> ApiResult {
    Ok((status, Json(json!({ "data": data, "meta": meta }))))
}

fn to_value<T: serde::Serialize>(data: &T) -> Result<Value, ApiError> {
    serde_json::to_value(data).map_err(|e| ApiError::Internal(e.to_string()))
}

fn operator(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(OPERATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized("x-operator-id header required"))
}

fn operator_or_unknown(headers: &HeaderMap) -> String {
    operator(headers).unwrap_or_else(|_| "unknown".to_string())
}

fn require_justification(state: &AppState, justification: &str) -> Result<(), ApiError> {
    let min = state.guardian.config.enforcement.min_justification_len;
    if justification.trim().chars().count() < min {
        return Err(ApiError::Unprocessable(format!(
            "justification must be at least {min} characters"
        )));
    }
    Ok(())
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> ApiResult {
    ok(
        StatusCode::OK,
        json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }),
        json!({
            "timestamp": state.guardian.clock.now(),
            "version": env!("CARGO_PKG_VERSION")
        }),
    )
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventBody {
    event_type: SecurityEventType,
    actor_type: ActorType,
    tenant_id: Option<String>,
    actor_id: Option<String>,
    /// Raw client IP; hashed before it is stored.
    ip: Option<String>,
    user_agent: Option<String>,
    route: Option<String>,
    method: Option<String>,
    status_code: Option<u16>,
    error_code: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn ingest_event(State(state): State<AppState>, Json(body): Json<EventBody>) -> ApiResult {
    let guardian = &state.guardian;
    let mut event = SecurityEvent::new(body.event_type, body.actor_type, guardian.clock.now());
    event.tenant_id = body.tenant_id;
    event.actor_id = body.actor_id;
    event.ip_hash = body
        .ip
        .as_deref()
        .map(|ip| hash_ip(ip, &guardian.config.events.ip_hash_salt));
    event.user_agent = body.user_agent;
    event.route = body.route;
    event.method = body.method;
    event.status_code = body.status_code;
    event.error_code = body.error_code;
    if let Some(metadata) = body.metadata {
        event.metadata = metadata;
    }

    let id = event.id;
    let accepted = guardian.emitter.emit(event);
    ok(StatusCode::ACCEPTED, json!({ "id": id, "accepted": accepted }), json!({}))
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PolicyListQuery {
    #[serde(default)]
    enabled_only: bool,
}

async fn list_policies(State(state): State<AppState>, Query(q): Query<PolicyListQuery>) -> ApiResult {
    let policies = state.guardian.engine.list_policies(q.enabled_only).await?;
    let total = policies.len();
    ok(StatusCode::OK, to_value(&policies)?, json!({ "total": total }))
}

async fn get_policy(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let policy = state.guardian.engine.get_policy(id).await?;
    ok(StatusCode::OK, to_value(&policy)?, json!({}))
}

async fn create_policy(State(state): State<AppState>, headers: HeaderMap, Json(input): Json<PolicyInput>) -> ApiResult {
    let policy = state.guardian.engine.create_policy(input).await?;
    audit::record(
        state.guardian.audit.as_deref(),
        AuditEntry::new(AuditAction::PolicyCreated, operator_or_unknown(&headers), state.guardian.clock.now())
            .with_subject(policy.id)
            .with_details(json!({ "name": policy.name })),
    )
    .await;
    ok(StatusCode::CREATED, to_value(&policy)?, json!({}))
}

async fn update_policy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(input): Json<PolicyInput>,
) -> ApiResult {
    let policy = state.guardian.engine.update_policy(id, input).await?;
    audit::record(
        state.guardian.audit.as_deref(),
        AuditEntry::new(
            AuditAction::PolicyUpdated,
            operator_or_unknown(&headers),
            state.guardian.clock.now(),
        )
        .with_subject(id),
    )
    .await;
    ok(StatusCode::OK, to_value(&policy)?, json!({}))
}

async fn enable_policy(State(state): State<AppState>, Path(id): Path<Uuid>, headers: HeaderMap) -> ApiResult {
    toggle_policy(state, id, &headers, true).await
}

async fn disable_policy(State(state): State<AppState>, Path(id): Path<Uuid>, headers: HeaderMap) -> ApiResult {
    toggle_policy(state, id, &headers, false).await
}

async fn toggle_policy(state: AppState, id: Uuid, headers: &HeaderMap, enabled: bool) -> ApiResult {
    let policy = state.guardian.engine.set_policy_enabled(id, enabled).await?;
    let action = if enabled {
        AuditAction::PolicyEnabled
    } else {
        AuditAction::PolicyDisabled
    };
    audit::record(
        state.guardian.audit.as_deref(),
        AuditEntry::new(action, operator_or_unknown(headers), state.guardian.clock.now()).with_subject(id),
    )
    .await;
    ok(StatusCode::OK, to_value(&policy)?, json!({}))
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IncidentListQuery {
    status: Option<IncidentStatus>,
    limit: Option<usize>,
}

async fn list_incidents(State(state): State<AppState>, Query(q): Query<IncidentListQuery>) -> ApiResult {
    let incidents = state
        .guardian
        .engine
        .incidents()
        .list_recent(q.status, clamp_limit(q.limit))
        .await?;
    let total = incidents.len();
    ok(StatusCode::OK, to_value(&incidents)?, json!({ "total": total }))
}

async fn get_incident(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let incident = state.guardian.engine.incidents().get(id).await?;
    ok(StatusCode::OK, to_value(&incident)?, json!({}))
}

async fn acknowledge_incident(State(state): State<AppState>, Path(id): Path<Uuid>, headers: HeaderMap) -> ApiResult {
    let by = operator(&headers)?;
    let incident = state.guardian.engine.incidents().acknowledge(id, &by).await?;
    audit::record(
        state.guardian.audit.as_deref(),
        AuditEntry::new(AuditAction::IncidentAcknowledged, by, state.guardian.clock.now()).with_subject(id),
    )
    .await;
    ok(StatusCode::OK, to_value(&incident)?, json!({}))
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    notes: Option<String>,
}

async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let by = operator(&headers)?;
    // the body is optional; an empty one means "no notes"
    let notes = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<ResolveBody>(&body)
            .map_err(|e| ApiError::Unprocessable(format!("invalid body: {e}")))?
            .notes
    };
    let incident = state
        .guardian
        .engine
        .incidents()
        .resolve(id, &by, notes.as_deref())
        .await?;
    let mut entry = AuditEntry::new(AuditAction::IncidentResolved, by, state.guardian.clock.now()).with_subject(id);
    if let Some(notes) = notes {
        entry = entry.with_justification(notes);
    }
    audit::record(state.guardian.audit.as_deref(), entry).await;
    ok(StatusCode::OK, to_value(&incident)?, json!({}))
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ActionListQuery {
    status: Option<ActionStatus>,
    limit: Option<usize>,
}

async fn list_actions(State(state): State<AppState>, Query(q): Query<ActionListQuery>) -> ApiResult {
    let actions = state
        .guardian
        .enforcer
        .list_actions(q.status, clamp_limit(q.limit))
        .await?;
    let total = actions.len();
    ok(StatusCode::OK, to_value(&actions)?, json!({ "total": total }))
}

async fn get_action(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let action = state.guardian.enforcer.get_action(id).await?;
    ok(StatusCode::OK, to_value(&action)?, json!({}))
}

#[derive(Debug, Deserialize)]
struct ApplyBody {
    /// Kept as text so an unknown type is a 422 from the enforcer, not a
    /// generic body rejection.
    action_type: String,
    target_type: TargetType,
    target_id: String,
    scope: Option<ActionScope>,
    #[serde(default)]
    params: Value,
    justification: String,
    incident_id: Option<Uuid>,
}

async fn apply_action(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<ApplyBody>) -> ApiResult {
    let by = operator(&headers)?;
    require_justification(&state, &body.justification)?;
    let action_type = ActionType::parse(&body.action_type)?;

    let mut request = ActionRequest::new(action_type, body.target_type, body.target_id.clone())
        .with_params(body.params.clone())
        .with_reason(body.justification.clone())
        .created_by(by.clone());
    request.scope = body.scope;
    if let Some(incident_id) = body.incident_id {
        match state.guardian.engine.incidents().get(incident_id).await {
            Ok(_) => request.incident_id = Some(incident_id),
            Err(DetectError::IncidentNotFound(_)) => {
                return Err(ApiError::Unprocessable(format!("incident {incident_id} not found")));
            }
            Err(e) => return Err(e.into()),
        }
    }

    let id = state.guardian.enforcer.try_apply_action(request).await?;
    audit::record(
        state.guardian.audit.as_deref(),
        AuditEntry::new(AuditAction::ActionApplied, by, state.guardian.clock.now())
            .with_subject(id)
            .with_target(format!("{}:{}", body.target_type, body.target_id))
            .with_justification(body.justification)
            .with_details(json!({ "action_type": action_type, "params": body.params })),
    )
    .await;

    let action = state.guardian.enforcer.get_action(id).await?;
    ok(StatusCode::CREATED, to_value(&action)?, json!({}))
}

#[derive(Debug, Deserialize)]
struct RevokeBody {
    justification: String,
}

async fn revoke_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<RevokeBody>,
) -> ApiResult {
    let by = operator(&headers)?;
    require_justification(&state, &body.justification)?;

    state
        .guardian
        .enforcer
        .try_revoke_action(id, &body.justification, &by)
        .await?;
    audit::record(
        state.guardian.audit.as_deref(),
        AuditEntry::new(AuditAction::ActionRevoked, by, state.guardian.clock.now())
            .with_subject(id)
            .with_justification(body.justification),
    )
    .await;

    let action = state.guardian.enforcer.get_action(id).await?;
    ok(StatusCode::OK, to_value(&action)?, json!({}))
}

// ---------------------------------------------------------------------------
// Enforcement
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EnforcementQuery {
    target_type: TargetType,
    target_id: String,
    scope: Option<ActionScope>,
}

async fn check_enforcement(State(state): State<AppState>, Query(q): Query<EnforcementQuery>) -> ApiResult {
    let enforcement = state
        .guardian
        .enforcer
        .check_enforcement(q.target_type, &q.target_id, q.scope)
        .await;
    let now = state.guardian.clock.now();
    let retry_after = enforcement.as_ref().map(|s| s.retry_after_secs(now));
    ok(
        StatusCode::OK,
        to_value(&enforcement)?,
        json!({ "checked_at": now, "retry_after_secs": retry_after }),
    )
}

async fn active_enforcement(State(state): State<AppState>) -> ApiResult {
    let states = state.guardian.enforcer.list_active().await?;
    let total = states.len();
    ok(StatusCode::OK, to_value(&states)?, json!({ "total": total }))
}

// ---------------------------------------------------------------------------
// On-demand jobs
// ---------------------------------------------------------------------------

async fn evaluate(State(state): State<AppState>) -> ApiResult {
    let results = state.guardian.engine.evaluate_all_policies().await;
    let triggered = results.iter().filter(|r| r.triggered).count();
    ok(
        StatusCode::OK,
        to_value(&results)?,
        json!({ "policies": results.len(), "triggered": triggered }),
    )
}

async fn cleanup(State(state): State<AppState>) -> ApiResult {
    let report = state.guardian.sweeper.run_once().await;
    ok(StatusCode::OK, to_value(&report)?, json!({}))
}
