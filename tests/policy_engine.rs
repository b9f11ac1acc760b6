//! Detection scenarios run through the full component graph: default
//! policies, real store, manual clock.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

use guardian::clock::{Clock, ManualClock};
use guardian::config::GuardianConfig;
use guardian::detect::{DetectError, EvaluationResult, IncidentStatus};
use guardian::enforce::{ActionScope, ActionType, Admission, Subject, TargetType};
use guardian::events::{ActorType, SecurityEvent, SecurityEventType};
use guardian::storage::{open_store, run_blocking};
use guardian::Guardian;

struct World {
    _dir: TempDir,
    clock: Arc<ManualClock>,
    guardian: Guardian,
}

async fn world() -> World {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path().join("guardian.db").to_str().unwrap()).unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 14, 0, 0).unwrap()));

    let mut config = GuardianConfig::default();
    config.policies.cache_ttl_secs = 0;
    let (guardian, _writer) = Guardian::with_store(config, store, clock.clone()).await.unwrap();
    World {
        _dir: dir,
        clock,
        guardian,
    }
}

impl World {
    async fn record(&self, event: SecurityEvent) {
        run_blocking(&self.guardian.store, move |s| s.insert_event(&event))
            .await
            .unwrap();
    }

    async fn failed_logins(&self, actor: &str, ip: &str, n: usize) {
        for _ in 0..n {
            let event = SecurityEvent::new(SecurityEventType::LoginFailed, ActorType::TenantUser, self.clock.now())
                .with_actor_id(actor)
                .with_tenant("acme")
                .with_ip_hash(ip);
            self.record(event).await;
        }
    }

    async fn evaluate(&self, policy_name: &str) -> EvaluationResult {
        self.guardian
            .engine
            .evaluate_all_policies()
            .await
            .into_iter()
            .find(|r| r.policy_name == policy_name)
            .unwrap()
    }
}

#[tokio::test]
async fn test_brute_force_locks_account_and_gate_blocks() {
    let w = world().await;
    w.failed_logins("alice", "ip-a", 5).await;

    let result = w.evaluate("brute-force-login-actor").await;
    assert!(result.triggered);
    assert!(result.action_log_id.is_some());

    let subject = Subject {
        actor_id: Some("alice".to_string()),
        tenant_id: Some("acme".to_string()),
        ..Subject::default()
    };
    match w.guardian.gate.check(&subject).await {
        Admission::Restricted {
            state,
            retry_after_secs,
        } => {
            assert_eq!(state.action_type, ActionType::LockUserTemp);
            assert_eq!(retry_after_secs, 15 * 60);
        }
        other => panic!("expected restriction, got {other:?}"),
    }

    let bob = Subject {
        actor_id: Some("bob".to_string()),
        tenant_id: Some("acme".to_string()),
        ..Subject::default()
    };
    assert_eq!(w.guardian.gate.check(&bob).await, Admission::Admitted);

    w.clock.advance(Duration::minutes(15));
    assert_eq!(w.guardian.gate.check(&subject).await, Admission::Admitted);
}

#[tokio::test]
async fn test_events_outside_window_are_ignored() {
    let w = world().await;
    w.failed_logins("alice", "ip-a", 5).await;
    w.clock.advance(Duration::seconds(301));

    let result = w.evaluate("brute-force-login-actor").await;
    assert!(!result.triggered);
    assert_eq!(result.event_count, 0);
    assert!(w.guardian.engine.incidents().list_recent(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cooldown_then_new_incident() {
    let w = world().await;
    w.failed_logins("alice", "ip-a", 5).await;
    let first = w.evaluate("brute-force-login-actor").await;
    assert!(first.triggered && !first.suppressed);

    w.clock.advance(Duration::minutes(1));
    let again = w.evaluate("brute-force-login-actor").await;
    assert!(again.suppressed);
    assert!(again.incident_id.is_none());

    w.clock.advance(Duration::minutes(15));
    w.failed_logins("alice", "ip-a", 5).await;
    let later = w.evaluate("brute-force-login-actor").await;
    assert!(later.triggered && !later.suppressed);
    assert_ne!(later.incident_id, first.incident_id);
    assert_eq!(w.guardian.engine.incidents().list_recent(None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_login_spray_rate_limits_ip_for_auth_only() {
    let w = world().await;
    for i in 0..20 {
        w.failed_logins(&format!("user-{i}"), "ip-spray", 1).await;
    }

    assert!(!w.evaluate("brute-force-login-actor").await.triggered);
    let spray = w.evaluate("login-spray-ip").await;
    assert!(spray.triggered);
    assert_eq!(spray.group_key.as_deref(), Some("ip-spray"));

    let state = w
        .guardian
        .enforcer
        .check_enforcement(TargetType::Ip, "ip-spray", Some(ActionScope::Auth))
        .await
        .unwrap();
    assert_eq!(state.action_type, ActionType::RateLimit);

    let from_spray = |scope| Subject {
        ip_hash: Some("ip-spray".to_string()),
        scope: Some(scope),
        ..Subject::default()
    };
    assert!(matches!(
        w.guardian.gate.check(&from_spray(ActionScope::Auth)).await,
        Admission::Restricted { .. }
    ));
    assert_eq!(w.guardian.gate.check(&from_spray(ActionScope::Ai)).await, Admission::Admitted);
}

#[tokio::test]
async fn test_impersonation_burst_raises_incident_without_action() {
    let w = world().await;
    for _ in 0..10 {
        let event = SecurityEvent::new(SecurityEventType::ImpersonationStart, ActorType::SaasAdmin, w.clock.now())
            .with_actor_id("admin-7");
        w.record(event).await;
    }

    let result = w.evaluate("impersonation-burst").await;
    assert!(result.triggered);
    assert!(result.incident_id.is_some());
    assert!(result.action_log_id.is_none());
    assert!(w.guardian.enforcer.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_incident_lifecycle() {
    let w = world().await;
    w.failed_logins("alice", "ip-a", 5).await;
    let id = w.evaluate("brute-force-login-actor").await.incident_id.unwrap();
    let incidents = w.guardian.engine.incidents();

    let acked = incidents.acknowledge(id, "ops@example.com").await.unwrap();
    assert_eq!(acked.status, IncidentStatus::Ack);
    assert_eq!(acked.acknowledged_by.as_deref(), Some("ops@example.com"));

    assert!(matches!(
        incidents.acknowledge(id, "ops@example.com").await,
        Err(DetectError::InvalidTransition { from: IncidentStatus::Ack, .. })
    ));

    let resolved = incidents
        .resolve(id, "ops@example.com", Some("password reset forced"))
        .await
        .unwrap();
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    assert_eq!(resolved.resolution_notes.as_deref(), Some("password reset forced"));

    assert!(matches!(
        incidents.resolve(id, "ops@example.com", None).await,
        Err(DetectError::InvalidTransition { from: IncidentStatus::Resolved, .. })
    ));
    assert!(matches!(
        incidents.get(uuid::Uuid::new_v4()).await,
        Err(DetectError::IncidentNotFound(_))
    ));
}

#[tokio::test]
async fn test_disabled_policy_stops_evaluating() {
    let w = world().await;
    let policies = w.guardian.engine.list_policies(false).await.unwrap();
    let brute = policies.iter().find(|p| p.name == "brute-force-login-actor").unwrap();

    w.guardian.engine.set_policy_enabled(brute.id, false).await.unwrap();
    w.failed_logins("alice", "ip-a", 5).await;

    let results = w.guardian.engine.evaluate_all_policies().await;
    assert_eq!(results.len(), policies.len() - 1);
    assert!(results.iter().all(|r| r.policy_id != brute.id));
    assert!(w
        .guardian
        .enforcer
        .check_enforcement(TargetType::TenantUser, "alice", None)
        .await
        .is_none());
}
