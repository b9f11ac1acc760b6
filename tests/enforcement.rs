//! Enforcement lifecycle against a real SQLite store with a manual clock.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use guardian::clock::{Clock, ManualClock};
use guardian::enforce::{
    ActionEnforcer, ActionRequest, ActionScope, ActionStatus, ActionType, CreatedByType, EnforceError, TargetType,
};
use guardian::storage::{open_pool, SqliteStore};

struct Harness {
    _dir: TempDir,
    pool: guardian::storage::Pool,
    clock: Arc<ManualClock>,
    enforcer: ActionEnforcer,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(dir.path().join("enforce.db").to_str().unwrap()).unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()));
    let enforcer = ActionEnforcer::new(Arc::new(SqliteStore::new(pool.clone())), clock.clone());
    Harness {
        _dir: dir,
        pool,
        clock,
        enforcer,
    }
}

fn lock(user: &str, minutes: u32) -> ActionRequest {
    ActionRequest::new(ActionType::LockUserTemp, TargetType::TenantUser, user)
        .with_params(json!({ "durationMinutes": minutes }))
        .with_reason("test lock")
}

#[tokio::test]
async fn test_lock_expires_exactly_after_duration() {
    let h = harness();
    let start = h.clock.now();
    let id = h.enforcer.apply_action(lock("u1", 10)).await.unwrap();

    let log = h.enforcer.get_action(id).await.unwrap();
    assert_eq!(log.status, ActionStatus::Applied);
    assert_eq!(log.created_by_type, CreatedByType::System);
    assert_eq!(log.expires_at, start + Duration::minutes(10));

    let state = h
        .enforcer
        .check_enforcement(TargetType::TenantUser, "u1", None)
        .await
        .unwrap();
    assert_eq!(state.action_log_id, id);
    assert_eq!(state.retry_after_secs(h.clock.now()), 600);

    h.clock.advance(Duration::minutes(10) - Duration::seconds(1));
    assert!(h.enforcer.check_enforcement(TargetType::TenantUser, "u1", None).await.is_some());

    h.clock.advance(Duration::seconds(1));
    assert!(h.enforcer.check_enforcement(TargetType::TenantUser, "u1", None).await.is_none());
}

#[tokio::test]
async fn test_cleanup_expires_logs_once() {
    let h = harness();
    let id = h.enforcer.apply_action(lock("u1", 10)).await.unwrap();

    let early = h.enforcer.cleanup_expired().await;
    assert_eq!((early.expired_logs, early.deleted_states), (0, 0));

    h.clock.advance(Duration::minutes(11));
    let first = h.enforcer.cleanup_expired().await;
    assert_eq!((first.expired_logs, first.deleted_states), (1, 1));
    assert_eq!(h.enforcer.get_action(id).await.unwrap().status, ActionStatus::Expired);

    let second = h.enforcer.cleanup_expired().await;
    assert_eq!((second.expired_logs, second.deleted_states), (0, 0));
    assert!(h.enforcer.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_revoke_lifts_enforcement() {
    let h = harness();
    let id = h
        .enforcer
        .apply_action(lock("u1", 30).created_by("ops@example.com"))
        .await
        .unwrap();
    assert_eq!(
        h.enforcer.get_action(id).await.unwrap().created_by_type,
        CreatedByType::SaasUser
    );

    assert!(h.enforcer.revoke_action(id, "false positive", "ops@example.com").await);
    assert!(h.enforcer.check_enforcement(TargetType::TenantUser, "u1", None).await.is_none());

    let log = h.enforcer.get_action(id).await.unwrap();
    assert_eq!(log.status, ActionStatus::Reverted);
    assert_eq!(log.revoked_by.as_deref(), Some("ops@example.com"));
    assert_eq!(log.revoke_reason.as_deref(), Some("false positive"));
    assert_eq!(log.ended_at, Some(h.clock.now()));

    // a second revoke is a no-op that still succeeds
    assert!(h.enforcer.revoke_action(id, "again", "someone-else").await);
    let log = h.enforcer.get_action(id).await.unwrap();
    assert_eq!(log.revoked_by.as_deref(), Some("ops@example.com"));
}

#[tokio::test]
async fn test_revoke_expired_action_keeps_status() {
    let h = harness();
    let id = h.enforcer.apply_action(lock("u1", 10)).await.unwrap();
    h.clock.advance(Duration::minutes(20));
    h.enforcer.cleanup_expired().await;

    assert!(h.enforcer.revoke_action(id, "late revoke", "ops").await);
    assert_eq!(h.enforcer.get_action(id).await.unwrap().status, ActionStatus::Expired);
}

#[tokio::test]
async fn test_revoke_unknown_action() {
    let h = harness();
    let missing = uuid::Uuid::new_v4();
    assert!(!h.enforcer.revoke_action(missing, "nothing", "ops").await);
    assert!(matches!(
        h.enforcer.try_revoke_action(missing, "nothing", "ops").await,
        Err(EnforceError::ActionNotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn test_invalid_params_record_nothing() {
    let h = harness();
    let bad = ActionRequest::new(ActionType::LockUserTemp, TargetType::TenantUser, "u1")
        .with_params(json!({ "durationMinutes": "soon" }));
    assert!(h.enforcer.apply_action(bad).await.is_none());
    assert!(h.enforcer.list_actions(None, 10).await.unwrap().is_empty());
    assert!(ActionType::parse("BAN_FOREVER").is_err());
}

#[tokio::test]
async fn test_scoped_rate_limit() {
    let h = harness();
    let id = h
        .enforcer
        .apply_action(
            ActionRequest::new(ActionType::RateLimit, TargetType::Ip, "iphash")
                .with_params(json!({ "durationHours": 1, "scope": "AI" })),
        )
        .await
        .unwrap();

    let log = h.enforcer.get_action(id).await.unwrap();
    assert_eq!(log.scope, Some(ActionScope::Ai));
    assert_eq!(log.expires_at, h.clock.now() + Duration::hours(1));

    assert!(h
        .enforcer
        .check_enforcement(TargetType::Ip, "iphash", Some(ActionScope::Ai))
        .await
        .is_some());
    assert!(h
        .enforcer
        .check_enforcement(TargetType::Ip, "iphash", Some(ActionScope::Exports))
        .await
        .is_none());
    // an unscoped check sees every restriction on the target
    assert!(h.enforcer.check_enforcement(TargetType::Ip, "iphash", None).await.is_some());
}

#[tokio::test]
async fn test_lock_outranks_rate_limit() {
    let h = harness();
    h.enforcer
        .apply_action(
            ActionRequest::new(ActionType::RateLimit, TargetType::TenantUser, "u1")
                .with_params(json!({ "durationHours": 5 })),
        )
        .await
        .unwrap();
    let lock_id = h.enforcer.apply_action(lock("u1", 5)).await.unwrap();

    let state = h
        .enforcer
        .check_enforcement(TargetType::TenantUser, "u1", None)
        .await
        .unwrap();
    assert_eq!(state.action_type, ActionType::LockUserTemp);
    assert_eq!(state.action_log_id, lock_id);
}

#[tokio::test]
async fn test_overlapping_locks_each_keep_a_row() {
    let h = harness();
    let first = h.enforcer.apply_action(lock("u1", 10)).await.unwrap();
    h.clock.advance(Duration::minutes(5));
    let second = h.enforcer.apply_action(lock("u1", 60)).await.unwrap();

    let active = h.enforcer.list_active().await.unwrap();
    assert_eq!(active.len(), 2);
    let state = h
        .enforcer
        .check_enforcement(TargetType::TenantUser, "u1", None)
        .await
        .unwrap();
    assert_eq!(state.action_log_id, second);

    h.clock.advance(Duration::minutes(6));
    let cleanup = h.enforcer.cleanup_expired().await;
    assert_eq!((cleanup.expired_logs, cleanup.deleted_states), (1, 1));
    assert_eq!(h.enforcer.get_action(first).await.unwrap().status, ActionStatus::Expired);
    assert_eq!(h.enforcer.list_actions(Some(ActionStatus::Applied), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_short_lock_does_not_shorten_longer_lock() {
    let h = harness();
    let long = h
        .enforcer
        .apply_action(lock("u1", 24 * 60).created_by("ops@example.com"))
        .await
        .unwrap();
    h.enforcer.apply_action(lock("u1", 10)).await.unwrap();

    h.clock.advance(Duration::minutes(11));
    let state = h
        .enforcer
        .check_enforcement(TargetType::TenantUser, "u1", None)
        .await
        .unwrap();
    assert_eq!(state.action_log_id, long);

    // revoking a newer short action leaves the operator's lock in force
    let again = h.enforcer.apply_action(lock("u1", 10)).await.unwrap();
    assert!(h.enforcer.revoke_action(again, "duplicate", "ops@example.com").await);
    let state = h
        .enforcer
        .check_enforcement(TargetType::TenantUser, "u1", None)
        .await
        .unwrap();
    assert_eq!(state.action_log_id, long);
}

#[tokio::test]
async fn test_check_fails_open_when_store_breaks() {
    let h = harness();
    h.enforcer.apply_action(lock("u1", 10)).await.unwrap();

    h.pool
        .get()
        .unwrap()
        .execute_batch("DROP TABLE security_enforcement_state;")
        .unwrap();

    assert!(h
        .enforcer
        .try_check_enforcement(TargetType::TenantUser, "u1", None)
        .await
        .is_err());
    assert!(h.enforcer.check_enforcement(TargetType::TenantUser, "u1", None).await.is_none());
}
