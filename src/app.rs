//! Wiring: one place that turns a [`GuardianConfig`] into running components.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::info;

use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::config::GuardianConfig;
use crate::detect::PolicyEngine;
use crate::enforce::{ActionEnforcer, AdmissionGate, CleanupSweeper};
use crate::events::emitter::EmitterStats;
use crate::events::EventEmitter;
use crate::storage::{open_store, SharedStore};

/// Every long-lived component, built once and shared.
#[derive(Clone)]
pub struct Guardian {
    pub config: Arc<GuardianConfig>,
    pub store: SharedStore,
    pub clock: Arc<dyn Clock>,
    pub enforcer: Arc<ActionEnforcer>,
    pub engine: Arc<PolicyEngine>,
    pub sweeper: Arc<CleanupSweeper>,
    pub gate: Arc<AdmissionGate>,
    pub emitter: EventEmitter,
    pub audit: Option<Arc<AuditLog>>,
}

impl Guardian {
    /// Open the store named in `config` and build everything on top of it.
    ///
    /// Must be called inside a tokio runtime: the event writer task is
    /// spawned here. The returned handle resolves once every clone of the
    /// emitter has been dropped and the queue is drained.
    pub async fn open(config: GuardianConfig, clock: Arc<dyn Clock>) -> Result<(Self, JoinHandle<EmitterStats>)> {
        let db_path = config.storage.database_path.clone();
        info!(%db_path, "opening security store");
        let store = open_store(&db_path).with_context(|| format!("failed to open database at {db_path}"))?;
        Self::with_store(config, store, clock).await
    }

    pub async fn with_store(
        config: GuardianConfig,
        store: SharedStore,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, JoinHandle<EmitterStats>)> {
        let enforcer = Arc::new(ActionEnforcer::new(store.clone(), clock.clone()));
        let engine = Arc::new(PolicyEngine::new(
            store.clone(),
            enforcer.clone(),
            clock.clone(),
            config.policies.cache_ttl(),
        ));
        let sweeper = Arc::new(CleanupSweeper::new(
            enforcer.clone(),
            store.clone(),
            clock.clone(),
            config.events.retention_days,
        ));
        let gate = Arc::new(
            AdmissionGate::new(enforcer.clone(), clock.clone())
                .with_fail_closed_scopes(config.enforcement.fail_closed_scopes.clone())
                .with_ip_hash_salt(config.events.ip_hash_salt.clone()),
        );

        let audit = match &config.audit.path {
            Some(path) => Some(Arc::new(AuditLog::open(path.clone()).await?)),
            None => None,
        };

        if config.policies.seed_defaults {
            engine.seed_defaults().await.context("failed to seed default policies")?;
        }

        let (emitter, writer) = EventEmitter::start(store.clone(), config.events.queue_capacity);

        Ok((
            Self {
                config: Arc::new(config),
                store,
                clock,
                enforcer,
                engine,
                sweeper,
                gate,
                emitter,
                audit,
            },
            writer,
        ))
    }
}
