//! Guardian -- security incident detection and automated enforcement for a
//! multi-tenant SaaS.
//!
//! This crate provides the core library: the security event model and
//! ingestion queue, threshold policies and their evaluation engine, incident
//! lifecycle, temporary enforcement actions with their request-path gate,
//! scheduling, and the HTTP API.

pub mod api;
pub mod app;
pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod detect;
pub mod enforce;
pub mod events;
pub mod scheduler;
pub mod storage;
mod wire;

pub use self::app::Guardian;
pub use self::wire::UnknownVariant;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::clock::SystemClock;
use crate::config::GuardianConfig;
use crate::scheduler::{JobRunner, Scheduler};

/// Start the Guardian daemon: API server plus the evaluate and cleanup loops.
///
/// Runs until Ctrl-C, then stops the loops and drains the event queue.
pub async fn serve(config: GuardianConfig) -> Result<()> {
    let bind = config.server.bind.clone();
    let scheduler_enabled = config.scheduler.enabled;
    let scheduler = Scheduler::from_config(&config.scheduler)?;

    let (guardian, event_writer) = Guardian::open(config, Arc::new(SystemClock)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = if scheduler_enabled {
        let runner = JobRunner {
            engine: guardian.engine.clone(),
            sweeper: guardian.sweeper.clone(),
        };
        scheduler::spawn_loops(&scheduler, runner, guardian.clock.clone(), shutdown_rx)
    } else {
        tracing::info!("scheduler disabled; evaluation and cleanup run on demand only");
        Vec::new()
    };

    let addr: std::net::SocketAddr = bind.parse().with_context(|| format!("invalid bind address: {bind}"))?;
    let app = api::router(api::state::AppState::new(guardian));

    tracing::info!(%addr, "Guardian listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in loops {
        let _ = handle.await;
    }
    match event_writer.await {
        Ok(stats) => tracing::info!(written = stats.written, failed = stats.failed, "event queue drained"),
        Err(e) => tracing::warn!(error = %e, "event writer ended abnormally"),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
