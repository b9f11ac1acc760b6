use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use guardian::audit::{self, AuditAction, AuditEntry};
use guardian::clock::{Clock, SystemClock};
use guardian::config::GuardianConfig;
use guardian::detect::{IncidentStatus, PolicyInput};
use guardian::enforce::{ActionRequest, ActionScope, ActionStatus, ActionType, TargetType};
use guardian::events::{hash_ip, ActorType, SecurityEvent, SecurityEventType};
use guardian::scheduler::Scheduler;
use guardian::Guardian;

#[derive(Parser)]
#[command(
    name = "guardian",
    about = "Security incident detection and automated enforcement",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults: $GUARDIAN_CONFIG, /etc/guardian/guardian.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + evaluation and cleanup loops)
    Serve {
        /// Bind address (overrides [server] bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Evaluate every enabled policy once
    Evaluate {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Expire actions, sweep enforcement state and purge old events
    Cleanup {
        #[arg(long)]
        json: bool,
    },

    /// Manage detection policies
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Review and move incidents along their lifecycle
    Incident {
        #[command(subcommand)]
        action: IncidentAction,
    },

    /// Apply, revoke and inspect enforcement actions
    Action {
        #[command(subcommand)]
        action: ActionCommand,
    },

    /// Record security events directly (drills and testing)
    Emit {
        #[arg(long)]
        event_type: SecurityEventType,

        #[arg(long, default_value = "TENANT_USER")]
        actor_type: ActorType,

        #[arg(long)]
        actor_id: Option<String>,

        #[arg(long)]
        tenant_id: Option<String>,

        /// Raw client IP; hashed with the configured salt
        #[arg(long)]
        ip: Option<String>,

        /// How many identical events to record
        #[arg(long, default_value = "1")]
        count: u32,
    },

    /// Inspect the evaluation and cleanup schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// List policies
    List {
        #[arg(long)]
        enabled_only: bool,
        #[arg(long)]
        json: bool,
    },

    /// Create a policy from a JSON file
    Add {
        /// Path to a JSON policy definition
        #[arg(long)]
        file: PathBuf,
    },

    /// Enable a policy
    Enable {
        #[arg(long)]
        id: uuid::Uuid,
    },

    /// Disable a policy
    Disable {
        #[arg(long)]
        id: uuid::Uuid,
    },

    /// Insert the default policy set into an empty store
    SeedDefaults,
}

#[derive(Subcommand)]
enum IncidentAction {
    /// List recent incidents
    List {
        #[arg(long)]
        status: Option<IncidentStatus>,
        #[arg(long, default_value = "50")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },

    /// Acknowledge an open incident
    Ack {
        #[arg(long)]
        id: uuid::Uuid,
        /// Operator identity
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Resolve an incident
    Resolve {
        #[arg(long)]
        id: uuid::Uuid,
        #[arg(long, default_value = "cli")]
        by: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
enum ActionCommand {
    /// Manually apply an action
    Apply {
        /// LOCK_USER_TEMP, RATE_LIMIT or REQUIRE_REAUTH
        #[arg(long = "type")]
        action_type: String,
        #[arg(long)]
        target_type: TargetType,
        #[arg(long)]
        target_id: String,
        #[arg(long)]
        scope: Option<ActionScope>,
        /// Action parameters as JSON, e.g. '{"durationMinutes": 30}'
        #[arg(long, default_value = "{}")]
        params: String,
        /// Justification recorded on the action log
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Revoke an applied action
    Revoke {
        #[arg(long)]
        id: uuid::Uuid,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// List action logs
    List {
        #[arg(long)]
        status: Option<ActionStatus>,
        #[arg(long, default_value = "50")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },

    /// Is this target enforced right now?
    Check {
        #[arg(long)]
        target_type: TargetType,
        #[arg(long)]
        target_id: String,
        #[arg(long)]
        scope: Option<ActionScope>,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Preview what will run in the next N hours
    Preview {
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(config: &GuardianConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = GuardianConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.database_path = db;
    }
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting Guardian daemon");
            guardian::serve(config).await?;
        }
        Commands::Schedule { action } => match action {
            ScheduleAction::Preview { hours } => {
                let scheduler = Scheduler::from_config(&config.scheduler)?;
                let preview = scheduler.preview_next_runs(SystemClock.now(), hours);
                if preview.is_empty() {
                    println!("No runs scheduled in next {} hours.", hours);
                } else {
                    println!("Upcoming runs (next {} hours):", hours);
                    for run in preview {
                        println!("{} : {}", run.at.to_rfc3339(), run.job);
                    }
                }
            }
        },
        command => {
            let (guardian, writer) = Guardian::open(config, Arc::new(SystemClock)).await?;
            run_command(&guardian, command).await?;
            drop(guardian);
            writer.await.context("event writer task failed")?;
        }
    }

    Ok(())
}

async fn run_command(g: &Guardian, command: Commands) -> Result<()> {
    let audit_log = g.audit.as_deref();

    match command {
        Commands::Serve { .. } | Commands::Schedule { .. } => {
            anyhow::bail!("command does not operate on an open store")
        }

        Commands::Evaluate { json } => {
            let results = g.engine.evaluate_all_policies().await;
            if json {
                print_json(&results)?;
            } else {
                println!("{:<28} | {:<9} | {:>6} | Incident", "Policy", "Triggered", "Events");
                println!("{:-<28}-|-{:-<9}-|-{:-<6}-|-{:-<36}", "", "", "", "");
                for r in &results {
                    let triggered = match (r.triggered, r.suppressed) {
                        (true, true) => "cooldown",
                        (true, false) => "yes",
                        (false, _) => "no",
                    };
                    let incident = r
                        .incident_id
                        .map(|id| id.to_string())
                        .or_else(|| r.reason.clone())
                        .unwrap_or_default();
                    println!("{:<28} | {:<9} | {:>6} | {}", r.policy_name, triggered, r.event_count, incident);
                }
            }
        }

        Commands::Cleanup { json } => {
            let report = g.sweeper.run_once().await;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Expired {} action(s), removed {} enforcement row(s), purged {} event(s).",
                    report.expired_logs, report.deleted_states, report.purged_events
                );
            }
        }

        Commands::Policy { action } => match action {
            PolicyAction::List { enabled_only, json } => {
                let policies = g.engine.list_policies(enabled_only).await?;
                if json {
                    print_json(&policies)?;
                } else if policies.is_empty() {
                    println!("No policies found.");
                } else {
                    println!("{:<36} | {:<28} | {:<7} | {:<20} | Action", "Id", "Name", "Enabled", "Event");
                    println!("{:-<36}-|-{:-<28}-|-{:-<7}-|-{:-<20}-|-{:-<14}", "", "", "", "", "");
                    for p in policies {
                        let action = p.action_type.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<36} | {:<28} | {:<7} | {:<20} | {}",
                            p.id, p.name, p.enabled, p.event_type, action
                        );
                    }
                }
            }
            PolicyAction::Add { file } => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read policy file: {}", file.display()))?;
                let input: PolicyInput = serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse policy file: {}", file.display()))?;
                let policy = g.engine.create_policy(input).await?;
                audit::record(
                    audit_log,
                    AuditEntry::new(AuditAction::PolicyCreated, "cli", g.clock.now()).with_subject(policy.id),
                )
                .await;
                println!("Policy '{}' added ({}).", policy.name, policy.id);
            }
            PolicyAction::Enable { id } => {
                let policy = g.engine.set_policy_enabled(id, true).await?;
                let entry = AuditEntry::new(AuditAction::PolicyEnabled, "cli", g.clock.now()).with_subject(id);
                audit::record(audit_log, entry).await;
                println!("Policy '{}' enabled.", policy.name);
            }
            PolicyAction::Disable { id } => {
                let policy = g.engine.set_policy_enabled(id, false).await?;
                let entry = AuditEntry::new(AuditAction::PolicyDisabled, "cli", g.clock.now()).with_subject(id);
                audit::record(audit_log, entry).await;
                println!("Policy '{}' disabled.", policy.name);
            }
            PolicyAction::SeedDefaults => {
                let inserted = g.engine.seed_defaults().await?;
                if inserted == 0 {
                    println!("Store already has policies; nothing seeded.");
                } else {
                    println!("Seeded {} default policies.", inserted);
                }
            }
        },

        Commands::Incident { action } => match action {
            IncidentAction::List { status, limit, json } => {
                let incidents = g.engine.incidents().list_recent(status, limit).await?;
                if json {
                    print_json(&incidents)?;
                } else if incidents.is_empty() {
                    println!("No incidents found.");
                } else {
                    for i in incidents {
                        println!(
                            "{} [{}] {} {} ({} events) {}",
                            i.created_at.to_rfc3339(),
                            i.status,
                            i.severity,
                            i.id,
                            i.evidence.len(),
                            i.summary
                        );
                    }
                }
            }
            IncidentAction::Ack { id, by } => {
                g.engine.incidents().acknowledge(id, &by).await?;
                let entry = AuditEntry::new(AuditAction::IncidentAcknowledged, by, g.clock.now()).with_subject(id);
                audit::record(audit_log, entry).await;
                println!("Incident {} acknowledged.", id);
            }
            IncidentAction::Resolve { id, by, notes } => {
                g.engine.incidents().resolve(id, &by, notes.as_deref()).await?;
                let mut entry = AuditEntry::new(AuditAction::IncidentResolved, by, g.clock.now()).with_subject(id);
                if let Some(notes) = notes {
                    entry = entry.with_justification(notes);
                }
                audit::record(audit_log, entry).await;
                println!("Incident {} resolved.", id);
            }
        },

        Commands::Action { action } => match action {
            ActionCommand::Apply {
                action_type,
                target_type,
                target_id,
                scope,
                params,
                reason,
                by,
            } => {
                let action_type = ActionType::parse(&action_type)?;
                let params: Value = serde_json::from_str(&params).context("--params must be a JSON object")?;
                let mut request = ActionRequest::new(action_type, target_type, target_id.clone())
                    .with_params(params.clone())
                    .with_reason(reason.clone())
                    .created_by(by.clone());
                request.scope = scope;

                let id = g.enforcer.try_apply_action(request).await?;
                audit::record(
                    audit_log,
                    AuditEntry::new(AuditAction::ActionApplied, by, g.clock.now())
                        .with_subject(id)
                        .with_target(format!("{}:{}", target_type, target_id))
                        .with_justification(reason)
                        .with_details(params),
                )
                .await;
                let log = g.enforcer.get_action(id).await?;
                println!(
                    "Applied {} to {}:{} until {} ({}).",
                    action_type,
                    target_type,
                    target_id,
                    log.expires_at.to_rfc3339(),
                    id
                );
            }
            ActionCommand::Revoke { id, reason, by } => {
                g.enforcer.try_revoke_action(id, &reason, &by).await?;
                audit::record(
                    audit_log,
                    AuditEntry::new(AuditAction::ActionRevoked, by, g.clock.now())
                        .with_subject(id)
                        .with_justification(reason),
                )
                .await;
                println!("Action {} revoked.", id);
            }
            ActionCommand::List { status, limit, json } => {
                let logs = g.enforcer.list_actions(status, limit).await?;
                if json {
                    print_json(&logs)?;
                } else if logs.is_empty() {
                    println!("No actions found.");
                } else {
                    for l in logs {
                        println!(
                            "{} [{}] {} {}:{} expires {} ({})",
                            l.created_at.to_rfc3339(),
                            l.status,
                            l.action_type,
                            l.target_type,
                            l.target_id,
                            l.expires_at.to_rfc3339(),
                            l.id
                        );
                    }
                }
            }
            ActionCommand::Check {
                target_type,
                target_id,
                scope,
            } => match g.enforcer.try_check_enforcement(target_type, &target_id, scope).await? {
                Some(state) => println!(
                    "ENFORCED: {} until {} (retry after {}s, action {})",
                    state.action_type,
                    state.expires_at.to_rfc3339(),
                    state.retry_after_secs(g.clock.now()),
                    state.action_log_id
                ),
                None => println!("not enforced"),
            },
        },

        Commands::Emit {
            event_type,
            actor_type,
            actor_id,
            tenant_id,
            ip,
            count,
        } => {
            let ip_hash = ip.as_deref().map(|ip| hash_ip(ip, &g.config.events.ip_hash_salt));
            let mut accepted = 0;
            for _ in 0..count {
                let mut event = SecurityEvent::new(event_type, actor_type, g.clock.now());
                event.actor_id = actor_id.clone();
                event.tenant_id = tenant_id.clone();
                event.ip_hash = ip_hash.clone();
                if g.emitter.emit(event) {
                    accepted += 1;
                }
            }
            println!("Queued {} of {} {} event(s).", accepted, count, event_type);
        }
    }

    Ok(())
}
