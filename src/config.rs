//! TOML configuration for Guardian.
//!
//! Every section has defaults, so an empty or partial file is valid. The
//! file is located through the `GUARDIAN_CONFIG` environment variable, then
//! the standard system path, then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::enforce::ActionScope;

pub const CONFIG_ENV: &str = "GUARDIAN_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/guardian/guardian.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardianConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub policies: PoliciesConfig,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GuardianConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded guardian configuration");
        Ok(config)
    }

    /// Try, in order: `GUARDIAN_CONFIG`, `/etc/guardian/guardian.toml`,
    /// compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "GUARDIAN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit `--config` path must load; otherwise fall back as above.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8087".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/guardian.db".to_string(),
        }
    }
}

/// Six-field cron expressions (seconds first).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub evaluate_cron: String,
    pub cleanup_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluate_cron: "0 */2 * * * *".to_string(),
            cleanup_cron: "30 */5 * * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Bounded ingestion queue; events beyond this are dropped.
    pub queue_capacity: usize,
    /// Events older than this are purged by the sweeper; 0 keeps them forever.
    pub retention_days: u32,
    pub ip_hash_salt: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            retention_days: 30,
            ip_hash_salt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
    pub cache_ttl_secs: u64,
    /// Seed the default policy set into an empty store at startup.
    pub seed_defaults: bool,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            seed_defaults: true,
        }
    }
}

impl PoliciesConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// Scopes whose requests are refused (503) when the lookup itself fails.
    pub fail_closed_scopes: Vec<ActionScope>,
    /// Minimum length of an operator's justification for manual actions.
    pub min_justification_len: usize,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            fail_closed_scopes: Vec::new(),
            min_justification_len: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines operator audit log; disabled when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = GuardianConfig::default();

        assert_eq!(cfg.server.bind, "127.0.0.1:8087");
        assert_eq!(cfg.storage.database_path, "data/guardian.db");
        assert!(cfg.scheduler.enabled);
        assert_eq!(cfg.scheduler.evaluate_cron, "0 */2 * * * *");
        assert_eq!(cfg.events.queue_capacity, 1024);
        assert_eq!(cfg.events.retention_days, 30);
        assert_eq!(cfg.policies.cache_ttl(), Duration::from_secs(30));
        assert!(cfg.policies.seed_defaults);
        assert!(cfg.enforcement.fail_closed_scopes.is_empty());
        assert_eq!(cfg.enforcement.min_justification_len, 10);
        assert!(cfg.audit.path.is_none());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[server]
bind = "0.0.0.0:9000"

[storage]
database_path = "/var/lib/guardian/guardian.db"

[scheduler]
evaluate_cron = "0 * * * * *"
cleanup_cron = "15 * * * * *"

[events]
queue_capacity = 64
retention_days = 0
ip_hash_salt = "pepper"

[policies]
cache_ttl_secs = 5
seed_defaults = false

[enforcement]
fail_closed_scopes = ["EXPORTS", "AI"]
min_justification_len = 20

[audit]
path = "/var/log/guardian/operator.jsonl"

[logging]
level = "debug"
json = true
"#;

        let cfg: GuardianConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert_eq!(cfg.storage.database_path, "/var/lib/guardian/guardian.db");
        assert_eq!(cfg.scheduler.cleanup_cron, "15 * * * * *");
        assert_eq!(cfg.events.queue_capacity, 64);
        assert_eq!(cfg.events.retention_days, 0);
        assert_eq!(cfg.events.ip_hash_salt, "pepper");
        assert!(!cfg.policies.seed_defaults);
        assert_eq!(
            cfg.enforcement.fail_closed_scopes,
            vec![ActionScope::Exports, ActionScope::Ai]
        );
        assert_eq!(cfg.enforcement.min_justification_len, 20);
        assert_eq!(
            cfg.audit.path,
            Some(PathBuf::from("/var/log/guardian/operator.jsonl"))
        );
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: GuardianConfig = toml::from_str("[server]\nbind = \"10.0.0.1:8080\"\n").unwrap();
        assert_eq!(cfg.server.bind, "10.0.0.1:8080");
        assert_eq!(cfg.events.queue_capacity, 1024);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_unknown_scope_is_rejected() {
        let result: Result<GuardianConfig, _> =
            toml::from_str("[enforcement]\nfail_closed_scopes = [\"EVERYTHING\"]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_missing_path_errors() {
        let result = GuardianConfig::resolve(Some(Path::new("/nonexistent/guardian.toml")));
        assert!(result.is_err());
    }
}
