//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::vault::paths;

/// Prefix for every environment variable read by [`OrchestratorConfig::from_env`].
pub const ENV_PREFIX: &str = "VAULT_ORCH_";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root folder of the vault.
    pub vault_root: PathBuf,
    /// Logical owner name; host and pid are added at runtime.
    pub owner_name: String,
    /// Fixed cadence of the trigger loop.
    pub interval: Duration,
    /// Cron expression that replaces `interval` when set.
    pub schedule: Option<String>,
    /// Program invoked as the reasoning engine. No engine runs when unset.
    pub engine_program: Option<String>,
    pub engine_args: Vec<String>,
    pub engine_timeout: Duration,
    /// How long a dead owner's claim is left alone before it is requeued.
    pub claim_grace: Duration,
    /// Approvals waiting longer than this are tagged stale.
    pub approval_ttl: Duration,
    /// Abandonments tolerated before a record is quarantined.
    pub max_attempts: u32,
    /// Policy file. Defaults to `<vault>/approval_policy.yaml`.
    pub policy_path: Option<PathBuf>,
    pub policy_reload: Duration,
    /// Source ids kept per watcher offset log.
    pub offset_retention: usize,
    /// Watch `<vault>/Inbox/` for dropped files.
    pub drop_folder: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            vault_root: PathBuf::from("./vault"),
            owner_name: "orchestrator".to_string(),
            interval: Duration::from_secs(30),
            schedule: None,
            engine_program: None,
            engine_args: Vec::new(),
            engine_timeout: Duration::from_secs(300), // 5 minutes
            claim_grace: Duration::from_secs(120),
            approval_ttl: Duration::from_secs(24 * 3600),
            max_attempts: 3,
            policy_path: None,
            policy_reload: Duration::from_secs(60),
            offset_retention: 1000,
            drop_folder: true,
        }
    }
}

impl OrchestratorConfig {
    /// Build config from `VAULT_ORCH_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup. Keys are full names,
    /// prefix included.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(root) = var("VAULT") {
            config.vault_root = PathBuf::from(root);
        }
        if let Some(name) = var("OWNER") {
            config.owner_name = name;
        }
        if let Some(raw) = var("INTERVAL_SECS") {
            config.interval = secs("INTERVAL_SECS", &raw)?;
        }
        config.schedule = var("SCHEDULE");
        config.engine_program = var("ENGINE");
        if let Some(raw) = var("ENGINE_ARGS") {
            config.engine_args = raw.split_whitespace().map(str::to_string).collect();
        }
        if let Some(raw) = var("ENGINE_TIMEOUT_SECS") {
            config.engine_timeout = secs("ENGINE_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = var("CLAIM_GRACE_SECS") {
            config.claim_grace = secs("CLAIM_GRACE_SECS", &raw)?;
        }
        if let Some(raw) = var("APPROVAL_TTL_SECS") {
            config.approval_ttl = secs("APPROVAL_TTL_SECS", &raw)?;
        }
        if let Some(raw) = var("MAX_ATTEMPTS") {
            config.max_attempts = parse("MAX_ATTEMPTS", &raw)?;
        }
        config.policy_path = var("POLICY").map(PathBuf::from);
        if let Some(raw) = var("POLICY_RELOAD_SECS") {
            config.policy_reload = secs("POLICY_RELOAD_SECS", &raw)?;
        }
        if let Some(raw) = var("OFFSET_RETENTION") {
            config.offset_retention = parse("OFFSET_RETENTION", &raw)?;
        }
        if let Some(raw) = var("DROP_FOLDER") {
            config.drop_folder = flag("DROP_FOLDER", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(invalid("INTERVAL_SECS", "must be at least one second"));
        }
        if self.engine_timeout.is_zero() {
            return Err(invalid("ENGINE_TIMEOUT_SECS", "must be at least one second"));
        }
        if self.offset_retention == 0 {
            return Err(invalid("OFFSET_RETENTION", "must be positive"));
        }
        if self.owner_name.trim().is_empty() {
            return Err(invalid("OWNER", "must not be empty"));
        }
        if let Some(schedule) = &self.schedule {
            cron::Schedule::from_str(schedule)
                .map_err(|e| invalid("SCHEDULE", &format!("invalid cron: {e}")))?;
        }
        Ok(())
    }

    pub fn policy_path(&self) -> PathBuf {
        self.policy_path
            .clone()
            .unwrap_or_else(|| self.vault_root.join(paths::POLICY))
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        message: message.to_string(),
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| invalid(key, &format!("cannot parse {raw:?}")))
}

fn secs(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, raw).map(Duration::from_secs)
}

fn flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, &format!("expected a boolean, got {raw:?}"))),
    }
}
