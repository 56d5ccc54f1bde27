//! Error types for the vault orchestrator.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Claim error: {0}")]
    Claim(#[from] ClaimError),

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),
}

impl Error {
    /// Stable label written to the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Storage(e) => e.kind(),
            Self::Record(e) => e.kind(),
            Self::Claim(e) => e.kind(),
            Self::Transition(_) => "invalid_transition",
            Self::Policy(_) => "policy_evaluation",
            Self::Engine(e) => e.kind(),
            Self::Watcher(e) => e.kind(),
        }
    }

    /// Only a missing vault root stops the process. Everything else is
    /// retried on the next interval.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(StorageError::RootMissing { .. }))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Storage-medium errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Vault root {path} is missing or not a directory")]
    RootMissing { path: PathBuf },

    #[error("Transient IO failure on {path}: {source}")]
    Transient {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage unit not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Storage unit already exists: {path}")]
    AlreadyExists { path: PathBuf },
}

impl StorageError {
    /// Wrap an IO error, mapping `NotFound`/`AlreadyExists` to their own variants.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            _ => Self::Transient { path, source },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RootMissing { .. } => "root_missing",
            Self::Transient { .. } => "transient_io",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
        }
    }
}

/// Record parsing and identity errors.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Corrupt record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Invalid record id '{0}'")]
    InvalidId(String),
}

impl RecordError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Corrupt { .. } => "corrupt_record",
            Self::InvalidId(_) => "invalid_id",
        }
    }
}

/// Claim manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("Record {record} is already claimed by {holder}")]
    Conflict { record: String, holder: String },

    #[error("Record {record} not found in Intake or any claim folder")]
    NotFound { record: String },

    #[error("Record {record} is not held by {owner}")]
    NotOwner { record: String, owner: String },

    #[error("Storage failure while claiming: {0}")]
    Storage(#[from] StorageError),
}

impl ClaimError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "claim_conflict",
            Self::NotFound { .. } => "not_found",
            Self::NotOwner { .. } => "not_owner",
            Self::Storage(e) => e.kind(),
        }
    }
}

/// Lifecycle transition errors.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("Record {record} cannot move from {from} to {to}")]
    Invalid {
        record: String,
        from: String,
        to: String,
    },

    #[error("Transition {from} -> {to} is reserved for a human decision")]
    HumanOnly { from: String, to: String },
}

/// Approval policy errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Rule '{rule}' could not be evaluated: {reason}")]
    Evaluation { rule: String, reason: String },

    #[error("Failed to load policy from {path}: {reason}")]
    Load { path: PathBuf, reason: String },
}

/// Reasoning engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Reasoning engine timed out after {budget:?}")]
    Timeout { budget: Duration },

    #[error("Failed to launch reasoning engine '{program}': {reason}")]
    Launch { program: String, reason: String },

    #[error("Reasoning engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Invalid engine report: {0}")]
    InvalidReport(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "engine_timeout",
            Self::Launch { .. } => "engine_launch",
            Self::Failed { .. } => "engine_failed",
            Self::InvalidReport(_) => "engine_report",
        }
    }
}

/// Watcher errors.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Watcher {watcher} fetch failed: {reason}")]
    Fetch { watcher: String, reason: String },

    #[error("Source item {source_id} is malformed: {reason}")]
    Malformed { source_id: String, reason: String },

    #[error("Offset log error: {0}")]
    Offsets(#[from] StorageError),
}

impl WatcherError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "watcher_fetch",
            Self::Malformed { .. } => "malformed_source",
            Self::Offsets(e) => e.kind(),
        }
    }
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
