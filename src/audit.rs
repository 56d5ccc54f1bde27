//! Durable audit log.
//!
//! One JSON object per line in `Logs/<YYYY-MM-DD>.jsonl`. Every lifecycle
//! transition and every recoverable error lands here with the record id,
//! state and error kind, so nothing is swallowed silently.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Error, StorageError};

/// Outcome column of an audit line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failed,
}

/// A single audit line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Who acted: an owner id, `human`, or a watcher kind.
    pub actor: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub status: AuditStatus,
}

impl AuditEntry {
    pub fn success(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            record: None,
            state: None,
            error_kind: None,
            detail: None,
            status: AuditStatus::Success,
        }
    }

    pub fn failed(actor: impl Into<String>, action: impl Into<String>, error: &Error) -> Self {
        Self {
            error_kind: Some(error.kind().to_string()),
            detail: Some(error.to_string()),
            status: AuditStatus::Failed,
            ..Self::success(actor, action)
        }
    }

    pub fn record(mut self, id: impl ToString) -> Self {
        self.record = Some(id.to_string());
        self
    }

    pub fn state(mut self, state: impl ToString) -> Self {
        self.state = Some(state.to_string());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Append-only JSONL writer, shared across tasks of one process.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }

    /// Append an entry. The file for the entry's day is created on demand.
    pub async fn append(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        let path = self.path_for(entry.timestamp.date_naive());
        let mut line = serde_json::to_string(entry).map_err(|e| StorageError::Transient {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.flush().await.map_err(|e| StorageError::io(&path, e))?;
        Ok(())
    }

    /// Log a successful state change.
    pub async fn record_transition(
        &self,
        actor: &str,
        record: impl ToString,
        from: impl ToString,
        to: impl ToString,
    ) {
        let entry = AuditEntry::success(actor, "transition")
            .record(record)
            .state(to)
            .detail(format!("from {}", from.to_string()));
        self.append_or_warn(&entry).await;
    }

    /// Log a recoverable failure with its context.
    pub async fn record_error(
        &self,
        actor: &str,
        action: &str,
        record: Option<&str>,
        state: Option<&str>,
        error: &Error,
    ) {
        let mut entry = AuditEntry::failed(actor, action, error);
        entry.record = record.map(str::to_string);
        entry.state = state.map(str::to_string);
        self.append_or_warn(&entry).await;
    }

    /// Write an entry, falling back to the diagnostic log when the audit
    /// file itself cannot be written.
    pub async fn append_or_warn(&self, entry: &AuditEntry) {
        if let Err(e) = self.append(entry).await {
            warn!(action = %entry.action, error = %e, "Failed to append audit entry");
        }
    }

    /// Read back every entry for a day. Unparseable lines are skipped.
    pub async fn entries(&self, day: NaiveDate) -> Result<Vec<AuditEntry>, StorageError> {
        let path = self.path_for(day);
        let text = match fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        Ok(text
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
