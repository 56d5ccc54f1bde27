//! Per-watcher offset log.
//!
//! An append-only JSONL file under `.state/offsets/<kind>.jsonl`, replayed on
//! open. A source id is appended only after its record is durably in the
//! vault. A torn last line from a crash is skipped on replay.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::vault::RecordId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Entry {
    Seen {
        source_id: String,
        record_id: RecordId,
        at: DateTime<Utc>,
    },
    Checked {
        at: DateTime<Utc>,
    },
}

/// Replayed offset state for one watcher kind.
#[derive(Debug)]
pub struct OffsetTracker {
    path: PathBuf,
    kind: String,
    retention: usize,
    seen: HashMap<String, RecordId>,
    /// Source ids oldest first, for compaction.
    order: VecDeque<(String, DateTime<Utc>)>,
    last_checked: Option<DateTime<Utc>>,
    /// Lines currently in the file, of either kind.
    lines: usize,
}

impl OffsetTracker {
    /// Open and replay the log for `kind` in `dir`.
    pub async fn open(dir: &Path, kind: &str, retention: usize) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::io(dir, e))?;
        let path = dir.join(format!("{kind}.jsonl"));
        let mut tracker = Self {
            path,
            kind: kind.to_string(),
            retention: retention.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
            last_checked: None,
            lines: 0,
        };

        let text = match fs::read_to_string(&tracker.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(StorageError::io(&tracker.path, e)),
        };
        let mut skipped = 0usize;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<Entry>(line) {
                Ok(entry) => tracker.apply(entry),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(watcher = %tracker.kind, skipped, "Skipped unreadable offset lines");
        }
        // Terminate a torn tail so the next append starts on its own line.
        if !text.is_empty() && !text.ends_with('\n') {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(&tracker.path)
                .await
                .map_err(|e| StorageError::io(&tracker.path, e))?;
            file.write_all(b"\n")
                .await
                .map_err(|e| StorageError::io(&tracker.path, e))?;
        }
        debug!(watcher = %tracker.kind, seen = tracker.seen.len(), "Offset log replayed");
        Ok(tracker)
    }

    fn apply(&mut self, entry: Entry) {
        self.lines += 1;
        match entry {
            Entry::Seen {
                source_id,
                record_id,
                at,
            } => {
                if self.seen.insert(source_id.clone(), record_id).is_none() {
                    self.order.push_back((source_id, at));
                }
            }
            Entry::Checked { at } => {
                self.last_checked = Some(self.last_checked.map_or(at, |prev| prev.max(at)));
            }
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn has_seen(&self, source_id: &str) -> bool {
        self.seen.contains_key(source_id)
    }

    /// The record a source id was materialised into.
    pub fn record_for(&self, source_id: &str) -> Option<&RecordId> {
        self.seen.get(source_id)
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.last_checked
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Record that `source_id` now exists as `record_id`. Call only after the
    /// record is durable.
    pub async fn mark_seen(&mut self, source_id: &str, record_id: &RecordId) -> Result<(), StorageError> {
        if self.has_seen(source_id) {
            return Ok(());
        }
        let entry = Entry::Seen {
            source_id: source_id.to_string(),
            record_id: record_id.clone(),
            at: Utc::now(),
        };
        self.append(&entry).await?;
        self.apply(entry);
        self.compact_if_due().await
    }

    pub async fn mark_checked(&mut self, at: DateTime<Utc>) -> Result<(), StorageError> {
        let entry = Entry::Checked { at };
        self.append(&entry).await?;
        self.apply(entry);
        self.compact_if_due().await
    }

    async fn compact_if_due(&mut self) -> Result<(), StorageError> {
        if self.lines > self.retention * 2 {
            self.compact().await?;
        }
        Ok(())
    }

    async fn append(&self, entry: &Entry) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(entry).map_err(|e| StorageError::Transient {
            path: self.path.clone(),
            source: std::io::Error::other(e),
        })?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;
        Ok(())
    }

    /// Rewrite the log keeping the newest `retention` ids.
    async fn compact(&mut self) -> Result<(), StorageError> {
        while self.order.len() > self.retention {
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }

        let mut text = String::new();
        for (source_id, at) in &self.order {
            let Some(record_id) = self.seen.get(source_id) else {
                continue;
            };
            let entry = Entry::Seen {
                source_id: source_id.clone(),
                record_id: record_id.clone(),
                at: *at,
            };
            if let Ok(line) = serde_json::to_string(&entry) {
                text.push_str(&line);
                text.push('\n');
            }
        }
        if let Some(at) = self.last_checked
            && let Ok(line) = serde_json::to_string(&Entry::Checked { at })
        {
            text.push_str(&line);
            text.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        file.write_all(text.as_bytes())
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;

        self.lines = self.order.len() + usize::from(self.last_checked.is_some());
        info!(watcher = %self.kind, kept = self.lines, "Offset log compacted");
        Ok(())
    }
}
