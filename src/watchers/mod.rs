//! Watchers turn external items into Intake records.
//!
//! A watcher only fetches and converts. Deduplication, durable writes and
//! offset bookkeeping live in [`materialize`], so every watcher gets the
//! same crash guarantees: a source id is marked seen only after its record
//! is on disk, and a replay after a crash lands on the same record id.

pub mod drop_folder;
pub mod offsets;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::error::{Error, StorageError, WatcherError};
use crate::lifecycle::State;
use crate::vault::record::tags;
use crate::vault::{paths, Location, Priority, Record, RecordId, RecordKind, Vault};

pub use drop_folder::DropFolderWatcher;
pub use offsets::OffsetTracker;

// ── Source items ────────────────────────────────────────────────────

/// One item as fetched from a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceItem {
    /// Stable, source-native identifier.
    pub source_id: String,
    pub received: DateTime<Utc>,
    /// Display name, e.g. the file name.
    pub name: Option<String>,
    pub content: Vec<u8>,
    /// Facts the source already knows (sender, subject, ...).
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl SourceItem {
    pub fn new(source_id: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            source_id: source_id.into(),
            received: Utc::now(),
            name: None,
            content: content.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

// ── Watcher trait ───────────────────────────────────────────────────

/// A producer of new items.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Watcher kind, e.g. "mail" or "file". Prefixes record ids and names
    /// the offset log.
    fn kind(&self) -> &str;

    /// Fetch items. Each call is a fresh, finite fetch.
    async fn poll(&self) -> Result<Vec<SourceItem>, WatcherError>;

    /// Convert an item into a record. Must be deterministic in the record id.
    /// `Malformed` items are quarantined as error-tagged records.
    fn to_record(&self, item: &SourceItem) -> Result<Record, WatcherError>;

    /// Kind used for error-tagged records of this watcher.
    fn record_kind(&self) -> RecordKind {
        RecordKind::MessageItem
    }
}

// ── Record helpers shared by watchers ───────────────────────────────

const URGENT_KEYWORDS: &[&str] = &["urgent", "asap", "immediately", "emergency"];

/// Keyword priority: urgent wording is high, anything else normal.
pub fn priority_from_text(text: &str) -> Priority {
    let lower = text.to_lowercase();
    if URGENT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Priority::High
    } else {
        Priority::Normal
    }
}

/// Default checklist for a freshly materialised record.
pub fn suggested_actions(kind: RecordKind) -> &'static [&'static str] {
    match kind {
        RecordKind::MailItem => &[
            "Review email content",
            "Reply to sender",
            "Take required action",
            "Archive after processing",
        ],
        RecordKind::MessageItem => &[
            "Review message",
            "Reply to sender",
            "Take required action",
            "Archive after processing",
        ],
        _ => &[
            "Review file content",
            "Take required action",
            "Archive after processing",
        ],
    }
}

/// Error-tagged stand-in for an item that could not be converted.
pub fn error_record(watcher_kind: &str, kind: RecordKind, item: &SourceItem, reason: &str) -> Record {
    let preview: String = String::from_utf8_lossy(&item.content).chars().take(500).collect();
    let mut record = Record::new(RecordId::from_source(watcher_kind, &item.source_id), kind)
        .with_meta("source_id", item.source_id.clone())
        .with_body(format!(
            "Could not convert this item: {reason}\n\n```\n{preview}\n```"
        ))
        .with_action("Inspect the source item")
        .with_action("Archive after processing");
    if let Some(name) = &item.name {
        record.set_meta("source_name", name.clone());
    }
    record.created = item.received;
    record.add_tag(tags::ERROR);
    record.trail.error = Some(reason.to_string());
    record
}

// ── Materialisation ─────────────────────────────────────────────────

/// What happened to one source item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    Created(RecordId),
    /// The offset log already had this source id.
    AlreadySeen,
    /// A record with this id already exists somewhere in the vault.
    Duplicate(RecordId),
    /// Malformed item, written as an error-tagged record.
    Quarantined(RecordId),
}

/// Write one source item into Intake, at most once.
pub async fn materialize(
    watcher: &dyn Watcher,
    item: &SourceItem,
    offsets: &mut OffsetTracker,
    vault: &Vault,
) -> Result<Materialized, Error> {
    if offsets.has_seen(&item.source_id) {
        return Ok(Materialized::AlreadySeen);
    }

    let (record, malformed) = match watcher.to_record(item) {
        Ok(record) => (record, false),
        Err(WatcherError::Malformed { reason, .. }) => {
            warn!(watcher = watcher.kind(), source_id = %item.source_id, reason = %reason, "Malformed source item");
            (
                error_record(watcher.kind(), watcher.record_kind(), item, &reason),
                true,
            )
        }
        Err(e) => return Err(e.into()),
    };

    // A crash between write and mark leaves the record but not the offset.
    if vault.locate(&record.id).await?.is_some() {
        offsets
            .mark_seen(&item.source_id, &record.id)
            .await
            .map_err(WatcherError::Offsets)?;
        debug!(record = %record.id, "Source item already materialised");
        return Ok(Materialized::Duplicate(record.id));
    }

    match vault.write_new(&Location::Folder(State::Intake), &record).await {
        Ok(()) => {}
        Err(Error::Storage(StorageError::AlreadyExists { .. })) => {
            offsets
                .mark_seen(&item.source_id, &record.id)
                .await
                .map_err(WatcherError::Offsets)?;
            return Ok(Materialized::Duplicate(record.id));
        }
        Err(e) => return Err(e),
    }

    offsets
        .mark_seen(&item.source_id, &record.id)
        .await
        .map_err(WatcherError::Offsets)?;

    if malformed {
        Ok(Materialized::Quarantined(record.id))
    } else {
        info!(watcher = watcher.kind(), record = %record.id, "New record in Intake");
        Ok(Materialized::Created(record.id))
    }
}

/// Counters for one poll-and-materialise pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatcherCycle {
    pub created: usize,
    pub already_seen: usize,
    pub duplicates: usize,
    pub quarantined: usize,
}

/// Poll once and materialise everything, in fetch order. A fetch failure
/// leaves the offsets untouched. A write failure stops the pass so later
/// items are not materialised ahead of earlier ones.
pub async fn run_watcher_cycle(
    watcher: &dyn Watcher,
    offsets: &mut OffsetTracker,
    vault: &Vault,
    audit: &AuditLog,
) -> Result<WatcherCycle, Error> {
    let items = match watcher.poll().await {
        Ok(items) => items,
        Err(e) => {
            let err = Error::from(e);
            audit.record_error(watcher.kind(), "poll", None, None, &err).await;
            return Err(err);
        }
    };

    let mut cycle = WatcherCycle::default();
    for item in &items {
        match materialize(watcher, item, offsets, vault).await {
            Ok(Materialized::Created(_)) => cycle.created += 1,
            Ok(Materialized::AlreadySeen) => cycle.already_seen += 1,
            Ok(Materialized::Duplicate(_)) => cycle.duplicates += 1,
            Ok(Materialized::Quarantined(id)) => {
                cycle.quarantined += 1;
                let err = Error::from(WatcherError::Malformed {
                    source_id: item.source_id.clone(),
                    reason: "quarantined as error-tagged record".to_string(),
                });
                audit
                    .record_error(watcher.kind(), "materialize", Some(id.as_str()), Some("Intake"), &err)
                    .await;
            }
            Err(e) => {
                audit
                    .record_error(watcher.kind(), "materialize", None, None, &e)
                    .await;
                return Err(e);
            }
        }
    }

    offsets
        .mark_checked(Utc::now())
        .await
        .map_err(WatcherError::Offsets)?;
    if cycle.created + cycle.quarantined > 0 {
        info!(
            watcher = watcher.kind(),
            created = cycle.created,
            quarantined = cycle.quarantined,
            "Watcher cycle complete"
        );
    }
    Ok(cycle)
}

/// Open the offset log for a watcher under the vault's state folder.
pub async fn open_offsets(
    vault: &Vault,
    watcher: &dyn Watcher,
    retention: usize,
) -> Result<OffsetTracker, StorageError> {
    OffsetTracker::open(&vault.resolve(paths::OFFSETS), watcher.kind(), retention).await
}

/// Run a watcher as its own loop, independent of the trigger loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_watcher_loop(
    watcher: Arc<dyn Watcher>,
    vault: Vault,
    audit: AuditLog,
    retention: usize,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let mut offsets = match open_offsets(&vault, watcher.as_ref(), retention).await {
            Ok(offsets) => offsets,
            Err(e) => {
                error!(watcher = watcher.kind(), error = %e, "Cannot open offset log");
                return;
            }
        };
        info!(
            watcher = watcher.kind(),
            seen = offsets.len(),
            "Watcher started, polling every {}s",
            interval.as_secs()
        );

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!(watcher = watcher.kind(), "Watcher shutting down");
                return;
            }

            if let Err(e) = run_watcher_cycle(watcher.as_ref(), &mut offsets, &vault, &audit).await {
                if e.is_fatal() {
                    error!(watcher = watcher.kind(), error = %e, "Vault unavailable, watcher stopping");
                    return;
                }
                warn!(watcher = watcher.kind(), error = %e, "Watcher cycle failed");
            }
        }
    });

    (handle, shutdown_flag)
}
