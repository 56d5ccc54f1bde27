//! Record data model and the on-disk document format.
//!
//! A record file is a YAML header fenced by `---` lines, a free-form body,
//! and an optional `## Actions` checklist:
//!
//! ```text
//! ---
//! id: mail-msg-42
//! kind: mail-item
//! created: 2026-10-16T09:00:00Z
//! priority: high
//! sender: alice@example.com
//! ---
//!
//! Can we move the call to Friday?
//!
//! ## Actions
//! - [ ] Reply to sender
//! ```
//!
//! The header never carries a status: the folder a record sits in is its state.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::RecordError;

/// Longest identifier we will put in a file name.
const MAX_ID_LEN: usize = 120;

/// Heading that opens the action checklist.
const ACTIONS_HEADING: &str = "## Actions";

/// Header keys owned by the record itself; metadata may not shadow them.
const RESERVED_KEYS: &[&str] = &["id", "kind", "created", "priority", "parent", "tags", "trail"];

/// Legacy header key dropped on read. Location is the only state.
const LEGACY_STATUS_KEY: &str = "status";

/// Well-known tags.
pub mod tags {
    pub const STALE: &str = "stale";
    pub const EXECUTING: &str = "executing";
    pub const ERROR: &str = "error";
    pub const AUTO_APPROVED: &str = "auto-approved";
}

/// Stable, globally unique record identifier. Doubles as the file stem.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Validate an identifier that is already in canonical form.
    pub fn new(raw: impl Into<String>) -> Result<Self, RecordError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= MAX_ID_LEN
            && !raw.starts_with('.')
            && raw.chars().all(is_id_char);
        if valid {
            Ok(Self(raw))
        } else {
            Err(RecordError::InvalidId(raw))
        }
    }

    /// Derive the identifier for a watcher source item.
    ///
    /// Deterministic: the same `(kind, source_id)` always yields the same id,
    /// so re-materializing a source item targets the same record. When the
    /// raw pair is not already a valid id, a digest of it is appended so
    /// distinct sources never share an id.
    pub fn from_source(watcher_kind: &str, source_id: &str) -> Self {
        let kind = sanitize(watcher_kind);
        let source = sanitize(source_id);
        let raw = format!("{kind}-{source}");
        if kind == watcher_kind
            && source == source_id
            && !raw.starts_with('.')
            && raw.len() <= MAX_ID_LEN
        {
            return Self(raw);
        }

        let digest = source_digest(watcher_kind, source_id);
        let head: String = raw
            .trim_start_matches('.')
            .chars()
            .take(MAX_ID_LEN - DIGEST_LEN - 1)
            .collect();
        let head = if head.is_empty() { "record" } else { head.as_str() };
        Self(format!("{head}-{digest}"))
    }

    /// Identifier of the plan record spawned by `parent`.
    pub fn plan_for(parent: &RecordId) -> Self {
        Self::from_source("plan", parent.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the storage unit for this record.
    pub fn file_name(&self) -> String {
        format!("{}.md", self.0)
    }

    /// Recover the id from a storage unit file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".md")?;
        Self::new(stem).ok()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Hex characters of the source digest appended to lossy ids.
const DIGEST_LEN: usize = 8;

fn source_digest(watcher_kind: &str, source_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(watcher_kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(source_id.as_bytes());
    hasher
        .finalize()
        .iter()
        .take(DIGEST_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if is_id_char(c) { c } else { '-' })
        .collect()
}

/// What a record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    MailItem,
    FileItem,
    MessageItem,
    Plan,
    ApprovalRequest,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MailItem => "mail-item",
            Self::FileItem => "file-item",
            Self::MessageItem => "message-item",
            Self::Plan => "plan",
            Self::ApprovalRequest => "approval-request",
        };
        f.write_str(s)
    }
}

/// Processing priority. Ordered `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    #[serde(alias = "medium")]
    Normal,
    High,
    #[serde(alias = "urgent")]
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A human decision on a gated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => f.write_str("approved"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// One line of the action checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub done: bool,
    pub text: String,
}

impl ActionItem {
    pub fn todo(text: impl Into<String>) -> Self {
        Self {
            done: false,
            text: text.into(),
        }
    }
}

/// Lifecycle annotations written by the claim manager and approval gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approval_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Trail {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    id: RecordId,
    kind: RecordKind,
    created: DateTime<Utc>,
    #[serde(default)]
    priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Trail::is_empty")]
    trail: Trail,
    #[serde(flatten)]
    metadata: BTreeMap<String, serde_json::Value>,
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub kind: RecordKind,
    pub created: DateTime<Utc>,
    pub priority: Priority,
    pub parent: Option<RecordId>,
    pub tags: Vec<String>,
    pub trail: Trail,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub body: String,
    pub actions: Vec<ActionItem>,
}

impl Record {
    pub fn new(id: RecordId, kind: RecordKind) -> Self {
        Self {
            id,
            kind,
            created: Utc::now(),
            priority: Priority::Normal,
            parent: None,
            tags: Vec::new(),
            trail: Trail::default(),
            metadata: BTreeMap::new(),
            body: String::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent: RecordId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_action(mut self, text: impl Into<String>) -> Self {
        self.actions.push(ActionItem::todo(text));
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.set_meta(key, value);
        self
    }

    /// Set a metadata field. Reserved header keys are refused.
    pub fn set_meta(&mut self, key: &str, value: impl Into<serde_json::Value>) -> bool {
        if RESERVED_KEYS.contains(&key) || key == LEGACY_STATUS_KEY {
            debug!(record = %self.id, key, "Refusing to shadow reserved header key");
            return false;
        }
        self.metadata.insert(key.to_string(), value.into());
        true
    }

    /// Metadata value rendered as a string (numbers and booleans included).
    pub fn meta_str(&self, key: &str) -> Option<String> {
        value_as_string(self.metadata.get(key)?)
    }

    /// Metadata value as a list: arrays are taken as-is, strings split on commas.
    pub fn meta_list(&self, key: &str) -> Vec<String> {
        value_as_list(self.metadata.get(key))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn add_tag(&mut self, tag: &str) {
        if !self.has_tag(tag) {
            self.tags.push(tag.to_string());
        }
    }

    pub fn remove_tag(&mut self, tag: &str) {
        self.tags.retain(|t| t != tag);
    }

    /// Presentation order: priority first (highest wins), then oldest first.
    pub fn presentation_cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created.cmp(&other.created))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Parse a record document. `path` is only used for error context.
    pub fn parse(text: &str, path: &Path) -> Result<Self, RecordError> {
        let corrupt = |reason: String| RecordError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut lines = text.split_inclusive('\n');
        match lines.next() {
            Some(first) if first.trim_end() == "---" => {}
            _ => return Err(corrupt("missing opening header fence".into())),
        }

        let mut header = String::new();
        let mut closed = false;
        for line in lines.by_ref() {
            if line.trim_end() == "---" {
                closed = true;
                break;
            }
            header.push_str(line);
        }
        if !closed {
            return Err(corrupt("missing closing header fence".into()));
        }
        let rest: String = lines.collect();

        let mut parsed: Header =
            serde_yaml::from_str(&header).map_err(|e| corrupt(format!("bad header: {e}")))?;
        parsed.metadata.remove(LEGACY_STATUS_KEY);

        let (body, actions) = split_actions(&rest);

        Ok(Self {
            id: parsed.id,
            kind: parsed.kind,
            created: parsed.created,
            priority: parsed.priority,
            parent: parsed.parent,
            tags: parsed.tags,
            trail: parsed.trail,
            metadata: parsed.metadata,
            body,
            actions,
        })
    }

    /// Render the record document.
    pub fn render(&self) -> Result<String, RecordError> {
        let header = Header {
            id: self.id.clone(),
            kind: self.kind,
            created: self.created,
            priority: self.priority,
            parent: self.parent.clone(),
            tags: self.tags.clone(),
            trail: self.trail.clone(),
            metadata: self
                .metadata
                .iter()
                .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let yaml = serde_yaml::to_string(&header).map_err(|e| RecordError::Corrupt {
            path: self.id.file_name().into(),
            reason: format!("cannot serialize header: {e}"),
        })?;

        let mut out = format!("---\n{yaml}---\n");
        if !self.body.is_empty() {
            out.push('\n');
            out.push_str(&self.body);
            out.push('\n');
        }
        if !self.actions.is_empty() {
            out.push('\n');
            out.push_str(ACTIONS_HEADING);
            out.push('\n');
            for item in &self.actions {
                let mark = if item.done { 'x' } else { ' ' };
                out.push_str(&format!("- [{mark}] {}\n", item.text));
            }
        }
        Ok(out)
    }
}

/// Separate the action checklist from the body. Anything under the
/// heading that is not a checklist line stays in the body.
fn split_actions(rest: &str) -> (String, Vec<ActionItem>) {
    let mut body_lines = Vec::new();
    let mut notes = Vec::new();
    let mut actions = Vec::new();
    let mut in_actions = false;

    for line in rest.lines() {
        if line.trim() == ACTIONS_HEADING {
            in_actions = true;
            continue;
        }
        if in_actions && line.starts_with('#') {
            in_actions = false;
        }
        if !in_actions {
            body_lines.push(line);
            continue;
        }
        let trimmed = line.trim_start();
        if let Some(text) = trimmed.strip_prefix("- [ ] ") {
            actions.push(ActionItem::todo(text.trim_end()));
        } else if let Some(text) = trimmed
            .strip_prefix("- [x] ")
            .or_else(|| trimmed.strip_prefix("- [X] "))
        {
            actions.push(ActionItem {
                done: true,
                text: text.trim_end().to_string(),
            });
        } else if !trimmed.is_empty() {
            notes.push(line);
        }
    }

    let mut body = body_lines.join("\n").trim_matches('\n').to_string();
    if !notes.is_empty() {
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str(&notes.join("\n"));
    }
    (body, actions)
}

pub(crate) fn value_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn value_as_list(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => {
            items.iter().filter_map(value_as_string).collect()
        }
        Some(serde_json::Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(other) => value_as_string(other).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Record {
        let mut record = Record::new(RecordId::from_source("mail", "msg-42"), RecordKind::MailItem)
            .with_priority(Priority::High)
            .with_meta("sender", "alice@example.com")
            .with_meta("subject", "Quick question")
            .with_meta("attachments", serde_json::json!(["invoice.pdf"]))
            .with_body("Can we move the call to Friday?")
            .with_action("Review email content")
            .with_action("Reply to sender");
        record.created = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();
        record
    }

    #[test]
    fn render_then_parse_preserves_record() {
        let record = sample();
        let text = record.render().unwrap();
        assert!(text.starts_with("---\n"));
        assert!(text.contains("kind: mail-item"));
        assert!(text.contains("- [ ] Reply to sender"));
        assert!(!text.contains("status:"));

        let parsed = Record::parse(&text, Path::new("mail-msg-42.md")).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn parses_hand_written_document() {
        let text = "---\n\
id: file-report.txt\n\
kind: file-item\n\
created: 2026-10-16T08:30:00Z\n\
priority: medium\n\
status: pending\n\
amount: 250.00\n\
recipients: a@x.com, b@y.com\n\
---\n\
\n\
Quarterly report attached.\n\
\n\
## Actions\n\
- [x] Review content\n\
- [ ] Archive after processing\n";
        let record = Record::parse(text, Path::new("file-report.txt.md")).unwrap();
        assert_eq!(record.priority, Priority::Normal);
        assert_eq!(record.body, "Quarterly report attached.");
        assert_eq!(record.actions.len(), 2);
        assert!(record.actions[0].done);
        assert!(!record.actions[1].done);
        assert!(!record.metadata.contains_key("status"));
        assert_eq!(record.meta_str("amount").as_deref(), Some("250.0"));
        assert_eq!(record.meta_list("recipients"), vec!["a@x.com", "b@y.com"]);
    }

    #[test]
    fn notes_under_actions_survive_rewrite() {
        let text = "---\nid: mail-1\nkind: mail-item\ncreated: 2026-10-16T09:00:00Z\n---\n\nHello\n\n## Actions\n- [ ] Reply to sender\nCheck with legal first.\n- [x] Archive after processing\n\n## Notes\nCalled them back.\n";
        let record = Record::parse(text, Path::new("mail-1.md")).unwrap();
        assert_eq!(record.actions.len(), 2);
        assert!(record.body.contains("Check with legal first."));
        assert!(record.body.contains("## Notes\nCalled them back."));

        let again = Record::parse(&record.render().unwrap(), Path::new("mail-1.md")).unwrap();
        assert_eq!(again.actions, record.actions);
        assert!(again.body.contains("Check with legal first."));
        assert!(again.body.contains("Called them back."));
    }

    #[test]
    fn missing_fence_is_corrupt() {
        let err = Record::parse("hello world", Path::new("x.md")).unwrap_err();
        assert!(matches!(err, RecordError::Corrupt { .. }));

        let err = Record::parse("---\nid: x\n", Path::new("x.md")).unwrap_err();
        assert!(matches!(err, RecordError::Corrupt { .. }));
    }

    #[test]
    fn unknown_kind_is_corrupt() {
        let text = "---\nid: x\nkind: fax\ncreated: 2026-10-16T08:30:00Z\n---\n";
        let err = Record::parse(text, Path::new("x.md")).unwrap_err();
        assert!(matches!(err, RecordError::Corrupt { .. }));
    }

    #[test]
    fn source_ids_are_sanitized_and_deterministic() {
        let a = RecordId::from_source("mail", "<CAF+abc@mail.gmail.com>");
        let b = RecordId::from_source("mail", "<CAF+abc@mail.gmail.com>");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("mail--CAF-abc-mail.gmail.com--"));
        assert!(RecordId::new(a.as_str()).is_ok());
        assert_eq!(RecordId::from_source("mail", "msg-42").as_str(), "mail-msg-42");
    }

    #[test]
    fn lossy_source_ids_do_not_collide() {
        let slash = RecordId::from_source("mail", "x/1");
        let dash = RecordId::from_source("mail", "x-1");
        assert_eq!(dash.as_str(), "mail-x-1");
        assert_ne!(slash, dash);

        let spaced = RecordId::from_source("file", "a b.txt");
        assert_ne!(spaced, RecordId::from_source("file", "a-b.txt"));

        let prefix = "p".repeat(MAX_ID_LEN);
        let long_a = RecordId::from_source("mail", &format!("{prefix}a"));
        let long_b = RecordId::from_source("mail", &format!("{prefix}b"));
        assert_ne!(long_a, long_b);
        for id in [&slash, &spaced, &long_a, &long_b] {
            assert!(RecordId::new(id.as_str()).is_ok(), "{id} is not a valid id");
        }

        let parent = RecordId::new(format!("mail-{}", "q".repeat(MAX_ID_LEN - 5))).unwrap();
        let sibling = RecordId::new(format!("mail-{}r", "q".repeat(MAX_ID_LEN - 6))).unwrap();
        assert_ne!(RecordId::plan_for(&parent), RecordId::plan_for(&sibling));
    }

    #[test]
    fn record_id_rejects_path_tricks() {
        assert!(RecordId::new("../etc").is_err());
        assert!(RecordId::new("a/b").is_err());
        assert!(RecordId::new("").is_err());
        assert!(RecordId::new(".hidden").is_err());
        assert_eq!(
            RecordId::from_file_name("mail-1.md"),
            Some(RecordId::new("mail-1").unwrap())
        );
        assert_eq!(RecordId::from_file_name("notes.txt"), None);
    }

    #[test]
    fn priority_ordering_and_aliases() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        let p: Priority = serde_yaml::from_str("urgent").unwrap();
        assert_eq!(p, Priority::Critical);
    }

    #[test]
    fn presentation_order_is_priority_then_age() {
        let mut old_low = sample().with_priority(Priority::Low);
        old_low.id = RecordId::new("a").unwrap();
        let mut new_high = sample();
        new_high.id = RecordId::new("b").unwrap();
        new_high.created = old_low.created + chrono::Duration::hours(1);
        let mut old_high = sample();
        old_high.id = RecordId::new("c").unwrap();

        let mut all = vec![old_low.clone(), new_high.clone(), old_high.clone()];
        all.sort_by(Record::presentation_cmp);
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn reserved_keys_cannot_be_shadowed() {
        let mut record = sample();
        assert!(!record.set_meta("id", "other"));
        assert!(!record.set_meta("status", "done"));
        assert!(record.set_meta("recipient", "bob@example.com"));
    }

    #[test]
    fn tags_are_deduplicated() {
        let mut record = sample();
        record.add_tag(tags::STALE);
        record.add_tag(tags::STALE);
        assert_eq!(record.tags, vec!["stale"]);
        record.remove_tag(tags::STALE);
        assert!(record.tags.is_empty());
    }
}
