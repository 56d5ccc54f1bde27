//! Drop-folder watcher over `Inbox/`.
//!
//! `.eml` files become mail items; anything else becomes a file item. The
//! original file stays where it was dropped and the record points at it.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use tokio::fs;
use tracing::debug;

use super::{SourceItem, Watcher, priority_from_text, suggested_actions};
use crate::error::WatcherError;
use crate::vault::{paths, Record, RecordId, RecordKind};

/// Files larger than this are recorded by size only.
const MAX_CONTENT_BYTES: u64 = 5 * 1024 * 1024;

/// Longest text body copied into a file record.
const MAX_BODY_CHARS: usize = 20_000;

pub struct DropFolderWatcher {
    inbox: PathBuf,
}

impl DropFolderWatcher {
    pub fn new(inbox: impl Into<PathBuf>) -> Self {
        Self {
            inbox: inbox.into(),
        }
    }

    fn is_candidate(name: &str) -> bool {
        !(name.starts_with('.') || name.ends_with(".tmp") || name.ends_with(".part"))
    }
}

fn extension(name: &str) -> Option<String> {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

fn mail_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return html.trim().to_string();
    }
    "(no readable content)".to_string()
}

#[async_trait]
impl Watcher for DropFolderWatcher {
    fn kind(&self) -> &str {
        "drop"
    }

    fn record_kind(&self) -> RecordKind {
        RecordKind::FileItem
    }

    async fn poll(&self) -> Result<Vec<SourceItem>, WatcherError> {
        let fetch_err = |reason: String| WatcherError::Fetch {
            watcher: "drop".to_string(),
            reason,
        };
        let mut read_dir = fs::read_dir(&self.inbox)
            .await
            .map_err(|e| fetch_err(format!("{}: {e}", self.inbox.display())))?;

        let mut found = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| fetch_err(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !Self::is_candidate(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
            found.push((modified, name, entry.path(), meta.len()));
        }
        found.sort();

        let mut items = Vec::with_capacity(found.len());
        for (modified, name, path, size) in found {
            let content = if size <= MAX_CONTENT_BYTES {
                fs::read(&path)
                    .await
                    .map_err(|e| fetch_err(format!("{}: {e}", path.display())))?
            } else {
                Vec::new()
            };

            let message_id = if extension(&name).as_deref() == Some("eml") {
                MessageParser::default()
                    .parse(&content[..])
                    .and_then(|m| m.message_id().map(str::to_string))
            } else {
                None
            };
            let source_id = message_id.unwrap_or_else(|| format!("{name}@{}", modified.timestamp()));

            let mut item = SourceItem::new(source_id, content)
                .with_field("file_name", name.clone())
                .with_field("size", size)
                .with_field("source_path", format!("{}/{}", paths::INBOX, name));
            item.name = Some(name);
            item.received = modified;
            items.push(item);
        }
        debug!(count = items.len(), inbox = %self.inbox.display(), "Drop folder polled");
        Ok(items)
    }

    fn to_record(&self, item: &SourceItem) -> Result<Record, WatcherError> {
        let name = item.name.clone().unwrap_or_else(|| item.source_id.clone());
        let id = RecordId::from_source(self.kind(), &item.source_id);
        let record = if extension(&name).as_deref() == Some("eml") {
            mail_record(id, item)?
        } else {
            file_record(id, &name, item)
        };
        Ok(record)
    }
}

fn mail_record(id: RecordId, item: &SourceItem) -> Result<Record, WatcherError> {
    let malformed = |reason: &str| WatcherError::Malformed {
        source_id: item.source_id.clone(),
        reason: reason.to_string(),
    };
    let parsed = MessageParser::default()
        .parse(&item.content[..])
        .ok_or_else(|| malformed("not a parseable email"))?;

    let sender = addresses(parsed.from()).into_iter().next();
    let subject = parsed.subject().map(str::to_string);
    if sender.is_none() && subject.is_none() {
        return Err(malformed("email has neither sender nor subject"));
    }

    let mut recipients = addresses(parsed.to());
    recipients.extend(addresses(parsed.cc()));
    let attachments: Vec<String> = parsed
        .attachments()
        .map(|part| MimeHeaders::attachment_name(part).unwrap_or("unnamed").to_string())
        .collect();
    let body = mail_text(&parsed);
    let subject = subject.unwrap_or_else(|| "(no subject)".to_string());
    let received = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or(item.received);

    let mut record = Record::new(id, RecordKind::MailItem)
        .with_priority(priority_from_text(&format!("{subject}\n{body}")))
        .with_meta("sender", sender.unwrap_or_else(|| "unknown".to_string()))
        .with_meta("recipients", recipients)
        .with_meta("subject", subject)
        .with_meta("attachments", attachments)
        .with_meta("received", received.to_rfc3339())
        .with_body(body);
    for (key, value) in &item.fields {
        record.set_meta(key, value.clone());
    }
    if let Some(message_id) = parsed.message_id() {
        record.set_meta("message_id", message_id);
    }
    record.created = item.received;
    for action in suggested_actions(RecordKind::MailItem) {
        record = record.with_action(*action);
    }
    Ok(record)
}

fn file_record(id: RecordId, name: &str, item: &SourceItem) -> Record {
    let body = match std::str::from_utf8(&item.content) {
        Ok(text) if !item.content.is_empty() && !text.contains('\0') => {
            text.chars().take(MAX_BODY_CHARS).collect()
        }
        _ => format!("Binary or oversized file. See {}/{name}.", paths::INBOX),
    };

    let mut record = Record::new(id, RecordKind::FileItem)
        .with_priority(priority_from_text(&format!("{name}\n{body}")))
        .with_meta("extension", extension(name).unwrap_or_default())
        .with_body(body);
    for (key, value) in &item.fields {
        record.set_meta(key, value.clone());
    }
    record.created = item.received;
    for action in suggested_actions(RecordKind::FileItem) {
        record = record.with_action(*action);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::Priority;
    use serde_json::json;
    use tempfile::TempDir;

    const EMAIL: &str = "From: Alice <alice@newco.io>\r\n\
To: me@yourcompany.com\r\n\
Cc: bob@yourcompany.com\r\n\
Subject: URGENT: contract review\r\n\
Message-ID: <msg-42@newco.io>\r\n\
Date: Fri, 16 Oct 2026 09:00:00 +0000\r\n\
\r\n\
Can you look at this today?\r\n";

    #[tokio::test]
    async fn eml_becomes_mail_item() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("note.eml"), EMAIL).unwrap();
        let watcher = DropFolderWatcher::new(dir.path());

        let items = watcher.poll().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source_id, "msg-42@newco.io");

        let record = watcher.to_record(&items[0]).unwrap();
        assert_eq!(record.kind, RecordKind::MailItem);
        assert_eq!(record.priority, Priority::High);
        assert_eq!(record.meta_str("sender").as_deref(), Some("alice@newco.io"));
        assert_eq!(
            record.metadata["recipients"],
            json!(["me@yourcompany.com", "bob@yourcompany.com"])
        );
        assert_eq!(record.meta_list("attachments"), Vec::<String>::new());
        assert!(record.body.contains("look at this today"));
        assert_eq!(record.actions.len(), 4);
    }

    #[tokio::test]
    async fn plain_file_becomes_file_item() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "call the bank").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        std::fs::write(dir.path().join("upload.part"), "x").unwrap();
        let watcher = DropFolderWatcher::new(dir.path());

        let items = watcher.poll().await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].source_id.starts_with("notes.txt@"));

        let record = watcher.to_record(&items[0]).unwrap();
        assert_eq!(record.kind, RecordKind::FileItem);
        assert_eq!(record.priority, Priority::Normal);
        assert_eq!(record.body, "call the bank");
        assert_eq!(record.meta_str("source_path").as_deref(), Some("Inbox/notes.txt"));
    }

    #[tokio::test]
    async fn same_file_same_record_id() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let watcher = DropFolderWatcher::new(dir.path());
        let first = watcher.to_record(&watcher.poll().await.unwrap()[0]).unwrap();
        let second = watcher.to_record(&watcher.poll().await.unwrap()[0]).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn empty_eml_is_malformed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.eml"), "").unwrap();
        let watcher = DropFolderWatcher::new(dir.path());
        let items = watcher.poll().await.unwrap();
        let err = watcher.to_record(&items[0]).unwrap_err();
        assert!(matches!(err, WatcherError::Malformed { .. }));
    }

    #[tokio::test]
    async fn missing_inbox_is_a_fetch_error() {
        let dir = TempDir::new().unwrap();
        let watcher = DropFolderWatcher::new(dir.path().join("nope"));
        let err = watcher.poll().await.unwrap_err();
        assert!(matches!(err, WatcherError::Fetch { .. }));
    }
}
