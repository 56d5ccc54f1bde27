//! Vault status snapshot: what is where, and who holds what.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::fs;

use crate::error::StorageError;
use crate::lifecycle::State;
use crate::vault::record::tags;
use crate::vault::{paths, Location, Vault};

/// Counts across the folder contract at one instant.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VaultStatus {
    pub collected_at: DateTime<Utc>,
    /// Records per state folder, keyed by folder name.
    pub folders: BTreeMap<String, usize>,
    /// Claimed records per owner.
    pub claims: BTreeMap<String, usize>,
    /// Approvals flagged stale or waiting longer than the TTL.
    pub stale_approvals: usize,
    /// Files waiting in the drop folder.
    pub inbox: usize,
}

impl VaultStatus {
    pub async fn collect(
        vault: &Vault,
        now: DateTime<Utc>,
        approval_ttl: Duration,
    ) -> Result<Self, StorageError> {
        let mut folders = BTreeMap::new();
        for state in State::FOLDER_STATES {
            let count = vault.list(&Location::Folder(state)).await?.len();
            folders.insert(state.folder().to_string(), count);
        }

        let mut claims = BTreeMap::new();
        for (owner, _) in vault.list_claimed().await? {
            *claims.entry(owner.to_string()).or_insert(0) += 1;
        }

        let ttl = TimeDelta::from_std(approval_ttl).unwrap_or(TimeDelta::MAX);
        let mut stale_approvals = 0;
        let awaiting = Location::Folder(State::AwaitingApproval);
        for (_, result) in vault.read_all(&awaiting).await? {
            let Ok(record) = result else {
                continue;
            };
            let since = record.trail.escalated_at.unwrap_or(record.created);
            if record.has_tag(tags::STALE) || now - since >= ttl {
                stale_approvals += 1;
            }
        }

        Ok(Self {
            collected_at: now,
            folders,
            claims,
            stale_approvals,
            inbox: count_files(vault, paths::INBOX).await?,
        })
    }

    pub fn count(&self, state: State) -> usize {
        self.folders.get(state.folder()).copied().unwrap_or(0)
    }

    pub fn claimed(&self) -> usize {
        self.claims.values().sum()
    }
}

async fn count_files(vault: &Vault, folder: &str) -> Result<usize, StorageError> {
    let dir = vault.resolve(folder);
    let mut read_dir = match fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StorageError::io(&dir, e)),
    };
    let mut count = 0;
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| StorageError::io(&dir, e))?
    {
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && !hidden {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::OwnerId;
    use crate::vault::{Record, RecordId, RecordKind};
    use tempfile::TempDir;

    async fn write(vault: &Vault, location: &Location, id: &str) -> Record {
        let record = Record::new(RecordId::new(id).unwrap(), RecordKind::MailItem);
        vault.write_new(location, &record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn counts_folders_claims_and_stale() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).await.unwrap();
        vault.ensure_layout().await.unwrap();

        write(&vault, &Location::Folder(State::Intake), "mail-1").await;
        write(&vault, &Location::Folder(State::Intake), "mail-2").await;
        write(&vault, &Location::Folder(State::Done), "mail-3").await;
        let owner = OwnerId::new("a", "h", 1);
        write(&vault, &Location::Claimed(owner.clone()), "mail-4").await;
        let waiting = write(&vault, &Location::Folder(State::AwaitingApproval), "mail-5").await;
        std::fs::write(dir.path().join("Inbox/drop.txt"), "x").unwrap();
        std::fs::write(dir.path().join("Inbox/.partial"), "x").unwrap();

        let now = waiting.created + TimeDelta::hours(1);
        let status = VaultStatus::collect(&vault, now, Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(status.count(State::Intake), 2);
        assert_eq!(status.count(State::Done), 1);
        assert_eq!(status.count(State::AwaitingApproval), 1);
        assert_eq!(status.claims.get("a@h+1"), Some(&1));
        assert_eq!(status.claimed(), 1);
        assert_eq!(status.stale_approvals, 0);
        assert_eq!(status.inbox, 1);

        let later = waiting.created + TimeDelta::hours(25);
        let status = VaultStatus::collect(&vault, later, Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(status.stale_approvals, 1);
    }
}
