//! File-backed vault: the shared storage medium and system of record.
//!
//! Every lifecycle state is a folder; a record is a single `<id>.md` file and
//! its location is its state. All cross-process coordination goes through
//! `rename`, which is atomic within one filesystem. New records are staged in
//! `.state/tmp/` and published with a no-clobber hard link so a concurrent
//! reader never sees a partial write.

pub mod record;

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, RecordError, StorageError};
use crate::lifecycle::owner::OwnerId;
use crate::lifecycle::state::State;

pub use record::{ActionItem, Decision, Priority, Record, RecordId, RecordKind, Trail};

/// Well-known vault paths, relative to the vault root.
pub mod paths {
    pub const INTAKE: &str = "Intake";
    pub const CLAIMED: &str = "Claimed";
    pub const PLANS: &str = "Plans";
    pub const AWAITING_APPROVAL: &str = "AwaitingApproval";
    pub const APPROVED: &str = "Approved";
    pub const REJECTED: &str = "Rejected";
    pub const DONE: &str = "Done";
    pub const QUARANTINE: &str = "Quarantine";
    pub const INBOX: &str = "Inbox";
    pub const LOGS: &str = "Logs";
    pub const OFFSETS: &str = ".state/offsets";
    pub const DECISIONS: &str = ".state/decisions";
    pub const STAGING: &str = ".state/tmp";
    pub const HANDBOOK: &str = "Company_Handbook.md";
    pub const POLICY: &str = "approval_policy.yaml";
}

/// Folders created by [`Vault::ensure_layout`].
const LAYOUT: &[&str] = &[
    paths::INTAKE,
    paths::CLAIMED,
    paths::PLANS,
    paths::AWAITING_APPROVAL,
    paths::APPROVED,
    paths::REJECTED,
    paths::DONE,
    paths::QUARANTINE,
    paths::INBOX,
    paths::LOGS,
    paths::OFFSETS,
    paths::DECISIONS,
    paths::STAGING,
];

/// Where a record physically lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// One of the shared state folders.
    Folder(State),
    /// An owner-qualified claim folder, `Claimed/<owner>/`.
    Claimed(OwnerId),
}

impl Location {
    /// The lifecycle state this location projects.
    pub fn state(&self) -> State {
        match self {
            Self::Folder(state) => *state,
            Self::Claimed(_) => State::Claimed,
        }
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        match self {
            Self::Claimed(owner) => Some(owner),
            Self::Folder(_) => None,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Folder(state) => write!(f, "{}", state.folder()),
            Self::Claimed(owner) => write!(f, "{}/{}", paths::CLAIMED, owner),
        }
    }
}

/// A record together with where it was read from.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: Record,
    pub location: Location,
}

/// Handle on a vault directory.
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    /// Open an existing vault. A missing root is the one fatal storage error.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let vault = Self { root: root.into() };
        vault.check_root().await?;
        Ok(vault)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Verify the root still exists and is a directory.
    pub async fn check_root(&self) -> Result<(), StorageError> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(StorageError::RootMissing {
                path: self.root.clone(),
            }),
        }
    }

    /// Create every folder of the layout.
    pub async fn ensure_layout(&self) -> Result<(), StorageError> {
        self.check_root().await?;
        for dir in LAYOUT {
            let path = self.root.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| StorageError::io(&path, e))?;
        }
        Ok(())
    }

    /// Resolve a path relative to the vault root.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Directory backing a location.
    pub fn folder_path(&self, location: &Location) -> PathBuf {
        match location {
            Location::Folder(state) => self.root.join(state.folder()),
            Location::Claimed(owner) => self.root.join(paths::CLAIMED).join(owner.to_string()),
        }
    }

    /// Path of a record's storage unit at a location.
    pub fn path_of(&self, location: &Location, id: &RecordId) -> PathBuf {
        self.folder_path(location).join(id.file_name())
    }

    /// Record ids at a location, sorted. A missing folder is empty.
    pub async fn list(&self, location: &Location) -> Result<Vec<RecordId>, StorageError> {
        let dir = self.folder_path(location);
        let mut ids = Vec::new();
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(StorageError::io(&dir, e)),
        };
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = RecordId::from_file_name(&name) {
                ids.push(id);
            } else if name.ends_with(".md") {
                debug!(file = %name, location = %location, "Skipping file with invalid record name");
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Files at a location that are not valid record storage units.
    pub async fn stray_files(&self, location: &Location) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.folder_path(location);
        let mut stray = Vec::new();
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stray),
            Err(e) => return Err(StorageError::io(&dir, e)),
        };
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".md") && RecordId::from_file_name(&name).is_none() {
                stray.push(entry.path());
            }
        }
        Ok(stray)
    }

    /// Owners that currently have a claim folder.
    pub async fn claim_owners(&self) -> Result<Vec<OwnerId>, StorageError> {
        let dir = self.root.join(paths::CLAIMED);
        let mut owners = Vec::new();
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(owners),
            Err(e) => return Err(StorageError::io(&dir, e)),
        };
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match OwnerId::parse(&name) {
                Some(owner) => owners.push(owner),
                None => warn!(folder = %name, "Ignoring claim folder with unrecognised owner"),
            }
        }
        owners.sort_by_key(|o| o.to_string());
        Ok(owners)
    }

    /// Every claimed record across all owners.
    pub async fn list_claimed(&self) -> Result<Vec<(OwnerId, RecordId)>, StorageError> {
        let mut out = Vec::new();
        for owner in self.claim_owners().await? {
            for id in self.list(&Location::Claimed(owner.clone())).await? {
                out.push((owner.clone(), id));
            }
        }
        Ok(out)
    }

    /// Find the single location a record currently occupies.
    pub async fn locate(&self, id: &RecordId) -> Result<Option<Location>, StorageError> {
        for state in State::FOLDER_STATES {
            let location = Location::Folder(state);
            if self.exists(&location, id).await? {
                return Ok(Some(location));
            }
        }
        for owner in self.claim_owners().await? {
            let location = Location::Claimed(owner);
            if self.exists(&location, id).await? {
                return Ok(Some(location));
            }
        }
        Ok(None)
    }

    pub async fn exists(&self, location: &Location, id: &RecordId) -> Result<bool, StorageError> {
        let path = self.path_of(location, id);
        fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))
    }

    /// Last modification time of a record's storage unit.
    pub async fn modified(
        &self,
        location: &Location,
        id: &RecordId,
    ) -> Result<chrono::DateTime<chrono::Utc>, StorageError> {
        let path = self.path_of(location, id);
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        let modified = meta.modified().map_err(|e| StorageError::io(&path, e))?;
        Ok(modified.into())
    }

    /// Remove an owner's claim folder if it is empty.
    pub async fn prune_claim_folder(&self, owner: &OwnerId) {
        let dir = self.folder_path(&Location::Claimed(owner.clone()));
        if fs::remove_dir(&dir).await.is_ok() {
            debug!(owner = %owner, "Removed empty claim folder");
        }
    }

    /// Read and parse a record.
    pub async fn read(&self, location: &Location, id: &RecordId) -> Result<Record, Error> {
        let path = self.path_of(location, id);
        let text = fs::read_to_string(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        let record = Record::parse(&text, &path)?;
        if record.id != *id {
            return Err(RecordError::Corrupt {
                path,
                reason: format!("header id '{}' does not match file name", record.id),
            }
            .into());
        }
        Ok(record)
    }

    /// Read every record at a location. Per-record failures are returned
    /// alongside the id so the caller can quarantine them.
    pub async fn read_all(
        &self,
        location: &Location,
    ) -> Result<Vec<(RecordId, Result<Record, Error>)>, StorageError> {
        let mut out = Vec::new();
        for id in self.list(location).await? {
            let result = self.read(location, &id).await;
            out.push((id, result));
        }
        Ok(out)
    }

    /// Publish a new record without ever overwriting an existing one.
    pub async fn write_new(&self, location: &Location, record: &Record) -> Result<(), Error> {
        let dest = self.path_of(location, &record.id);
        let dir = self.folder_path(location);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;

        let staged = self.stage(record).await?;
        let linked = fs::hard_link(&staged, &dest).await;
        let _ = fs::remove_file(&staged).await;
        linked.map_err(|e| StorageError::io(&dest, e))?;
        debug!(record = %record.id, location = %location, "Record written");
        Ok(())
    }

    /// Replace a record in place. The record must already exist there.
    pub async fn rewrite(&self, location: &Location, record: &Record) -> Result<(), Error> {
        let dest = self.path_of(location, &record.id);
        if !fs::try_exists(&dest)
            .await
            .map_err(|e| StorageError::io(&dest, e))?
        {
            return Err(StorageError::NotFound { path: dest }.into());
        }
        let staged = self.stage(record).await?;
        if let Err(e) = fs::rename(&staged, &dest).await {
            let _ = fs::remove_file(&staged).await;
            return Err(StorageError::io(&dest, e).into());
        }
        Ok(())
    }

    /// Atomically move a record between locations. Fails with `NotFound`
    /// when the source is gone and `AlreadyExists` when the target is taken.
    pub async fn move_record(
        &self,
        id: &RecordId,
        from: &Location,
        to: &Location,
    ) -> Result<(), StorageError> {
        let src = self.path_of(from, id);
        let dest = self.path_of(to, id);
        let dir = self.folder_path(to);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        if fs::try_exists(&dest)
            .await
            .map_err(|e| StorageError::io(&dest, e))?
        {
            return Err(StorageError::AlreadyExists { path: dest });
        }
        fs::rename(&src, &dest)
            .await
            .map_err(|e| StorageError::io(&src, e))?;
        debug!(record = %id, from = %from, to = %to, "Record moved");
        Ok(())
    }

    /// Move an arbitrary file (typically unparseable) into `Quarantine/`.
    /// Returns the quarantined path. Nothing is ever deleted.
    pub async fn quarantine_raw(&self, path: &Path) -> Result<PathBuf, StorageError> {
        let dir = self.root.join(paths::QUARANTINE);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        let mut dest = dir.join(&name);
        if fs::try_exists(&dest)
            .await
            .map_err(|e| StorageError::io(&dest, e))?
        {
            let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
            dest = dir.join(format!("{stamp}-{name}"));
        }
        fs::rename(path, &dest)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        warn!(from = %path.display(), to = %dest.display(), "File quarantined");
        Ok(dest)
    }

    /// Write a record to a durable staging file and return its path.
    async fn stage(&self, record: &Record) -> Result<PathBuf, Error> {
        let text = record.render()?;
        let dir = self.root.join(paths::STAGING);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        let staged = dir.join(format!("{}.{}.tmp", record.id, Uuid::new_v4().simple()));
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged)
            .await
            .map_err(|e| StorageError::io(&staged, e))?;
        file.write_all(text.as_bytes())
            .await
            .map_err(|e| StorageError::io(&staged, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(&staged, e))?;
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_vault() -> (Vault, TempDir) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).await.unwrap();
        vault.ensure_layout().await.unwrap();
        (vault, dir)
    }

    fn mail(id: &str) -> Record {
        Record::new(RecordId::new(id).unwrap(), RecordKind::MailItem).with_body("hello")
    }

    #[tokio::test]
    async fn open_missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let err = Vault::open(&missing).await.unwrap_err();
        assert!(matches!(err, StorageError::RootMissing { .. }));
    }

    #[tokio::test]
    async fn ensure_layout_creates_folders() {
        let (vault, dir) = test_vault().await;
        for folder in ["Intake", "Claimed", "AwaitingApproval", "Approved", "Rejected", "Done", "Quarantine"] {
            assert!(dir.path().join(folder).is_dir(), "{folder} missing");
        }
        assert!(vault.resolve(paths::OFFSETS).is_dir());
    }

    #[tokio::test]
    async fn write_new_never_clobbers() {
        let (vault, _dir) = test_vault().await;
        let intake = Location::Folder(State::Intake);
        vault.write_new(&intake, &mail("mail-1")).await.unwrap();

        let second = mail("mail-1").with_body("different");
        let err = vault.write_new(&intake, &second).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::AlreadyExists { .. })
        ));

        let stored = vault.read(&intake, &RecordId::new("mail-1").unwrap()).await.unwrap();
        assert_eq!(stored.body, "hello");
    }

    #[tokio::test]
    async fn write_new_leaves_no_staging_files() {
        let (vault, _dir) = test_vault().await;
        let intake = Location::Folder(State::Intake);
        vault.write_new(&intake, &mail("mail-1")).await.unwrap();
        let mut rd = fs::read_dir(vault.resolve(paths::STAGING)).await.unwrap();
        assert!(rd.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn move_and_locate() {
        let (vault, _dir) = test_vault().await;
        let id = RecordId::new("mail-1").unwrap();
        let intake = Location::Folder(State::Intake);
        vault.write_new(&intake, &mail("mail-1")).await.unwrap();
        assert_eq!(vault.locate(&id).await.unwrap(), Some(intake.clone()));

        let owner = OwnerId::new("orch", "host-a", 42);
        let claimed = Location::Claimed(owner.clone());
        vault.move_record(&id, &intake, &claimed).await.unwrap();
        assert_eq!(vault.locate(&id).await.unwrap(), Some(claimed.clone()));
        assert!(vault.list(&intake).await.unwrap().is_empty());
        assert_eq!(vault.claim_owners().await.unwrap(), vec![owner]);

        let err = vault.move_record(&id, &intake, &claimed).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn header_id_must_match_file_name() {
        let (vault, dir) = test_vault().await;
        let intake = Location::Folder(State::Intake);
        vault.write_new(&intake, &mail("mail-1")).await.unwrap();
        std::fs::copy(
            dir.path().join("Intake/mail-1.md"),
            dir.path().join("Intake/mail-copy.md"),
        )
        .unwrap();

        let copy = RecordId::new("mail-copy").unwrap();
        let err = vault.read(&intake, &copy).await.unwrap_err();
        assert!(matches!(err, Error::Record(RecordError::Corrupt { .. })));
        assert!(vault.read(&intake, &RecordId::new("mail-1").unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn rewrite_requires_existing_record() {
        let (vault, _dir) = test_vault().await;
        let intake = Location::Folder(State::Intake);
        let mut record = mail("mail-1");
        assert!(vault.rewrite(&intake, &record).await.is_err());

        vault.write_new(&intake, &record).await.unwrap();
        record.add_tag("stale");
        vault.rewrite(&intake, &record).await.unwrap();
        let stored = vault.read(&intake, &record.id).await.unwrap();
        assert!(stored.has_tag("stale"));
    }

    #[tokio::test]
    async fn quarantine_keeps_both_copies_on_name_clash() {
        let (vault, dir) = test_vault().await;
        let a = dir.path().join("Intake").join("broken.md");
        fs::write(&a, "garbage").await.unwrap();
        let first = vault.quarantine_raw(&a).await.unwrap();

        fs::write(&a, "more garbage").await.unwrap();
        let second = vault.quarantine_raw(&a).await.unwrap();
        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }

    #[tokio::test]
    async fn list_skips_non_record_files() {
        let (vault, dir) = test_vault().await;
        let intake = Location::Folder(State::Intake);
        vault.write_new(&intake, &mail("mail-1")).await.unwrap();
        fs::write(dir.path().join("Intake").join("notes.txt"), "x")
            .await
            .unwrap();
        fs::write(dir.path().join("Intake").join("bad name.md"), "x")
            .await
            .unwrap();
        let ids = vault.list(&intake).await.unwrap();
        assert_eq!(ids, vec![RecordId::new("mail-1").unwrap()]);
        assert_eq!(vault.stray_files(&intake).await.unwrap().len(), 1);
    }
}
