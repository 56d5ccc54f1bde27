//! Claim manager: exclusive ownership through atomic rename.
//!
//! Claiming moves `Intake/<id>.md` to `Claimed/<owner>/<id>.md`. The rename is
//! the only lock. Of several concurrent claimers exactly one rename succeeds;
//! the others find the record under someone else's folder and get a
//! conflict. A claim outlives its process, which is what makes crash
//! recovery possible: the owner id in the path says whose it was.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use super::owner::{Liveness, OwnerId, OwnerProbe};
use super::state::State;
use super::Lifecycle;
use crate::error::{ClaimError, Error, StorageError};
use crate::vault::record::tags;
use crate::vault::{Location, Record, RecordId};

/// Proof of exclusive ownership of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub record: RecordId,
    pub owner: OwnerId,
    pub claimed_at: DateTime<Utc>,
    /// True when the record was already ours (restart or repeat call).
    pub resumed: bool,
}

impl Claim {
    pub fn location(&self) -> Location {
        Location::Claimed(self.owner.clone())
    }
}

/// Where a released claim goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    AwaitingApproval,
    Done,
    Rejected,
    /// Give the record back to Intake for another attempt.
    Abandoned,
}

impl Outcome {
    pub fn target(&self) -> State {
        match self {
            Self::AwaitingApproval => State::AwaitingApproval,
            Self::Done => State::Done,
            Self::Rejected => State::Rejected,
            Self::Abandoned => State::Intake,
        }
    }
}

/// What happened to an abandoned record found during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovered {
    /// Moved from a dead owner's folder into ours.
    Resumed(RecordId),
    /// Returned to Intake for re-claim.
    Requeued(RecordId),
    /// Exceeded the retry limit.
    Quarantined(RecordId),
}

/// Claim manager bound to one owner identity.
pub struct ClaimManager {
    lifecycle: Lifecycle,
    owner: OwnerId,
    probe: Arc<dyn OwnerProbe>,
    grace: TimeDelta,
    max_attempts: u32,
}

/// Foreign-host owners are trusted for this many grace periods.
const UNKNOWN_LEASE_FACTOR: i32 = 10;

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

impl ClaimManager {
    pub fn new(
        lifecycle: Lifecycle,
        owner: OwnerId,
        probe: Arc<dyn OwnerProbe>,
        grace: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            lifecycle,
            owner,
            probe,
            grace: to_delta(grace),
            max_attempts,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    fn my_location(&self) -> Location {
        Location::Claimed(self.owner.clone())
    }

    fn actor(&self) -> String {
        self.owner.to_string()
    }

    /// Take exclusive ownership of a record in Intake.
    pub async fn claim(&self, id: &RecordId) -> Result<Claim, ClaimError> {
        let vault = self.lifecycle.vault();
        let mine = self.my_location();

        if vault.exists(&mine, id).await? {
            debug!(record = %id, "Record already claimed by us");
            return Ok(self.existing_claim(id).await);
        }

        let intake = Location::Folder(State::Intake);
        match vault.move_record(id, &intake, &mine).await {
            Ok(()) => {
                let claim = self.stamp(id, Utc::now()).await;
                info!(record = %id, owner = %self.owner, "Record claimed");
                self.lifecycle
                    .audit()
                    .record_transition(&self.actor(), id, &intake, &mine)
                    .await;
                Ok(claim)
            }
            Err(StorageError::NotFound { .. }) => self.resolve_conflict(id).await,
            Err(e) => Err(e.into()),
        }
    }

    /// The rename lost; work out who holds the record.
    async fn resolve_conflict(&self, id: &RecordId) -> Result<Claim, ClaimError> {
        let vault = self.lifecycle.vault();
        for holder in vault.claim_owners().await? {
            if holder == self.owner || !vault.exists(&Location::Claimed(holder.clone()), id).await? {
                continue;
            }
            let dead = self.probe.liveness(&holder) == Liveness::Dead;
            if holder.same_identity(&self.owner) && dead {
                // A previous incarnation of us; re-entrant.
                let from = Location::Claimed(holder.clone());
                let mine = self.my_location();
                vault.move_record(id, &from, &mine).await?;
                self.lifecycle
                    .audit()
                    .record_transition(&self.actor(), id, &from, &mine)
                    .await;
                info!(record = %id, previous = %holder, "Resumed claim from earlier process");
                let mut claim = self.stamp(id, Utc::now()).await;
                claim.resumed = true;
                return Ok(claim);
            }
            debug!(record = %id, holder = %holder, "Claim conflict");
            return Err(ClaimError::Conflict {
                record: id.to_string(),
                holder: holder.to_string(),
            });
        }
        // The winner may already have moved it on.
        match vault.locate(id).await? {
            Some(location) => {
                debug!(record = %id, location = %location, "Record moved on before the claim");
                Err(ClaimError::Conflict {
                    record: id.to_string(),
                    holder: location.to_string(),
                })
            }
            None => Err(ClaimError::NotFound {
                record: id.to_string(),
            }),
        }
    }

    /// Annotate the trail of a freshly claimed record. A record that cannot
    /// be parsed is left as-is; the orchestrator quarantines it on read.
    async fn stamp(&self, id: &RecordId, at: DateTime<Utc>) -> Claim {
        let vault = self.lifecycle.vault();
        let mine = self.my_location();
        match vault.read(&mine, id).await {
            Ok(mut record) => {
                record.trail.claimed_by = Some(self.owner.to_string());
                record.trail.claimed_at = Some(at);
                if let Err(e) = vault.rewrite(&mine, &record).await {
                    warn!(record = %id, error = %e, "Failed to annotate claim");
                }
            }
            Err(e) => warn!(record = %id, error = %e, "Claimed record is unreadable"),
        }
        Claim {
            record: id.clone(),
            owner: self.owner.clone(),
            claimed_at: at,
            resumed: false,
        }
    }

    async fn existing_claim(&self, id: &RecordId) -> Claim {
        let claimed_at = match self.lifecycle.vault().read(&self.my_location(), id).await {
            Ok(record) => record.trail.claimed_at.unwrap_or_else(Utc::now),
            Err(_) => Utc::now(),
        };
        Claim {
            record: id.clone(),
            owner: self.owner.clone(),
            claimed_at,
            resumed: true,
        }
    }

    /// Move a claimed record onward. Abandonment goes through [`Self::abandon`].
    pub async fn release(&self, claim: &Claim, outcome: Outcome) -> Result<Location, Error> {
        self.ensure_owned(claim)?;
        if outcome == Outcome::Abandoned {
            return self.abandon(claim, "released without outcome").await;
        }
        let to = Location::Folder(outcome.target());
        self.lifecycle
            .transition(&claim.record, &claim.location(), &to, &self.actor())
            .await?;
        Ok(to)
    }

    /// Write the record's annotations in the claim folder, then release it.
    pub async fn release_annotated(
        &self,
        claim: &Claim,
        record: &Record,
        outcome: Outcome,
    ) -> Result<Location, Error> {
        self.ensure_owned(claim)?;
        if outcome == Outcome::Abandoned {
            return self.abandon(claim, "released without outcome").await;
        }
        let to = Location::Folder(outcome.target());
        self.lifecycle
            .commit(record, &claim.location(), &to, &self.actor())
            .await?;
        Ok(to)
    }

    /// Claim handle for a record already in our folder.
    pub fn held(&self, record: &Record) -> Claim {
        Claim {
            record: record.id.clone(),
            owner: self.owner.clone(),
            claimed_at: record.trail.claimed_at.unwrap_or_else(Utc::now),
            resumed: true,
        }
    }

    /// Give up on a claimed record: back to Intake with one more attempt
    /// counted, or to Quarantine once the retry limit is exceeded.
    pub async fn abandon(&self, claim: &Claim, reason: &str) -> Result<Location, Error> {
        self.ensure_owned(claim)?;
        self.requeue(&claim.record, &claim.location(), reason).await
    }

    fn ensure_owned(&self, claim: &Claim) -> Result<(), ClaimError> {
        if claim.owner != self.owner {
            return Err(ClaimError::NotOwner {
                record: claim.record.to_string(),
                owner: self.owner.to_string(),
            });
        }
        Ok(())
    }

    async fn requeue(&self, id: &RecordId, from: &Location, reason: &str) -> Result<Location, Error> {
        let vault = self.lifecycle.vault();
        let mut record = match vault.read(from, id).await {
            Ok(record) => record,
            Err(Error::Record(e)) => {
                let path = vault.path_of(from, id);
                vault.quarantine_raw(&path).await?;
                let err = Error::Record(e);
                self.lifecycle
                    .audit()
                    .record_error(&self.actor(), "requeue", Some(id.as_str()), Some(&from.to_string()), &err)
                    .await;
                return Ok(Location::Folder(State::Quarantined));
            }
            Err(e) => return Err(e),
        };

        record.trail.attempts += 1;
        record.trail.claimed_by = None;
        record.trail.claimed_at = None;
        record.remove_tag(tags::EXECUTING);

        if record.trail.attempts > self.max_attempts {
            let why = format!(
                "gave up after {} attempts: {reason}",
                record.trail.attempts
            );
            self.lifecycle
                .quarantine(&mut record, from, &why, &self.actor())
                .await?;
            return Ok(Location::Folder(State::Quarantined));
        }

        record.trail.error = Some(reason.to_string());
        let to = Location::Folder(State::Intake);
        self.lifecycle.commit(&record, from, &to, &self.actor()).await?;
        Ok(to)
    }

    /// Records currently held by this owner, in name order.
    pub async fn claimed_by_me(&self) -> Result<Vec<RecordId>, StorageError> {
        self.lifecycle.vault().list(&self.my_location()).await
    }

    /// Adopt claims left by earlier, now dead, processes with our identity.
    pub async fn resume_own(&self) -> Result<Vec<Recovered>, Error> {
        let vault = self.lifecycle.vault();
        let mut resumed = Vec::new();
        for holder in vault.claim_owners().await? {
            if holder == self.owner || !holder.same_identity(&self.owner) {
                continue;
            }
            if self.probe.liveness(&holder) != Liveness::Dead {
                continue;
            }
            let from = Location::Claimed(holder.clone());
            for id in vault.list(&from).await? {
                match self
                    .lifecycle
                    .transition(&id, &from, &self.my_location(), &self.actor())
                    .await
                {
                    Ok(()) => {
                        self.stamp(&id, Utc::now()).await;
                        resumed.push(Recovered::Resumed(id));
                    }
                    Err(e) => warn!(record = %id, error = %e, "Failed to resume claim"),
                }
            }
            vault.prune_claim_folder(&holder).await;
        }
        if !resumed.is_empty() {
            info!(count = resumed.len(), owner = %self.owner, "Resumed own claims");
        }
        Ok(resumed)
    }

    /// Requeue records held by dead owners once the grace period has passed.
    pub async fn reclaim_abandoned(&self, now: DateTime<Utc>) -> Result<Vec<Recovered>, Error> {
        let vault = self.lifecycle.vault();
        let mut recovered = Vec::new();
        for holder in vault.claim_owners().await? {
            if holder.same_identity(&self.owner) {
                continue;
            }
            let grace = match self.probe.liveness(&holder) {
                Liveness::Alive => continue,
                Liveness::Dead => self.grace,
                Liveness::Unknown => self
                    .grace
                    .checked_mul(UNKNOWN_LEASE_FACTOR)
                    .unwrap_or(TimeDelta::MAX),
            };

            let from = Location::Claimed(holder.clone());
            for id in vault.list(&from).await? {
                let claimed_at = match vault.read(&from, &id).await {
                    Ok(record) => record.trail.claimed_at,
                    Err(_) => None,
                };
                let since = match claimed_at {
                    Some(at) => at,
                    None => vault.modified(&from, &id).await?,
                };
                if now - since < grace {
                    debug!(record = %id, holder = %holder, "Abandoned claim still within grace");
                    continue;
                }
                let reason = format!("abandoned by {holder}");
                match self.requeue(&id, &from, &reason).await {
                    Ok(Location::Folder(State::Quarantined)) => {
                        recovered.push(Recovered::Quarantined(id))
                    }
                    Ok(_) => {
                        info!(record = %id, holder = %holder, "Requeued abandoned claim");
                        recovered.push(Recovered::Requeued(id));
                    }
                    Err(e) => warn!(record = %id, error = %e, "Failed to requeue abandoned claim"),
                }
            }
            vault.prune_claim_folder(&holder).await;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::vault::{RecordKind, Vault};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct ScriptedProbe {
        dead: Mutex<HashSet<String>>,
    }

    impl ScriptedProbe {
        fn kill(&self, owner: &OwnerId) {
            self.dead.lock().unwrap().insert(owner.to_string());
        }
    }

    impl OwnerProbe for ScriptedProbe {
        fn liveness(&self, owner: &OwnerId) -> Liveness {
            if self.dead.lock().unwrap().contains(&owner.to_string()) {
                Liveness::Dead
            } else {
                Liveness::Alive
            }
        }
    }

    struct Fixture {
        lifecycle: Lifecycle,
        probe: Arc<ScriptedProbe>,
        _dir: TempDir,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let vault = Vault::open(dir.path()).await.unwrap();
            vault.ensure_layout().await.unwrap();
            let audit = AuditLog::new(dir.path().join("Logs"));
            Self {
                lifecycle: Lifecycle::new(vault, audit),
                probe: Arc::new(ScriptedProbe::default()),
                _dir: dir,
            }
        }

        fn manager(&self, owner: OwnerId, max_attempts: u32) -> ClaimManager {
            ClaimManager::new(
                self.lifecycle.clone(),
                owner,
                self.probe.clone(),
                Duration::from_secs(60),
                max_attempts,
            )
        }

        async fn intake(&self, id: &str) -> RecordId {
            let record = Record::new(RecordId::new(id).unwrap(), RecordKind::MailItem);
            self.lifecycle
                .vault()
                .write_new(&Location::Folder(State::Intake), &record)
                .await
                .unwrap();
            record.id
        }
    }

    #[tokio::test]
    async fn claim_moves_and_stamps() {
        let fx = Fixture::new().await;
        let id = fx.intake("mail-1").await;
        let owner = OwnerId::new("a", "h", 1);
        let mgr = fx.manager(owner.clone(), 3);

        let claim = mgr.claim(&id).await.unwrap();
        assert!(!claim.resumed);
        let record = fx.lifecycle.vault().read(&claim.location(), &id).await.unwrap();
        assert_eq!(record.trail.claimed_by.as_deref(), Some("a@h+1"));
        assert_eq!(mgr.claimed_by_me().await.unwrap(), vec![id.clone()]);

        // Re-entrant for the same owner.
        let again = mgr.claim(&id).await.unwrap();
        assert!(again.resumed);
    }

    #[tokio::test]
    async fn second_owner_conflicts() {
        let fx = Fixture::new().await;
        let id = fx.intake("mail-1").await;
        let a = fx.manager(OwnerId::new("a", "h", 1), 3);
        let b = fx.manager(OwnerId::new("b", "h", 2), 3);

        a.claim(&id).await.unwrap();
        let err = b.claim(&id).await.unwrap_err();
        match err {
            ClaimError::Conflict { holder, .. } => assert_eq!(holder, "a@h+1"),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let fx = Fixture::new().await;
        let a = fx.manager(OwnerId::new("a", "h", 1), 3);
        let err = a.claim(&RecordId::new("ghost").unwrap()).await.unwrap_err();
        assert!(matches!(err, ClaimError::NotFound { .. }));
    }

    #[tokio::test]
    async fn record_settled_by_winner_is_a_conflict() {
        let fx = Fixture::new().await;
        let id = fx.intake("mail-1").await;
        let a = fx.manager(OwnerId::new("a", "h", 1), 3);
        let b = fx.manager(OwnerId::new("b", "h", 2), 3);
        let claim = a.claim(&id).await.unwrap();
        a.release(&claim, Outcome::Done).await.unwrap();

        match b.claim(&id).await.unwrap_err() {
            ClaimError::Conflict { holder, .. } => assert_eq!(holder, "Done"),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_moves_onward() {
        let fx = Fixture::new().await;
        let id = fx.intake("mail-1").await;
        let a = fx.manager(OwnerId::new("a", "h", 1), 3);
        let claim = a.claim(&id).await.unwrap();

        let to = a.release(&claim, Outcome::Done).await.unwrap();
        assert_eq!(to, Location::Folder(State::Done));
        assert!(fx.lifecycle.vault().exists(&to, &id).await.unwrap());
        assert!(a.claimed_by_me().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_rejects_foreign_claim() {
        let fx = Fixture::new().await;
        let id = fx.intake("mail-1").await;
        let a = fx.manager(OwnerId::new("a", "h", 1), 3);
        let b = fx.manager(OwnerId::new("b", "h", 2), 3);
        let claim = a.claim(&id).await.unwrap();
        let err = b.release(&claim, Outcome::Done).await.unwrap_err();
        assert!(matches!(err, Error::Claim(ClaimError::NotOwner { .. })));
    }

    #[tokio::test]
    async fn abandon_counts_attempts_then_quarantines() {
        let fx = Fixture::new().await;
        let id = fx.intake("mail-1").await;
        let a = fx.manager(OwnerId::new("a", "h", 1), 1);

        let claim = a.claim(&id).await.unwrap();
        let to = a.abandon(&claim, "engine gave up").await.unwrap();
        assert_eq!(to, Location::Folder(State::Intake));
        let record = fx.lifecycle.vault().read(&to, &id).await.unwrap();
        assert_eq!(record.trail.attempts, 1);
        assert!(record.trail.claimed_by.is_none());

        let claim = a.claim(&id).await.unwrap();
        let to = a.abandon(&claim, "engine gave up again").await.unwrap();
        assert_eq!(to, Location::Folder(State::Quarantined));
        let record = fx.lifecycle.vault().read(&to, &id).await.unwrap();
        assert!(record.has_tag(tags::ERROR));
    }

    #[tokio::test]
    async fn dead_owner_claims_requeued_after_grace() {
        let fx = Fixture::new().await;
        let id = fx.intake("mail-1").await;
        let dead = OwnerId::new("a", "h", 1);
        let survivor = fx.manager(OwnerId::new("b", "h", 2), 3);
        let claim = fx.manager(dead.clone(), 3).claim(&id).await.unwrap();

        // Alive owner: untouched.
        let later = claim.claimed_at + TimeDelta::seconds(600);
        assert!(survivor.reclaim_abandoned(later).await.unwrap().is_empty());

        fx.probe.kill(&dead);
        let early = claim.claimed_at + TimeDelta::seconds(10);
        assert!(survivor.reclaim_abandoned(early).await.unwrap().is_empty());

        let recovered = survivor.reclaim_abandoned(later).await.unwrap();
        assert_eq!(recovered, vec![Recovered::Requeued(id.clone())]);
        let now_at = fx.lifecycle.vault().locate(&id).await.unwrap();
        assert_eq!(now_at, Some(Location::Folder(State::Intake)));

        let reclaimed = survivor.claim(&id).await.unwrap();
        assert_eq!(reclaimed.owner, *survivor.owner());
    }

    #[tokio::test]
    async fn resume_own_adopts_previous_pid() {
        let fx = Fixture::new().await;
        let id = fx.intake("mail-1").await;
        let old = OwnerId::new("a", "h", 1);
        fx.manager(old.clone(), 3).claim(&id).await.unwrap();

        let new = fx.manager(OwnerId::new("a", "h", 9), 3);
        // Previous incarnation still alive: leave it alone.
        assert!(new.resume_own().await.unwrap().is_empty());

        fx.probe.kill(&old);
        let resumed = new.resume_own().await.unwrap();
        assert_eq!(resumed, vec![Recovered::Resumed(id.clone())]);
        assert_eq!(new.claimed_by_me().await.unwrap(), vec![id]);
        assert!(fx.lifecycle.vault().claim_owners().await.unwrap().len() == 1);
    }
}
