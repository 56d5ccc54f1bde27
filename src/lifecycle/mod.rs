//! Lifecycle state machine.
//!
//! [`State`] is the authority; folders are its projection. Every move of a
//! record goes through [`Lifecycle::transition`], which checks the table in
//! [`state::TRANSITIONS`], performs the atomic rename and writes the audit
//! line.

pub mod claim;
pub mod owner;
pub mod state;

use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::error::{Error, TransitionError};
use crate::vault::record::tags;
use crate::vault::{Location, Record, RecordId, Vault};

pub use claim::{Claim, ClaimManager, Outcome};
pub use owner::{Liveness, OwnerId, OwnerProbe, SystemProbe};
pub use state::{Actor, State, TRANSITIONS, transition_allowed};

/// Executes validated transitions against the vault.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    vault: Vault,
    audit: AuditLog,
}

impl Lifecycle {
    pub fn new(vault: Vault, audit: AuditLog) -> Self {
        Self { vault, audit }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Validate a system-driven transition without performing it.
    pub fn check(&self, id: &RecordId, from: &Location, to: &Location) -> Result<(), TransitionError> {
        let (f, t) = (from.state(), to.state());
        if transition_allowed(f, t, Actor::System) {
            return Ok(());
        }
        if transition_allowed(f, t, Actor::Human) {
            return Err(TransitionError::HumanOnly {
                from: f.to_string(),
                to: t.to_string(),
            });
        }
        Err(TransitionError::Invalid {
            record: id.to_string(),
            from: f.to_string(),
            to: t.to_string(),
        })
    }

    /// Move a record between locations.
    pub async fn transition(
        &self,
        id: &RecordId,
        from: &Location,
        to: &Location,
        actor: &str,
    ) -> Result<(), Error> {
        self.check(id, from, to)?;
        self.vault.move_record(id, from, to).await?;
        info!(record = %id, from = %from, to = %to, actor, "Record transitioned");
        self.audit.record_transition(actor, id, from, to).await;
        Ok(())
    }

    /// Write annotations at the current location, then move.
    pub async fn commit(
        &self,
        record: &Record,
        from: &Location,
        to: &Location,
        actor: &str,
    ) -> Result<(), Error> {
        self.check(&record.id, from, to)?;
        self.vault.rewrite(from, record).await?;
        self.transition(&record.id, from, to, actor).await
    }

    /// Record that a human relocated a file. Nothing is moved.
    pub async fn observe_human(&self, id: &RecordId, from: State, to: &Location) {
        if !transition_allowed(from, to.state(), Actor::Human) {
            warn!(record = %id, from = %from, to = %to, "Human move outside the transition table");
        }
        self.audit.record_transition("human", id, from.folder(), to).await;
    }

    /// Tag a parsed record as failed and move it to `Quarantine/`.
    pub async fn quarantine(
        &self,
        record: &mut Record,
        from: &Location,
        reason: &str,
        actor: &str,
    ) -> Result<(), Error> {
        record.add_tag(tags::ERROR);
        record.trail.error = Some(reason.to_string());
        let to = Location::Folder(State::Quarantined);
        warn!(record = %record.id, from = %from, reason, "Quarantining record");
        self.commit(record, from, &to, actor).await
    }
}
