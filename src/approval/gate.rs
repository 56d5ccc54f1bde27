//! Approval gate: decides which steps need a human, parks them in
//! `AwaitingApproval/`, and picks up the decisions humans make by moving
//! files into `Approved/` or `Rejected/`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::policy::{PolicyStore, Subject, Verdict};
use crate::engine::StepProposal;
use crate::error::{Error, StorageError};
use crate::lifecycle::{Claim, Lifecycle, State};
use crate::vault::record::tags;
use crate::vault::{paths, Decision, Location, Record, RecordId};

/// Seconds a marker outlives the decision it reported.
const MARKER_GRACE_SECS: i64 = 600;

/// Result of running proposed steps through the policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepReview {
    pub required: bool,
    /// One entry per step that needs sign-off.
    pub reasons: Vec<String>,
}

/// A human decision observed in the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionEvent {
    pub record: RecordId,
    pub decision: Decision,
}

#[derive(Debug, Serialize, Deserialize)]
struct DecisionMarker {
    record: RecordId,
    decision: Decision,
    owner: String,
    at: DateTime<Utc>,
}

pub struct ApprovalGate {
    lifecycle: Lifecycle,
    policy: Arc<PolicyStore>,
    ttl: TimeDelta,
    actor: String,
}

impl ApprovalGate {
    pub fn new(lifecycle: Lifecycle, policy: Arc<PolicyStore>, ttl: Duration, actor: impl Into<String>) -> Self {
        Self {
            lifecycle,
            policy,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            actor: actor.into(),
        }
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    /// Evaluate one subject, folding evaluation errors into "required".
    async fn verdict(&self, record: &RecordId, subject: &Subject) -> Verdict {
        let policy = self.policy.current().await;
        match policy.evaluate(subject) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(record = %record, error = %e, "Approval rule failed, requiring approval");
                let reason = e.to_string();
                let err = Error::from(e);
                self.lifecycle
                    .audit()
                    .record_error(&self.actor, "evaluate_policy", Some(record.as_str()), None, &err)
                    .await;
                Verdict::Required { rule: None, reason }
            }
        }
    }

    /// Whether the record as it stands needs a human decision.
    pub async fn requires_approval(&self, record: &Record) -> bool {
        self.verdict(&record.id, &Subject::from_record(record))
            .await
            .requires_approval()
    }

    /// Run each proposed step through the policy. With no steps, the record
    /// itself is evaluated.
    pub async fn evaluate_steps(&self, record: &Record, steps: &[StepProposal]) -> StepReview {
        if steps.is_empty() {
            let verdict = self.verdict(&record.id, &Subject::from_record(record)).await;
            return StepReview {
                required: verdict.requires_approval(),
                reasons: if verdict.requires_approval() {
                    vec![verdict.reason()]
                } else {
                    Vec::new()
                },
            };
        }

        let mut review = StepReview::default();
        for step in steps {
            let subject =
                Subject::from_record(record).with_step(&step.action, &step.description, &step.metadata);
            let verdict = self.verdict(&record.id, &subject).await;
            debug!(record = %record.id, action = %step.action, verdict = ?verdict, "Step reviewed");
            if verdict.requires_approval() {
                review.required = true;
                review.reasons.push(format!("{}: {}", step.action, verdict.reason()));
            }
        }
        review
    }

    /// Park a claimed record for human review.
    pub async fn escalate(
        &self,
        claim: &Claim,
        record: &mut Record,
        steps: &[StepProposal],
        reasons: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        record.trail.escalated_at = Some(now);
        record.trail.approval_reasons = reasons;
        record.remove_tag(tags::STALE);
        for step in steps {
            let text = if step.description.is_empty() {
                format!("Approve: {}", step.action)
            } else {
                format!("Approve: {} ({})", step.action, step.description)
            };
            if !record.actions.iter().any(|a| a.text == text) {
                record.actions.push(crate::vault::ActionItem::todo(text));
            }
        }
        let to = Location::Folder(State::AwaitingApproval);
        self.lifecycle
            .commit(record, &claim.location(), &to, &self.actor)
            .await?;
        info!(record = %record.id, reasons = ?record.trail.approval_reasons, "Escalated for approval");
        Ok(())
    }

    /// Detect and apply decisions humans made since the last poll.
    ///
    /// The decision is stamped on the record before its marker is created,
    /// so a crash in between leaves an applied decision rather than a lost
    /// one. The marker makes sure only one poller reports each decision.
    pub async fn poll_decisions(&self, now: DateTime<Utc>) -> Result<Vec<DecisionEvent>, Error> {
        let vault = self.lifecycle.vault();
        let mut events = Vec::new();
        let mut present = HashSet::new();
        for (state, decision) in [
            (State::Approved, Decision::Approved),
            (State::Rejected, Decision::Rejected),
        ] {
            let location = Location::Folder(state);
            for id in vault.list(&location).await? {
                present.insert(id.clone());
                let mut record = match vault.read(&location, &id).await {
                    Ok(record) => record,
                    Err(Error::Record(e)) => {
                        let err = Error::Record(e);
                        self.lifecycle
                            .audit()
                            .record_error(&self.actor, "poll_decisions", Some(id.as_str()), Some(&location.to_string()), &err)
                            .await;
                        vault.quarantine_raw(&vault.path_of(&location, &id)).await?;
                        continue;
                    }
                    Err(Error::Storage(StorageError::NotFound { .. })) => continue,
                    Err(e) => return Err(e),
                };

                // Applied earlier, or settled by the system itself.
                if record.trail.decision.is_some() {
                    self.prune_marker(&id, now, false).await?;
                    continue;
                }

                if !self.apply_decision(&location, &mut record, decision, now).await? {
                    debug!(record = %id, "Decided record moved before it was applied");
                    continue;
                }
                if !self.consume(&id, decision).await? {
                    debug!(record = %id, "Decision already reported elsewhere");
                    continue;
                }
                info!(record = %id, decision = %decision, "Human decision detected");
                self.lifecycle
                    .observe_human(&id, State::AwaitingApproval, &location)
                    .await;
                events.push(DecisionEvent {
                    record: id,
                    decision,
                });
            }
        }

        for id in self.marker_ids().await? {
            if !present.contains(&id) {
                self.prune_marker(&id, now, true).await?;
            }
        }
        Ok(events)
    }

    fn marker_dir(&self) -> PathBuf {
        self.lifecycle.vault().resolve(paths::DECISIONS)
    }

    fn marker_path(&self, id: &RecordId) -> PathBuf {
        self.marker_dir().join(format!("{id}.json"))
    }

    async fn marker_ids(&self) -> Result<Vec<RecordId>, StorageError> {
        let dir = self.marker_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&dir, e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            let name = entry.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|stem| RecordId::new(stem).ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Remove a marker once its record has settled. Markers of records
    /// still in a decision folder are kept for a grace period so a slower
    /// poller cannot report the same decision again.
    async fn prune_marker(&self, id: &RecordId, now: DateTime<Utc>, settled: bool) -> Result<(), StorageError> {
        let path = self.marker_path(id);
        let modified = match fs::metadata(&path).await {
            Ok(meta) => meta.modified().ok().map(DateTime::<Utc>::from),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        let expired = modified.is_none_or(|at| now - at >= TimeDelta::seconds(MARKER_GRACE_SECS));
        if !settled && !expired {
            return Ok(());
        }
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(record = %id, "Decision marker pruned");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    /// Create the marker. Returns false if it already existed.
    async fn consume(&self, id: &RecordId, decision: Decision) -> Result<bool, StorageError> {
        let path = self.marker_path(id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::io(dir, e))?;
        }
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        let marker = DecisionMarker {
            record: id.clone(),
            decision,
            owner: self.actor.clone(),
            at: Utc::now(),
        };
        let body = serde_json::to_vec(&marker).unwrap_or_default();
        file.write_all(&body)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(true)
    }

    /// Stamp the decision on a record in its decision folder. Approved
    /// records are tagged as executing; the engine picks them up on its
    /// next run. Returns false if the record is no longer there.
    pub async fn apply_decision(
        &self,
        location: &Location,
        record: &mut Record,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        record.trail.decision = Some(decision);
        record.trail.decided_at = Some(now);
        record.remove_tag(tags::STALE);
        if decision == Decision::Approved {
            record.add_tag(tags::EXECUTING);
        }
        match self.lifecycle.vault().rewrite(location, record).await {
            Ok(()) => {}
            Err(Error::Storage(StorageError::NotFound { .. })) => return Ok(false),
            Err(e) => return Err(e),
        }
        if decision == Decision::Approved {
            self.lifecycle
                .audit()
                .record_transition(&self.actor, &record.id, State::Approved, State::Executing)
                .await;
        }
        Ok(true)
    }

    /// Flag approvals that have waited longer than the TTL. Nothing moves.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<Vec<RecordId>, Error> {
        let vault = self.lifecycle.vault();
        let location = Location::Folder(State::AwaitingApproval);
        let mut flagged = Vec::new();
        for (id, result) in vault.read_all(&location).await? {
            let mut record = match result {
                Ok(record) => record,
                Err(Error::Record(e)) => {
                    let err = Error::Record(e);
                    self.lifecycle
                        .audit()
                        .record_error(&self.actor, "sweep_stale", Some(id.as_str()), Some(&location.to_string()), &err)
                        .await;
                    vault.quarantine_raw(&vault.path_of(&location, &id)).await?;
                    continue;
                }
                Err(e) => {
                    warn!(record = %id, error = %e, "Skipping unreadable approval");
                    continue;
                }
            };
            if record.has_tag(tags::STALE) {
                continue;
            }
            let since = record.trail.escalated_at.unwrap_or(record.created);
            if now - since < self.ttl {
                continue;
            }
            record.add_tag(tags::STALE);
            match vault.rewrite(&location, &record).await {
                Ok(()) => {
                    info!(record = %id, waiting_since = %since, "Approval is stale");
                    flagged.push(id);
                }
                Err(Error::Storage(StorageError::NotFound { .. })) => {
                    debug!(record = %id, "Approval moved during stale sweep");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::policy::ApprovalPolicy;
    use crate::audit::AuditLog;
    use crate::lifecycle::OwnerId;
    use crate::vault::{RecordKind, Vault};
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup(policy: ApprovalPolicy) -> (ApprovalGate, Lifecycle, TempDir) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).await.unwrap();
        vault.ensure_layout().await.unwrap();
        let lifecycle = Lifecycle::new(vault, AuditLog::new(dir.path().join("Logs")));
        let gate = ApprovalGate::new(
            lifecycle.clone(),
            Arc::new(PolicyStore::fixed(policy)),
            Duration::from_secs(3600),
            "orch@h+1",
        );
        (gate, lifecycle, dir)
    }

    fn mail(id: &str) -> Record {
        Record::new(RecordId::new(id).unwrap(), RecordKind::MailItem)
            .with_meta("sender", json!("someone@new.org"))
    }

    #[tokio::test]
    async fn empty_policy_fails_safe() {
        let (gate, _lc, _dir) = setup(ApprovalPolicy::fail_safe()).await;
        assert!(gate.requires_approval(&mail("mail-1")).await);
    }

    #[tokio::test]
    async fn broken_rule_requires_approval() {
        let policy = ApprovalPolicy::from_yaml(
            "rules:\n  - name: broken\n    when: { amount_over: lots }\n    require: false\n",
        )
        .unwrap();
        let (gate, _lc, _dir) = setup(policy).await;
        let review = gate
            .evaluate_steps(&mail("mail-1"), &[StepProposal::new("email_reply", "reply")])
            .await;
        assert!(review.required);
        assert_eq!(review.reasons.len(), 1);
    }

    #[tokio::test]
    async fn exempt_steps_pass() {
        let policy = ApprovalPolicy::from_yaml(
            "rules:\n  - name: replies\n    when: { action: email_reply }\n    require: false\n",
        )
        .unwrap();
        let (gate, _lc, _dir) = setup(policy).await;
        let review = gate
            .evaluate_steps(&mail("mail-1"), &[StepProposal::new("email_reply", "reply")])
            .await;
        assert_eq!(review, StepReview::default());

        let review = gate
            .evaluate_steps(
                &mail("mail-1"),
                &[
                    StepProposal::new("email_reply", "reply"),
                    StepProposal::new("payment", "pay invoice"),
                ],
            )
            .await;
        assert!(review.required);
        assert!(review.reasons[0].starts_with("payment:"));
    }

    #[tokio::test]
    async fn decision_is_consumed_once() {
        let (gate, lc, _dir) = setup(ApprovalPolicy::fail_safe()).await;
        let record = mail("mail-1");
        let approved = Location::Folder(State::Approved);
        lc.vault().write_new(&approved, &record).await.unwrap();

        let events = gate.poll_decisions(Utc::now()).await.unwrap();
        assert_eq!(
            events,
            vec![DecisionEvent {
                record: record.id.clone(),
                decision: Decision::Approved
            }]
        );
        assert!(gate.poll_decisions(Utc::now()).await.unwrap().is_empty());

        let stored = lc.vault().read(&approved, &record.id).await.unwrap();
        assert!(stored.has_tag(tags::EXECUTING));
        assert_eq!(stored.trail.decision, Some(Decision::Approved));
    }

    #[tokio::test]
    async fn two_gates_share_one_decision() {
        let (gate, lc, _dir) = setup(ApprovalPolicy::fail_safe()).await;
        let other = ApprovalGate::new(
            lc.clone(),
            Arc::new(PolicyStore::fixed(ApprovalPolicy::fail_safe())),
            Duration::from_secs(3600),
            "orch@h+2",
        );
        lc.vault()
            .write_new(&Location::Folder(State::Rejected), &mail("mail-1"))
            .await
            .unwrap();

        let now = Utc::now();
        let (a, b) = tokio::join!(gate.poll_decisions(now), other.poll_decisions(now));
        assert_eq!(a.unwrap().len() + b.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn marker_without_stamp_is_still_applied() {
        let (gate, lc, dir) = setup(ApprovalPolicy::fail_safe()).await;
        let record = mail("mail-1");
        let approved = Location::Folder(State::Approved);
        lc.vault().write_new(&approved, &record).await.unwrap();
        // A marker left behind by a poller that never got to stamp the record.
        let markers = dir.path().join(".state/decisions");
        std::fs::create_dir_all(&markers).unwrap();
        std::fs::write(markers.join("mail-1.json"), "{}").unwrap();

        let events = gate.poll_decisions(Utc::now()).await.unwrap();
        assert!(events.is_empty());
        let stored = lc.vault().read(&approved, &record.id).await.unwrap();
        assert!(stored.has_tag(tags::EXECUTING));
        assert_eq!(stored.trail.decision, Some(Decision::Approved));
    }

    #[tokio::test]
    async fn markers_are_pruned_once_records_settle() {
        let (gate, lc, dir) = setup(ApprovalPolicy::fail_safe()).await;
        let approved = Location::Folder(State::Approved);
        let rejected = Location::Folder(State::Rejected);
        lc.vault().write_new(&approved, &mail("mail-1")).await.unwrap();
        lc.vault().write_new(&rejected, &mail("mail-2")).await.unwrap();
        let now = Utc::now();
        assert_eq!(gate.poll_decisions(now).await.unwrap().len(), 2);

        let markers = dir.path().join(".state/decisions");
        let id = RecordId::new("mail-1").unwrap();
        lc.vault()
            .move_record(&id, &approved, &Location::Folder(State::Done))
            .await
            .unwrap();
        gate.poll_decisions(now).await.unwrap();
        assert!(!markers.join("mail-1.json").exists());
        assert!(markers.join("mail-2.json").exists());

        // The rejected record keeps its stamp, so its marker goes after the grace period.
        let later = now + TimeDelta::seconds(MARKER_GRACE_SECS + 1);
        assert!(gate.poll_decisions(later).await.unwrap().is_empty());
        assert!(!markers.join("mail-2.json").exists());
        assert!(gate.poll_decisions(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn system_rejections_are_not_human_decisions() {
        let (gate, lc, _dir) = setup(ApprovalPolicy::fail_safe()).await;
        let mut record = mail("mail-1");
        record.trail.decision = Some(Decision::Rejected);
        lc.vault()
            .write_new(&Location::Folder(State::Rejected), &record)
            .await
            .unwrap();
        assert!(gate.poll_decisions(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn escalate_then_sweep_stale() {
        let (gate, lc, _dir) = setup(ApprovalPolicy::fail_safe()).await;
        let owner = OwnerId::new("orch", "h", 1);
        let mut record = mail("mail-1");
        let claimed = Location::Claimed(owner.clone());
        lc.vault().write_new(&claimed, &record).await.unwrap();
        let claim = Claim {
            record: record.id.clone(),
            owner,
            claimed_at: Utc::now(),
            resumed: false,
        };

        let escalated_at = Utc::now();
        let steps = [StepProposal::new("email_reply", "reply to sender")];
        gate.escalate(&claim, &mut record, &steps, vec!["new contact".into()], escalated_at)
            .await
            .unwrap();
        let awaiting = Location::Folder(State::AwaitingApproval);
        let stored = lc.vault().read(&awaiting, &record.id).await.unwrap();
        assert_eq!(stored.trail.approval_reasons, vec!["new contact".to_string()]);
        assert!(stored.actions.iter().any(|a| a.text.starts_with("Approve: email_reply")));

        assert!(gate.sweep_stale(escalated_at + TimeDelta::minutes(30)).await.unwrap().is_empty());
        let flagged = gate.sweep_stale(escalated_at + TimeDelta::hours(2)).await.unwrap();
        assert_eq!(flagged, vec![record.id.clone()]);
        // Flagged once, never moved.
        assert!(gate.sweep_stale(escalated_at + TimeDelta::hours(3)).await.unwrap().is_empty());
        assert!(lc.vault().exists(&awaiting, &record.id).await.unwrap());
    }
}
