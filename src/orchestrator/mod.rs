//! The trigger loop's body.
//!
//! [`Orchestrator::run_once`] is one pass over the vault: poll watchers,
//! pick up human decisions, claim new records, hand the claimed and
//! approved records to the reasoning engine, settle what it reports, then
//! flag stale approvals and recover abandoned claims. A failing step is
//! logged and the pass continues; only a missing vault root ends it.

pub mod trigger;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::{ApprovalGate, PolicyStore};
use crate::audit::{AuditEntry, AuditLog};
use crate::config::OrchestratorConfig;
use crate::engine::{
    build_prompt, CommandEngine, EngineRequest, ReasoningEngine, RecordOutcome, StepProposal,
};
use crate::error::{ClaimError, EngineError, Error, RecordError, StorageError};
use crate::lifecycle::claim::Recovered;
use crate::lifecycle::{ClaimManager, Lifecycle, Outcome, OwnerId, OwnerProbe, State, SystemProbe};
use crate::status::VaultStatus;
use crate::vault::record::tags;
use crate::vault::{paths, Decision, Location, Record, RecordId, RecordKind, Vault};
use crate::watchers::{open_offsets, run_watcher_cycle, DropFolderWatcher, OffsetTracker, Watcher};

pub use trigger::{spawn_trigger_loop, TriggerSchedule};

/// How the engine step of an iteration went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineRun {
    /// No engine configured.
    Disabled,
    /// Nothing claimed or approved.
    Idle,
    Completed { outcomes: usize },
    TimedOut,
    Failed,
}

/// Summary of one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    /// New records written by watchers.
    pub materialized: usize,
    /// Malformed source items kept as error-tagged records.
    pub malformed: usize,
    pub decisions: usize,
    pub claimed: usize,
    pub conflicts: usize,
    pub engine: EngineRun,
    pub escalated: usize,
    /// Claimed records settled into Done.
    pub completed: usize,
    /// Approved records the engine finished.
    pub executed: usize,
    pub rejected: usize,
    pub quarantined: usize,
    pub stale: usize,
    pub recovered: usize,
    /// `step: error_kind` for every failure absorbed this pass.
    pub errors: Vec<String>,
    pub status: Option<VaultStatus>,
}

impl IterationReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            materialized: 0,
            malformed: 0,
            decisions: 0,
            claimed: 0,
            conflicts: 0,
            engine: EngineRun::Disabled,
            escalated: 0,
            completed: 0,
            executed: 0,
            rejected: 0,
            quarantined: 0,
            stale: 0,
            recovered: 0,
            errors: Vec::new(),
            status: None,
        }
    }
}

struct RegisteredWatcher {
    watcher: Arc<dyn Watcher>,
    offsets: Mutex<OffsetTracker>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    vault: Vault,
    lifecycle: Lifecycle,
    claims: ClaimManager,
    gate: ApprovalGate,
    engine: Option<Arc<dyn ReasoningEngine>>,
    watchers: Vec<RegisteredWatcher>,
    actor: String,
}

impl Orchestrator {
    /// Open the vault, create its layout and load the approval policy.
    pub async fn new(
        config: OrchestratorConfig,
        owner: OwnerId,
        probe: Arc<dyn OwnerProbe>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let vault = Vault::open(&config.vault_root).await?;
        vault.ensure_layout().await?;
        let audit = AuditLog::new(vault.resolve(paths::LOGS));
        let lifecycle = Lifecycle::new(vault.clone(), audit);

        let policy = Arc::new(PolicyStore::open(config.policy_path(), config.policy_reload).await);
        let actor = owner.to_string();
        let claims = ClaimManager::new(
            lifecycle.clone(),
            owner,
            probe,
            config.claim_grace,
            config.max_attempts,
        );
        let gate = ApprovalGate::new(lifecycle.clone(), policy, config.approval_ttl, actor.clone());

        Ok(Self {
            config,
            vault,
            lifecycle,
            claims,
            gate,
            engine: None,
            watchers: Vec::new(),
            actor,
        })
    }

    /// Assemble an orchestrator for this process: local owner id, process
    /// table liveness, the command engine and drop folder if configured.
    pub async fn from_config(config: OrchestratorConfig) -> Result<Self, Error> {
        let owner = OwnerId::local(&config.owner_name);
        let engine = config
            .engine_program
            .clone()
            .map(|program| CommandEngine::new(program, config.engine_args.clone()));
        let drop_folder = config.drop_folder;

        let mut orchestrator = Self::new(config, owner, Arc::new(SystemProbe::new())).await?;
        if let Some(engine) = engine {
            orchestrator = orchestrator.with_engine(Arc::new(engine));
        }
        if drop_folder {
            let inbox = orchestrator.vault.resolve(paths::INBOX);
            orchestrator
                .register_watcher(Arc::new(DropFolderWatcher::new(inbox)))
                .await?;
        }
        Ok(orchestrator)
    }

    pub fn with_engine(mut self, engine: Arc<dyn ReasoningEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Register a watcher. Its offset log is replayed here, before the
    /// first poll.
    pub async fn register_watcher(&mut self, watcher: Arc<dyn Watcher>) -> Result<(), Error> {
        let offsets = open_offsets(&self.vault, watcher.as_ref(), self.config.offset_retention).await?;
        info!(watcher = watcher.kind(), seen = offsets.len(), "Watcher registered");
        self.watchers.push(RegisteredWatcher {
            watcher,
            offsets: Mutex::new(offsets),
        });
        Ok(())
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn claims(&self) -> &ClaimManager {
        &self.claims
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn owner(&self) -> &OwnerId {
        self.claims.owner()
    }

    fn audit(&self) -> &AuditLog {
        self.lifecycle.audit()
    }

    /// Recover claims before the first iteration: adopt our own from a
    /// previous process and requeue those of dead owners past grace.
    pub async fn startup(&self, now: DateTime<Utc>) -> Result<Vec<Recovered>, Error> {
        self.vault.check_root().await?;
        let mut recovered = self.claims.resume_own().await?;
        recovered.extend(self.claims.reclaim_abandoned(now).await?);
        info!(
            owner = %self.owner(),
            recovered = recovered.len(),
            watchers = self.watchers.len(),
            engine = self.engine.as_ref().map(|e| e.name()).unwrap_or("none"),
            "Orchestrator started"
        );
        Ok(recovered)
    }

    /// Run one iteration.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<IterationReport, Error> {
        self.vault.check_root().await?;
        let mut report = IterationReport::new(now);
        debug!(iteration = %report.id, "Iteration started");

        if self.gate.policy().refresh().await {
            info!("Approval policy reloaded");
        }

        let result = self.poll_watchers(&mut report).await;
        self.absorb("watchers", None, result, &mut report).await?;

        let result = self.apply_decisions(now, &mut report).await;
        self.absorb("decisions", None, result, &mut report).await?;

        let result = self.claim_intake(&mut report).await;
        self.absorb("claim", None, result, &mut report).await?;

        let result = self.run_engine(now, &mut report).await;
        self.absorb("engine", None, result, &mut report).await?;

        match self.gate.sweep_stale(now).await {
            Ok(flagged) => report.stale = flagged.len(),
            Err(e) => self.absorb("stale", None, Err(e), &mut report).await?,
        }

        match self.claims.reclaim_abandoned(now).await {
            Ok(recovered) => {
                for r in &recovered {
                    match r {
                        Recovered::Quarantined(_) => report.quarantined += 1,
                        Recovered::Requeued(_) | Recovered::Resumed(_) => report.recovered += 1,
                    }
                }
            }
            Err(e) => self.absorb("recover", None, Err(e), &mut report).await?,
        }

        match VaultStatus::collect(&self.vault, now, self.config.approval_ttl).await {
            Ok(status) => {
                info!(
                    iteration = %report.id,
                    intake = status.count(State::Intake),
                    claimed = status.claimed(),
                    awaiting = status.count(State::AwaitingApproval),
                    approved = status.count(State::Approved),
                    done = status.count(State::Done),
                    quarantine = status.count(State::Quarantined),
                    stale = status.stale_approvals,
                    errors = report.errors.len(),
                    "Iteration complete"
                );
                report.status = Some(status);
            }
            Err(e) => self.absorb("status", None, Err(e.into()), &mut report).await?,
        }
        Ok(report)
    }

    /// Log and audit a failed step. Fatal errors are handed back.
    async fn absorb(
        &self,
        step: &str,
        record: Option<&RecordId>,
        result: Result<(), Error>,
        report: &mut IterationReport,
    ) -> Result<(), Error> {
        let Err(e) = result else {
            return Ok(());
        };
        if e.is_fatal() {
            return Err(e);
        }
        match record {
            Some(id) => warn!(step, record = %id, error = %e, "Step failed"),
            None => warn!(step, error = %e, "Step failed"),
        }
        self.audit()
            .record_error(&self.actor, step, record.map(RecordId::as_str), None, &e)
            .await;
        report.errors.push(format!("{step}: {}", e.kind()));
        Ok(())
    }

    /// Move an unparseable record file to Quarantine unchanged.
    async fn quarantine_corrupt(
        &self,
        location: &Location,
        id: &RecordId,
        cause: RecordError,
    ) -> Result<(), Error> {
        let err = Error::Record(cause);
        self.audit()
            .record_error(&self.actor, "quarantine", Some(id.as_str()), Some(&location.to_string()), &err)
            .await;
        self.vault
            .quarantine_raw(&self.vault.path_of(location, id))
            .await?;
        Ok(())
    }

    /// Read every record at a location, quarantining the unreadable ones.
    async fn read_location(
        &self,
        location: &Location,
        report: &mut IterationReport,
    ) -> Result<Vec<Record>, Error> {
        let mut records = Vec::new();
        for (id, result) in self.vault.read_all(location).await? {
            match result {
                Ok(record) => records.push(record),
                Err(Error::Record(cause)) => {
                    let result = self.quarantine_corrupt(location, &id, cause).await;
                    if result.is_ok() {
                        report.quarantined += 1;
                    }
                    self.absorb("quarantine", Some(&id), result, report).await?;
                }
                // Usually moved by someone else between list and read.
                Err(e) => self.absorb("read", Some(&id), Err(e), report).await?,
            }
        }
        Ok(records)
    }

    // ── Watchers ────────────────────────────────────────────────────────

    async fn poll_watchers(&self, report: &mut IterationReport) -> Result<(), Error> {
        let cycles = join_all(self.watchers.iter().map(|w| async move {
            let mut offsets = w.offsets.lock().await;
            let result =
                run_watcher_cycle(w.watcher.as_ref(), &mut offsets, &self.vault, self.audit()).await;
            (w.watcher.kind().to_string(), result)
        }))
        .await;

        for (kind, result) in cycles {
            match result {
                Ok(cycle) => {
                    report.materialized += cycle.created;
                    report.malformed += cycle.quarantined;
                }
                Err(e) if e.is_fatal() => return Err(e),
                // Already audited by the watcher cycle.
                Err(e) => {
                    warn!(watcher = %kind, error = %e, "Watcher cycle failed");
                    report.errors.push(format!("watcher {kind}: {}", e.kind()));
                }
            }
        }
        Ok(())
    }

    // ── Decisions ───────────────────────────────────────────────────────

    async fn apply_decisions(&self, now: DateTime<Utc>, report: &mut IterationReport) -> Result<(), Error> {
        report.decisions += self.gate.poll_decisions(now).await?.len();
        self.follow_rejected_plans(now, report).await
    }

    /// Move pending plans whose parent ended up in `Rejected/`. Runs every
    /// iteration, so it does not matter which poller saw the decision.
    async fn follow_rejected_plans(&self, now: DateTime<Utc>, report: &mut IterationReport) -> Result<(), Error> {
        let plans = Location::Folder(State::PlanPending);
        let rejected = Location::Folder(State::Rejected);
        for plan in self.read_location(&plans, report).await? {
            let Some(parent) = &plan.parent else {
                continue;
            };
            if self.vault.exists(&rejected, parent).await? {
                let result = self.settle_plan(parent, State::Rejected, now).await;
                self.absorb("settle_plan", Some(parent), result, report)
                    .await?;
            }
        }
        Ok(())
    }

    // ── Claiming ────────────────────────────────────────────────────────

    async fn claim_intake(&self, report: &mut IterationReport) -> Result<(), Error> {
        let intake = Location::Folder(State::Intake);
        for path in self.vault.stray_files(&intake).await? {
            let reason = "file name is not a valid record id".to_string();
            let err = Error::Record(RecordError::Corrupt {
                path: path.clone(),
                reason,
            });
            self.audit()
                .record_error(&self.actor, "quarantine", None, Some(&intake.to_string()), &err)
                .await;
            self.vault.quarantine_raw(&path).await?;
            report.quarantined += 1;
        }

        let mut candidates = self.read_location(&intake, report).await?;
        candidates.sort_by(|a, b| a.presentation_cmp(b));

        for record in candidates {
            match self.claims.claim(&record.id).await {
                Ok(_) => report.claimed += 1,
                Err(ClaimError::Conflict { holder, .. }) => {
                    debug!(record = %record.id, holder = %holder, "Lost claim race, backing off");
                    report.conflicts += 1;
                    let err = Error::Claim(ClaimError::Conflict {
                        record: record.id.to_string(),
                        holder,
                    });
                    self.audit()
                        .record_error(&self.actor, "claim", Some(record.id.as_str()), Some(&intake.to_string()), &err)
                        .await;
                }
                Err(ClaimError::NotFound { .. }) => {
                    debug!(record = %record.id, "Record left Intake before it could be claimed");
                }
                Err(e) => self.absorb("claim", Some(&record.id), Err(e.into()), report).await?,
            }
        }
        Ok(())
    }

    // ── Engine ──────────────────────────────────────────────────────────

    async fn run_engine(&self, now: DateTime<Utc>, report: &mut IterationReport) -> Result<(), Error> {
        let Some(engine) = &self.engine else {
            report.engine = EngineRun::Disabled;
            return Ok(());
        };

        let mine = Location::Claimed(self.owner().clone());
        let claimed = self.read_location(&mine, report).await?;
        let approved: Vec<Record> = self
            .read_location(&Location::Folder(State::Approved), report)
            .await?
            .into_iter()
            .filter(|r| r.has_tag(tags::EXECUTING))
            .collect();
        if claimed.is_empty() && approved.is_empty() {
            report.engine = EngineRun::Idle;
            return Ok(());
        }

        let policy = self.gate.policy().current().await;
        let summary = policy.summary();
        let has_handbook = tokio::fs::try_exists(self.vault.resolve(paths::HANDBOOK))
            .await
            .unwrap_or(false);
        let request = EngineRequest {
            vault: self.vault.root().to_path_buf(),
            claimed: claimed.iter().map(|r| r.id.clone()).collect(),
            approved: approved.iter().map(|r| r.id.clone()).collect(),
            prompt: build_prompt(&claimed, &approved, &summary, has_handbook),
            policy: summary,
        };

        info!(
            engine = engine.name(),
            claimed = request.claimed.len(),
            approved = request.approved.len(),
            "Invoking reasoning engine"
        );
        let budget = self.config.engine_timeout;
        let result = match tokio::time::timeout(budget, engine.run(&request)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout { budget }),
        };

        let engine_report = match result {
            Ok(engine_report) => engine_report,
            Err(e) => {
                report.engine = match e {
                    EngineError::Timeout { .. } => EngineRun::TimedOut,
                    _ => EngineRun::Failed,
                };
                let err = Error::Engine(e);
                warn!(engine = engine.name(), error = %err, "Engine run failed, records stay claimed");
                for id in &request.claimed {
                    self.audit()
                        .record_error(&self.actor, "engine", Some(id.as_str()), Some(&mine.to_string()), &err)
                        .await;
                }
                report.errors.push(format!("engine: {}", err.kind()));
                return Ok(());
            }
        };
        report.engine = EngineRun::Completed {
            outcomes: engine_report.outcomes.len(),
        };

        for outcome in &engine_report.outcomes {
            let id = outcome.record();
            if !request.claimed.contains(id) && !request.approved.contains(id) {
                warn!(record = %id, "Engine reported on a record outside its scope");
            }
        }

        for record in claimed {
            let Some(outcome) = engine_report.for_record(&record.id) else {
                debug!(record = %record.id, "No outcome reported, record stays claimed");
                continue;
            };
            let id = record.id.clone();
            let result = self.settle_claimed(record, outcome, now, report).await;
            self.absorb("settle", Some(&id), result, report).await?;
        }
        for record in approved {
            let Some(outcome) = engine_report.for_record(&record.id) else {
                continue;
            };
            let id = record.id.clone();
            let result = self.settle_approved(record, outcome, now, report).await;
            self.absorb("execute", Some(&id), result, report).await?;
        }
        Ok(())
    }

    async fn settle_claimed(
        &self,
        mut record: Record,
        outcome: &RecordOutcome,
        now: DateTime<Utc>,
        report: &mut IterationReport,
    ) -> Result<(), Error> {
        let claim = self.claims.held(&record);
        match outcome {
            RecordOutcome::Proposed { steps, plan, .. } => {
                if let Some(plan) = plan {
                    self.write_plan(&record, plan, steps).await?;
                }
                let review = self.gate.evaluate_steps(&record, steps).await;
                if review.required {
                    self.gate
                        .escalate(&claim, &mut record, steps, review.reasons, now)
                        .await?;
                    report.escalated += 1;
                } else {
                    record.add_tag(tags::AUTO_APPROVED);
                    record.trail.completed_at = Some(now);
                    self.claims
                        .release_annotated(&claim, &record, Outcome::Done)
                        .await?;
                    info!(record = %record.id, steps = steps.len(), "Proposal exempt from approval");
                    self.settle_plan(&record.id, State::Done, now).await?;
                    report.completed += 1;
                }
            }
            RecordOutcome::Completed { summary, .. } => {
                record.trail.completed_at = Some(now);
                if let Some(summary) = summary {
                    record.set_meta("summary", summary.clone());
                }
                self.claims
                    .release_annotated(&claim, &record, Outcome::Done)
                    .await?;
                self.settle_plan(&record.id, State::Done, now).await?;
                report.completed += 1;
            }
            RecordOutcome::Rejected { reason, .. } => {
                record.trail.decision = Some(Decision::Rejected);
                record.trail.decided_at = Some(now);
                if let Some(reason) = reason {
                    record.set_meta("rejection_reason", reason.clone());
                }
                // A stamped decision tells the poller this was not a human.
                self.claims
                    .release_annotated(&claim, &record, Outcome::Rejected)
                    .await?;
                self.settle_plan(&record.id, State::Rejected, now).await?;
                report.rejected += 1;
            }
        }
        Ok(())
    }

    async fn settle_approved(
        &self,
        mut record: Record,
        outcome: &RecordOutcome,
        now: DateTime<Utc>,
        report: &mut IterationReport,
    ) -> Result<(), Error> {
        let RecordOutcome::Completed { summary, .. } = outcome else {
            warn!(record = %record.id, "Only completion applies to an approved record, ignoring outcome");
            return Ok(());
        };
        record.remove_tag(tags::EXECUTING);
        record.trail.completed_at = Some(now);
        if let Some(summary) = summary {
            record.set_meta("summary", summary.clone());
        }
        self.lifecycle
            .commit(
                &record,
                &Location::Folder(State::Approved),
                &Location::Folder(State::Done),
                &self.actor,
            )
            .await?;
        self.settle_plan(&record.id, State::Done, now).await?;
        report.executed += 1;
        Ok(())
    }

    // ── Plans ───────────────────────────────────────────────────────────

    async fn write_plan(&self, parent: &Record, plan: &str, steps: &[StepProposal]) -> Result<(), Error> {
        let mut record = Record::new(RecordId::plan_for(&parent.id), RecordKind::Plan)
            .with_parent(parent.id.clone())
            .with_priority(parent.priority)
            .with_body(plan);
        for step in steps {
            record = if step.description.is_empty() {
                record.with_action(step.action.clone())
            } else {
                record.with_action(format!("{}: {}", step.action, step.description))
            };
        }

        let plans = Location::Folder(State::PlanPending);
        match self.vault.write_new(&plans, &record).await {
            Ok(()) => {
                info!(record = %record.id, parent = %parent.id, "Plan written");
                self.audit()
                    .append_or_warn(
                        &AuditEntry::success(&self.actor, "create_plan")
                            .record(&record.id)
                            .state(&plans),
                    )
                    .await;
                Ok(())
            }
            Err(Error::Storage(StorageError::AlreadyExists { .. })) => {
                self.vault.rewrite(&plans, &record).await
            }
            Err(e) => Err(e),
        }
    }

    /// Move a parent's plan, if any, to the parent's terminal state.
    async fn settle_plan(&self, parent: &RecordId, to: State, now: DateTime<Utc>) -> Result<(), Error> {
        let plans = Location::Folder(State::PlanPending);
        let id = RecordId::plan_for(parent);
        if !self.vault.exists(&plans, &id).await? {
            return Ok(());
        }
        let mut plan = match self.vault.read(&plans, &id).await {
            Ok(plan) => plan,
            Err(Error::Record(cause)) => return self.quarantine_corrupt(&plans, &id, cause).await,
            Err(e) => return Err(e),
        };
        if to == State::Rejected {
            plan.trail.decision = Some(Decision::Rejected);
            plan.trail.decided_at = Some(now);
        } else {
            plan.trail.completed_at = Some(now);
        }
        self.lifecycle
            .commit(&plan, &plans, &Location::Folder(to), &self.actor)
            .await
    }
}
