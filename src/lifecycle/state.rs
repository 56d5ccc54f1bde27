//! Record lifecycle states and the transition table.

use serde::{Deserialize, Serialize};

use crate::vault::paths;

/// State of a record. The folder a record sits in is the projection of this
/// state; there is no stored status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Freshly materialised, waiting for a claim.
    Intake,
    /// Exclusively owned by one orchestrator.
    Claimed,
    /// An engine-authored plan attached to a parent record.
    PlanPending,
    /// Waiting on a human decision.
    AwaitingApproval,
    /// A human approved the gated step.
    Approved,
    /// Approved and handed to the engine. Advisory: lives in `Approved/`.
    Executing,
    /// Terminal. A human or the engine said no.
    Rejected,
    /// Terminal archive.
    Done,
    /// Corrupt or poisoned. Never deleted.
    Quarantined,
}

/// Who performs a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The orchestrator or the engine acting through it.
    System,
    /// A person relocating files in the vault.
    Human,
}

/// Every allowed `(from, to, actor)` triple. Quarantine is handled apart.
pub const TRANSITIONS: &[(State, State, Actor)] = &[
    (State::Intake, State::Claimed, Actor::System),
    // Same-owner resume and reclaim of an abandoned claim.
    (State::Claimed, State::Claimed, Actor::System),
    (State::Claimed, State::AwaitingApproval, Actor::System),
    (State::Claimed, State::Done, Actor::System),
    (State::Claimed, State::Rejected, Actor::System),
    // Abandonment: give the record back for another owner.
    (State::Claimed, State::Intake, Actor::System),
    (State::AwaitingApproval, State::Approved, Actor::Human),
    (State::AwaitingApproval, State::Rejected, Actor::Human),
    (State::Approved, State::Executing, Actor::System),
    (State::Approved, State::Done, Actor::System),
    (State::Executing, State::Done, Actor::System),
    (State::PlanPending, State::Done, Actor::System),
    (State::PlanPending, State::Rejected, Actor::System),
];

impl State {
    /// States that map to a shared top-level folder.
    pub const FOLDER_STATES: [State; 7] = [
        State::Intake,
        State::PlanPending,
        State::AwaitingApproval,
        State::Approved,
        State::Rejected,
        State::Done,
        State::Quarantined,
    ];

    /// Folder name relative to the vault root. `Claimed` is the parent of
    /// the per-owner folders.
    pub fn folder(&self) -> &'static str {
        match self {
            Self::Intake => paths::INTAKE,
            Self::Claimed => paths::CLAIMED,
            Self::PlanPending => paths::PLANS,
            Self::AwaitingApproval => paths::AWAITING_APPROVAL,
            Self::Approved | Self::Executing => paths::APPROVED,
            Self::Rejected => paths::REJECTED,
            Self::Done => paths::DONE,
            Self::Quarantined => paths::QUARANTINE,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Rejected | Self::Quarantined)
    }

    /// Check a transition against the table.
    pub fn can_transition_to(&self, target: State, actor: Actor) -> bool {
        transition_allowed(*self, target, actor)
    }
}

/// Table lookup. Any non-terminal state may be quarantined by the system.
pub fn transition_allowed(from: State, to: State, actor: Actor) -> bool {
    if to == State::Quarantined {
        return actor == Actor::System && !from.is_terminal();
    }
    TRANSITIONS
        .iter()
        .any(|&(f, t, a)| f == from && t == to && a == actor)
}

/// Whether a transition exists at all, for any actor.
pub fn transition_exists(from: State, to: State) -> bool {
    transition_allowed(from, to, Actor::System) || transition_allowed(from, to, Actor::Human)
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Intake => "intake",
            Self::Claimed => "claimed",
            Self::PlanPending => "plan_pending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Rejected => "rejected",
            Self::Done => "done",
            Self::Quarantined => "quarantined",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Human => write!(f, "human"),
        }
    }
}
