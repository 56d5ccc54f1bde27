//! Human sign-off: policy evaluation and decision detection.

pub mod gate;
pub mod policy;

pub use gate::{ApprovalGate, DecisionEvent, StepReview};
pub use policy::{ApprovalPolicy, Condition, PolicyStore, Rule, Subject, Verdict, SAMPLE_POLICY};
