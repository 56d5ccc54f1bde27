//! Vault Orchestrator: folder-backed task lifecycle with human approval.

pub mod approval;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod status;
pub mod vault;
pub mod watchers;

pub use error::{Error, Result};
pub use orchestrator::{IterationReport, Orchestrator};
