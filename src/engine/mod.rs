//! Reasoning engine seam.
//!
//! The engine decides what to do with records; the orchestrator only
//! sequences and gates. An engine receives the records in scope and may
//! answer with a structured [`EngineReport`]. Anything it does beyond that
//! must stay inside the folder contract.

pub mod command;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::vault::{paths, Record, RecordId};

pub use command::CommandEngine;

/// Input to one engine invocation.
#[derive(Debug, Clone, Serialize)]
pub struct EngineRequest {
    pub vault: PathBuf,
    /// Records held by this orchestrator and not yet settled.
    pub claimed: Vec<RecordId>,
    /// Human-approved records waiting to be executed.
    pub approved: Vec<RecordId>,
    /// Human-readable summary of the approval rules.
    pub policy: String,
    pub prompt: String,
}

/// One action the engine wants to take for a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProposal {
    /// Machine label, e.g. `email_reply`, `payment`, `post`.
    pub action: String,
    #[serde(default)]
    pub description: String,
    /// Step facts the policy looks at: recipients, amount, attachments.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StepProposal {
    pub fn new(action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            description: description.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// What the engine reports for a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// The engine wants to take these steps. An optional plan is kept as a
    /// separate record.
    Proposed {
        record: RecordId,
        #[serde(default)]
        steps: Vec<StepProposal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plan: Option<String>,
    },
    /// Work on the record is finished.
    Completed {
        record: RecordId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    /// The engine declines the record.
    Rejected {
        record: RecordId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl RecordOutcome {
    pub fn record(&self) -> &RecordId {
        match self {
            Self::Proposed { record, .. }
            | Self::Completed { record, .. }
            | Self::Rejected { record, .. } => record,
        }
    }
}

/// Structured engine output. Empty when the engine printed nothing usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineReport {
    #[serde(default)]
    pub outcomes: Vec<RecordOutcome>,
}

impl EngineReport {
    /// Parse engine stdout: the whole output as JSON, or else the last line
    /// that is a JSON object. Free-form text yields an empty report.
    pub fn from_output(stdout: &str) -> Self {
        let trimmed = stdout.trim();
        if let Ok(report) = serde_json::from_str::<EngineReport>(trimmed) {
            return report;
        }
        for line in trimmed.lines().rev() {
            let line = line.trim();
            if !line.starts_with('{') {
                continue;
            }
            if let Ok(report) = serde_json::from_str::<EngineReport>(line) {
                return report;
            }
        }
        if !trimmed.is_empty() {
            debug!(bytes = trimmed.len(), "Engine output carried no structured report");
        }
        Self::default()
    }

    pub fn for_record(&self, id: &RecordId) -> Option<&RecordOutcome> {
        self.outcomes.iter().find(|o| o.record() == id)
    }
}

/// An external decision maker.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Run once over the request. The caller enforces the time budget.
    async fn run(&self, request: &EngineRequest) -> Result<EngineReport, EngineError>;
}

fn describe(out: &mut String, record: &Record) {
    out.push_str(&format!(
        "- {} [{} | {} priority]",
        record.id, record.kind, record.priority
    ));
    if let Some(subject) = record.meta_str("subject") {
        out.push_str(&format!(" \"{subject}\""));
    }
    if let Some(sender) = record.meta_str("sender") {
        out.push_str(&format!(" from {sender}"));
    }
    out.push('\n');
}

/// Build the instruction text handed to the engine.
pub fn build_prompt(
    claimed: &[Record],
    approved: &[Record],
    policy_summary: &str,
    has_handbook: bool,
) -> String {
    let mut claimed: Vec<&Record> = claimed.iter().collect();
    claimed.sort_by(|a, b| a.presentation_cmp(b));
    let mut approved: Vec<&Record> = approved.iter().collect();
    approved.sort_by(|a, b| a.presentation_cmp(b));

    let mut out = String::from("You are processing work items in this vault.\n\n");

    if !claimed.is_empty() {
        out.push_str("Records to triage:\n");
        for record in &claimed {
            describe(&mut out, record);
        }
        out.push('\n');
    }
    if !approved.is_empty() {
        out.push_str("Records a human approved, ready to execute:\n");
        for record in &approved {
            describe(&mut out, record);
        }
        out.push('\n');
    }

    out.push_str("Approval rules, evaluated top to bottom:\n");
    out.push_str(policy_summary);
    out.push_str("\n\nInstructions:\n");
    out.push_str("1. Read each record file before deciding.\n");
    if has_handbook {
        out.push_str(&format!("2. Follow {}.\n", paths::HANDBOOK));
    } else {
        out.push_str("2. Use conservative defaults; no handbook is present.\n");
    }
    out.push_str(
        "3. For records to triage, list every step you propose. Carry out only steps the rules exempt; never act on a step that needs approval.\n",
    );
    out.push_str("4. For approved records, carry out the approved steps and report completion.\n");
    out.push_str(
        "5. Print a JSON object {\"outcomes\": [...]} with one entry per record you handled.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{Priority, RecordKind};
    use serde_json::json;

    #[test]
    fn parses_report_from_noisy_output() {
        let stdout = "thinking...\nlooked at 2 files\n{\"outcomes\":[{\"record\":\"mail-msg-42\",\"outcome\":\"proposed\",\"steps\":[{\"action\":\"email_reply\",\"description\":\"Reply\",\"metadata\":{\"recipients\":[\"new@x.com\"]}}]},{\"record\":\"mail-7\",\"outcome\":\"completed\"}]}\n";
        let report = EngineReport::from_output(stdout);
        assert_eq!(report.outcomes.len(), 2);

        let id = RecordId::new("mail-msg-42").unwrap();
        match report.for_record(&id).unwrap() {
            RecordOutcome::Proposed { steps, plan, .. } => {
                assert_eq!(steps[0].action, "email_reply");
                assert_eq!(steps[0].metadata["recipients"], json!(["new@x.com"]));
                assert!(plan.is_none());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn free_text_is_an_empty_report() {
        assert_eq!(EngineReport::from_output("All done, moved files."), EngineReport::default());
        assert_eq!(EngineReport::from_output(""), EngineReport::default());
    }

    #[test]
    fn prompt_lists_records_by_priority() {
        let low = Record::new(RecordId::new("file-a").unwrap(), RecordKind::FileItem)
            .with_priority(Priority::Low);
        let high = Record::new(RecordId::new("mail-b").unwrap(), RecordKind::MailItem)
            .with_priority(Priority::High)
            .with_meta("subject", json!("URGENT invoice"))
            .with_meta("sender", json!("a@b.com"));
        let prompt = build_prompt(&[low, high], &[], "1. new-contact → requires approval", false);

        let high_at = prompt.find("mail-b").unwrap();
        let low_at = prompt.find("file-a").unwrap();
        assert!(high_at < low_at);
        assert!(prompt.contains("\"URGENT invoice\" from a@b.com"));
        assert!(prompt.contains("new-contact"));
        assert!(!prompt.contains("ready to execute"));
    }
}
