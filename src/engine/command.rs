//! Engine backed by an external program.
//!
//! The program runs inside the vault directory with the prompt as its last
//! argument. The full request is also exported as JSON in
//! `VAULT_ORCH_REQUEST` for programs that want the record ids.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{EngineReport, EngineRequest, ReasoningEngine};
use crate::error::EngineError;

/// Maximum stderr kept in an error message.
const MAX_STDERR: usize = 2_000;

pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &text[..end])
}

#[async_trait]
impl ReasoningEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.program
    }

    async fn run(&self, request: &EngineRequest) -> Result<EngineReport, EngineError> {
        let request_json = serde_json::to_string(request)
            .map_err(|e| EngineError::InvalidReport(format!("request encoding: {e}")))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&request.prompt)
            .current_dir(&request.vault)
            .env("VAULT_ORCH_REQUEST", request_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropped on timeout; the next run must not race a stale child.
            .kill_on_drop(true);

        debug!(program = %self.program, args = ?self.args, "Spawning engine program");

        let child = command.spawn().map_err(|e| EngineError::Launch {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;
        let output = child.wait_with_output().await.map_err(|e| EngineError::Launch {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Failed {
                status: output.status.to_string(),
                stderr: truncate(stderr.trim(), MAX_STDERR),
            });
        }

        let report = EngineReport::from_output(&stdout);
        debug!(outcomes = report.outcomes.len(), "Engine finished");
        Ok(report)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::vault::RecordId;
    use tempfile::TempDir;

    fn request(dir: &TempDir) -> EngineRequest {
        EngineRequest {
            vault: dir.path().to_path_buf(),
            claimed: vec![RecordId::new("mail-1").unwrap()],
            approved: Vec::new(),
            policy: String::new(),
            prompt: "do the thing".to_string(),
        }
    }

    #[tokio::test]
    async fn reads_report_from_stdout() {
        let dir = TempDir::new().unwrap();
        let engine = CommandEngine::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo working; echo '{"outcomes":[{"record":"mail-1","outcome":"completed"}]}'"#.into(),
                "engine".into(),
            ],
        );
        let report = engine.run(&request(&dir)).await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn runs_inside_the_vault_with_prompt_argument() {
        let dir = TempDir::new().unwrap();
        let engine = CommandEngine::new(
            "sh",
            vec!["-c".into(), r#"printf '%s' "$1" > prompt.txt"#.into(), "engine".into()],
        );
        let report = engine.run(&request(&dir)).await.unwrap();
        assert!(report.outcomes.is_empty());
        let written = std::fs::read_to_string(dir.path().join("prompt.txt")).unwrap();
        assert_eq!(written, "do the thing");
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let engine = CommandEngine::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into(), "engine".into()]);
        let err = engine.run(&request(&dir)).await.unwrap_err();
        match err {
            EngineError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timed_out_engine_is_killed() {
        let dir = TempDir::new().unwrap();
        let engine = CommandEngine::new(
            "sh",
            vec!["-c".into(), "echo $$ > engine.pid; exec sleep 30".into(), "engine".into()],
        );
        let pid_file = dir.path().join("engine.pid");
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(500), engine.run(&request(&dir))).await;
        assert!(result.is_err());

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        // Gone, or a zombie waiting to be reaped.
        let alive = || {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .map(|stat| !stat.contains(") Z "))
                .unwrap_or(false)
        };
        for _ in 0..40 {
            if !alive() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("engine process {pid} still running after timeout");
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let dir = TempDir::new().unwrap();
        let engine = CommandEngine::new("definitely-not-a-real-engine-binary", Vec::new());
        let err = engine.run(&request(&dir)).await.unwrap_err();
        assert!(matches!(err, EngineError::Launch { .. }));
    }
}
