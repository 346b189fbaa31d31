//! Agent subprocess invocation.
//!
//! The AI assistant itself is an opaque long-running subprocess that emits a
//! structured event stream on stdout (one JSON object per line) and finishes
//! with a terminal `result` event carrying the answer plus cost and turn
//! metadata. [`AgentRunner`] abstracts that invocation so the worker loop can
//! be driven by a scripted runner in tests.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::WorkError;

/// Final payload of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunOutcome {
    /// The agent's final answer text.
    pub result: String,
    /// Cumulative API cost for the run.
    pub cost_usd: f64,
    /// Number of assistant turns taken.
    pub num_turns: u32,
}

/// Callback receiving every raw stream event as it arrives.
pub type EventSink<'a> = &'a (dyn Fn(Value) + Send + Sync);

/// Abstraction over agent execution for testability.
/// Real implementation: [`ClaudeRunner`]. Tests use scripted doubles.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one prompt to completion inside `workdir`, streaming events into
    /// `events` as they arrive. Cancelling `cancel` interrupts the subprocess
    /// and resolves to [`WorkError::Interrupted`].
    async fn run(
        &self,
        prompt: &str,
        workdir: &Path,
        events: EventSink<'_>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, WorkError>;
}

/// Runs the Claude CLI in streaming mode.
pub struct ClaudeRunner {
    cmd: String,
}

impl Default for ClaudeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeRunner {
    pub fn new() -> Self {
        let cmd = std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string());
        Self { cmd }
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn run(
        &self,
        prompt: &str,
        workdir: &Path,
        events: EventSink<'_>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, WorkError> {
        let mut child = Command::new(&self.cmd)
            .args([
                "--print",
                "--dangerously-skip-permissions",
                "--output-format",
                "stream-json",
                "--verbose",
                "-p",
                prompt,
            ])
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(WorkError::SpawnFailed)?;

        let stdout = child.stdout.take();
        let mut outcome: Option<RunOutcome> = None;

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        return Err(WorkError::Interrupted);
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                                    // Non-JSON noise on stdout; skip it.
                                    continue;
                                };
                                if let Some(parsed) = parse_result_event(&value) {
                                    outcome = Some(parsed);
                                }
                                events(value);
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!("agent stdout read error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Capture stderr before waiting so a failure is diagnosable.
        let stderr_content = match child.stderr.take() {
            Some(stderr) => {
                let mut content = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    content.push_str(&line);
                    content.push('\n');
                }
                content
            }
            None => String::new(),
        };

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(WorkError::Interrupted);
            }
            status = child.wait() => status.map_err(WorkError::SpawnFailed)?,
        };

        if !status.success() {
            return Err(WorkError::NonZeroExit {
                exit_code: status.code().unwrap_or(-1),
                stderr: stderr_content.trim().to_string(),
            });
        }

        outcome.ok_or(WorkError::MissingResult)
    }
}

/// Extract a [`RunOutcome`] from a terminal `result` stream event, if this
/// event is one.
pub fn parse_result_event(value: &Value) -> Option<RunOutcome> {
    if value.get("type").and_then(|t| t.as_str()) != Some("result") {
        return None;
    }
    Some(RunOutcome {
        result: value
            .get("result")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string(),
        cost_usd: value
            .get("total_cost_usd")
            .and_then(|c| c.as_f64())
            .unwrap_or(0.0),
        num_turns: value
            .get("num_turns")
            .and_then(|n| n.as_u64())
            .unwrap_or(0) as u32,
    })
}
