//! Coding agent abstraction and the Claude CLI implementation.
//!
//! The agent is driven in non-interactive mode and emits newline-delimited
//! JSON on stdout. We parse each line tolerantly: unknown event shapes are
//! skipped rather than failing the run, since the CLI adds event types
//! between versions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

/// One request to the coding agent: a prompt executed inside a working
/// directory with a bounded number of turns.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub max_turns: u32,
    pub allowed_tools: Vec<String>,
}

/// Final outcome of one agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub result: Option<String>,
    pub is_error: bool,
}

/// Raw events from the agent's stream-json output.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Partial-message streaming event wrapping an Anthropic SSE payload.
    StreamEvent { event: StreamPayload },
    /// A complete assistant message, carrying usage totals.
    Assistant { message: AssistantMessage },
    /// Terminal event for the invocation.
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    ContentBlockStart { content_block: ContentBlockStart },
    ContentBlockDelta { delta: BlockDelta },
    ContentBlockStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockStart {
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub usage: Option<UsageDelta>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UsageDelta {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// A coding agent that executes one prompt to completion, streaming raw
/// events along the way. Cancellation kills the underlying process.
#[async_trait]
pub trait CodingAgent: Send + Sync {
    async fn run(
        &self,
        request: AgentRequest,
        cancel: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<AgentOutcome>;
}

/// Agent backed by the `claude` CLI in print mode.
pub struct ClaudeCliAgent {
    cmd: String,
    model: String,
}

impl ClaudeCliAgent {
    pub fn new(cmd: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            model: model.into(),
        }
    }
}

/// Resolve once the cancel flag flips to true. Pends forever if the sender
/// is dropped without cancelling, so callers can select! against it safely.
pub async fn wait_cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl CodingAgent for ClaudeCliAgent {
    async fn run(
        &self,
        request: AgentRequest,
        cancel: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<AgentOutcome> {
        let mut command = Command::new(&self.cmd);
        command
            .args([
                "--print",
                "--output-format",
                "stream-json",
                "--include-partial-messages",
                "--verbose",
                "--dangerously-skip-permissions",
                "--model",
                &self.model,
                "--max-turns",
            ])
            .arg(request.max_turns.to_string());
        if !request.allowed_tools.is_empty() {
            command
                .arg("--allowed-tools")
                .arg(request.allowed_tools.join(","));
        }
        command
            .arg("-p")
            .arg(&request.prompt)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            // Unread piped stderr can deadlock a chatty agent; discard it.
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn coding agent '{}'", self.cmd))?;
        let stdout = child
            .stdout
            .take()
            .context("Agent stdout was not captured")?;
        let mut lines = BufReader::new(stdout).lines();

        let mut outcome = AgentOutcome::default();
        let cancelled = wait_cancelled(cancel);
        tokio::pin!(cancelled);

        loop {
            tokio::select! {
                () = &mut cancelled => {
                    child.kill().await.ok();
                    anyhow::bail!("Agent run cancelled");
                }
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read agent output")? else {
                        break;
                    };
                    let Ok(event) = serde_json::from_str::<AgentEvent>(&line) else {
                        continue;
                    };
                    if let AgentEvent::Result { result, is_error, .. } = &event {
                        outcome.result = result.clone();
                        outcome.is_error = *is_error;
                    }
                    // Receiver gone means the run is being torn down.
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
        }

        let status = child.wait().await.context("Failed to wait for agent")?;
        if !status.success() && outcome.result.is_none() {
            anyhow::bail!("Agent exited with {status} and produced no result");
        }
        Ok(outcome)
    }
}
