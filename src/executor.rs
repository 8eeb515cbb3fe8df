//! Per-story execution: prompt the coding agent, commit whatever it
//! changed, then verify the repository still builds.

use crate::agent::{AgentEvent, AgentRequest, CodingAgent};
use crate::prd::{Story, StoryStatus, TokenUsage};
use crate::status::RunStreams;
use crate::stream::{ChatEvent, ChatEventMapper};
use crate::tracker::ChangeTracker;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

const ERROR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct StoryOutcome {
    pub status: StoryStatus,
    pub commit: Option<String>,
    pub diff: Option<String>,
    pub error: Option<String>,
    pub changed: bool,
}

pub struct StoryExecutor {
    agent: Arc<dyn CodingAgent>,
    build_timeout: Duration,
    max_turns: u32,
}

impl StoryExecutor {
    pub fn new(agent: Arc<dyn CodingAgent>, build_timeout: Duration, max_turns: u32) -> Self {
        Self {
            agent,
            build_timeout,
            max_turns,
        }
    }

    fn build_prompt(task: &str, story: &Story, progress: &[String]) -> String {
        let mut prompt = format!(
            "You are implementing one story of a larger task.\n\n\
             Overall task:\n{task}\n\n"
        );
        if !progress.is_empty() {
            prompt.push_str("## Previous stories completed\n");
            for entry in progress {
                prompt.push_str("- ");
                prompt.push_str(entry);
                prompt.push('\n');
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            "## Current story: {} — {}\n\nAcceptance criteria:\n",
            story.id, story.title
        ));
        for (i, criterion) in story.acceptance.iter().enumerate() {
            prompt.push_str(&format!("{}. {criterion}\n", i + 1));
        }
        prompt.push_str(
            "\nImplement ONLY this story. Make the smallest change that meets \
             every criterion. Do not commit; changes are committed for you.\n",
        );
        prompt
    }

    /// Run one story to completion. Agent events stream to the chat channel
    /// and usage accumulates into `usage`.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        workspace: &Path,
        tracker: &ChangeTracker,
        task: &str,
        story: &Story,
        progress: &[String],
        usage: &mut TokenUsage,
        streams: &RunStreams,
        cancel: watch::Receiver<bool>,
    ) -> Result<StoryOutcome> {
        let request = AgentRequest {
            prompt: Self::build_prompt(task, story, progress),
            working_dir: workspace.to_path_buf(),
            max_turns: self.max_turns,
            allowed_tools: Vec::new(),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
        let forwarder = {
            let streams = streams.clone();
            tokio::spawn(async move {
                let mut mapper = ChatEventMapper::new();
                let mut usage = TokenUsage::default();
                while let Some(event) = rx.recv().await {
                    if let AgentEvent::Assistant { message } = &event {
                        if let Some(delta) = &message.usage {
                            usage.add(TokenUsage {
                                input_tokens: delta.input_tokens,
                                output_tokens: delta.output_tokens,
                                cache_read_tokens: delta.cache_read_input_tokens,
                                cache_creation_tokens: delta.cache_creation_input_tokens,
                            });
                        }
                    }
                    if let Some(chat) = mapper.map(&event) {
                        streams.send_chat(&chat);
                    }
                }
                usage
            })
        };

        let outcome = self.agent.run(request, cancel, tx).await;
        if let Ok(story_usage) = forwarder.await {
            usage.add(story_usage);
        }
        let outcome = outcome.context("Agent run failed")?;

        // Commit whatever the agent changed before classifying the result,
        // so a failed story's leftovers never bleed into the next commit.
        let changed = tracker.is_dirty()?;
        let commit = if changed {
            Some(tracker.commit_all(&format!("{}: {}", story.id, story.title))?)
        } else {
            None
        };
        let diff = if changed {
            Some(tracker.diff_last_commit()?)
        } else {
            None
        };

        if outcome.is_error {
            return Ok(StoryOutcome {
                status: StoryStatus::Failed,
                commit,
                diff,
                error: Some(
                    outcome
                        .result
                        .unwrap_or_else(|| "agent reported an error".to_string()),
                ),
                changed,
            });
        }

        if let Some(build_error) = self.check_build(workspace).await? {
            streams.send_chat(&ChatEvent::Text {
                delta: format!("\nBuild verification failed:\n{build_error}\n"),
            });
            return Ok(StoryOutcome {
                status: StoryStatus::Failed,
                commit,
                diff,
                error: Some(build_error),
                changed,
            });
        }

        Ok(StoryOutcome {
            status: StoryStatus::Done,
            commit,
            diff,
            error: None,
            changed,
        })
    }

    /// Run `npm run build` if the project has one. Returns the trimmed error
    /// tail on failure, None on success or when no build exists.
    async fn check_build(&self, workspace: &Path) -> Result<Option<String>> {
        if !has_build_script(workspace) {
            return Ok(None);
        }

        let spawned = Command::new("npm")
            .args(["run", "build"])
            .env("NODE_ENV", "production")
            .current_dir(workspace)
            .output();

        let output = match tokio::time::timeout(self.build_timeout, spawned).await {
            Err(_) => {
                return Ok(Some(format!(
                    "build timed out after {}s",
                    self.build_timeout.as_secs()
                )));
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                // No npm on this host; skip verification rather than fail
                // every story.
                tracing::warn!("npm not found, skipping build verification");
                return Ok(None);
            }
            Ok(Err(err)) => return Err(err).context("Failed to spawn npm run build"),
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            return Ok(None);
        }
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(Some(tail(&combined, ERROR_TAIL_CHARS)))
    }
}

fn has_build_script(workspace: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(workspace.join("package.json")) else {
        return false;
    };
    serde_json::from_str::<serde_json::Value>(&contents)
        .ok()
        .and_then(|pkg| pkg.get("scripts")?.get("build").cloned())
        .is_some()
}

/// Last `max_chars` characters of `s`, cut on a char boundary.
fn tail(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let skip = trimmed.chars().count() - max_chars;
    trimmed.chars().skip(skip).collect()
}
