//! The run state machine: clone, explore, plan, gate, execute stories,
//! publish. All user-visible progress goes out on the run's streams; the
//! caller only sees the final outcome.

use crate::agent::CodingAgent;
use crate::config::Config;
use crate::errors::WorkflowError;
use crate::executor::{StoryExecutor, StoryOutcome};
use crate::gate::{GateBroker, GateWait, PlanAnswer, StoryAnswer};
use crate::planner::{self, PlanGenerator};
use crate::prd::{Prd, StoryStatus, TokenUsage};
use crate::publisher::Publisher;
use crate::status::{RunStreams, StatusEvent, StorySnapshot, WaitpointInfo};
use crate::stream::ChatEvent;
use crate::tracker::ChangeTracker;
use crate::workspace::Workspace;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

const MAX_BRANCH_SLUG: usize = 42;
const RECENT_COMMIT_LOG: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub repo_url: String,
    pub prompt: String,
    #[serde(default)]
    pub yolo_mode: bool,
    #[serde(default)]
    pub max_turns_per_story: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub stories_completed: usize,
    pub stories_failed: usize,
    pub branch_url: Option<String>,
    pub pr_url: Option<String>,
    pub usage: TokenUsage,
}

pub struct WorkflowRunner {
    config: Config,
    agent: Arc<dyn CodingAgent>,
    gates: GateBroker,
}

impl WorkflowRunner {
    pub fn new(config: Config, agent: Arc<dyn CodingAgent>, gates: GateBroker) -> Self {
        Self {
            config,
            agent,
            gates,
        }
    }

    /// Execute one run end to end. The workspace is always removed, whether
    /// the run succeeds, fails, or is cancelled.
    pub async fn run(
        &self,
        request: RunRequest,
        streams: RunStreams,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, WorkflowError> {
        streams.send_status(&StatusEvent::Cloning {
            repo_url: request.repo_url.clone(),
        });
        let mut workspace =
            match Workspace::acquire(&request.repo_url, self.config.github_token.as_deref()).await
            {
                Ok(workspace) => workspace,
                Err(err) => {
                    streams.send_status(&StatusEvent::Error {
                        message: err.user_message(),
                    });
                    return Err(err);
                }
            };
        streams.send_status(&StatusEvent::Cloned);

        streams.send_status(&StatusEvent::Installing);
        workspace
            .install_dependencies(self.config.install_timeout)
            .await;

        let result = self.drive(&request, &workspace, &streams, cancel).await;
        workspace.release();

        if let Err(err) = &result {
            streams.send_status(&StatusEvent::Error {
                message: err.user_message(),
            });
        }
        result
    }

    async fn drive(
        &self,
        request: &RunRequest,
        workspace: &Workspace,
        streams: &RunStreams,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, WorkflowError> {
        streams.send_status(&StatusEvent::Exploring);
        let digest = planner::explore(workspace.path());

        let generator = PlanGenerator::new(self.agent.clone());
        let prd = generator
            .generate(
                workspace.path(),
                &request.prompt,
                &digest,
                streams,
                cancel.clone(),
            )
            .await?;
        streams.send_status(&StatusEvent::PrdGenerated { prd: prd.clone() });

        let (prd, mut yolo) = self.plan_gate(prd, streams).await?;
        yolo = yolo || request.yolo_mode;

        let tracker = ChangeTracker::open(workspace.path())?;
        tracker.configure_identity(&self.config.git_user_name, &self.config.git_user_email)?;
        tracker.ensure_gitignore()?;
        let branch = format!("storyloop/{}", slugify(&prd.name, MAX_BRANCH_SLUG));
        tracker.create_branch(&branch)?;
        // Commit the ignore-file housekeeping on its own so the first story's
        // commit contains only that story's changes.
        if tracker.is_dirty()? {
            tracker.commit_all("chore: ignore build artifacts")?;
        }

        let executor = StoryExecutor::new(
            self.agent.clone(),
            self.config.build_timeout,
            request
                .max_turns_per_story
                .unwrap_or(self.config.max_turns_per_story),
        );

        let mut usage = TokenUsage::default();
        let mut progress: Vec<String> = Vec::new();
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut commits_made = 0usize;
        let pending = prd.pending_stories();
        let total = pending.len();

        for (idx, story) in pending.iter().enumerate() {
            let current = idx + 1;
            streams.send_status(&StatusEvent::StoryStart {
                story: StorySnapshot {
                    id: story.id.clone(),
                    current,
                    total,
                    title: story.title.clone(),
                    acceptance: story.acceptance.clone(),
                },
            });
            streams.send_chat(&ChatEvent::StorySeparator {
                story_num: current,
                total_stories: total,
                title: story.title.clone(),
            });

            let outcome = match executor
                .execute(
                    workspace.path(),
                    &tracker,
                    &request.prompt,
                    story,
                    &progress,
                    &mut usage,
                    streams,
                    cancel.clone(),
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    if *cancel.borrow() {
                        return Err(WorkflowError::Cancelled);
                    }
                    tracing::error!(story = %story.id, %err, "story execution errored");
                    // Treated like any other failed story so the gate below
                    // still asks whether to continue.
                    StoryOutcome {
                        status: StoryStatus::Failed,
                        commit: None,
                        diff: None,
                        error: Some(err.to_string()),
                        changed: false,
                    }
                }
            };

            if outcome.commit.is_some() {
                commits_made += 1;
            }
            if let Some(diff) = &outcome.diff {
                streams.send_status(&StatusEvent::Diff {
                    diff: diff.clone(),
                    commits: tracker.recent_commits(RECENT_COMMIT_LOG)?,
                });
            }

            match outcome.status {
                StoryStatus::Done => {
                    completed += 1;
                    let commit_note = outcome
                        .commit
                        .as_deref()
                        .map(|sha| format!(" (commit {})", &sha[..7]))
                        .unwrap_or_default();
                    progress.push(format!("{} {}{commit_note}", story.id, story.title));
                    streams.send_status(&StatusEvent::StoryComplete {
                        story_id: story.id.clone(),
                        commit: outcome.commit.clone(),
                    });
                }
                _ => {
                    failed += 1;
                    streams.send_status(&StatusEvent::StoryFailed {
                        story_id: story.id.clone(),
                        error: outcome
                            .error
                            .unwrap_or_else(|| "story did not complete".to_string()),
                    });
                }
            }

            // The last story never gates: there is nothing left to approve
            // continuing into. Failed stories still gate so the reviewer can
            // bail out; yolo mode asks nothing at all.
            if yolo || current == total {
                continue;
            }

            match self.story_gate(&story.id, streams).await? {
                StoryAnswer::Continue => {}
                StoryAnswer::Yolo => yolo = true,
                // Both early exits publish what exists; the distinction is
                // only whether the reviewer considers the task done.
                StoryAnswer::ApproveComplete | StoryAnswer::Stop => break,
            }
        }

        let (branch_url, pr_url) = self
            .publish(request, workspace, &tracker, &branch, &prd, &progress, commits_made, streams)
            .await;

        streams.send_status(&StatusEvent::Complete {
            stories_completed: completed,
            stories_failed: failed,
            usage,
        });

        Ok(RunOutcome {
            success: true,
            stories_completed: completed,
            stories_failed: failed,
            branch_url,
            pr_url,
            usage,
        })
    }

    /// Present the generated plan for review. The reviewer may edit the plan
    /// before approving; their version replaces the generated one after
    /// re-validation. Timing out here fails the run: nothing has been built
    /// yet and an unreviewed plan is not worth executing.
    async fn plan_gate(
        &self,
        prd: Prd,
        streams: &RunStreams,
    ) -> Result<(Prd, bool), WorkflowError> {
        let token = self.gates.create(self.config.gate_timeout);
        let waitpoint = WaitpointInfo {
            token_id: token.id.clone(),
            credential: token.credential.clone(),
            question: "Review the plan, edit if needed, then approve".to_string(),
        };
        streams.send_status(&StatusEvent::PrdReview {
            prd: prd.clone(),
            waitpoint,
        });
        // One id ties the approval request to its eventual response so
        // clients can correlate the pair in the chat stream.
        let approval_id = format!("plan-{}", token.id);
        streams.send_chat(&ChatEvent::Approval {
            id: approval_id.clone(),
            token_id: token.id.clone(),
            credential: token.credential.clone(),
            question: "Approve this plan?".to_string(),
            variant: "plan".to_string(),
            created_at: token.created_at,
            timeout_ms: token.timeout_ms,
        });

        let wait = self.gates.wait(&token.id).await.context("Gate vanished")?;
        self.gates.remove(&token.id);
        match wait {
            GateWait::TimedOut => Err(WorkflowError::PlanReviewTimedOut),
            GateWait::Answered(value) => {
                let answer: PlanAnswer = serde_json::from_value(value)
                    .context("Plan approval payload did not match the expected shape")?;
                let PlanAnswer::ApprovePrd { prd: approved, yolo } = answer;
                approved
                    .validate()
                    .context("Approved plan failed validation")?;
                streams.send_chat(&ChatEvent::ApprovalResponse {
                    id: approval_id,
                    action: "approve_prd".to_string(),
                });
                Ok((approved, yolo))
            }
        }
    }

    /// Gate between stories. A timeout is an implicit stop, not a failure:
    /// work done so far is still worth publishing.
    async fn story_gate(
        &self,
        story_id: &str,
        streams: &RunStreams,
    ) -> Result<StoryAnswer, WorkflowError> {
        let token = self.gates.create(self.config.gate_timeout);
        let waitpoint = WaitpointInfo {
            token_id: token.id.clone(),
            credential: token.credential.clone(),
            question: format!("{story_id} finished. Continue?"),
        };
        streams.send_status(&StatusEvent::Waitpoint {
            waitpoint,
            story_id: story_id.to_string(),
        });
        let approval_id = format!("story-{}", token.id);
        streams.send_chat(&ChatEvent::Approval {
            id: approval_id.clone(),
            token_id: token.id.clone(),
            credential: token.credential.clone(),
            question: format!("{story_id} finished. Continue to the next story?"),
            variant: "story".to_string(),
            created_at: token.created_at,
            timeout_ms: token.timeout_ms,
        });

        let wait = self.gates.wait(&token.id).await.context("Gate vanished")?;
        self.gates.remove(&token.id);
        match wait {
            GateWait::TimedOut => {
                tracing::info!(story_id, "story gate timed out, stopping and publishing");
                Ok(StoryAnswer::Stop)
            }
            GateWait::Answered(value) => {
                let answer: StoryAnswer = serde_json::from_value(value)
                    .context("Story approval payload did not match the expected shape")?;
                streams.send_chat(&ChatEvent::ApprovalResponse {
                    id: approval_id,
                    action: match answer {
                        StoryAnswer::Continue => "continue",
                        StoryAnswer::Stop => "stop",
                        StoryAnswer::ApproveComplete => "approve_complete",
                        StoryAnswer::Yolo => "yolo",
                    }
                    .to_string(),
                });
                Ok(answer)
            }
        }
    }

    /// Push and open a PR when there is something to publish and the
    /// credentials to do it. Publishing problems never fail the run.
    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        request: &RunRequest,
        workspace: &Workspace,
        tracker: &ChangeTracker,
        branch: &str,
        prd: &Prd,
        progress: &[String],
        commits_made: usize,
        streams: &RunStreams,
    ) -> (Option<String>, Option<String>) {
        if commits_made == 0 {
            tracing::info!("no commits were made, nothing to publish");
            return (None, None);
        }
        let Some(token) = self.config.github_token.clone() else {
            streams.send_status(&StatusEvent::PushFailed {
                error: "no credentials for publishing; set GITHUB_TOKEN".to_string(),
            });
            return (None, None);
        };

        streams.send_status(&StatusEvent::Pushing {
            branch: branch.to_string(),
        });

        let mut body = format!("{}\n\n## Completed stories\n", prd.description);
        for entry in progress {
            body.push_str("- ");
            body.push_str(entry);
            body.push('\n');
        }
        if let Ok(commits) = tracker.recent_commits(RECENT_COMMIT_LOG) {
            body.push_str("\n## Commits\n");
            for commit in commits {
                body.push_str("- ");
                body.push_str(&commit);
                body.push('\n');
            }
        }

        let publisher = Publisher::new(token);
        match publisher
            .publish(workspace.path(), &request.repo_url, branch, &prd.name, &body)
            .await
        {
            Ok(outcome) => {
                streams.send_status(&StatusEvent::Pushed {
                    branch_url: outcome.branch_url.clone(),
                    pr_url: outcome.pr_url.clone(),
                });
                (Some(outcome.branch_url), outcome.pr_url)
            }
            Err(err) => {
                streams.send_status(&StatusEvent::PushFailed {
                    error: err.to_string(),
                });
                (None, None)
            }
        }
    }
}

/// Lowercased, dash-separated slug of at most `max_len` characters.
pub fn slugify(input: &str, max_len: usize) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in input.chars() {
        if slug.chars().count() >= max_len {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}
