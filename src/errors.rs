//! Typed error hierarchy for the storyloop workflow.
//!
//! Two fatal conditions abort a run: `Clone` and `PlanGeneration` (plus a
//! plan-review gate that times out). Everything else — a story failing its
//! build check, a push or PR call failing — is recorded into the status
//! stream and the run keeps going.

use thiserror::Error;

/// Errors from the top-level workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid repository URL: {0}")]
    InvalidRepoUrl(String),

    #[error("Failed to clone {repo_url}: {stderr}")]
    Clone {
        repo_url: String,
        stderr: String,
        hint: Option<String>,
    },

    #[error("Failed to generate plan: {0}")]
    PlanGeneration(String),

    #[error("Plan review timed out")]
    PlanReviewTimedOut,

    #[error("Run cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Human-readable message for the status stream. Clone errors append
    /// their hint so the observer sees actionable text, not just git stderr.
    pub fn user_message(&self) -> String {
        match self {
            WorkflowError::Clone { stderr, hint, .. } => match hint {
                Some(hint) => format!("Clone failed: {}\n\nHint: {}", stderr.trim(), hint),
                None => format!("Clone failed: {}", stderr.trim()),
            },
            other => other.to_string(),
        }
    }
}

/// Errors from resolving an approval token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("Unknown approval token {0}")]
    UnknownToken(String),

    #[error("Credential mismatch for token {0}")]
    BadCredential(String),

    #[error("Approval token {0} is already resolved")]
    AlreadyResolved(String),
}

/// Errors from the publish step. Push failure is reported but never fails
/// the run; PR-creation failure is even softer (the branch URL survives).
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to push branch {branch}: {stderr}")]
    Push { branch: String, stderr: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
