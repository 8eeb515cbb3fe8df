//! Isolated working directories: one temporary directory per run, a shallow
//! clone into it, optional dependency install, and guaranteed removal.

use crate::errors::WorkflowError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// A per-run working directory holding the cloned repository. The directory
/// is removed by `release()`; `Drop` is only a backstop for early errors.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    released: bool,
}

impl Workspace {
    /// Create a fresh workspace and shallow-clone `repo_url` into it.
    pub async fn acquire(repo_url: &str, token: Option<&str>) -> Result<Self, WorkflowError> {
        let dir = tempfile::Builder::new()
            .prefix("storyloop-")
            .tempdir()
            .context("Failed to create workspace directory")?
            .keep();
        let workspace = Self {
            dir,
            released: false,
        };

        let clone_url = inject_token(repo_url, token);
        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--single-branch", &clone_url])
            .arg(&workspace.dir)
            .output()
            .await
            .context("Failed to spawn git clone")?;

        if !output.status.success() {
            // Never echo the clone URL: it may carry the token.
            let stderr = String::from_utf8_lossy(&output.stderr)
                .replace(&clone_url, repo_url);
            let hint = clone_hint(&stderr);
            let mut workspace = workspace;
            workspace.release();
            return Err(WorkflowError::Clone {
                repo_url: repo_url.to_string(),
                stderr,
                hint,
            });
        }

        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Detect a JS lockfile and install dependencies with the matching
    /// package manager. Failures are logged and swallowed: a failed install
    /// leaves the agent to deal with a bare checkout, which it often can.
    pub async fn install_dependencies(&self, timeout: Duration) {
        let Some((manager, args)) = detect_install_command(&self.dir) else {
            tracing::debug!("no lockfile found, skipping dependency install");
            return;
        };
        tracing::info!(manager, "installing dependencies");

        let result = tokio::time::timeout(
            timeout,
            Command::new(manager)
                .args(args)
                .current_dir(&self.dir)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => {
                tracing::warn!(
                    manager,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "dependency install failed, continuing without"
                );
            }
            Ok(Err(err)) => {
                tracing::warn!(manager, %err, "could not spawn package manager, continuing");
            }
            Err(_) => {
                tracing::warn!(manager, "dependency install timed out, continuing");
            }
        }
    }

    /// Remove the workspace directory. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.dir.display(), %err, "failed to remove workspace");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.release();
    }
}

/// Embed the token into an https GitHub URL for clone auth. Other hosts and
/// schemes pass through untouched.
fn inject_token(repo_url: &str, token: Option<&str>) -> String {
    match token {
        Some(token) if repo_url.starts_with("https://github.com/") => {
            repo_url.replacen("https://", &format!("https://{token}@"), 1)
        }
        _ => repo_url.to_string(),
    }
}

fn detect_install_command(dir: &Path) -> Option<(&'static str, &'static [&'static str])> {
    if dir.join("pnpm-lock.yaml").exists() {
        Some(("pnpm", &["install", "--frozen-lockfile"]))
    } else if dir.join("yarn.lock").exists() {
        Some(("yarn", &["install", "--frozen-lockfile"]))
    } else if dir.join("package-lock.json").exists() {
        Some(("npm", &["ci"]))
    } else if dir.join("package.json").exists() {
        Some(("npm", &["install"]))
    } else {
        None
    }
}

/// Map common clone failures to a short actionable hint.
fn clone_hint(stderr: &str) -> Option<String> {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication failed") || lower.contains("invalid username or password") {
        Some("Check that GITHUB_TOKEN is set and has access to this repository".to_string())
    } else if lower.contains("not found") || lower.contains("repository") && lower.contains("does not exist") {
        Some("The repository was not found; check the URL or token permissions".to_string())
    } else if lower.contains("could not resolve host") {
        Some("DNS resolution failed; check network connectivity".to_string())
    } else if lower.contains("timed out") || lower.contains("timeout") {
        Some("The clone timed out; the repository may be too large or the network slow".to_string())
    } else {
        None
    }
}
