//! Publishing results: push the story branch and open a pull request.
//! Push failure is fatal to publishing; PR failure only loses the PR link.

use crate::errors::PublishError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub branch_url: String,
    pub pr_url: Option<String>,
}

/// Split an https GitHub URL into (owner, repo), tolerating a trailing
/// `.git` and trailing slash.
pub fn parse_owner_repo(repo_url: &str) -> Result<(String, String)> {
    let rest = repo_url
        .strip_prefix("https://github.com/")
        .context("Only https://github.com/ URLs can be published")?;
    let rest = rest.trim_end_matches('/').trim_end_matches(".git");
    let mut parts = rest.splitn(2, '/');
    let owner = parts.next().filter(|s| !s.is_empty());
    let repo = parts.next().filter(|s| !s.is_empty() && !s.contains('/'));
    match (owner, repo) {
        (Some(owner), Some(repo)) => Ok((owner.to_string(), repo.to_string())),
        _ => anyhow::bail!("Could not parse owner/repo from '{repo_url}'"),
    }
}

pub struct Publisher {
    http: reqwest::Client,
    token: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    html_url: String,
}

impl Publisher {
    pub fn new(token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
        }
    }

    /// Push `branch` to origin and open a PR against main. The PR title is
    /// the plan name; its body lists the completed stories.
    pub async fn publish(
        &self,
        workspace: &Path,
        repo_url: &str,
        branch: &str,
        pr_title: &str,
        pr_body: &str,
    ) -> Result<PublishOutcome, PublishError> {
        let (owner, repo) = parse_owner_repo(repo_url)?;

        // Re-point origin at a tokened URL so the push authenticates even
        // though the clone may have been anonymous.
        let push_url = format!("https://{}@github.com/{owner}/{repo}.git", self.token);
        let output = Command::new("git")
            .args(["remote", "set-url", "origin", &push_url])
            .current_dir(workspace)
            .output()
            .await
            .context("Failed to spawn git remote set-url")?;
        if !output.status.success() {
            return Err(PublishError::Push {
                branch: branch.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let output = Command::new("git")
            .args(["push", "-u", "origin", branch])
            .current_dir(workspace)
            .output()
            .await
            .context("Failed to spawn git push")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).replace(&push_url, repo_url);
            return Err(PublishError::Push {
                branch: branch.to_string(),
                stderr,
            });
        }

        let branch_url = format!("https://github.com/{owner}/{repo}/tree/{branch}");
        let pr_url = match self
            .create_pull_request(&owner, &repo, branch, pr_title, pr_body)
            .await
        {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::warn!(%err, "pull request creation failed, branch was still pushed");
                None
            }
        };

        Ok(PublishOutcome { branch_url, pr_url })
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let response = self
            .http
            .post(format!("https://api.github.com/repos/{owner}/{repo}/pulls"))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "storyloop")
            .json(&serde_json::json!({
                "title": title,
                "head": branch,
                "base": "main",
                "body": body,
            }))
            .send()
            .await
            .context("Failed to call the GitHub API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API returned {status}: {body}");
        }
        let pr: PullRequestResponse = response
            .json()
            .await
            .context("Failed to parse pull request response")?;
        Ok(pr.html_url)
    }
}
