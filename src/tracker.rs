//! Git operations inside the workspace: identity setup, branch creation,
//! per-story commits, and diff/summary extraction for review.
//!
//! Only the workspace path is held between calls; a `git2::Repository` is
//! opened inside each method and never outlives it. Repository handles are
//! not `Sync`, and the tracker is borrowed across agent awaits.

use anyhow::{Context, Result};
use git2::{DiffFormat, DiffOptions, Repository, Signature, StatusOptions};
use std::path::{Path, PathBuf};

const GITIGNORE_DEFAULTS: &str = "node_modules/\ndist/\n.env\n";

pub struct ChangeTracker {
    path: PathBuf,
}

impl ChangeTracker {
    /// Bind to the repository at `path`, verifying it opens.
    pub fn open(path: &Path) -> Result<Self> {
        Repository::open(path)
            .with_context(|| format!("Failed to open git repository at {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.path)
            .with_context(|| format!("Failed to open git repository at {}", self.path.display()))
    }

    /// Set the committer identity in the repo-local config so commits never
    /// depend on host-level git configuration.
    pub fn configure_identity(&self, name: &str, email: &str) -> Result<()> {
        let repo = self.repo()?;
        let mut config = repo.config().context("Failed to open repo config")?;
        config.set_str("user.name", name)?;
        config.set_str("user.email", email)?;
        Ok(())
    }

    /// Make sure build artifacts never end up in story commits. Appends the
    /// defaults only when node_modules is not already ignored.
    pub fn ensure_gitignore(&self) -> Result<()> {
        let path = self.path.join(".gitignore");
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        if existing.contains("node_modules") {
            return Ok(());
        }
        let mut contents = existing;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(GITIGNORE_DEFAULTS);
        std::fs::write(&path, contents).context("Failed to write .gitignore")?;
        Ok(())
    }

    /// Create and check out a new branch from the current HEAD commit.
    pub fn create_branch(&self, name: &str) -> Result<()> {
        let repo = self.repo()?;
        let head = repo
            .head()
            .context("Repository has no HEAD")?
            .peel_to_commit()
            .context("HEAD does not point to a commit")?;
        repo.branch(name, &head, false)
            .with_context(|| format!("Failed to create branch '{name}'"))?;
        repo.set_head(&format!("refs/heads/{name}"))
            .with_context(|| format!("Failed to check out branch '{name}'"))?;
        Ok(())
    }

    /// Whether the working tree has any changes, including untracked files.
    pub fn is_dirty(&self) -> Result<bool> {
        let repo = self.repo()?;
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true);
        let statuses = repo
            .statuses(Some(&mut options))
            .context("Failed to read repository status")?;
        Ok(!statuses.is_empty())
    }

    /// Stage everything and commit. Returns the new commit sha.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        let repo = self.repo()?;
        let mut index = repo.index().context("Failed to open index")?;
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .context("Failed to stage changes")?;
        index.write().context("Failed to write index")?;
        let tree_id = index.write_tree().context("Failed to write tree")?;
        let tree = repo.find_tree(tree_id)?;

        let signature = repo
            .signature()
            .or_else(|_| Signature::now("storyloop", "storyloop@users.noreply.github.com"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();

        let oid = repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .context("Failed to create commit")?;
        Ok(oid.to_string())
    }

    pub fn head_sha(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?;
        Ok(head.id().to_string())
    }

    /// Unified diff of the most recent commit against its parent. For a root
    /// commit, diffs against the empty tree.
    pub fn diff_last_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?;
        let head_tree = head.tree()?;
        let parent_tree = match head.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };

        let mut options = DiffOptions::new();
        let diff = repo.diff_tree_to_tree(
            parent_tree.as_ref(),
            Some(&head_tree),
            Some(&mut options),
        )?;

        let mut out = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            let origin = line.origin();
            if matches!(origin, '+' | '-' | ' ') {
                out.push(origin);
            }
            out.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        Ok(out)
    }

    /// Short log of the most recent `n` commits, newest first.
    pub fn recent_commits(&self, n: usize) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let mut walk = repo.revwalk()?;
        walk.push_head()?;
        let mut commits = Vec::new();
        for oid in walk.take(n) {
            let oid = oid?;
            let commit = repo.find_commit(oid)?;
            let sha = oid.to_string();
            let summary = commit.summary().unwrap_or("(no message)");
            commits.push(format!("{} {}", &sha[..7], summary));
        }
        Ok(commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_repo() -> (TempDir, ChangeTracker) {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path()).unwrap();
        let tracker = ChangeTracker::open(dir.path()).unwrap();
        tracker.configure_identity("Test", "test@example.com").unwrap();
        (dir, tracker)
    }

    fn write_file(dir: &TempDir, name: &str, contents: &str) {
        std::fs::write(dir.path().join(name), contents).unwrap();
    }

    #[test]
    fn tracker_is_shareable_across_threads() {
        fn assert_sync<T: Send + Sync>() {}
        assert_sync::<ChangeTracker>();
    }

    #[test]
    fn dirty_detection_includes_untracked() {
        let (dir, tracker) = setup_repo();
        assert!(!tracker.is_dirty().unwrap());
        write_file(&dir, "a.txt", "hello");
        assert!(tracker.is_dirty().unwrap());
    }

    #[test]
    fn commit_all_stages_and_commits() {
        let (dir, tracker) = setup_repo();
        write_file(&dir, "a.txt", "one");
        let sha = tracker.commit_all("first").unwrap();
        assert_eq!(sha.len(), 40);
        assert!(!tracker.is_dirty().unwrap());
        assert_eq!(tracker.head_sha().unwrap(), sha);

        write_file(&dir, "a.txt", "two");
        let sha2 = tracker.commit_all("second").unwrap();
        assert_ne!(sha, sha2);
    }

    #[test]
    fn branch_created_from_head() {
        let (dir, tracker) = setup_repo();
        write_file(&dir, "a.txt", "x");
        tracker.commit_all("init").unwrap();
        tracker.create_branch("feature/test").unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        assert_eq!(
            repo.head().unwrap().shorthand().unwrap(),
            "feature/test"
        );
    }

    #[test]
    fn diff_covers_last_commit_only() {
        let (dir, tracker) = setup_repo();
        write_file(&dir, "a.txt", "line1\n");
        tracker.commit_all("first").unwrap();
        write_file(&dir, "a.txt", "line1\nline2\n");
        tracker.commit_all("second").unwrap();

        let diff = tracker.diff_last_commit().unwrap();
        assert!(diff.contains("+line2"));
        assert!(!diff.contains("+line1\n+line2"));
    }

    #[test]
    fn diff_of_root_commit_is_whole_tree() {
        let (dir, tracker) = setup_repo();
        write_file(&dir, "a.txt", "content\n");
        tracker.commit_all("init").unwrap();
        let diff = tracker.diff_last_commit().unwrap();
        assert!(diff.contains("+content"));
    }

    #[test]
    fn recent_commits_newest_first() {
        let (dir, tracker) = setup_repo();
        write_file(&dir, "a.txt", "1");
        tracker.commit_all("first").unwrap();
        write_file(&dir, "a.txt", "2");
        tracker.commit_all("second").unwrap();

        let commits = tracker.recent_commits(10).unwrap();
        assert_eq!(commits.len(), 2);
        assert!(commits[0].ends_with("second"));
        assert!(commits[1].ends_with("first"));

        assert_eq!(tracker.recent_commits(1).unwrap().len(), 1);
    }

    #[test]
    fn gitignore_appended_once() {
        let (dir, tracker) = setup_repo();
        tracker.ensure_gitignore().unwrap();
        let contents = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(contents.contains("node_modules/"));

        tracker.ensure_gitignore().unwrap();
        let again = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(contents, again);
    }
}
