//! Repository exploration and plan generation: build a bounded digest of
//! the cloned repo, then ask the coding agent for a story-based PRD.

use crate::agent::{AgentEvent, AgentRequest, CodingAgent};
use crate::errors::WorkflowError;
use crate::prd::Prd;
use crate::status::RunStreams;
use crate::stream::ChatEventMapper;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const MAX_LISTED_FILES: usize = 50;
const MAX_README_LINES: usize = 50;
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", "dist", ".next"];

/// Build a compact text digest of the repository: a bounded two-level file
/// listing, the package manifest summary, and the README head. This goes
/// into the planning prompt instead of letting the agent wander the tree.
pub fn explore(dir: &Path) -> String {
    let mut digest = String::from("## Repository layout\n");
    let mut listed = 0usize;
    list_level(dir, dir, 0, &mut digest, &mut listed);
    if listed >= MAX_LISTED_FILES {
        digest.push_str("... (truncated)\n");
    }

    if let Ok(contents) = std::fs::read_to_string(dir.join("package.json")) {
        if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&contents) {
            digest.push_str("\n## package.json\n");
            if let Some(name) = pkg.get("name").and_then(|v| v.as_str()) {
                digest.push_str(&format!("name: {name}\n"));
            }
            for section in ["scripts", "dependencies", "devDependencies"] {
                if let Some(map) = pkg.get(section).and_then(|v| v.as_object()) {
                    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                    digest.push_str(&format!("{section}: {}\n", keys.join(", ")));
                }
            }
        }
    }

    for readme in ["README.md", "README.txt", "README"] {
        if let Ok(contents) = std::fs::read_to_string(dir.join(readme)) {
            digest.push_str("\n## README (head)\n");
            for line in contents.lines().take(MAX_README_LINES) {
                digest.push_str(line);
                digest.push('\n');
            }
            break;
        }
    }

    if let Ok(contents) = std::fs::read_to_string(dir.join(".env.example")) {
        digest.push_str("\n## .env.example\n");
        digest.push_str(&contents);
        digest.push('\n');
    }

    digest
}

fn list_level(root: &Path, dir: &Path, depth: usize, out: &mut String, listed: &mut usize) {
    if depth > 1 || *listed >= MAX_LISTED_FILES {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if *listed >= MAX_LISTED_FILES {
            return;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        let is_dir = path.is_dir();
        if is_dir && SKIP_DIRS.contains(&name.as_str()) {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(&path).display();
        out.push_str(&format!("{rel}{}\n", if is_dir { "/" } else { "" }));
        *listed += 1;
        if is_dir {
            list_level(root, &path, depth + 1, out, listed);
        }
    }
}

pub struct PlanGenerator {
    agent: Arc<dyn CodingAgent>,
}

impl PlanGenerator {
    pub fn new(agent: Arc<dyn CodingAgent>) -> Self {
        Self { agent }
    }

    fn build_prompt(task: &str, digest: &str) -> String {
        format!(
            r#"You are planning a coding task against an existing repository.

Task from the user:
{task}

Repository overview:
{digest}

Break the task into 3-7 small user stories, each independently completable
in one to three agent iterations. Order them so that each story only
depends on earlier ones. Acceptance criteria must be concrete and
mechanically checkable.

Respond with ONLY a JSON object matching this schema, no prose:
{{
  "name": "short project name",
  "description": "one-paragraph summary of the overall task",
  "stories": [
    {{
      "id": "US-001",
      "title": "imperative story title",
      "acceptance": ["criterion 1", "criterion 2"],
      "dependencies": [],
      "passes": false
    }}
  ]
}}

Ids must be sequential: US-001, US-002, and so on."#
        )
    }

    /// Ask the agent for a plan. Chat output streams to the run's chat
    /// stream while we wait. Unparseable output is fatal; there is no
    /// fallback plan.
    pub async fn generate(
        &self,
        workspace: &Path,
        task: &str,
        digest: &str,
        streams: &RunStreams,
        cancel: watch::Receiver<bool>,
    ) -> Result<Prd, WorkflowError> {
        let request = AgentRequest {
            prompt: Self::build_prompt(task, digest),
            working_dir: workspace.to_path_buf(),
            max_turns: 5,
            allowed_tools: vec!["WebSearch".to_string()],
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
        let forwarder = {
            let streams = streams.clone();
            tokio::spawn(async move {
                let mut mapper = ChatEventMapper::new();
                while let Some(event) = rx.recv().await {
                    if let Some(chat) = mapper.map(&event) {
                        streams.send_chat(&chat);
                    }
                }
            })
        };

        let outcome = self
            .agent
            .run(request, cancel, tx)
            .await
            .map_err(|err| WorkflowError::PlanGeneration(err.to_string()))?;
        let _ = forwarder.await;

        if outcome.is_error {
            return Err(WorkflowError::PlanGeneration(
                outcome
                    .result
                    .unwrap_or_else(|| "agent reported an error".to_string()),
            ));
        }
        let raw = outcome
            .result
            .ok_or_else(|| WorkflowError::PlanGeneration("agent produced no output".to_string()))?;
        Prd::parse(&raw).map_err(|err| WorkflowError::PlanGeneration(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explore_lists_two_levels_and_skips_noise() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.ts"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("index.ts"), "").unwrap();

        let digest = explore(dir.path());
        assert!(digest.contains("src/"));
        assert!(digest.contains("src/main.ts"));
        assert!(digest.contains("index.ts"));
        assert!(!digest.contains("node_modules"));
    }

    #[test]
    fn explore_summarizes_package_json_and_readme() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"demo","scripts":{"build":"tsc"},"dependencies":{"react":"^18"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "# Demo\nA demo app.\n").unwrap();

        let digest = explore(dir.path());
        assert!(digest.contains("name: demo"));
        assert!(digest.contains("scripts: build"));
        assert!(digest.contains("dependencies: react"));
        assert!(digest.contains("# Demo"));
    }

    #[test]
    fn explore_caps_file_listing() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..80 {
            std::fs::write(dir.path().join(format!("file{i:03}.txt")), "").unwrap();
        }
        let digest = explore(dir.path());
        assert!(digest.contains("(truncated)"));
        let count = digest.lines().filter(|l| l.ends_with(".txt")).count();
        assert!(count <= MAX_LISTED_FILES);
    }

    #[test]
    fn prompt_carries_task_and_schema() {
        let prompt = PlanGenerator::build_prompt("add dark mode", "## layout");
        assert!(prompt.contains("add dark mode"));
        assert!(prompt.contains("US-001"));
        assert!(prompt.contains("\"stories\""));
    }
}
