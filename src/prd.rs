//! The plan data model: a PRD (product requirements document) holding an
//! ordered list of small, independently completable stories.
//!
//! A PRD is generated once by the planner, may be replaced wholesale by the
//! reviewer at the plan gate, and is immutable afterwards. Per-run progress
//! is tracked outside the plan by the orchestrator.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prd {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub stories: Vec<Story>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub passes: bool,
}

/// Derived per-run story status. A story makes exactly one terminal
/// transition per run; failed stories are skipped, never retried in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// Cumulative token usage for one run, accumulated across agent calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }
}

/// Extract the outermost JSON object from model output, stripping one layer
/// of markdown fences if present. Models wrap JSON in ```json fences or
/// prepend prose often enough that this is table stakes.
pub fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s))
        .unwrap_or(trimmed);
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&unfenced[start..=end])
}

impl Prd {
    /// Parse model output into a validated PRD. Strips fences once and
    /// retries; there is no fallback plan — still-invalid output is an error.
    pub fn parse(raw: &str) -> Result<Self> {
        let json = extract_json(raw).context("No JSON object found in model output")?;
        let mut prd: Prd =
            serde_json::from_str(json).context("Model output did not match the PRD schema")?;
        prd.normalize();
        prd.validate()?;
        Ok(prd)
    }

    /// Force every story back to unpassed, regardless of what the model
    /// claimed. Completion is tracked by the orchestrator, not the plan.
    pub fn normalize(&mut self) {
        for story in &mut self.stories {
            story.passes = false;
        }
    }

    /// Structural checks: at least one story, unique sequential `US-NNN` ids,
    /// dependencies referring only to earlier stories.
    pub fn validate(&self) -> Result<()> {
        if self.stories.is_empty() {
            bail!("PRD contains no stories");
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for (idx, story) in self.stories.iter().enumerate() {
            if !is_story_id(&story.id) {
                bail!("Story id '{}' does not match US-NNN", story.id);
            }
            if !seen.insert(story.id.as_str()) {
                bail!("Duplicate story id '{}'", story.id);
            }
            let expected = format!("US-{:03}", idx + 1);
            if story.id != expected {
                bail!(
                    "Story ids must be sequential: expected '{}', found '{}'",
                    expected,
                    story.id
                );
            }
            for dep in &story.dependencies {
                if !self.stories[..idx].iter().any(|s| &s.id == dep) {
                    bail!(
                        "Story '{}' depends on '{}', which does not precede it",
                        story.id,
                        dep
                    );
                }
            }
        }
        Ok(())
    }

    /// Stories still to run, in plan order. Stories already marked passing at
    /// approval time are skipped, not retried.
    pub fn pending_stories(&self) -> Vec<&Story> {
        self.stories.iter().filter(|s| !s.passes).collect()
    }
}

fn is_story_id(id: &str) -> bool {
    match id.strip_prefix("US-") {
        Some(digits) => digits.len() == 3 && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prd_json(stories: &str) -> String {
        format!(
            r#"{{"name":"demo","description":"a task","stories":[{}]}}"#,
            stories
        )
    }

    fn story_json(id: &str, passes: bool) -> String {
        format!(
            r#"{{"id":"{}","title":"do {}","acceptance":["it works"],"dependencies":[],"passes":{}}}"#,
            id, id, passes
        )
    }

    #[test]
    fn parse_plain_json() {
        let raw = prd_json(&story_json("US-001", false));
        let prd = Prd::parse(&raw).unwrap();
        assert_eq!(prd.name, "demo");
        assert_eq!(prd.stories.len(), 1);
    }

    #[test]
    fn parse_strips_markdown_fences() {
        let raw = format!("```json\n{}\n```", prd_json(&story_json("US-001", false)));
        let prd = Prd::parse(&raw).unwrap();
        assert_eq!(prd.stories[0].id, "US-001");
    }

    #[test]
    fn parse_extracts_object_from_surrounding_prose() {
        let raw = format!(
            "Here is the plan:\n{}\nLet me know!",
            prd_json(&story_json("US-001", false))
        );
        assert!(Prd::parse(&raw).is_ok());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Prd::parse("not json at all").is_err());
        assert!(Prd::parse("{\"name\": \"x\"").is_err());
    }

    #[test]
    fn parse_normalizes_passes_to_false() {
        let raw = prd_json(&format!(
            "{},{}",
            story_json("US-001", true),
            story_json("US-002", true)
        ));
        let prd = Prd::parse(&raw).unwrap();
        assert!(prd.stories.iter().all(|s| !s.passes));
    }

    #[test]
    fn validate_rejects_empty_plan() {
        let prd = Prd {
            name: "x".into(),
            description: String::new(),
            stories: vec![],
        };
        assert!(prd.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_id_pattern() {
        let raw = prd_json(&story_json("STORY-1", false));
        assert!(Prd::parse(&raw).is_err());
    }

    #[test]
    fn validate_rejects_non_sequential_ids() {
        let raw = prd_json(&format!(
            "{},{}",
            story_json("US-001", false),
            story_json("US-003", false)
        ));
        assert!(Prd::parse(&raw).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let raw = prd_json(&format!(
            "{},{}",
            story_json("US-001", false),
            story_json("US-001", false)
        ));
        assert!(Prd::parse(&raw).is_err());
    }

    #[test]
    fn validate_rejects_forward_dependency() {
        let raw = prd_json(
            r#"{"id":"US-001","title":"a","acceptance":[],"dependencies":["US-002"]},
               {"id":"US-002","title":"b","acceptance":[],"dependencies":[]}"#,
        );
        assert!(Prd::parse(&raw).is_err());
    }

    #[test]
    fn validate_accepts_backward_dependency() {
        let raw = prd_json(
            r#"{"id":"US-001","title":"a","acceptance":[],"dependencies":[]},
               {"id":"US-002","title":"b","acceptance":[],"dependencies":["US-001"]}"#,
        );
        assert!(Prd::parse(&raw).is_ok());
    }

    #[test]
    fn pending_stories_skips_passing() {
        let mut prd = Prd::parse(&prd_json(&format!(
            "{},{}",
            story_json("US-001", false),
            story_json("US-002", false)
        )))
        .unwrap();
        prd.stories[0].passes = true;
        let pending = prd.pending_stories();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "US-002");
    }

    #[test]
    fn token_usage_accumulates() {
        let mut usage = TokenUsage::default();
        usage.add(TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            cache_read_tokens: 5,
            cache_creation_tokens: 1,
        });
        usage.add(TokenUsage {
            input_tokens: 1,
            ..Default::default()
        });
        assert_eq!(usage.input_tokens, 11);
        assert_eq!(usage.output_tokens, 20);
    }

    #[test]
    fn extract_json_handles_unfenced_and_nested_braces() {
        let raw = r#"text {"a": {"b": 1}} trailing"#;
        assert_eq!(extract_json(raw), Some(r#"{"a": {"b": 1}}"#));
        assert_eq!(extract_json("no braces"), None);
    }
}
