//! The status stream: coarse run lifecycle events, one JSON line each.
//! Consumers drive UI state and waitpoint resolution off this stream.

use crate::prd::{Prd, TokenUsage};
use crate::stream::ChatEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySnapshot {
    pub id: String,
    pub current: usize,
    pub total: usize,
    pub title: String,
    pub acceptance: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitpointInfo {
    pub token_id: String,
    pub credential: String,
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Cloning {
        repo_url: String,
    },
    Cloned,
    Installing,
    Exploring,
    PrdGenerated {
        prd: Prd,
    },
    PrdReview {
        prd: Prd,
        waitpoint: WaitpointInfo,
    },
    StoryStart {
        story: StorySnapshot,
    },
    StoryComplete {
        story_id: String,
        commit: Option<String>,
    },
    StoryFailed {
        story_id: String,
        error: String,
    },
    Waitpoint {
        waitpoint: WaitpointInfo,
        story_id: String,
    },
    Diff {
        diff: String,
        commits: Vec<String>,
    },
    Pushing {
        branch: String,
    },
    Pushed {
        branch_url: String,
        pr_url: Option<String>,
    },
    PushFailed {
        error: String,
    },
    Complete {
        stories_completed: usize,
        stories_failed: usize,
        usage: TokenUsage,
    },
    Error {
        message: String,
    },
}

/// The two broadcast streams of a run. Lines are pre-serialized JSON so the
/// server can forward them without re-encoding. Sending with no receivers is
/// not an error: streams exist whether or not anyone is watching.
#[derive(Debug, Clone)]
pub struct RunStreams {
    pub status: broadcast::Sender<String>,
    pub chat: broadcast::Sender<String>,
}

impl RunStreams {
    pub fn new(capacity: usize) -> Self {
        Self {
            status: broadcast::channel(capacity).0,
            chat: broadcast::channel(capacity).0,
        }
    }

    pub fn send_status(&self, event: &StatusEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = self.status.send(line);
        }
    }

    pub fn send_chat(&self, event: &ChatEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = self.chat.send(line);
        }
    }
}

impl Default for RunStreams {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_events_use_snake_case_tags() {
        let event = StatusEvent::StoryFailed {
            story_id: "US-002".into(),
            error: "build failed".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "story_failed");
        assert_eq!(value["story_id"], "US-002");

        let event = StatusEvent::PushFailed {
            error: "no credentials".into(),
        };
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "push_failed");
    }

    #[test]
    fn send_without_receivers_is_silent() {
        let streams = RunStreams::new(8);
        streams.send_status(&StatusEvent::Cloned);
        streams.send_chat(&ChatEvent::Text { delta: "x".into() });
    }

    #[test]
    fn receivers_observe_serialized_lines() {
        let streams = RunStreams::new(8);
        let mut rx = streams.status.subscribe();
        streams.send_status(&StatusEvent::Exploring);
        let line = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "exploring");
    }
}
