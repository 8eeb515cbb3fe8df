//! The chat event wire contract and the mapping from raw agent events onto
//! it, plus incremental reassembly of streamed tool inputs.

use crate::agent::{AgentEvent, BlockDelta, ContentBlockStart, StreamPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Events on the chat stream, one JSON object per line. `type` is the
/// discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Thinking {
        delta: String,
    },
    Text {
        delta: String,
    },
    ToolStart {
        id: String,
        name: String,
    },
    ToolInput {
        id: String,
        delta: String,
    },
    ToolEnd {
        id: String,
    },
    StorySeparator {
        story_num: usize,
        total_stories: usize,
        title: String,
    },
    Approval {
        id: String,
        token_id: String,
        credential: String,
        question: String,
        variant: String,
        created_at: DateTime<Utc>,
        timeout_ms: u64,
    },
    ApprovalResponse {
        id: String,
        action: String,
    },
}

/// Maps raw agent stream payloads to chat events. Tracks the currently open
/// tool block so input deltas and block stops can be attributed to it.
#[derive(Debug, Default)]
pub struct ChatEventMapper {
    current_tool: Option<String>,
}

impl ChatEventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one raw event. Non-streaming events and unknown payloads
    /// map to nothing.
    pub fn map(&mut self, event: &AgentEvent) -> Option<ChatEvent> {
        let AgentEvent::StreamEvent { event } = event else {
            return None;
        };
        match event {
            StreamPayload::ContentBlockStart {
                content_block: ContentBlockStart::ToolUse { id, name },
            } => {
                self.current_tool = Some(id.clone());
                Some(ChatEvent::ToolStart {
                    id: id.clone(),
                    name: name.clone(),
                })
            }
            StreamPayload::ContentBlockStart { .. } => {
                self.current_tool = None;
                None
            }
            StreamPayload::ContentBlockDelta { delta } => match delta {
                BlockDelta::TextDelta { text } => Some(ChatEvent::Text {
                    delta: text.clone(),
                }),
                BlockDelta::ThinkingDelta { thinking } => Some(ChatEvent::Thinking {
                    delta: thinking.clone(),
                }),
                BlockDelta::InputJsonDelta { partial_json } => {
                    let id = self.current_tool.clone()?;
                    Some(ChatEvent::ToolInput {
                        id,
                        delta: partial_json.clone(),
                    })
                }
                BlockDelta::Other => None,
            },
            StreamPayload::ContentBlockStop => {
                let id = self.current_tool.take()?;
                Some(ChatEvent::ToolEnd { id })
            }
            StreamPayload::Other => None,
        }
    }
}

/// A fully reassembled tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Consumer-side reassembly of tool calls from chat events: concatenate
/// `tool_input` deltas per id and emit the complete call on `tool_end`.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    open: HashMap<String, (String, String)>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chat event; returns a completed tool call when a matching
    /// `tool_end` arrives. A `tool_end` with no open call is dropped.
    pub fn apply(&mut self, event: &ChatEvent) -> Option<ToolCall> {
        match event {
            ChatEvent::ToolStart { id, name } => {
                self.open.insert(id.clone(), (name.clone(), String::new()));
                None
            }
            ChatEvent::ToolInput { id, delta } => {
                if let Some((_, buf)) = self.open.get_mut(id) {
                    buf.push_str(delta);
                }
                None
            }
            ChatEvent::ToolEnd { id } => {
                let (name, buf) = self.open.remove(id)?;
                let input = if buf.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&buf).unwrap_or(Value::String(buf))
                };
                Some(ToolCall {
                    id: id.clone(),
                    name,
                    input,
                })
            }
            _ => None,
        }
    }
}
