//! Checkpoint entity
//!
//! A checkpoint is a durable snapshot of a task's conversation and stage
//! state. Multiple checkpoints per task are ordered by sequence; the
//! latest is the resume source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::{PauseReason, SessionData, TaskUsage};

/// Conversation participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One typed block within a conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Text payload, if this is a text block
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One message of the serialized conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ConversationMessage {
    /// Convenience constructor for a single text block
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text of all text blocks in this message
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Structured checkpoint metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    pub pause_reason: Option<PauseReason>,
    pub session_data: Option<SessionData>,
    pub usage: Option<TaskUsage>,
    /// Additive fields carried verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Durable snapshot of a task at a stage boundary or pause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Deterministic id: `{taskId}-{createdAt ms}`
    pub id: String,
    pub task_id: String,
    /// Monotonic per-task sequence number
    pub sequence: u32,
    /// Stage name at snapshot time
    pub stage: String,
    /// Stage index at snapshot time
    pub stage_index: u32,
    /// Ordered conversation history
    pub conversation: Vec<ConversationMessage>,
    /// Opaque executor state
    pub stage_state: Option<Value>,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build a checkpoint for a task; the id is derived from the task id
    /// and the creation timestamp in epoch milliseconds.
    pub fn new(
        task_id: impl Into<String>,
        sequence: u32,
        stage: impl Into<String>,
        stage_index: u32,
        conversation: Vec<ConversationMessage>,
    ) -> Self {
        let task_id = task_id.into();
        let created_at = Utc::now();
        Self {
            id: format!("{}-{}", task_id, created_at.timestamp_millis()),
            task_id,
            sequence,
            stage: stage.into(),
            stage_index,
            conversation,
            stage_state: None,
            metadata: CheckpointMetadata::default(),
            created_at,
        }
    }

    /// Builder: attach opaque stage state
    pub fn with_stage_state(mut self, state: Value) -> Self {
        self.stage_state = Some(state);
        self
    }

    /// Builder: attach metadata
    pub fn with_metadata(mut self, metadata: CheckpointMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
