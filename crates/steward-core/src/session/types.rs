//! Session data model
//!
//! A session is an ordered sequence of messages; a message is an ordered
//! sequence of typed blocks. Messages are append-only once superseded by a
//! later message — only the most recent assistant message mutates in place
//! while a turn streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Usage;

/// Whether a session belongs to the top-level agent or a delegated subagent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    #[default]
    Main,
    Subagent,
}

/// Metadata record written as the first line of a session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub is_meta: bool,
    pub session_id: String,
    pub session_type: SessionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub workdir: String,
    pub started_at: DateTime<Utc>,
}

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Subagent,
}

/// Lifecycle stage of a tool block.
///
/// Strictly monotonic: `Start → Streaming → Running → End`. A stage is never
/// revisited; [`Block::advance_stage`] ignores backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStage {
    Start,
    Streaming,
    Running,
    End,
}

/// Terminal state carried by a tool block once its stage reaches `End`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One typed unit of message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    Error {
        message: String,
    },
    Tool {
        id: String,
        name: String,
        input: Value,
        stage: ToolStage,
        #[serde(skip_serializing_if = "Option::is_none")]
        outcome: Option<ToolOutcome>,
    },
    Image {
        media_type: String,
        data: String,
    },
    Diff {
        path: String,
        diff: String,
    },
    CommandOutput {
        command: String,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// Summary block replacing compacted history.
    Compress {
        summary: String,
        elided_messages: usize,
    },
    /// Durable note surfaced into future context.
    Memory {
        content: String,
    },
    /// Reference to a delegated subagent's own session.
    Subagent {
        instance_id: String,
        session_id: String,
        name: String,
    },
}

impl Block {
    pub fn text(text: impl Into<String>) -> Self {
        Block::Text { text: text.into() }
    }

    pub fn tool_start(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Block::Tool {
            id: id.into(),
            name: name.into(),
            input,
            stage: ToolStage::Start,
            outcome: None,
        }
    }

    /// Advance a tool block's stage. Backward or repeated transitions are
    /// ignored (and logged): once `End`, a block never reverts.
    pub fn advance_stage(&mut self, next: ToolStage) -> bool {
        let Block::Tool { stage, id, .. } = self else {
            return false;
        };
        if next <= *stage {
            tracing::warn!(
                block_id = %id,
                current = ?stage,
                requested = ?next,
                "Ignoring non-monotonic tool stage transition"
            );
            return false;
        }
        *stage = next;
        true
    }

    /// Move a tool block to its terminal stage with an outcome.
    pub fn finish_tool(&mut self, result: ToolOutcome) -> bool {
        let advanced = self.advance_stage(ToolStage::End);
        if advanced
            && let Block::Tool { outcome, .. } = self
        {
            *outcome = Some(result);
        }
        advanced
    }

    pub fn tool_id(&self) -> Option<&str> {
        match self {
            Block::Tool { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub blocks: Vec<Block>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Message {
    pub fn user(blocks: Vec<Block>) -> Self {
        Self {
            role: MessageRole::User,
            blocks,
            usage: None,
        }
    }

    pub fn assistant() -> Self {
        Self {
            role: MessageRole::Assistant,
            blocks: Vec::new(),
            usage: None,
        }
    }
}

/// One line of a session file after the meta record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_stage_is_monotonic() {
        let mut block = Block::tool_start("t1", "Write", json!({}));

        assert!(block.advance_stage(ToolStage::Streaming));
        assert!(block.advance_stage(ToolStage::Running));
        assert!(block.finish_tool(ToolOutcome {
            success: true,
            result: "ok".to_string(),
            error: None,
        }));

        // Once End, nothing moves it back.
        assert!(!block.advance_stage(ToolStage::Running));
        assert!(!block.advance_stage(ToolStage::Streaming));
        match block {
            Block::Tool { stage, outcome, .. } => {
                assert_eq!(stage, ToolStage::End);
                assert!(outcome.unwrap().success);
            }
            _ => panic!("expected tool block"),
        }
    }

    #[test]
    fn tool_stage_skips_forward() {
        // Start → Running is legal (a call with no streaming arguments).
        let mut block = Block::tool_start("t1", "Bash", json!({"command": "ls"}));
        assert!(block.advance_stage(ToolStage::Running));
    }

    #[test]
    fn repeated_stage_is_rejected() {
        let mut block = Block::tool_start("t1", "Bash", json!({}));
        assert!(block.advance_stage(ToolStage::Streaming));
        assert!(!block.advance_stage(ToolStage::Streaming));
    }

    #[test]
    fn block_serde_tags() {
        let block = Block::Compress {
            summary: "earlier work".to_string(),
            elided_messages: 12,
        };
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains("\"type\":\"compress\""));

        let record = MessageRecord {
            timestamp: Utc::now(),
            message: Message::user(vec![Block::text("hi")]),
        };
        let line = serde_json::to_string(&record).unwrap();
        let back: MessageRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.message.blocks.len(), 1);
    }
}
