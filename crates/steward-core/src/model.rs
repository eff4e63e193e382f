//! Model service contract
//!
//! The model gateway is an external collaborator: the core only depends on
//! this trait and the wire shapes below. A provider implementation serializes
//! the conversation, performs the HTTP call, and feeds [`StreamPart`]s into
//! the returned channel as they arrive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// Role of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One content part of a wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePart {
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
        output: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Image {
        media_type: String,
        data: String,
    },
}

/// One message in the wire conversation sent to the model service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: Vec<WirePart>,
}

impl ModelMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![WirePart::Text { text: text.into() }],
        }
    }
}

/// A tool call requested by the model, with fully accumulated arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Token usage reported by the model service for one turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl Usage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// Incremental events from a streaming model response.
#[derive(Debug, Clone)]
pub enum StreamPart {
    /// Text content delta.
    TextDelta { delta: String },
    /// The model started streaming a tool call (arguments incomplete).
    ToolCallStart { id: String, name: String },
    /// Partial JSON of a tool call's arguments.
    ToolCallDelta { id: String, delta: String },
    /// A tool call's arguments are complete.
    ToolCallComplete { call: ToolCallRequest },
    /// Usage record for the turn.
    Usage { usage: Usage },
    /// Terminal stream error.
    Error { error: String },
}

/// Per-call options forwarded to the model service.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub model: String,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDescriptor>,
}

/// Tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The opaque request/stream service the loop driver talks to.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Start a streaming completion. Parts arrive on the returned channel;
    /// the channel closing signals end of stream.
    async fn call_streaming(
        &self,
        conversation: Vec<ModelMessage>,
        options: &CallOptions,
    ) -> Result<mpsc::UnboundedReceiver<StreamPart>>;

    /// One-shot, non-streaming completion. Used by the compaction pass.
    async fn call_text(&self, conversation: Vec<ModelMessage>, options: &CallOptions)
        -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_part_round_trips() {
        let part = WirePart::ToolUse {
            id: "t1".to_string(),
            name: "Bash".to_string(),
            input: serde_json::json!({"command": "ls"}),
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"type\":\"tool_use\""));
        let back: WirePart = serde_json::from_str(&json).unwrap();
        match back {
            WirePart::ToolUse { name, .. } => assert_eq!(name, "Bash"),
            _ => panic!("expected ToolUse"),
        }
    }

    #[test]
    fn usage_total() {
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
        };
        assert_eq!(usage.total(), 15);
    }
}
