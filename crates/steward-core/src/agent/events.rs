//! Loop event protocol
//!
//! `LoopEvent` is everything the loop driver emits about its progress.
//! Consumers (a TUI, a server) map these to their own presentation; the
//! permission rendezvous travels on its own channel
//! ([`crate::permission::PermissionPrompt`]).

use serde::Serialize;
use serde_json::Value;

/// Events emitted by the tool-calling loop driver.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// Text content delta from the model.
    TextDelta { delta: String },

    /// The model started streaming a tool call.
    ToolCallStart { id: String, name: String },

    /// A tool call's arguments arrived completely.
    ToolCallComplete {
        id: String,
        name: String,
        arguments: Value,
    },

    /// A tool call was denied (policy or hook) before execution.
    ToolDenied { id: String, reason: String },

    /// A tool is executing.
    ToolExecuting { id: String, name: String },

    /// A tool finished; the terminal block carries the full result.
    ToolResult {
        id: String,
        success: bool,
        short_result: Option<String>,
    },

    /// A compaction pass started.
    Compacting,

    /// A compaction pass finished.
    CompactionDone { elided_messages: usize },

    /// A hook surfaced a message for the user.
    SystemMessage { message: String },

    /// One agentic turn completed.
    TurnComplete { turn: usize, has_more: bool },

    /// The loop finished for this dispatch.
    Finished { session_id: String },

    /// The loop was aborted by cancellation.
    Aborted { session_id: String },

    /// A non-fatal error surfaced into the conversation.
    Error { error: String },
}
