//! Steward Core - the agent orchestration runtime
//!
//! This crate drives a conversational loop between a user, a language model,
//! and a set of executable tools, while enforcing permission policy,
//! persisting conversation state, and running user-defined hooks at
//! lifecycle events:
//!
//! - Session state and append-only persistence ([`session`])
//! - The tool-calling loop driver ([`agent`])
//! - The permission policy engine, including bash command decomposition
//!   ([`permission`])
//! - Lifecycle hooks run as child processes ([`hooks`])
//! - Subagent delegation with context isolation ([`subagent`])
//! - The background process registry ([`process`])
//!
//! The terminal UI, CLI parsing, trivial file tools, and the model-gateway
//! HTTP client are external collaborators; the model service in particular
//! is only the [`model::ModelService`] trait here.

pub mod agent;
pub mod config;
pub mod error;
pub mod hooks;
pub mod model;
pub mod permission;
pub mod process;
pub mod session;
pub mod subagent;
pub mod tools;

pub use agent::driver::{LoopDriver, LoopFlags, RunEnd};
pub use agent::events::LoopEvent;
pub use agent::{AbortHandle, Agent, AgentHandles};
pub use config::{AgentConfig, AgentConfigBuilder};
pub use error::{Error, Result, ToolError};
pub use hooks::{HookConfig, HookEvent};
pub use model::{CallOptions, ModelMessage, ModelService, StreamPart, ToolCallRequest, Usage};
pub use permission::{
    PermissionEngine, PermissionMode, PermissionOutcome, PermissionPrompt, PermissionReply,
};
pub use process::{BackgroundProcessRegistry, TaskKind, TaskSnapshot, TaskStatus};
pub use session::{
    Attachment, Block, Message, MessageRole, MessageState, RestorePolicy, SessionStore,
    SessionType, ToolStage,
};
pub use subagent::delegate::{DelegationChain, SubagentDelegator};
pub use subagent::{SubagentDefinition, SubagentRegistry};
pub use tools::{Tool, ToolContext, ToolRegistry, ToolResult};
