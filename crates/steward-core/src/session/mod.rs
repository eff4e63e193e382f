//! Session state and persistence
//!
//! - [`types`] - messages, blocks, and the tool stage machine
//! - [`store`] - append-only JSONL session files
//! - [`state`] - the in-memory conversation over one store

pub mod state;
pub mod store;
pub mod types;

pub use state::{Attachment, MessageState, RestorePolicy};
pub use store::{SessionStore, SessionSummary, generate_session_id};
pub use types::{
    Block, Message, MessageRecord, MessageRole, SessionMeta, SessionType, ToolOutcome, ToolStage,
};
