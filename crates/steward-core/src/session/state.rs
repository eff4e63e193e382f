//! Message state - the in-memory conversation machine
//!
//! Owns the ordered message list for one session and the session file under
//! it. Finalized messages are appended to disk as they are committed; the
//! most recent assistant message mutates in place while a turn streams and is
//! appended only when the turn completes.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use super::store::{self, SessionStore, generate_session_id};
use super::types::{
    Block, Message, MessageRole, SessionMeta, SessionType, ToolOutcome, ToolStage,
};
use crate::error::Result;
use crate::model::{ModelMessage, Role, Usage, WirePart};

/// How to obtain a session on construction.
#[derive(Debug, Clone)]
pub enum RestorePolicy {
    /// Load this exact session id.
    Resume(String),
    /// Load the most recently modified session for the workdir.
    ContinueLast,
    /// Start a fresh session with a generated id.
    New,
}

/// An image or file attachment on a user message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub media_type: String,
    pub data: String,
}

/// In-memory conversation plus its exclusive backing store.
pub struct MessageState {
    store: SessionStore,
    meta: SessionMeta,
    messages: Vec<Message>,
    /// Messages already appended to the session file.
    persisted: usize,
}

impl MessageState {
    /// Open a session per the restore policy. Restoration failures are
    /// non-fatal: a corrupt or missing file logs a warning and falls back to
    /// a fresh empty session.
    pub fn open(
        sessions_dir: &Path,
        workdir: &Path,
        session_type: SessionType,
        parent_session_id: Option<String>,
        policy: RestorePolicy,
    ) -> Result<Self> {
        let resolved_id = match &policy {
            RestorePolicy::Resume(id) => Some(id.clone()),
            RestorePolicy::ContinueLast => {
                SessionStore::latest_for_workdir(sessions_dir, workdir).map(|s| s.session_id)
            }
            RestorePolicy::New => None,
        };

        if let Some(id) = resolved_id {
            let store = SessionStore::new(sessions_dir, &id);
            match store.load() {
                Ok((meta, messages)) => {
                    let meta = meta.unwrap_or_else(|| {
                        store::new_meta(&id, session_type, parent_session_id.clone(), workdir)
                    });
                    info!(session_id = %id, messages = messages.len(), "Restored session");
                    let persisted = messages.len();
                    return Ok(Self {
                        store,
                        meta,
                        messages,
                        persisted,
                    });
                }
                Err(e) => {
                    warn!(session_id = %id, "Session restore failed, starting fresh: {e}");
                }
            }
        }

        let id = generate_session_id();
        let meta = store::new_meta(&id, session_type, parent_session_id, workdir);
        let store = SessionStore::new(sessions_dir, &id);
        store.write_meta(&meta)?;
        Ok(Self {
            store,
            meta,
            messages: Vec::new(),
            persisted: 0,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.meta.session_id
    }

    pub fn session_type(&self) -> SessionType {
        self.meta.session_type
    }

    pub fn workdir(&self) -> PathBuf {
        PathBuf::from(&self.meta.workdir)
    }

    /// Path of the transcript file (handed to hooks).
    pub fn transcript_path(&self) -> PathBuf {
        self.store.path().to_path_buf()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    // ── Mutation ───────────────────────────────────────────────────────

    /// Append a user message; persisted immediately.
    pub fn add_user_message(&mut self, content: &str, attachments: Vec<Attachment>) -> Result<()> {
        let mut blocks = vec![Block::text(content)];
        for attachment in attachments {
            blocks.push(Block::Image {
                media_type: attachment.media_type,
                data: attachment.data,
            });
        }
        self.commit(Message::user(blocks))
    }

    /// Append a memory block as its own user message; persisted immediately.
    pub fn add_memory_block(&mut self, content: &str) -> Result<()> {
        self.commit(Message::user(vec![Block::Memory {
            content: content.to_string(),
        }]))
    }

    /// Append an already-complete message; persisted immediately.
    pub fn commit(&mut self, message: Message) -> Result<()> {
        self.store.append_message(&message)?;
        self.messages.push(message);
        self.persisted = self.messages.len();
        Ok(())
    }

    /// Start a new (empty, unpersisted) assistant message for a streaming
    /// turn.
    pub fn begin_assistant(&mut self) {
        self.messages.push(Message::assistant());
    }

    /// Append a block to — or update a tool block of — the in-flight
    /// assistant message. Only the most recent assistant message mutates;
    /// anything earlier is immutable.
    pub fn append_or_update_assistant_block(&mut self, block: Block) {
        let Some(last) = self.messages.last_mut() else {
            warn!("append_or_update_assistant_block with no messages");
            return;
        };
        if last.role != MessageRole::Assistant {
            warn!("append_or_update_assistant_block on a non-assistant tail");
            return;
        }

        if let Some(id) = block.tool_id()
            && let Some(existing) = last
                .blocks
                .iter_mut()
                .find(|b| b.tool_id() == Some(id))
        {
            *existing = block;
            return;
        }
        last.blocks.push(block);
    }

    /// Replace the trailing text block of the in-flight assistant message
    /// (or push one) with the accumulated streamed text.
    pub fn update_streaming_text(&mut self, text: &str) {
        let Some(last) = self.messages.last_mut() else {
            return;
        };
        if last.role != MessageRole::Assistant {
            return;
        }
        if let Some(Block::Text { text: existing }) = last.blocks.last_mut() {
            *existing = text.to_string();
        } else {
            last.blocks.push(Block::text(text));
        }
    }

    /// Advance the stage of a tool block on the in-flight assistant message.
    pub fn advance_tool_stage(&mut self, tool_id: &str, stage: ToolStage) {
        if let Some(block) = self.find_tool_block(tool_id) {
            block.advance_stage(stage);
        }
    }

    /// Replace a streaming tool block's input once its arguments are
    /// complete. The stage is untouched.
    pub fn set_tool_input(&mut self, tool_id: &str, input: Value) {
        if let Some(Block::Tool {
            input: existing, ..
        }) = self.find_tool_block(tool_id)
        {
            *existing = input;
        }
    }

    /// Fail every tool block of the in-flight assistant message that has not
    /// reached its terminal stage. Used on abort: committed blocks are never
    /// rolled back, open ones are marked aborted.
    pub fn abort_open_tools(&mut self, reason: &str) {
        let Some(last) = self.messages.last_mut() else {
            return;
        };
        if last.role != MessageRole::Assistant {
            return;
        }
        for block in &mut last.blocks {
            if let Block::Tool { stage, .. } = block
                && *stage != ToolStage::End
            {
                block.finish_tool(ToolOutcome {
                    success: false,
                    result: String::new(),
                    error: Some(reason.to_string()),
                });
            }
        }
    }

    /// Terminate a tool block with its outcome.
    pub fn finish_tool(&mut self, tool_id: &str, outcome: ToolOutcome) {
        if let Some(block) = self.find_tool_block(tool_id) {
            block.finish_tool(outcome);
        } else {
            warn!(tool_id, "finish_tool: no such tool block");
        }
    }

    fn find_tool_block(&mut self, tool_id: &str) -> Option<&mut Block> {
        self.messages
            .last_mut()
            .filter(|m| m.role == MessageRole::Assistant)?
            .blocks
            .iter_mut()
            .find(|b| b.tool_id() == Some(tool_id))
    }

    /// Finalize the in-flight assistant message: record usage and append it
    /// to the session file. Drops the message instead if it is still empty.
    pub fn finalize_assistant(&mut self, usage: Option<Usage>) -> Result<()> {
        let Some(last) = self.messages.last_mut() else {
            return Ok(());
        };
        if last.role != MessageRole::Assistant {
            return Ok(());
        }
        if last.blocks.is_empty() {
            self.messages.pop();
            return Ok(());
        }
        last.usage = usage;
        if self.messages.len() > self.persisted {
            let tail = self.messages.len() - 1;
            self.store.append_message(&self.messages[tail])?;
            self.persisted = self.messages.len();
        }
        Ok(())
    }

    /// Flush any unpersisted tail (e.g. an aborted streaming message).
    pub fn save_session(&mut self) -> Result<()> {
        while self.persisted < self.messages.len() {
            self.store.append_message(&self.messages[self.persisted])?;
            self.persisted += 1;
        }
        Ok(())
    }

    /// Bulk-replace the conversation (restore/tests). Rewrites the file.
    pub fn set_messages(&mut self, messages: Vec<Message>) -> Result<()> {
        self.messages = messages;
        self.persisted = self.messages.len();
        self.store.rewrite(&self.meta, &self.messages)
    }

    /// Drop all messages and truncate the file back to the meta record.
    pub fn clear_messages(&mut self) -> Result<()> {
        self.messages.clear();
        self.persisted = 0;
        self.store.rewrite(&self.meta, &self.messages)
    }

    /// Replace the first `elided` messages with a single compress block.
    pub fn apply_compaction(&mut self, summary: String, elided: usize) -> Result<()> {
        let elided = elided.min(self.messages.len());
        let mut replacement = vec![Message::user(vec![Block::Compress {
            summary,
            elided_messages: elided,
        }])];
        replacement.extend(self.messages.split_off(elided));
        self.set_messages(replacement)
    }

    // ── Wire serialization ─────────────────────────────────────────────

    /// Serialize the conversation to the wire format the model service
    /// expects. Tool blocks on an assistant message become `tool_use` parts;
    /// their outcomes become `tool_result` parts on a synthetic user message
    /// immediately after, preserving request/response pairing.
    pub fn to_wire(&self) -> Vec<ModelMessage> {
        let mut wire = Vec::with_capacity(self.messages.len());

        for message in &self.messages {
            match message.role {
                MessageRole::User | MessageRole::Subagent => {
                    let parts: Vec<WirePart> =
                        message.blocks.iter().filter_map(user_block_to_wire).collect();
                    if !parts.is_empty() {
                        wire.push(ModelMessage {
                            role: Role::User,
                            content: parts,
                        });
                    }
                }
                MessageRole::Assistant => {
                    let mut parts = Vec::new();
                    let mut results = Vec::new();
                    for block in &message.blocks {
                        match block {
                            Block::Text { text } => {
                                parts.push(WirePart::Text { text: text.clone() })
                            }
                            Block::Tool {
                                id,
                                name,
                                input,
                                outcome,
                                ..
                            } => {
                                parts.push(WirePart::ToolUse {
                                    id: id.clone(),
                                    name: name.clone(),
                                    input: input.clone(),
                                });
                                if let Some(outcome) = outcome {
                                    results.push(WirePart::ToolResult {
                                        tool_use_id: id.clone(),
                                        output: Value::String(match &outcome.error {
                                            Some(err) if !outcome.success => err.clone(),
                                            _ => outcome.result.clone(),
                                        }),
                                        is_error: (!outcome.success).then_some(true),
                                    });
                                }
                            }
                            Block::Error { message } => parts.push(WirePart::Text {
                                text: format!("[error] {message}"),
                            }),
                            _ => {}
                        }
                    }
                    if !parts.is_empty() {
                        wire.push(ModelMessage {
                            role: Role::Assistant,
                            content: parts,
                        });
                    }
                    if !results.is_empty() {
                        wire.push(ModelMessage {
                            role: Role::User,
                            content: results,
                        });
                    }
                }
            }
        }

        wire
    }

    /// Sum of usage records across assistant messages.
    pub fn total_usage(&self) -> Usage {
        let mut total = Usage::default();
        for message in &self.messages {
            if let Some(usage) = message.usage {
                total.input_tokens += usage.input_tokens;
                total.output_tokens += usage.output_tokens;
            }
        }
        total
    }
}

fn user_block_to_wire(block: &Block) -> Option<WirePart> {
    match block {
        Block::Text { text } => Some(WirePart::Text { text: text.clone() }),
        Block::Image { media_type, data } => Some(WirePart::Image {
            media_type: media_type.clone(),
            data: data.clone(),
        }),
        Block::Memory { content } => Some(WirePart::Text {
            text: format!("<memory>\n{content}\n</memory>"),
        }),
        Block::Compress {
            summary,
            elided_messages,
        } => Some(WirePart::Text {
            text: format!(
                "<summary elided_messages=\"{elided_messages}\">\n{summary}\n</summary>"
            ),
        }),
        Block::CommandOutput {
            command, output, ..
        } => Some(WirePart::Text {
            text: format!("$ {command}\n{output}"),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_new(dir: &Path) -> MessageState {
        MessageState::open(
            dir,
            Path::new("/work"),
            SessionType::Main,
            None,
            RestorePolicy::New,
        )
        .unwrap()
    }

    #[test]
    fn streaming_message_persists_on_finalize() {
        let dir = tempdir().unwrap();
        let mut state = open_new(dir.path());

        state.add_user_message("hello", Vec::new()).unwrap();
        state.begin_assistant();
        state.append_or_update_assistant_block(Block::text("hi there"));
        state
            .finalize_assistant(Some(Usage {
                input_tokens: 3,
                output_tokens: 2,
            }))
            .unwrap();

        let id = state.session_id().to_string();
        let reloaded = MessageState::open(
            dir.path(),
            Path::new("/work"),
            SessionType::Main,
            None,
            RestorePolicy::Resume(id),
        )
        .unwrap();
        assert_eq!(reloaded.messages().len(), 2);
        assert_eq!(reloaded.total_usage().total(), 5);
    }

    #[test]
    fn tool_block_updates_in_place() {
        let dir = tempdir().unwrap();
        let mut state = open_new(dir.path());
        state.begin_assistant();
        state.append_or_update_assistant_block(Block::tool_start(
            "t1",
            "Bash",
            json!({"command": "ls"}),
        ));
        state.advance_tool_stage("t1", ToolStage::Running);
        state.finish_tool(
            "t1",
            ToolOutcome {
                success: true,
                result: "files".to_string(),
                error: None,
            },
        );

        let blocks = &state.messages().last().unwrap().blocks;
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            Block::Tool { stage, outcome, .. } => {
                assert_eq!(*stage, ToolStage::End);
                assert!(outcome.as_ref().unwrap().success);
            }
            _ => panic!("expected tool block"),
        }
    }

    #[test]
    fn restore_failure_falls_back_to_fresh() {
        let dir = tempdir().unwrap();
        let state = MessageState::open(
            dir.path(),
            Path::new("/work"),
            SessionType::Main,
            None,
            RestorePolicy::Resume("no-such-session".to_string()),
        )
        .unwrap();
        assert!(state.is_empty());
        assert_ne!(state.session_id(), "no-such-session");
    }

    #[test]
    fn continue_last_picks_matching_workdir() {
        let dir = tempdir().unwrap();

        let mut other = MessageState::open(
            dir.path(),
            Path::new("/other"),
            SessionType::Main,
            None,
            RestorePolicy::New,
        )
        .unwrap();
        other.add_user_message("other dir", Vec::new()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut mine = open_new(dir.path());
        mine.add_user_message("mine", Vec::new()).unwrap();
        let mine_id = mine.session_id().to_string();

        let restored = MessageState::open(
            dir.path(),
            Path::new("/work"),
            SessionType::Main,
            None,
            RestorePolicy::ContinueLast,
        )
        .unwrap();
        assert_eq!(restored.session_id(), mine_id);
    }

    #[test]
    fn wire_pairs_tool_use_with_result() {
        let dir = tempdir().unwrap();
        let mut state = open_new(dir.path());
        state.add_user_message("run ls", Vec::new()).unwrap();
        state.begin_assistant();
        state.append_or_update_assistant_block(Block::tool_start(
            "t1",
            "Bash",
            json!({"command": "ls"}),
        ));
        state.finish_tool(
            "t1",
            ToolOutcome {
                success: false,
                result: String::new(),
                error: Some("denied".to_string()),
            },
        );
        state.finalize_assistant(None).unwrap();

        let wire = state.to_wire();
        assert_eq!(wire.len(), 3);
        assert!(matches!(wire[1].content[0], WirePart::ToolUse { .. }));
        match &wire[2].content[0] {
            WirePart::ToolResult {
                is_error, output, ..
            } => {
                assert_eq!(*is_error, Some(true));
                assert_eq!(output, &Value::String("denied".to_string()));
            }
            _ => panic!("expected tool result"),
        }
    }

    #[test]
    fn compaction_replaces_prefix() {
        let dir = tempdir().unwrap();
        let mut state = open_new(dir.path());
        for i in 0..4 {
            state
                .add_user_message(&format!("msg {i}"), Vec::new())
                .unwrap();
        }
        state.apply_compaction("old stuff".to_string(), 3).unwrap();

        assert_eq!(state.messages().len(), 2);
        match &state.messages()[0].blocks[0] {
            Block::Compress {
                elided_messages, ..
            } => assert_eq!(*elided_messages, 3),
            _ => panic!("expected compress block"),
        }
    }

    #[test]
    fn clear_messages_truncates() {
        let dir = tempdir().unwrap();
        let mut state = open_new(dir.path());
        state.add_user_message("x", Vec::new()).unwrap();
        state.clear_messages().unwrap();
        assert!(state.is_empty());

        let id = state.session_id().to_string();
        let reloaded = MessageState::open(
            dir.path(),
            Path::new("/work"),
            SessionType::Main,
            None,
            RestorePolicy::Resume(id),
        )
        .unwrap();
        assert!(reloaded.is_empty());
    }
}
