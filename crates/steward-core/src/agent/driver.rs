//! Tool-calling loop driver
//!
//! Drives repeated model turns until the model returns a turn with no
//! pending tool requests, or the operation is cancelled. Each iteration
//! streams the response, materializing text and tool blocks incrementally,
//! then routes every requested tool call through the permission engine and
//! the PreToolUse hooks before executing it, and through the PostToolUse
//! hooks after.
//!
//! Tool calls within one turn execute sequentially by default; they fan out
//! concurrently only when none requires permission confirmation and no two
//! calls target overlapping file paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::hooks::executor::{self, HookInvocation, PreToolUseVerdict};
use crate::hooks::{HookConfig, HookEvent};
use crate::model::{CallOptions, ModelService, StreamPart, ToolCallRequest, Usage};
use crate::permission::{PermissionEngine, PermissionMode, is_restricted};
use crate::process::BackgroundProcessRegistry;
use crate::session::{Block, MessageState, ToolOutcome, ToolStage};
use crate::tools::{ToolContext, ToolRegistry, ToolResult};

use super::compact;
use super::events::LoopEvent;

/// Observable driver state: a model turn or tool execution in flight, and a
/// compression pass in flight.
#[derive(Debug, Default)]
pub struct LoopFlags {
    loading: AtomicBool,
    compressing: AtomicBool,
}

impl LoopFlags {
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn is_compressing(&self) -> bool {
        self.compressing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_loading(&self, value: bool) {
        self.loading.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_compressing(&self, value: bool) {
        self.compressing.store(value, Ordering::SeqCst);
    }
}

/// How one driver run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The model produced a turn with no tool requests (or a hook stopped
    /// the loop).
    Completed,
    /// The cancellation token fired.
    Aborted,
}

/// The tool-calling loop driver. One instance per agent (or subagent); a
/// fresh `run` is invoked per dispatched user input.
pub struct LoopDriver {
    pub model: Arc<dyn ModelService>,
    pub tools: ToolRegistry,
    pub hooks: Arc<HookConfig>,
    pub config: Arc<AgentConfig>,
    pub process_registry: BackgroundProcessRegistry,
    pub event_tx: mpsc::UnboundedSender<LoopEvent>,
    pub cancel: CancellationToken,
    pub flags: Arc<LoopFlags>,
    /// System prompt for this context (subagents derive theirs from the
    /// definition body).
    pub system_prompt: Option<String>,
    /// Model override for this context; `None` uses the configured model.
    pub model_override: Option<String>,
}

struct StreamAccum {
    text: String,
    partial_args: HashMap<String, String>,
    calls: Vec<ToolCallRequest>,
    usage: Option<Usage>,
    errored: bool,
}

enum StepEnd {
    Done,
    Aborted,
    /// A hook asked the turn to stop after this tool.
    Stop(String),
}

impl LoopDriver {
    fn emit(&self, event: LoopEvent) {
        let _ = self.event_tx.send(event);
    }

    fn call_options(&self) -> CallOptions {
        CallOptions {
            model: self
                .model_override
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            system_prompt: self.system_prompt.clone(),
            tools: self.tools.descriptors(),
        }
    }

    fn hook_invocation(&self, state: &MessageState, event: HookEvent) -> HookInvocation {
        let mut invocation = HookInvocation::new(
            state.session_id(),
            state.transcript_path(),
            state.workdir(),
            event,
        );
        invocation.project_dir = self.config.workdir.clone();
        invocation
    }

    fn tool_context(&self, state: &MessageState) -> ToolContext {
        let mut ctx = ToolContext::new(state.workdir(), state.session_id());
        ctx.shell_timeout = self.config.shell_timeout;
        ctx.with_process_registry(self.process_registry.clone())
    }

    /// Run the loop for one dispatched input. The caller has already
    /// appended the user message.
    pub async fn run(
        &self,
        state: &mut MessageState,
        permissions: &mut PermissionEngine,
    ) -> Result<RunEnd> {
        self.flags.set_loading(true);
        let end = self.run_inner(state, permissions).await;
        self.flags.set_loading(false);

        match &end {
            Ok(RunEnd::Completed) => self.emit(LoopEvent::Finished {
                session_id: state.session_id().to_string(),
            }),
            Ok(RunEnd::Aborted) => self.emit(LoopEvent::Aborted {
                session_id: state.session_id().to_string(),
            }),
            Err(e) => self.emit(LoopEvent::Error {
                error: e.to_string(),
            }),
        }
        end
    }

    async fn run_inner(
        &self,
        state: &mut MessageState,
        permissions: &mut PermissionEngine,
    ) -> Result<RunEnd> {
        for turn in 1..=self.config.max_turns {
            if self.cancel.is_cancelled() {
                return Ok(RunEnd::Aborted);
            }

            compact::maybe_compact(
                self.model.as_ref(),
                state,
                &self.config,
                &self.flags,
                &self.event_tx,
            )
            .await;

            let accum = match self.stream_turn(state).await? {
                Some(accum) => accum,
                None => {
                    // Cancelled mid-stream; open blocks already aborted.
                    state.finalize_assistant(None)?;
                    state.save_session()?;
                    return Ok(RunEnd::Aborted);
                }
            };

            if accum.errored {
                // Error already surfaced as an event; keep whatever
                // streamed, end the dispatch without crashing the driver.
                state.finalize_assistant(accum.usage)?;
                self.emit(LoopEvent::TurnComplete {
                    turn,
                    has_more: false,
                });
                return Ok(RunEnd::Completed);
            }

            if accum.calls.is_empty() {
                state.finalize_assistant(accum.usage)?;
                self.emit(LoopEvent::TurnComplete {
                    turn,
                    has_more: false,
                });
                return Ok(RunEnd::Completed);
            }

            let step = self.execute_calls(state, permissions, &accum.calls).await;
            state.finalize_assistant(accum.usage)?;

            match step {
                StepEnd::Aborted => {
                    state.save_session()?;
                    return Ok(RunEnd::Aborted);
                }
                StepEnd::Stop(reason) => {
                    info!(reason = %reason, "Turn stopped by hook");
                    self.emit(LoopEvent::SystemMessage { message: reason });
                    self.emit(LoopEvent::TurnComplete {
                        turn,
                        has_more: false,
                    });
                    return Ok(RunEnd::Completed);
                }
                StepEnd::Done => {
                    self.emit(LoopEvent::TurnComplete {
                        turn,
                        has_more: true,
                    });
                }
            }
        }

        warn!(max_turns = self.config.max_turns, "Turn limit reached");
        Ok(RunEnd::Completed)
    }

    /// Stream one model response, materializing blocks incrementally.
    /// Returns `None` if cancelled mid-stream.
    async fn stream_turn(&self, state: &mut MessageState) -> Result<Option<StreamAccum>> {
        let mut rx = self
            .model
            .call_streaming(state.to_wire(), &self.call_options())
            .await
            .map_err(|e| Error::Model(e.to_string()))?;

        state.begin_assistant();
        let mut accum = StreamAccum {
            text: String::new(),
            partial_args: HashMap::new(),
            calls: Vec::new(),
            usage: None,
            errored: false,
        };

        loop {
            let part = tokio::select! {
                _ = self.cancel.cancelled() => {
                    state.abort_open_tools("Aborted by user");
                    return Ok(None);
                }
                part = rx.recv() => part,
            };
            let Some(part) = part else {
                break;
            };

            match part {
                StreamPart::TextDelta { delta } => {
                    accum.text.push_str(&delta);
                    state.update_streaming_text(&accum.text);
                    self.emit(LoopEvent::TextDelta { delta });
                }
                StreamPart::ToolCallStart { id, name } => {
                    // A new content block begins; trailing text is sealed.
                    accum.text.clear();
                    state.append_or_update_assistant_block(Block::tool_start(
                        &id,
                        &name,
                        Value::Null,
                    ));
                    self.emit(LoopEvent::ToolCallStart { id, name });
                }
                StreamPart::ToolCallDelta { id, delta } => {
                    accum.partial_args.entry(id.clone()).or_default().push_str(&delta);
                    state.advance_tool_stage(&id, ToolStage::Streaming);
                }
                StreamPart::ToolCallComplete { mut call } => {
                    // Some providers only deliver arguments as deltas; fall
                    // back to the accumulated partial JSON.
                    if call.arguments.is_null()
                        && let Some(raw) = accum.partial_args.get(&call.id)
                        && let Ok(parsed) = serde_json::from_str(raw)
                    {
                        call.arguments = parsed;
                    }
                    state.advance_tool_stage(&call.id, ToolStage::Streaming);
                    state.set_tool_input(&call.id, call.arguments.clone());
                    self.emit(LoopEvent::ToolCallComplete {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    });
                    accum.calls.push(call);
                }
                StreamPart::Usage { usage } => accum.usage = Some(usage),
                StreamPart::Error { error } => {
                    warn!(error = %error, "Model stream error");
                    self.emit(LoopEvent::Error { error });
                    accum.errored = true;
                    break;
                }
            }
        }

        Ok(Some(accum))
    }

    /// Execute the turn's tool calls: sequential by default, concurrent only
    /// when provably independent.
    async fn execute_calls(
        &self,
        state: &mut MessageState,
        permissions: &mut PermissionEngine,
        calls: &[ToolCallRequest],
    ) -> StepEnd {
        if calls.len() > 1 && can_fan_out(calls) {
            return self.execute_concurrent(state, permissions.mode(), calls).await;
        }

        for (index, call) in calls.iter().enumerate() {
            match self.execute_one(state, permissions, call).await {
                StepEnd::Done => {}
                StepEnd::Aborted => {
                    // Remaining calls never started; their blocks abort.
                    fail_remaining(state, &calls[index + 1..], "Aborted by user");
                    return StepEnd::Aborted;
                }
                StepEnd::Stop(reason) => {
                    // Remaining calls are skipped, but every requested block
                    // still gets a terminal result for the wire.
                    fail_remaining(
                        state,
                        &calls[index + 1..],
                        "Skipped: turn stopped by hook",
                    );
                    return StepEnd::Stop(reason);
                }
            }
        }
        StepEnd::Done
    }

    /// One tool call: permission → PreToolUse hooks → execute → PostToolUse
    /// hooks → terminal block.
    async fn execute_one(
        &self,
        state: &mut MessageState,
        permissions: &mut PermissionEngine,
        call: &ToolCallRequest,
    ) -> StepEnd {
        let mut input = call.arguments.clone();

        // Permission engine first; a deny short-circuits before any hook or
        // execution sees the call.
        let decision = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.fail_tool(state, &call.id, "Aborted by user");
                return StepEnd::Aborted;
            }
            decision = permissions.evaluate(&call.name, &input) => decision,
        };
        if !decision.is_allowed() {
            let reason = decision
                .message
                .unwrap_or_else(|| "Permission denied".to_string());
            self.emit(LoopEvent::ToolDenied {
                id: call.id.clone(),
                reason: reason.clone(),
            });
            self.fail_tool(state, &call.id, &reason);
            return StepEnd::Done;
        }

        // PreToolUse hooks may deny, re-route to the user, or rewrite input.
        let invocation = self
            .hook_invocation(state, HookEvent::PreToolUse)
            .with_tool(&call.name, input.clone());
        let verdict =
            executor::run_pre_tool_use(&self.hooks, &invocation, self.config.hook_timeout).await;
        match verdict {
            PreToolUseVerdict::Deny { reason } => {
                self.emit(LoopEvent::ToolDenied {
                    id: call.id.clone(),
                    reason: reason.clone(),
                });
                self.fail_tool(state, &call.id, &reason);
                return StepEnd::Done;
            }
            PreToolUseVerdict::Ask { reason } => {
                debug!(tool = %call.name, reason = ?reason, "Hook escalated to user prompt");
                let decision = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.fail_tool(state, &call.id, "Aborted by user");
                        return StepEnd::Aborted;
                    }
                    decision = permissions.ask_user(&call.name, &input) => decision,
                };
                if !decision.is_allowed() {
                    let reason = decision
                        .message
                        .unwrap_or_else(|| "Denied by user".to_string());
                    self.fail_tool(state, &call.id, &reason);
                    return StepEnd::Done;
                }
            }
            PreToolUseVerdict::Allow { updated_input } => {
                if let Some(updated) = updated_input {
                    state.set_tool_input(&call.id, updated.clone());
                    input = updated;
                }
            }
        }

        state.advance_tool_stage(&call.id, ToolStage::Running);
        self.emit(LoopEvent::ToolExecuting {
            id: call.id.clone(),
            name: call.name.clone(),
        });

        let result = match self
            .run_tool(state, permissions.mode(), call, input.clone())
            .await
        {
            Some(result) => result,
            None => {
                self.fail_tool(state, &call.id, "Aborted by user");
                return StepEnd::Aborted;
            }
        };

        self.commit_result(state, call, &input, result).await
    }

    /// Execute the tool itself, racing cancellation. `None` means aborted.
    async fn run_tool(
        &self,
        state: &MessageState,
        mode: PermissionMode,
        call: &ToolCallRequest,
        input: Value,
    ) -> Option<ToolResult> {
        let Some(tool) = self.tools.get(&call.name) else {
            return Some(ToolResult::error(format!("Unknown tool: {}", call.name)));
        };
        let mut ctx = self.tool_context(state).for_call(&call.id);
        ctx.permission_mode = mode;
        ctx.cancel = self.cancel.clone();

        // Task delegation observes the token itself and must run its status
        // bookkeeping to completion; dropping its future would strand the
        // nested instance. Everything else is raced and dropped.
        if call.name == "Task" {
            let result = tool.execute(input, &ctx).await;
            if self.cancel.is_cancelled() {
                return None;
            }
            return Some(result);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = tool.execute(input, &ctx) => Some(result),
        }
    }

    /// PostToolUse hooks, truncation, terminal block, events.
    async fn commit_result(
        &self,
        state: &mut MessageState,
        call: &ToolCallRequest,
        input: &Value,
        mut result: ToolResult,
    ) -> StepEnd {
        result.content = truncate_result(&result.content, self.config.max_tool_result_chars);

        let response = serde_json::json!({
            "success": result.success,
            "content": result.content,
            "error": result.error,
        });
        let invocation = self
            .hook_invocation(state, HookEvent::PostToolUse)
            .with_tool(&call.name, input.clone())
            .with_tool_response(response);
        let outcome =
            executor::run_event(&self.hooks, &invocation, self.config.hook_timeout).await;

        for message in outcome.system_messages {
            self.emit(LoopEvent::SystemMessage { message });
        }
        if let Some(reason) = &outcome.blocked {
            // The tool already executed; the block decision annotates the
            // result the model sees (a pre-execution deny is the permission
            // engine's job).
            result.content = format!("{}\n\n[hook] {reason}", result.content);
        }

        state.finish_tool(
            &call.id,
            ToolOutcome {
                success: result.success,
                result: result.content.clone(),
                error: result.error.clone(),
            },
        );
        self.emit(LoopEvent::ToolResult {
            id: call.id.clone(),
            success: result.success,
            short_result: result.short_result.clone(),
        });

        // A successful Task delegation leaves a reference block so the
        // sub-conversation stays reachable for display.
        if call.name == "Task"
            && result.success
            && let Ok(parsed) = serde_json::from_str::<Value>(&result.content)
            && let (Some(instance_id), Some(session_id)) = (
                parsed.get("instance_id").and_then(Value::as_str),
                parsed.get("session_id").and_then(Value::as_str),
            )
        {
            state.append_or_update_assistant_block(Block::Subagent {
                instance_id: instance_id.to_string(),
                session_id: session_id.to_string(),
                name: parsed
                    .get("subagent")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        match outcome.stop_reason {
            Some(reason) => StepEnd::Stop(reason),
            None => StepEnd::Done,
        }
    }

    /// Fan out provably independent calls, committing results in call order.
    async fn execute_concurrent(
        &self,
        state: &mut MessageState,
        mode: PermissionMode,
        calls: &[ToolCallRequest],
    ) -> StepEnd {
        for call in calls {
            state.advance_tool_stage(&call.id, ToolStage::Running);
            self.emit(LoopEvent::ToolExecuting {
                id: call.id.clone(),
                name: call.name.clone(),
            });
        }

        let state_view: &MessageState = state;
        let executions = calls.iter().map(|call| {
            let input = call.arguments.clone();
            async move { self.run_tool(state_view, mode, call, input).await }
        });
        let results = futures::future::join_all(executions).await;

        let mut stop = None;
        for (call, result) in calls.iter().zip(results) {
            let Some(result) = result else {
                state.abort_open_tools("Aborted by user");
                return StepEnd::Aborted;
            };
            if let StepEnd::Stop(reason) =
                self.commit_result(state, call, &call.arguments, result).await
            {
                stop = Some(reason);
            }
        }
        match stop {
            Some(reason) => StepEnd::Stop(reason),
            None => StepEnd::Done,
        }
    }

    fn fail_tool(&self, state: &mut MessageState, tool_id: &str, reason: &str) {
        state.finish_tool(
            tool_id,
            ToolOutcome {
                success: false,
                result: String::new(),
                error: Some(reason.to_string()),
            },
        );
        self.emit(LoopEvent::ToolResult {
            id: tool_id.to_string(),
            success: false,
            short_result: Some(reason.to_string()),
        });
    }
}

fn fail_remaining(state: &mut MessageState, pending: &[ToolCallRequest], reason: &str) {
    for call in pending {
        state.finish_tool(
            &call.id,
            ToolOutcome {
                success: false,
                result: String::new(),
                error: Some(reason.to_string()),
            },
        );
    }
}

/// Concurrent fan-out is allowed only when no call requires permission
/// confirmation and no two calls target overlapping file paths.
fn can_fan_out(calls: &[ToolCallRequest]) -> bool {
    let mut seen_paths: Vec<&str> = Vec::new();
    for call in calls {
        if is_restricted(&call.name) {
            return false;
        }
        if let Some(path) = call
            .arguments
            .get("file_path")
            .or_else(|| call.arguments.get("path"))
            .and_then(Value::as_str)
        {
            if seen_paths.contains(&path) {
                return false;
            }
            seen_paths.push(path);
        }
    }
    true
}

/// Tail-truncate a tool result, noting how much was elided.
fn truncate_result(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        return content.to_string();
    }
    let mut boundary = max_chars.min(content.len());
    while boundary > 0 && !content.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let kept = &content[..boundary];
    let cut = kept.rfind('\n').unwrap_or(boundary);
    format!(
        "{}\n[... output truncated: {} of {} chars kept ...]",
        &content[..cut],
        cut,
        content.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            arguments: args,
        }
    }

    #[test]
    fn fan_out_requires_unrestricted_and_disjoint_paths() {
        assert!(can_fan_out(&[
            call("Read", json!({"file_path": "a.rs"})),
            call("Read", json!({"file_path": "b.rs"})),
        ]));

        // Restricted tool forces sequential.
        assert!(!can_fan_out(&[
            call("Read", json!({"file_path": "a.rs"})),
            call("Write", json!({"file_path": "b.rs"})),
        ]));

        // Overlapping paths force sequential.
        assert!(!can_fan_out(&[
            call("Read", json!({"file_path": "a.rs"})),
            call("Read", json!({"file_path": "a.rs"})),
        ]));
    }

    #[test]
    fn truncation_keeps_head_and_notes_cut() {
        let content = "line\n".repeat(100);
        let truncated = truncate_result(&content, 50);
        assert!(truncated.len() < content.len());
        assert!(truncated.contains("truncated"));
        assert!(truncated.starts_with("line"));

        let short = truncate_result("short", 50);
        assert_eq!(short, "short");
    }

    #[test]
    fn flags_toggle() {
        let flags = LoopFlags::default();
        assert!(!flags.is_loading());
        flags.set_loading(true);
        assert!(flags.is_loading());
        flags.set_compressing(true);
        assert!(flags.is_compressing());
    }
}
