//! End-to-end loop scenarios against a scripted model service.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use steward_core::agent::driver::RunEnd;
use steward_core::config::AgentConfigBuilder;
use steward_core::model::{
    CallOptions, ModelMessage, ModelService, StreamPart, ToolCallRequest, Usage,
};
use steward_core::permission::{PermissionMode, PermissionReply};
use steward_core::session::{Block, MessageRole, RestorePolicy, SessionStore, ToolStage};
use steward_core::tools::{Tool, ToolContext, ToolResult};
use steward_core::{Agent, AgentHandles, Error};

/// Scripted model: each `call_streaming` plays the next turn's parts;
/// `call_text` pops from a separate queue.
struct MockModel {
    turns: Mutex<std::vec::IntoIter<Vec<StreamPart>>>,
    text_responses: Mutex<Vec<String>>,
    /// When set, `call_streaming` returns a channel that never closes.
    hang: bool,
}

impl MockModel {
    fn scripted(turns: Vec<Vec<StreamPart>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into_iter()),
            text_responses: Mutex::new(Vec::new()),
            hang: false,
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(Vec::<Vec<StreamPart>>::new().into_iter()),
            text_responses: Mutex::new(Vec::new()),
            hang: true,
        })
    }

    fn with_summary(self: Arc<Self>, summary: &str) -> Arc<Self> {
        self.text_responses
            .try_lock()
            .unwrap()
            .push(summary.to_string());
        self
    }
}

#[async_trait]
impl ModelService for MockModel {
    async fn call_streaming(
        &self,
        _conversation: Vec<ModelMessage>,
        _options: &CallOptions,
    ) -> steward_core::Result<mpsc::UnboundedReceiver<StreamPart>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.hang {
            // Keep the sender alive so the stream never ends.
            tokio::spawn(async move {
                let _tx = tx;
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            });
            return Ok(rx);
        }
        let parts = self
            .turns
            .lock()
            .await
            .next()
            .unwrap_or_else(|| vec![text_part("fallback")]);
        for part in parts {
            let _ = tx.send(part);
        }
        Ok(rx)
    }

    async fn call_text(
        &self,
        _conversation: Vec<ModelMessage>,
        _options: &CallOptions,
    ) -> steward_core::Result<String> {
        self.text_responses
            .lock()
            .await
            .pop()
            .ok_or_else(|| Error::Model("no scripted text response".to_string()))
    }
}

fn text_part(text: &str) -> StreamPart {
    StreamPart::TextDelta {
        delta: text.to_string(),
    }
}

fn tool_turn(id: &str, name: &str, args: Value) -> Vec<StreamPart> {
    vec![
        StreamPart::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
        },
        StreamPart::ToolCallComplete {
            call: ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args,
            },
        },
        StreamPart::Usage {
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        },
    ]
}

/// A Write tool that records whether it ever executed.
struct RecordingWriteTool {
    executed: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for RecordingWriteTool {
    fn name(&self) -> &str {
        "Write"
    }
    fn description(&self) -> &str {
        "Write a file"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"file_path": {"type": "string"}}})
    }
    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolResult {
        self.executed.store(true, Ordering::SeqCst);
        ToolResult::success("written")
    }
}

struct TestEnv {
    _workdir: tempfile::TempDir,
    _sessions: tempfile::TempDir,
}

fn write_project_file(workdir: &Path, rel: &str, content: &str) {
    let path = workdir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

async fn build_agent(
    model: Arc<MockModel>,
    mode: PermissionMode,
    extra_tools: Vec<Arc<dyn Tool>>,
) -> (Agent, AgentHandles, TestEnv) {
    let workdir = tempfile::tempdir().unwrap();
    let sessions = tempfile::tempdir().unwrap();
    build_agent_in(model, mode, extra_tools, workdir, sessions).await
}

async fn build_agent_in(
    model: Arc<MockModel>,
    mode: PermissionMode,
    extra_tools: Vec<Arc<dyn Tool>>,
    workdir: tempfile::TempDir,
    sessions: tempfile::TempDir,
) -> (Agent, AgentHandles, TestEnv) {
    let config = AgentConfigBuilder::new()
        .workdir(workdir.path())
        .sessions_dir(sessions.path())
        .model("mock-model")
        .resolve()
        .unwrap();

    let (agent, handles) = Agent::new(config, model, RestorePolicy::New, mode, extra_tools)
        .await
        .unwrap();
    (
        agent,
        handles,
        TestEnv {
            _workdir: workdir,
            _sessions: sessions,
        },
    )
}

fn find_tool_block(agent: &Agent, tool_id: &str) -> Block {
    agent
        .messages()
        .iter()
        .flat_map(|m| m.blocks.iter())
        .find(|b| b.tool_id() == Some(tool_id))
        .cloned()
        .expect("tool block present")
}

#[tokio::test]
async fn plain_text_turn_completes() {
    let model = MockModel::scripted(vec![vec![
        text_part("hello "),
        text_part("there"),
        StreamPart::Usage {
            usage: Usage {
                input_tokens: 3,
                output_tokens: 2,
            },
        },
    ]]);
    let (mut agent, _handles, _env) = build_agent(model, PermissionMode::Default, vec![]).await;

    let end = agent.dispatch("hi", vec![]).await.unwrap();
    assert_eq!(end, RunEnd::Completed);

    let messages = agent.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    match &messages[1].blocks[0] {
        Block::Text { text } => assert_eq!(text, "hello there"),
        other => panic!("expected text block, got {other:?}"),
    }
    assert_eq!(messages[1].usage.unwrap().total(), 5);
}

#[tokio::test]
async fn safe_bash_tool_round_trip() {
    let model = MockModel::scripted(vec![
        tool_turn("t1", "Bash", json!({"command": "echo from-tool"})),
        vec![text_part("done")],
    ]);
    let (mut agent, _handles, _env) = build_agent(model, PermissionMode::Default, vec![]).await;

    let end = agent.dispatch("run it", vec![]).await.unwrap();
    assert_eq!(end, RunEnd::Completed);

    let block = find_tool_block(&agent, "t1");
    match block {
        Block::Tool { stage, outcome, .. } => {
            assert_eq!(stage, ToolStage::End);
            let outcome = outcome.unwrap();
            assert!(outcome.success);
            assert!(outcome.result.contains("from-tool"));
        }
        other => panic!("expected tool block, got {other:?}"),
    }
}

#[tokio::test]
async fn pre_tool_use_deny_hook_prevents_execution() {
    let workdir = tempfile::tempdir().unwrap();
    write_project_file(
        workdir.path(),
        ".steward/settings.json",
        r#"{"hooks":{"PreToolUse":[{"matcher":"Write","hooks":[{"command":"echo '{\"hookSpecificOutput\":{\"hookEventName\":\"PreToolUse\",\"permissionDecision\":\"deny\",\"permissionDecisionReason\":\"blocked\"}}'"}]}]}}"#,
    );

    let executed = Arc::new(AtomicBool::new(false));
    let write_tool = Arc::new(RecordingWriteTool {
        executed: Arc::clone(&executed),
    });

    let model = MockModel::scripted(vec![
        tool_turn("w1", "Write", json!({"file_path": "out.txt"})),
        vec![text_part("ok")],
    ]);
    let sessions = tempfile::tempdir().unwrap();
    let (mut agent, _handles, _env) = build_agent_in(
        model,
        // Bypass the permission gate so only the hook decides.
        PermissionMode::BypassPermissions,
        vec![write_tool],
        workdir,
        sessions,
    )
    .await;

    agent.dispatch("write the file", vec![]).await.unwrap();

    assert!(!executed.load(Ordering::SeqCst), "Write must never execute");
    let block = find_tool_block(&agent, "w1");
    match block {
        Block::Tool { stage, outcome, .. } => {
            assert_eq!(stage, ToolStage::End);
            let outcome = outcome.unwrap();
            assert!(!outcome.success);
            assert_eq!(outcome.error.as_deref(), Some("blocked"));
        }
        other => panic!("expected tool block, got {other:?}"),
    }
}

#[tokio::test]
async fn permission_denial_is_recoverable() {
    let model = MockModel::scripted(vec![
        tool_turn("b1", "Bash", json!({"command": "mkdir newdir"})),
        vec![text_part("understood")],
    ]);
    let (mut agent, mut handles, _env) =
        build_agent(model, PermissionMode::Default, vec![]).await;

    // The UI side denies the prompt.
    tokio::spawn(async move {
        while let Some(prompt) = handles.prompts.recv().await {
            let _ = prompt.reply_tx.send(PermissionReply::Deny {
                message: Some("not allowed".to_string()),
            });
        }
    });

    let end = agent.dispatch("make a dir", vec![]).await.unwrap();
    assert_eq!(end, RunEnd::Completed);

    let block = find_tool_block(&agent, "b1");
    match block {
        Block::Tool { outcome, .. } => {
            let outcome = outcome.unwrap();
            assert!(!outcome.success);
            assert_eq!(outcome.error.as_deref(), Some("not allowed"));
        }
        other => panic!("expected tool block, got {other:?}"),
    }
    // The loop continued to the next turn instead of dying.
    assert!(matches!(
        agent.messages().last().unwrap().blocks.last().unwrap(),
        Block::Text { .. }
    ));
}

#[tokio::test]
async fn abort_is_idempotent() {
    let model = MockModel::hanging();
    let (mut agent, _handles, _env) = build_agent(model, PermissionMode::Default, vec![]).await;
    let abort = agent.abort_handle();

    let dispatch = tokio::spawn(async move {
        let end = agent.dispatch("never finishes", vec![]).await.unwrap();
        (agent, end)
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    abort.abort();
    abort.abort(); // second abort: no additional observable effect

    let (agent, end) = dispatch.await.unwrap();
    assert_eq!(end, RunEnd::Aborted);

    // Committed messages survive; aborting again later changes nothing.
    let before = agent.messages().len();
    abort.abort();
    assert_eq!(agent.messages().len(), before);
}

#[tokio::test]
async fn unknown_subagent_lists_registered_names() {
    let workdir = tempfile::tempdir().unwrap();
    write_project_file(
        workdir.path(),
        ".steward/agents/code-reviewer.md",
        "---\nname: code-reviewer\ndescription: Reviews code changes\n---\nReview things.",
    );
    write_project_file(
        workdir.path(),
        ".steward/agents/explorer.md",
        "---\nname: explorer\ndescription: Explores the codebase\n---\nExplore things.",
    );

    let model = MockModel::scripted(vec![
        tool_turn(
            "task1",
            "Task",
            json!({"description": "do it", "prompt": "do it", "subagent_type": "ghost"}),
        ),
        vec![text_part("ok")],
    ]);
    let sessions = tempfile::tempdir().unwrap();
    let (mut agent, _handles, _env) = build_agent_in(
        model,
        PermissionMode::Default,
        vec![],
        workdir,
        sessions,
    )
    .await;

    agent.dispatch("delegate", vec![]).await.unwrap();

    let block = find_tool_block(&agent, "task1");
    match block {
        Block::Tool { outcome, .. } => {
            let outcome = outcome.unwrap();
            assert!(!outcome.success);
            let error = outcome.error.unwrap();
            assert!(error.contains("code-reviewer"), "error was: {error}");
            assert!(error.contains("explorer"));
        }
        other => panic!("expected tool block, got {other:?}"),
    }
}

#[tokio::test]
async fn subagent_returns_only_final_output() {
    let workdir = tempfile::tempdir().unwrap();
    write_project_file(
        workdir.path(),
        ".steward/agents/explorer.md",
        "---\nname: explorer\ndescription: Explores the codebase\n---\nYou explore.",
    );

    // Turn 1: parent delegates. Turn 2 (consumed by the nested driver): the
    // subagent answers. Turn 3: parent wraps up.
    let model = MockModel::scripted(vec![
        tool_turn(
            "task1",
            "Task",
            json!({"description": "explore", "prompt": "map the repo", "subagent_type": "explorer"}),
        ),
        vec![text_part("sub answer")],
        vec![text_part("all done")],
    ]);
    let sessions_dir = tempfile::tempdir().unwrap();
    let sessions_path = sessions_dir.path().to_path_buf();
    let (mut agent, _handles, _env) = build_agent_in(
        model,
        PermissionMode::Default,
        vec![],
        workdir,
        sessions_dir,
    )
    .await;

    agent.dispatch("use the explorer", vec![]).await.unwrap();

    let block = find_tool_block(&agent, "task1");
    let (outcome, _) = match block {
        Block::Tool { outcome, stage, .. } => (outcome.unwrap(), stage),
        other => panic!("expected tool block, got {other:?}"),
    };
    assert!(outcome.success);
    let parsed: Value = serde_json::from_str(&outcome.result).unwrap();
    assert_eq!(parsed["subagent"], "explorer");
    assert_eq!(parsed["output"], "sub answer");

    // No subagent message leaked into the parent conversation.
    for message in agent.messages() {
        for b in &message.blocks {
            if let Block::Text { text } = b {
                assert_ne!(text, "sub answer");
            }
        }
    }

    // The sub-conversation is on disk, typed as a subagent session with the
    // parent recorded, and referenced from the parent via a subagent block.
    let sub_session_id = parsed["session_id"].as_str().unwrap();
    let store = SessionStore::new(&sessions_path, sub_session_id);
    let (meta, sub_messages) = store.load().unwrap();
    let meta = meta.unwrap();
    assert_eq!(
        meta.parent_session_id.as_deref(),
        Some(agent.session_id())
    );
    assert_eq!(sub_messages.len(), 2);

    let has_reference = agent.messages().iter().any(|m| {
        m.blocks.iter().any(|b| {
            matches!(b, Block::Subagent { session_id, .. } if session_id == sub_session_id)
        })
    });
    assert!(has_reference);
}

#[tokio::test]
async fn compaction_replaces_old_history() {
    // Four tool turns accumulate usage past the threshold, then the final
    // text turn. The summary call is scripted separately.
    let model = MockModel::scripted(vec![
        tool_turn("c1", "Bash", json!({"command": "echo 1"})),
        tool_turn("c2", "Bash", json!({"command": "echo 2"})),
        tool_turn("c3", "Bash", json!({"command": "echo 3"})),
        tool_turn("c4", "Bash", json!({"command": "echo 4"})),
        vec![text_part("finished")],
    ])
    .with_summary("summary of earlier work");

    let workdir = tempfile::tempdir().unwrap();
    let sessions = tempfile::tempdir().unwrap();
    let config = AgentConfigBuilder::new()
        .workdir(workdir.path())
        .sessions_dir(sessions.path())
        .model("mock-model")
        .compact_threshold_tokens(20)
        .resolve()
        .unwrap();
    let (mut agent, _handles) = Agent::new(
        config,
        model,
        RestorePolicy::New,
        PermissionMode::Default,
        vec![],
    )
    .await
    .unwrap();

    agent.dispatch("do a lot", vec![]).await.unwrap();

    let first_blocks = &agent.messages()[0].blocks;
    assert!(
        matches!(first_blocks[0], Block::Compress { .. }),
        "expected compress block first, got {first_blocks:?}"
    );
    let _ = workdir;
    let _ = sessions;
}

#[tokio::test]
async fn user_prompt_submit_hook_can_block_dispatch() {
    let workdir = tempfile::tempdir().unwrap();
    write_project_file(
        workdir.path(),
        ".steward/settings.json",
        r#"{"hooks":{"UserPromptSubmit":[{"hooks":[{"command":"echo '{\"hookSpecificOutput\":{\"hookEventName\":\"UserPromptSubmit\",\"decision\":\"block\",\"reason\":\"nope\"}}'"}]}]}}"#,
    );
    let model = MockModel::scripted(vec![vec![text_part("never reached")]]);
    let sessions = tempfile::tempdir().unwrap();
    let (mut agent, _handles, _env) = build_agent_in(
        model,
        PermissionMode::Default,
        vec![],
        workdir,
        sessions,
    )
    .await;

    let err = agent.dispatch("blocked prompt", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("nope"));
    assert!(agent.messages().is_empty());
}

#[tokio::test]
async fn malformed_hook_config_fails_construction() {
    let workdir = tempfile::tempdir().unwrap();
    write_project_file(
        workdir.path(),
        ".steward/settings.json",
        r#"{"hooks":{"NotAnEvent":[{"hooks":[{"command":"echo hi"}]}]}}"#,
    );

    let config = AgentConfigBuilder::new()
        .workdir(workdir.path())
        .sessions_dir(tempfile::tempdir().unwrap().path())
        .model("mock-model")
        .resolve()
        .unwrap();

    let result = Agent::new(
        config,
        MockModel::scripted(vec![]),
        RestorePolicy::New,
        PermissionMode::Default,
        vec![],
    )
    .await;
    assert!(result.is_err());
}
