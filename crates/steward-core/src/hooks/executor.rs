//! Hook execution
//!
//! Stateless functions over an explicit [`HookInvocation`] context: no
//! executor object, no hidden state. Each matched command runs as an
//! isolated `sh -c` child with the JSON payload on stdin and the project
//! directory layered over the inherited environment.
//!
//! A hook signals its outcome either via exit code (zero = continue,
//! non-zero = failure subject to `continueOnFailure`) or via a structured
//! JSON object on stdout; structured output takes precedence over the exit
//! code. The per-command timeout is independent of turn cancellation — a
//! hook cannot be cancelled by aborting the main turn.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{HookCommand, HookConfig, HookEvent};

/// Environment variable naming the project root for hook processes.
pub const PROJECT_DIR_ENV: &str = "STEWARD_PROJECT_DIR";

/// Explicit execution context for one hook event.
#[derive(Debug, Clone)]
pub struct HookInvocation {
    pub session_id: String,
    pub transcript_path: PathBuf,
    pub cwd: PathBuf,
    /// Project root injected as [`PROJECT_DIR_ENV`].
    pub project_dir: PathBuf,
    pub event: HookEvent,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_response: Option<Value>,
    pub user_prompt: Option<String>,
    pub subagent_type: Option<String>,
    pub message: Option<String>,
    pub notification_type: Option<String>,
}

impl HookInvocation {
    pub fn new(
        session_id: impl Into<String>,
        transcript_path: PathBuf,
        cwd: PathBuf,
        event: HookEvent,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project_dir: cwd.clone(),
            transcript_path,
            cwd,
            event,
            tool_name: None,
            tool_input: None,
            tool_response: None,
            user_prompt: None,
            subagent_type: None,
            message: None,
            notification_type: None,
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, input: Value) -> Self {
        self.tool_name = Some(name.into());
        self.tool_input = Some(input);
        self
    }

    pub fn with_tool_response(mut self, response: Value) -> Self {
        self.tool_response = Some(response);
        self
    }

    pub fn with_user_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.user_prompt = Some(prompt.into());
        self
    }

    pub fn with_subagent_type(mut self, name: impl Into<String>) -> Self {
        self.subagent_type = Some(name.into());
        self
    }

    /// Fixed-shape stdin payload.
    fn payload(&self) -> Value {
        let mut payload = json!({
            "session_id": self.session_id,
            "transcript_path": self.transcript_path.to_string_lossy(),
            "cwd": self.cwd.to_string_lossy(),
            "hook_event_name": self.event.name(),
        });
        let object = payload.as_object_mut().expect("payload is an object");
        if let Some(v) = &self.tool_name {
            object.insert("tool_name".to_string(), json!(v));
        }
        if let Some(v) = &self.tool_input {
            object.insert("tool_input".to_string(), v.clone());
        }
        if let Some(v) = &self.tool_response {
            object.insert("tool_response".to_string(), v.clone());
        }
        if let Some(v) = &self.user_prompt {
            object.insert("user_prompt".to_string(), json!(v));
        }
        if let Some(v) = &self.subagent_type {
            object.insert("subagent_type".to_string(), json!(v));
        }
        if let Some(v) = &self.message {
            object.insert("message".to_string(), json!(v));
        }
        if let Some(v) = &self.notification_type {
            object.insert("notification_type".to_string(), json!(v));
        }
        payload
    }
}

/// Structured stdout object, camelCase per the output contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructuredOutput {
    #[serde(rename = "continue")]
    continue_: Option<bool>,
    stop_reason: Option<String>,
    system_message: Option<String>,
    hook_specific_output: Option<HookSpecificOutput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HookSpecificOutput {
    #[allow(dead_code)]
    hook_event_name: Option<String>,
    // PreToolUse
    permission_decision: Option<String>,
    permission_decision_reason: Option<String>,
    updated_input: Option<Value>,
    // Other events
    decision: Option<String>,
    reason: Option<String>,
}

/// Aggregated verdict of the PreToolUse hook chain.
#[derive(Debug, Clone)]
pub enum PreToolUseVerdict {
    Allow { updated_input: Option<Value> },
    Deny { reason: String },
    Ask { reason: Option<String> },
}

/// Aggregated result of a non-PreToolUse hook chain.
#[derive(Debug, Clone, Default)]
pub struct EventOutcome {
    /// A hook issued a `block` decision.
    pub blocked: Option<String>,
    /// A hook requested the turn to stop (`continue: false`).
    pub stop_reason: Option<String>,
    /// Messages surfaced to the user.
    pub system_messages: Vec<String>,
    /// Plain stdout of successful hooks (context for UserPromptSubmit).
    pub context: Vec<String>,
}

/// Run the PreToolUse chain for a tool call. First deny wins; a later
/// `updatedInput` replaces an earlier one; `ask` is reported if nothing
/// denied.
pub async fn run_pre_tool_use(
    config: &HookConfig,
    invocation: &HookInvocation,
    default_timeout: Duration,
) -> PreToolUseVerdict {
    let mut updated_input = None;
    let mut ask_reason: Option<Option<String>> = None;

    'chain: for entry in config.entries_for(HookEvent::PreToolUse) {
        if !entry.matches(invocation.tool_name.as_deref()) {
            continue;
        }
        for hook in &entry.hooks {
            let run = run_command(hook, invocation, default_timeout).await;
            let run = match handle_failure(run, hook, invocation) {
                ChainStep::Use(run) => run,
                ChainStep::Skip => continue,
                ChainStep::StopChain => break 'chain,
            };

            if let Some(output) = parse_structured(&run.stdout) {
                if output.continue_ == Some(false) {
                    return PreToolUseVerdict::Deny {
                        reason: output
                            .stop_reason
                            .unwrap_or_else(|| "Stopped by hook".to_string()),
                    };
                }
                if let Some(specific) = output.hook_specific_output {
                    match specific.permission_decision.as_deref() {
                        Some("deny") => {
                            return PreToolUseVerdict::Deny {
                                reason: specific
                                    .permission_decision_reason
                                    .unwrap_or_else(|| "Denied by hook".to_string()),
                            };
                        }
                        Some("ask") => {
                            ask_reason = Some(specific.permission_decision_reason);
                        }
                        Some("allow") | None => {
                            if let Some(input) = specific.updated_input {
                                updated_input = Some(input);
                            }
                        }
                        Some(other) => {
                            warn!(decision = other, "Unknown permissionDecision from hook");
                        }
                    }
                }
            }
        }
    }

    match ask_reason {
        Some(reason) => PreToolUseVerdict::Ask { reason },
        None => PreToolUseVerdict::Allow { updated_input },
    }
}

/// Run the hook chain for any non-PreToolUse event.
pub async fn run_event(
    config: &HookConfig,
    invocation: &HookInvocation,
    default_timeout: Duration,
) -> EventOutcome {
    let mut outcome = EventOutcome::default();

    'chain: for entry in config.entries_for(invocation.event) {
        if !entry.matches(invocation.tool_name.as_deref()) {
            continue;
        }
        for hook in &entry.hooks {
            let run = run_command(hook, invocation, default_timeout).await;
            let run = match handle_failure(run, hook, invocation) {
                ChainStep::Use(run) => run,
                ChainStep::Skip => continue,
                ChainStep::StopChain => break 'chain,
            };

            match parse_structured(&run.stdout) {
                Some(output) => {
                    if let Some(msg) = output.system_message {
                        outcome.system_messages.push(msg);
                    }
                    if output.continue_ == Some(false) {
                        outcome.stop_reason = Some(
                            output
                                .stop_reason
                                .unwrap_or_else(|| "Stopped by hook".to_string()),
                        );
                        return outcome;
                    }
                    if let Some(specific) = output.hook_specific_output
                        && specific.decision.as_deref() == Some("block")
                        && outcome.blocked.is_none()
                    {
                        outcome.blocked = Some(
                            specific
                                .reason
                                .unwrap_or_else(|| "Blocked by hook".to_string()),
                        );
                    }
                }
                None => {
                    let trimmed = run.stdout.trim();
                    if !trimmed.is_empty() {
                        outcome.context.push(trimmed.to_string());
                    }
                }
            }
        }
    }

    outcome
}

struct CommandRun {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

enum RunError {
    Spawn(String),
    TimedOut(u64),
}

enum ChainStep {
    /// Interpret this run's output.
    Use(CommandRun),
    /// Ignore this run, continue with the next hook.
    Skip,
    /// Failure with `continueOnFailure: false` — abandon remaining hooks.
    StopChain,
}

/// Map failures: spawn errors and timeouts are logged and skipped; a
/// non-zero exit is a failure whose `continueOnFailure` flag decides whether
/// the rest of the chain still runs. Structured stdout of a failed hook is
/// still interpreted (it takes precedence over the exit code).
fn handle_failure(
    run: std::result::Result<CommandRun, RunError>,
    hook: &HookCommand,
    invocation: &HookInvocation,
) -> ChainStep {
    match run {
        Ok(run) => {
            if run.exit_code != 0 {
                warn!(
                    event = %invocation.event,
                    command = %hook.command,
                    exit_code = run.exit_code,
                    stderr = %run.stderr.trim(),
                    "Hook command failed"
                );
                if !run.stdout.trim().is_empty() {
                    return ChainStep::Use(run);
                }
                return if hook.continue_on_failure {
                    ChainStep::Skip
                } else {
                    ChainStep::StopChain
                };
            }
            ChainStep::Use(run)
        }
        Err(RunError::Spawn(e)) => {
            warn!(command = %hook.command, "Hook failed to spawn: {e}");
            ChainStep::Skip
        }
        Err(RunError::TimedOut(secs)) => {
            warn!(command = %hook.command, timeout_secs = secs, "Hook timed out");
            ChainStep::Skip
        }
    }
}

async fn run_command(
    hook: &HookCommand,
    invocation: &HookInvocation,
    default_timeout: Duration,
) -> std::result::Result<CommandRun, RunError> {
    let payload = invocation.payload().to_string();
    let limit = hook
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&hook.command)
        .current_dir(&invocation.cwd)
        .env(PROJECT_DIR_ENV, &invocation.project_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RunError::Spawn(e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(payload.as_bytes()).await {
            debug!("Failed to write hook payload: {e}");
        }
        // Dropping stdin closes it.
    }

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(RunError::Spawn(e.to_string())),
        Err(_) => return Err(RunError::TimedOut(limit.as_secs())),
    };

    Ok(CommandRun {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn parse_structured(stdout: &str) -> Option<StructuredOutput> {
    let trimmed = stdout.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookEntry;
    use std::collections::HashMap;

    fn config_with(event: HookEvent, matcher: Option<&str>, commands: &[&str]) -> HookConfig {
        let mut entries = HashMap::new();
        entries.insert(
            event,
            vec![HookEntry {
                matcher: matcher.map(str::to_string),
                hooks: commands
                    .iter()
                    .map(|c| HookCommand {
                        command: c.to_string(),
                        timeout: None,
                        continue_on_failure: true,
                    })
                    .collect(),
            }],
        );
        HookConfig { entries }
    }

    fn invocation(event: HookEvent) -> HookInvocation {
        HookInvocation::new(
            "session-1",
            PathBuf::from("/tmp/session.jsonl"),
            std::env::temp_dir(),
            event,
        )
    }

    #[tokio::test]
    async fn pre_tool_use_deny_wins() {
        let config = config_with(
            HookEvent::PreToolUse,
            Some("Write"),
            &[
                r#"echo '{"hookSpecificOutput":{"hookEventName":"PreToolUse","permissionDecision":"deny","permissionDecisionReason":"blocked"}}'"#,
            ],
        );
        let inv = invocation(HookEvent::PreToolUse)
            .with_tool("Write", json!({"file_path": "x"}));

        let verdict = run_pre_tool_use(&config, &inv, Duration::from_secs(5)).await;
        match verdict {
            PreToolUseVerdict::Deny { reason } => assert_eq!(reason, "blocked"),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pre_tool_use_updated_input() {
        let config = config_with(
            HookEvent::PreToolUse,
            None,
            &[
                r#"echo '{"hookSpecificOutput":{"hookEventName":"PreToolUse","permissionDecision":"allow","updatedInput":{"command":"ls -la"}}}'"#,
            ],
        );
        let inv = invocation(HookEvent::PreToolUse).with_tool("Bash", json!({"command": "ls"}));

        let verdict = run_pre_tool_use(&config, &inv, Duration::from_secs(5)).await;
        match verdict {
            PreToolUseVerdict::Allow { updated_input } => {
                assert_eq!(updated_input.unwrap()["command"], "ls -la");
            }
            other => panic!("expected allow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pre_tool_use_unmatched_tool_allows() {
        let config = config_with(HookEvent::PreToolUse, Some("Write"), &["exit 1"]);
        let inv = invocation(HookEvent::PreToolUse).with_tool("Read", json!({}));
        let verdict = run_pre_tool_use(&config, &inv, Duration::from_secs(5)).await;
        assert!(matches!(
            verdict,
            PreToolUseVerdict::Allow { updated_input: None }
        ));
    }

    #[tokio::test]
    async fn payload_reaches_hook_stdin() {
        // The hook reads its stdin back; plain stdout becomes context.
        let config = config_with(HookEvent::UserPromptSubmit, None, &["cat"]);
        let inv = invocation(HookEvent::UserPromptSubmit).with_user_prompt("hello");

        let outcome = run_event(&config, &inv, Duration::from_secs(5)).await;
        assert_eq!(outcome.context.len(), 1);
        let payload: Value = serde_json::from_str(&outcome.context[0]).unwrap();
        assert_eq!(payload["hook_event_name"], "UserPromptSubmit");
        assert_eq!(payload["user_prompt"], "hello");
        assert_eq!(payload["session_id"], "session-1");
        assert!(payload["transcript_path"].as_str().unwrap().contains("session.jsonl"));
    }

    #[tokio::test]
    async fn stop_hook_can_block() {
        let config = config_with(
            HookEvent::Stop,
            None,
            &[
                r#"echo '{"hookSpecificOutput":{"hookEventName":"Stop","decision":"block","reason":"keep going"}}'"#,
            ],
        );
        let outcome = run_event(&config, &invocation(HookEvent::Stop), Duration::from_secs(5)).await;
        assert_eq!(outcome.blocked.as_deref(), Some("keep going"));
    }

    #[tokio::test]
    async fn failing_hook_does_not_block_by_default() {
        let config = config_with(
            HookEvent::Notification,
            None,
            &["exit 3", "echo survived"],
        );
        let outcome = run_event(
            &config,
            &invocation(HookEvent::Notification),
            Duration::from_secs(5),
        )
        .await;
        assert!(outcome.blocked.is_none());
        assert_eq!(outcome.context, vec!["survived"]);
    }

    #[tokio::test]
    async fn hook_timeout_is_contained() {
        let config = config_with(HookEvent::Stop, None, &["sleep 5"]);
        let started = std::time::Instant::now();
        let outcome = run_event(
            &config,
            &invocation(HookEvent::Stop),
            Duration::from_millis(200),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(outcome.blocked.is_none());
    }

    #[tokio::test]
    async fn continue_false_stops_turn() {
        let config = config_with(
            HookEvent::Stop,
            None,
            &[r#"echo '{"continue": false, "stopReason": "enough"}'"#],
        );
        let outcome = run_event(&config, &invocation(HookEvent::Stop), Duration::from_secs(5)).await;
        assert_eq!(outcome.stop_reason.as_deref(), Some("enough"));
    }
}
