//! Bash tool
//!
//! Foreground execution with a timeout and combined output capture, or
//! dispatch into the background process registry when `run_in_background`
//! is set. Background output is read later through the registry, never by
//! holding the child handle here.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::info;

use super::{Tool, ToolContext, ToolResult};

pub struct BashTool;

#[derive(Deserialize)]
struct Params {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    run_in_background: Option<bool>,
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "Bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the working directory. \
         Set run_in_background:true for servers and watchers; their output \
         is read later via the background task tools."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                },
                "timeout": {
                    "type": "number",
                    "description": "Optional timeout in milliseconds"
                },
                "description": {
                    "type": "string",
                    "description": "What this command does, in a few words"
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Run detached and return a task id"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let params: Params = match serde_json::from_value(args) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("Invalid parameters: {e}")),
        };

        info!(command = %params.command, "Executing bash command");

        if params.run_in_background.unwrap_or(false) {
            let Some(registry) = &ctx.process_registry else {
                return ToolResult::error("No background process registry available");
            };
            return match registry
                .spawn_shell(
                    params.command.clone(),
                    ctx.working_dir.clone(),
                    params.description.clone(),
                )
                .await
            {
                Ok(task_id) => {
                    let short = format!("background task {task_id}");
                    ToolResult::success(
                        json!({
                            "message": "Command started in background",
                            "task_id": task_id,
                            "status": "running"
                        })
                        .to_string(),
                    )
                    .with_short(short)
                }
                Err(e) => ToolResult::error(format!("Failed to start: {e}")),
            };
        }

        let limit = params
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(ctx.shell_timeout);

        let output = timeout(
            limit,
            Command::new("sh")
                .arg("-c")
                .arg(&params.command)
                .current_dir(&ctx.working_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match output {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str(stderr.trim_end());
                }

                if output.status.success() {
                    ToolResult::success(combined).with_short(format!("exit {exit_code}"))
                } else {
                    ToolResult {
                        success: false,
                        content: combined,
                        error: Some(format!("Command exited with code {exit_code}")),
                        short_result: Some(format!("exit {exit_code}")),
                    }
                }
            }
            Ok(Err(e)) => ToolResult::error(format!("Failed to spawn command: {e}")),
            Err(_) => ToolResult::error(format!(
                "Command timed out after {} ms",
                limit.as_millis()
            )),
        }
    }
}

/// Read buffered output of a background task.
pub struct TaskOutputTool;

#[derive(Deserialize)]
struct OutputParams {
    task_id: String,
    #[serde(default)]
    filter: Option<String>,
}

#[async_trait]
impl Tool for TaskOutputTool {
    fn name(&self) -> &str {
        "TaskOutput"
    }

    fn description(&self) -> &str {
        "Read buffered output from a background task without waiting. \
         Optionally filter to lines containing a substring."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "The background task to read"
                },
                "filter": {
                    "type": "string",
                    "description": "Only return lines containing this text"
                }
            },
            "required": ["task_id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let params: OutputParams = match serde_json::from_value(args) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("Invalid parameters: {e}")),
        };
        let Some(registry) = &ctx.process_registry else {
            return ToolResult::error("No background process registry available");
        };

        let status = match registry.status(&params.task_id).await {
            Some(status) => format!("{status:?}"),
            None => "unknown".to_string(),
        };
        match registry
            .read_output(&params.task_id, params.filter.as_deref())
            .await
        {
            Ok(output) => ToolResult::success(
                json!({
                    "task_id": params.task_id,
                    "status": status,
                    "output": output,
                })
                .to_string(),
            ),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

/// Terminate a background task.
pub struct KillTaskTool;

#[derive(Deserialize)]
struct KillParams {
    task_id: String,
}

#[async_trait]
impl Tool for KillTaskTool {
    fn name(&self) -> &str {
        "KillTask"
    }

    fn description(&self) -> &str {
        "Kill a running background task by id. Signals the whole process \
         group, escalating if it does not exit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "The background task to kill"
                }
            },
            "required": ["task_id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let params: KillParams = match serde_json::from_value(args) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("Invalid parameters: {e}")),
        };
        let Some(registry) = &ctx.process_registry else {
            return ToolResult::error("No background process registry available");
        };
        match registry.kill(&params.task_id).await {
            Ok(()) => ToolResult::success(format!("Task {} killed", params.task_id)),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::BackgroundProcessRegistry;
    use std::path::PathBuf;

    fn ctx() -> ToolContext {
        ToolContext::new(std::env::temp_dir(), "s1")
            .with_process_registry(BackgroundProcessRegistry::new())
    }

    #[tokio::test]
    async fn foreground_captures_output_and_exit() {
        let result = BashTool
            .execute(json!({"command": "echo hello"}), &ctx())
            .await;
        assert!(result.success);
        assert!(result.content.contains("hello"));

        let result = BashTool
            .execute(json!({"command": "echo oops >&2; exit 3"}), &ctx())
            .await;
        assert!(!result.success);
        assert!(result.content.contains("oops"));
        assert!(result.error.unwrap().contains("3"));
    }

    #[tokio::test]
    async fn foreground_times_out() {
        let result = BashTool
            .execute(json!({"command": "sleep 5", "timeout": 100}), &ctx())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn background_returns_task_id() {
        let ctx = ctx();
        let result = BashTool
            .execute(
                json!({"command": "sleep 10", "run_in_background": true}),
                &ctx,
            )
            .await;
        assert!(result.success);
        let parsed: Value = serde_json::from_str(&result.content).unwrap();
        let task_id = parsed["task_id"].as_str().unwrap().to_string();

        let registry = ctx.process_registry.as_ref().unwrap();
        assert!(registry.status(&task_id).await.unwrap().is_running());
        registry.kill(&task_id).await.unwrap();
    }

    #[tokio::test]
    async fn task_output_round_trip() {
        let ctx = ctx();
        let start = BashTool
            .execute(
                json!({"command": "echo ready", "run_in_background": true}),
                &ctx,
            )
            .await;
        let task_id = serde_json::from_str::<Value>(&start.content).unwrap()["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let result = TaskOutputTool
            .execute(json!({"task_id": task_id}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.content.contains("ready"));
    }

    #[tokio::test]
    async fn missing_registry_is_an_error() {
        let bare = ToolContext::new(PathBuf::from("/tmp"), "s1");
        let result = BashTool
            .execute(json!({"command": "ls", "run_in_background": true}), &bare)
            .await;
        assert!(!result.success);
    }
}
