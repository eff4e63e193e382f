//! Task tool - delegate a sub-task to a subagent
//!
//! The model requests a delegation by name (`subagent_type`) or by task
//! description; the delegator resolves the definition, runs the task in an
//! isolated context, and only the final output comes back as the tool
//! result. Failures (unknown type, circular delegation, depth cap) are tool
//! failures, never exceptions across the boundary.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::subagent::delegate::{DelegationChain, DelegationRequest, SubagentDelegator};

use super::{Tool, ToolContext, ToolResult};

pub struct TaskTool {
    delegator: Arc<SubagentDelegator>,
    chain: DelegationChain,
}

impl TaskTool {
    pub fn new(delegator: Arc<SubagentDelegator>, chain: DelegationChain) -> Self {
        Self { delegator, chain }
    }
}

#[derive(Deserialize)]
struct Params {
    description: String,
    prompt: String,
    #[serde(default)]
    subagent_type: Option<String>,
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "Task"
    }

    fn description(&self) -> &str {
        "Delegate a well-scoped task to a specialized subagent. The subagent \
         works in an isolated context and returns only its final answer."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "A short (3-5 word) description of the task"
                },
                "prompt": {
                    "type": "string",
                    "description": "The detailed task for the subagent to perform"
                },
                "subagent_type": {
                    "type": "string",
                    "description": "Exact subagent name; omit to select by description"
                }
            },
            "required": ["description", "prompt"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let params: Params = match serde_json::from_value(args) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("Invalid parameters: {e}")),
        };

        let request = DelegationRequest {
            subagent_type: params.subagent_type,
            description: params.description,
            prompt: params.prompt,
            chain: self.chain.clone(),
            permission_mode: ctx.permission_mode,
            cancel: ctx.cancel.clone(),
        };

        match self.delegator.delegate(request).await {
            Ok(output) => {
                let short = format!("{} finished", output.subagent);
                ToolResult::success(
                    json!({
                        "instance_id": output.instance_id,
                        "session_id": output.session_id,
                        "subagent": output.subagent,
                        "output": output.output,
                    })
                    .to_string(),
                )
                .with_short(short)
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    fn format_compact(&self, args: &Value) -> String {
        let label = args
            .get("subagent_type")
            .or_else(|| args.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        format!("Task({label})")
    }
}
