//! Tool system
//!
//! Tools are the actions the model can request. The loop driver depends only
//! on the [`ToolResult`] contract, decoupling it from individual tool
//! implementations; trivial file-system tools live outside the core and are
//! registered by the embedding application.

pub mod shell;
pub mod task;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::model::ToolDescriptor;
use crate::permission::PermissionMode;
use crate::process::BackgroundProcessRegistry;

/// The sole contract between a tool execution and the loop driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Compact one-line form for display surfaces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_result: Option<String>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            error: None,
            short_result: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            content: String::new(),
            error: Some(message),
            short_result: None,
        }
    }

    pub fn with_short(mut self, short: impl Into<String>) -> Self {
        self.short_result = Some(short.into());
        self
    }
}

/// Context threaded into every tool execution.
#[derive(Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub session_id: String,
    pub tool_use_id: String,
    pub process_registry: Option<BackgroundProcessRegistry>,
    /// Foreground shell timeout.
    pub shell_timeout: Duration,
    /// Policy stance of the calling context; subagents inherit it.
    pub permission_mode: PermissionMode,
    /// Cancellation signal of the calling turn; long-running tools (and
    /// nested subagent turns) observe it.
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(working_dir: PathBuf, session_id: impl Into<String>) -> Self {
        Self {
            working_dir,
            session_id: session_id.into(),
            tool_use_id: String::new(),
            process_registry: None,
            shell_timeout: crate::config::defaults::SHELL_TIMEOUT,
            permission_mode: PermissionMode::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_process_registry(mut self, registry: BackgroundProcessRegistry) -> Self {
        self.process_registry = Some(registry);
        self
    }

    pub fn for_call(&self, tool_use_id: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.tool_use_id = tool_use_id.into();
        ctx
    }
}

/// Capability interface every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used by the model to invoke it).
    fn name(&self) -> &str;

    /// Description advertised to the model.
    fn description(&self) -> &str;

    /// JSON schema for parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute with the given arguments.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult;

    /// Compact one-line rendering of a call, e.g. `Bash(ls -la)`.
    fn format_compact(&self, args: &Value) -> String {
        format!("{}({})", self.name(), compact_args(args))
    }

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}

fn compact_args(args: &Value) -> String {
    for key in ["command", "file_path", "path", "description"] {
        if let Some(v) = args.get(key).and_then(Value::as_str) {
            return v.chars().take(80).collect();
        }
    }
    String::new()
}

/// Registry mapping tool name → implementation, looked up at dispatch time.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions advertised to the model.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// A restricted view containing only the named tools. Unknown names are
    /// ignored (the definition may list tools this runtime does not ship).
    pub fn restricted_to(&self, allowed: &[String]) -> ToolRegistry {
        let tools = self
            .tools
            .iter()
            .filter(|(name, _)| allowed.iter().any(|a| a == *name))
            .map(|(name, tool)| (name.clone(), tool.clone()))
            .collect();
        ToolRegistry { tools }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "Echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::success(args["text"].as_str().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let tool = registry.get("Echo").unwrap();
        let ctx = ToolContext::new(PathBuf::from("/tmp"), "s1");
        let result = tool.execute(json!({"text": "hi"}), &ctx).await;
        assert!(result.success);
        assert_eq!(result.content, "hi");

        assert!(registry.get("Nope").is_none());
    }

    #[test]
    fn restricted_view_filters() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let restricted = registry.restricted_to(&["Echo".to_string(), "Ghost".to_string()]);
        assert_eq!(restricted.names(), vec!["Echo"]);

        let none = registry.restricted_to(&[]);
        assert!(none.names().is_empty());
    }

    #[test]
    fn compact_format_uses_salient_arg() {
        let tool = EchoTool;
        assert_eq!(
            tool.format_compact(&json!({"command": "ls -la"})),
            "Echo(ls -la)"
        );
    }
}
