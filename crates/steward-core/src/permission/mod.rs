//! Permission policy engine
//!
//! Stateless per-call decisions over {tool name, permission mode, tool input,
//! persisted allow-rules}. Restricted tools are evaluated; everything else is
//! always allowed. Bash commands are decomposed into atomic commands first
//! ([`bash`]); safe atomics are always allowed and never persisted.
//!
//! When no rule decides in default mode, the engine parks the call as a
//! pending request on a channel and waits for the reply — the UI layer
//! resolves it asynchronously, and the reply may also switch the permission
//! mode or persist new rules.

pub mod bash;
pub mod rules;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::Result;
use rules::{PermissionRule, RuleStore};

/// The current policy stance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    BypassPermissions,
    AcceptEdits,
    Plan,
}

/// Tools whose side effects require approval before execution.
pub const RESTRICTED_TOOLS: &[&str] = &[
    "Edit",
    "MultiEdit",
    "Delete",
    "Write",
    "Bash",
    "ExitPlanMode",
    "AskUser",
];

pub fn is_restricted(tool: &str) -> bool {
    RESTRICTED_TOOLS.contains(&tool)
}

const EDIT_FAMILY: &[&str] = &["Edit", "MultiEdit", "Write", "Delete"];

/// The engine's verdict for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct PermissionOutcome {
    pub behavior: PermissionBehavior,
    pub message: Option<String>,
}

impl PermissionOutcome {
    fn allow() -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            message: None,
        }
    }

    fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            message: Some(message.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.behavior == PermissionBehavior::Allow
    }
}

/// A pending user decision, parked until the UI resolves it.
#[derive(Debug)]
pub struct PermissionPrompt {
    pub tool_name: String,
    pub input: Value,
    /// Resume function: complete the prompt by sending the reply.
    pub reply_tx: oneshot::Sender<PermissionReply>,
}

/// The user's resolution of a pending prompt.
#[derive(Debug, Clone)]
pub enum PermissionReply {
    Allow {
        /// Persist a durable "don't ask again" rule for this input.
        remember: bool,
        /// Optionally switch the permission mode going forward.
        mode_change: Option<PermissionMode>,
    },
    Deny {
        message: Option<String>,
    },
}

/// Sender half handed to the engine; the UI owns the receiver.
pub type PromptSender = mpsc::UnboundedSender<PermissionPrompt>;
pub type PromptReceiver = mpsc::UnboundedReceiver<PermissionPrompt>;

pub fn prompt_channel() -> (PromptSender, PromptReceiver) {
    mpsc::unbounded_channel()
}

/// The permission policy engine.
pub struct PermissionEngine {
    mode: PermissionMode,
    workdir: PathBuf,
    rule_store: RuleStore,
    prompt_tx: PromptSender,
}

impl PermissionEngine {
    pub fn new(
        mode: PermissionMode,
        workdir: PathBuf,
        settings_dir: &std::path::Path,
        prompt_tx: PromptSender,
    ) -> Self {
        Self {
            mode,
            workdir,
            rule_store: RuleStore::load(settings_dir),
            prompt_tx,
        }
    }

    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PermissionMode) {
        if self.mode != mode {
            info!(from = ?self.mode, to = ?mode, "Permission mode changed");
            self.mode = mode;
        }
    }

    pub fn rules(&self) -> &[PermissionRule] {
        self.rule_store.rules()
    }

    /// Evaluate one tool call. May suspend on the pending-prompt rendezvous.
    pub async fn evaluate(&mut self, tool_name: &str, input: &Value) -> PermissionOutcome {
        if !is_restricted(tool_name) {
            return PermissionOutcome::allow();
        }

        match self.mode {
            PermissionMode::BypassPermissions => PermissionOutcome::allow(),
            PermissionMode::Plan => self.evaluate_plan(tool_name, input).await,
            PermissionMode::AcceptEdits if EDIT_FAMILY.contains(&tool_name) => {
                PermissionOutcome::allow()
            }
            PermissionMode::AcceptEdits | PermissionMode::Default => {
                self.evaluate_default(tool_name, input).await
            }
        }
    }

    async fn evaluate_plan(&mut self, tool_name: &str, input: &Value) -> PermissionOutcome {
        match tool_name {
            "Bash" => {
                let command = command_of(input);
                let all_safe = bash::split_atomic_commands(command)
                    .iter()
                    .all(|atomic| bash::is_safe_command(atomic, &self.workdir));
                if all_safe {
                    PermissionOutcome::allow()
                } else {
                    PermissionOutcome::deny(
                        "Mutating bash commands are blocked in plan mode; exit plan mode first",
                    )
                }
            }
            // Confirming the plan is exactly what plan mode is for.
            "ExitPlanMode" | "AskUser" => self.prompt_user(tool_name, input).await,
            _ => PermissionOutcome::deny(format!(
                "Tool '{tool_name}' is blocked in plan mode; exit plan mode first"
            )),
        }
    }

    async fn evaluate_default(&mut self, tool_name: &str, input: &Value) -> PermissionOutcome {
        if tool_name == "Bash" {
            let command = command_of(input);
            let atomics = bash::split_atomic_commands(command);

            let unsafe_atomics: Vec<String> = atomics
                .iter()
                .filter(|a| !bash::is_safe_command(a, &self.workdir))
                .cloned()
                .collect();

            // Every atomic part benign: always allowed, never persisted.
            if unsafe_atomics.is_empty() {
                debug!(command, "Bash command classified safe");
                return PermissionOutcome::allow();
            }

            // Each non-safe part must be covered by a persisted rule.
            let all_covered = unsafe_atomics.iter().all(|atomic| {
                self.rule_store
                    .is_allowed("Bash", &bash::normalize_command(atomic))
            });
            if all_covered {
                return PermissionOutcome::allow();
            }
        } else if self.rule_store.is_allowed(tool_name, &input_value(input)) {
            return PermissionOutcome::allow();
        }

        self.prompt_user(tool_name, input).await
    }

    /// Explicitly route a call to the user prompt, regardless of rules.
    /// Used when a PreToolUse hook answers `ask`.
    pub async fn ask_user(&mut self, tool_name: &str, input: &Value) -> PermissionOutcome {
        self.prompt_user(tool_name, input).await
    }

    /// Park the call as a pending request and await the user's resolution.
    async fn prompt_user(&mut self, tool_name: &str, input: &Value) -> PermissionOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        let prompt = PermissionPrompt {
            tool_name: tool_name.to_string(),
            input: input.clone(),
            reply_tx,
        };
        if self.prompt_tx.send(prompt).is_err() {
            return PermissionOutcome::deny("No permission prompt handler available");
        }

        match reply_rx.await {
            Ok(PermissionReply::Allow {
                remember,
                mode_change,
            }) => {
                if let Some(mode) = mode_change {
                    self.set_mode(mode);
                }
                if remember
                    && let Err(e) = self.remember(tool_name, input)
                {
                    tracing::warn!("Failed to persist permission rules: {e}");
                }
                PermissionOutcome::allow()
            }
            Ok(PermissionReply::Deny { message }) => PermissionOutcome::deny(
                message.unwrap_or_else(|| "Denied by user".to_string()),
            ),
            Err(_) => PermissionOutcome::deny("Permission prompt abandoned"),
        }
    }

    /// Persist a durable grant. For Bash the original compound string is
    /// never stored: one rule per non-safe atomic command, deduplicated, so
    /// future occurrences of any sub-command match alone or in other chains.
    fn remember(&mut self, tool_name: &str, input: &Value) -> Result<()> {
        let new_rules = if tool_name == "Bash" {
            bash::rules_for_command(command_of(input), &self.workdir)
                .into_iter()
                .map(|value| PermissionRule::new("Bash", value))
                .collect()
        } else {
            vec![PermissionRule::new(tool_name, input_value(input))]
        };
        if new_rules.is_empty() {
            return Ok(());
        }
        info!(tool = tool_name, count = new_rules.len(), "Persisting permission rules");
        self.rule_store.add_rules(new_rules)
    }
}

fn command_of(input: &Value) -> &str {
    input.get("command").and_then(Value::as_str).unwrap_or("")
}

/// Normalized rule value for non-bash tools: the target path when present,
/// otherwise a bare-tool wildcard.
fn input_value(input: &Value) -> String {
    input
        .get("file_path")
        .or_else(|| input.get("path"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "*".to_string())
}
