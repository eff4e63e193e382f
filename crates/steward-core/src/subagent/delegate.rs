//! Subagent delegation
//!
//! Each delegation creates an isolated {message state, loop driver} pair:
//! its own session file (type `subagent`, parent id recorded), a tool set
//! restricted to the definition's declared tools, and an optional model
//! override. Only the final assistant output crosses the isolation boundary;
//! the sub-conversation stays on disk for display.
//!
//! A delegation chain is threaded explicitly through nested delegations so a
//! subagent can never transitively re-invoke itself or an ancestor, and the
//! overall depth stays capped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::driver::{LoopDriver, LoopFlags, RunEnd};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::hooks::executor::{self, HookInvocation};
use crate::hooks::{HookConfig, HookEvent};
use crate::model::ModelService;
use crate::permission::{PermissionEngine, PermissionMode, PromptSender};
use crate::process::{BackgroundProcessRegistry, TaskStatus};
use crate::session::{Block, MessageRole, MessageState, RestorePolicy, SessionType};
use crate::tools::ToolRegistry;

use super::{ModelChoice, SubagentRegistry};

/// Explicit ancestor list threaded through nested delegations.
#[derive(Debug, Clone)]
pub struct DelegationChain {
    ancestors: Vec<String>,
    max_depth: usize,
}

impl DelegationChain {
    pub fn root(max_depth: usize) -> Self {
        Self {
            ancestors: Vec::new(),
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.ancestors.len()
    }

    /// Extend the chain for a nested delegation. Re-entering an ancestor or
    /// exceeding the depth cap fails the Task call.
    pub fn child(&self, name: &str) -> Result<Self> {
        if self.ancestors.iter().any(|a| a == name) {
            return Err(Error::Delegation(format!(
                "circular delegation: {name:?} is already in the delegation chain ({})",
                self.ancestors.join(" -> ")
            )));
        }
        if self.ancestors.len() >= self.max_depth {
            return Err(Error::Delegation(format!(
                "delegation depth limit ({}) reached",
                self.max_depth
            )));
        }
        let mut ancestors = self.ancestors.clone();
        ancestors.push(name.to_string());
        Ok(Self {
            ancestors,
            max_depth: self.max_depth,
        })
    }
}

/// Lifecycle status of a subagent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Active,
    Completed,
    Error,
    Aborted,
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub id: String,
    pub subagent: String,
    pub session_id: String,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
}

/// Everything a nested driver needs, cloned from the parent agent.
#[derive(Clone)]
pub struct SubagentServices {
    pub model: Arc<dyn ModelService>,
    /// The parent's full tool set; restricted per definition.
    pub tools: ToolRegistry,
    pub hooks: Arc<HookConfig>,
    pub config: Arc<AgentConfig>,
    pub process_registry: BackgroundProcessRegistry,
    pub prompt_tx: PromptSender,
    pub settings_dir: PathBuf,
}

/// A resolved delegation request.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    /// Exact subagent name, when the caller specifies one.
    pub subagent_type: Option<String>,
    /// Short task description, used for selection when no name is given.
    pub description: String,
    /// The full task prompt for the subagent.
    pub prompt: String,
    pub chain: DelegationChain,
    pub permission_mode: PermissionMode,
    /// Cancellation signal of the delegating turn.
    pub cancel: CancellationToken,
}

/// What crosses back over the isolation boundary.
#[derive(Debug, Clone)]
pub struct DelegationOutput {
    pub instance_id: String,
    pub session_id: String,
    pub subagent: String,
    pub output: String,
}

/// Creates and runs isolated subagent instances.
pub struct SubagentDelegator {
    registry: SubagentRegistry,
    services: SubagentServices,
    parent_session_id: String,
    instances: Arc<RwLock<HashMap<String, InstanceSnapshot>>>,
}

impl SubagentDelegator {
    pub fn new(
        registry: SubagentRegistry,
        services: SubagentServices,
        parent_session_id: String,
    ) -> Self {
        Self {
            registry,
            services,
            parent_session_id,
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &SubagentRegistry {
        &self.registry
    }

    pub async fn instances(&self) -> Vec<InstanceSnapshot> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn instance(&self, id: &str) -> Option<InstanceSnapshot> {
        self.instances.read().await.get(id).cloned()
    }

    /// Run a delegated task to completion in an isolated context.
    pub async fn delegate(self: &Arc<Self>, request: DelegationRequest) -> Result<DelegationOutput> {
        let definition = self
            .registry
            .select(request.subagent_type.as_deref(), &request.description)?
            .clone();
        let chain = request.chain.child(&definition.name)?;

        let instance_id = uuid::Uuid::new_v4().to_string();
        let mut state = MessageState::open(
            &self.services.config.sessions_dir,
            &self.services.config.workdir,
            SessionType::Subagent,
            Some(self.parent_session_id.clone()),
            RestorePolicy::New,
        )?;
        let session_id = state.session_id().to_string();

        info!(
            instance_id = %instance_id,
            subagent = %definition.name,
            session_id = %session_id,
            depth = chain.depth(),
            "Delegating to subagent"
        );

        self.instances.write().await.insert(
            instance_id.clone(),
            InstanceSnapshot {
                id: instance_id.clone(),
                subagent: definition.name.clone(),
                session_id: session_id.clone(),
                status: InstanceStatus::Active,
                started_at: Utc::now(),
            },
        );
        self.services
            .process_registry
            .register_subagent(instance_id.clone(), request.description.clone())
            .await;

        let result = self.run_instance(&definition, &request, chain, &mut state).await;

        let (status, task_status) = match &result {
            Ok(_) => (
                InstanceStatus::Completed,
                TaskStatus::Completed { exit_code: 0 },
            ),
            Err(Error::Cancelled) => (InstanceStatus::Aborted, TaskStatus::Killed),
            Err(e) => (
                InstanceStatus::Error,
                TaskStatus::Failed {
                    error: e.to_string(),
                },
            ),
        };
        if let Some(snapshot) = self.instances.write().await.get_mut(&instance_id) {
            snapshot.status = status;
        }
        self.services
            .process_registry
            .update_status(&instance_id, task_status)
            .await;

        // SubagentStop hooks observe the instance's own session.
        let invocation = HookInvocation::new(
            state.session_id(),
            state.transcript_path(),
            state.workdir(),
            HookEvent::SubagentStop,
        )
        .with_subagent_type(&definition.name);
        let outcome = executor::run_event(
            &self.services.hooks,
            &invocation,
            self.services.config.hook_timeout,
        )
        .await;
        if let Some(reason) = outcome.blocked {
            warn!(subagent = %definition.name, "SubagentStop hook reported: {reason}");
        }

        result.map(|output| DelegationOutput {
            instance_id,
            session_id,
            subagent: definition.name,
            output,
        })
    }

    async fn run_instance(
        self: &Arc<Self>,
        definition: &super::SubagentDefinition,
        request: &DelegationRequest,
        chain: DelegationChain,
        state: &mut MessageState,
    ) -> Result<String> {
        // Restrict the tool set to the declared subset; absence inherits the
        // full parent set. The Task tool is re-registered with the extended
        // chain so nested delegation stays guarded.
        let mut tools = match &definition.tools {
            Some(allowed) => self.services.tools.restricted_to(allowed),
            None => self.services.tools.clone(),
        };
        tools.register(Arc::new(crate::tools::task::TaskTool::new(
            Arc::clone(self),
            chain,
        )));

        let mut permissions = PermissionEngine::new(
            request.permission_mode,
            self.services.config.workdir.clone(),
            &self.services.settings_dir,
            self.services.prompt_tx.clone(),
        );

        // Events of the nested loop are not merged into the parent's stream;
        // the sub-session file is the record.
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        let driver = LoopDriver {
            model: Arc::clone(&self.services.model),
            tools,
            hooks: Arc::clone(&self.services.hooks),
            config: Arc::clone(&self.services.config),
            process_registry: self.services.process_registry.clone(),
            event_tx,
            cancel: request.cancel.child_token(),
            flags: Arc::new(LoopFlags::default()),
            system_prompt: Some(definition.system_prompt.clone()),
            model_override: match &definition.model {
                ModelChoice::Inherit => None,
                ModelChoice::Named(model) => Some(model.clone()),
            },
        };

        state.add_user_message(&request.prompt, Vec::new())?;
        match driver.run(state, &mut permissions).await? {
            RunEnd::Completed => Ok(final_assistant_text(state)),
            RunEnd::Aborted => Err(Error::Cancelled),
        }
    }
}

/// The final assistant output of an instance: text blocks of the last
/// assistant message.
fn final_assistant_text(state: &MessageState) -> String {
    state
        .messages()
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
        .map(|m| {
            m.blocks
                .iter()
                .filter_map(|b| match b {
                    Block::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
