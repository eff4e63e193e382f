//! Agent composition root
//!
//! Wires the session state, permission engine, hook engine, subagent
//! delegator, background process registry, and the tool-calling loop driver
//! behind one lifecycle: create (fail-fast), dispatch input, abort, destroy.

pub mod compact;
pub mod driver;
pub mod events;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{self, AgentConfig};
use crate::error::{Error, Result};
use crate::hooks::executor::{self, HookInvocation};
use crate::hooks::{HookConfig, HookEvent};
use crate::model::ModelService;
use crate::permission::{
    PermissionEngine, PermissionMode, PromptReceiver, prompt_channel,
};
use crate::process::BackgroundProcessRegistry;
use crate::session::{Attachment, MessageState, RestorePolicy, SessionType};
use crate::subagent::SubagentRegistry;
use crate::subagent::delegate::{DelegationChain, SubagentDelegator, SubagentServices};
use crate::tools::shell::{BashTool, KillTaskTool, TaskOutputTool};
use crate::tools::task::TaskTool;
use crate::tools::ToolRegistry;

use driver::{LoopDriver, LoopFlags, RunEnd};
use events::LoopEvent;

/// Channels the embedding layer consumes: loop events for display, pending
/// permission prompts to resolve.
pub struct AgentHandles {
    pub events: mpsc::UnboundedReceiver<LoopEvent>,
    pub prompts: PromptReceiver,
}

/// The top-level agent for one session.
pub struct Agent {
    config: Arc<AgentConfig>,
    state: MessageState,
    permissions: PermissionEngine,
    driver: LoopDriver,
    delegator: Arc<SubagentDelegator>,
    process_registry: BackgroundProcessRegistry,
    hooks: Arc<HookConfig>,
    event_tx: mpsc::UnboundedSender<LoopEvent>,
    flags: Arc<LoopFlags>,
    /// Fires when the agent is destroyed; every dispatch token derives from
    /// it.
    destroy_token: CancellationToken,
    /// Cancellation token of the current (or most recent) dispatch.
    current_abort: Arc<Mutex<CancellationToken>>,
    destroyed: bool,
}

/// Cloneable handle for aborting the agent's active dispatch from another
/// task. Aborting is idempotent.
#[derive(Clone)]
pub struct AbortHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.current.lock().cancel();
    }
}

impl Agent {
    /// Create the agent. Configuration problems — including malformed hook
    /// configuration — fail here; the agent is never half-built.
    pub async fn new(
        config: AgentConfig,
        model: Arc<dyn ModelService>,
        restore: RestorePolicy,
        initial_mode: PermissionMode,
        extra_tools: Vec<Arc<dyn crate::tools::Tool>>,
    ) -> Result<(Self, AgentHandles)> {
        let config = Arc::new(config);
        let project_dir = config::project_config_dir(&config.workdir);
        let user_dir = config::user_config_dir();

        let hooks = Arc::new(HookConfig::load(&project_dir, user_dir.as_deref())?);

        let state = MessageState::open(
            &config.sessions_dir,
            &config.workdir,
            SessionType::Main,
            None,
            restore,
        )?;

        let (prompt_tx, prompt_rx) = prompt_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let permissions = PermissionEngine::new(
            initial_mode,
            config.workdir.clone(),
            &project_dir,
            prompt_tx.clone(),
        );

        let process_registry = BackgroundProcessRegistry::new();

        let mut base_tools = ToolRegistry::new();
        base_tools.register(Arc::new(BashTool));
        base_tools.register(Arc::new(TaskOutputTool));
        base_tools.register(Arc::new(KillTaskTool));
        for tool in extra_tools {
            base_tools.register(tool);
        }

        let subagents = SubagentRegistry::discover(&project_dir, user_dir.as_deref());
        if subagents.is_empty() {
            info!("No subagent definitions found");
        }
        let delegator = Arc::new(SubagentDelegator::new(
            subagents,
            SubagentServices {
                model: Arc::clone(&model),
                tools: base_tools.clone(),
                hooks: Arc::clone(&hooks),
                config: Arc::clone(&config),
                process_registry: process_registry.clone(),
                prompt_tx,
                settings_dir: project_dir.clone(),
            },
            state.session_id().to_string(),
        ));

        let mut tools = base_tools;
        tools.register(Arc::new(TaskTool::new(
            Arc::clone(&delegator),
            DelegationChain::root(config.max_delegation_depth),
        )));

        let destroy_token = CancellationToken::new();
        let flags = Arc::new(LoopFlags::default());
        let driver = LoopDriver {
            model,
            tools,
            hooks: Arc::clone(&hooks),
            config: Arc::clone(&config),
            process_registry: process_registry.clone(),
            event_tx: event_tx.clone(),
            cancel: destroy_token.child_token(),
            flags: Arc::clone(&flags),
            system_prompt: None,
            model_override: None,
        };

        let agent = Self {
            config,
            state,
            permissions,
            driver,
            delegator,
            process_registry,
            hooks,
            event_tx,
            flags,
            destroy_token: destroy_token.clone(),
            current_abort: Arc::new(Mutex::new(destroy_token.child_token())),
            destroyed: false,
        };

        agent.run_session_start_hooks().await;

        Ok((
            agent,
            AgentHandles {
                events: event_rx,
                prompts: prompt_rx,
            },
        ))
    }

    pub fn session_id(&self) -> &str {
        self.state.session_id()
    }

    pub fn messages(&self) -> &[crate::session::Message] {
        self.state.messages()
    }

    pub fn permission_mode(&self) -> PermissionMode {
        self.permissions.mode()
    }

    pub fn set_permission_mode(&mut self, mode: PermissionMode) {
        self.permissions.set_mode(mode);
    }

    pub fn is_loading(&self) -> bool {
        self.flags.is_loading()
    }

    pub fn is_compressing(&self) -> bool {
        self.flags.is_compressing()
    }

    pub fn process_registry(&self) -> &BackgroundProcessRegistry {
        &self.process_registry
    }

    pub fn delegator(&self) -> &Arc<SubagentDelegator> {
        &self.delegator
    }

    /// Append a durable memory note to the conversation.
    pub fn add_memory(&mut self, content: &str) -> Result<()> {
        self.state.add_memory_block(content)
    }

    /// Drop the conversation, keeping the session.
    pub fn clear_messages(&mut self) -> Result<()> {
        self.state.clear_messages()
    }

    /// Dispatch one user input: append the message, run the hook gates, and
    /// drive the loop until the model stops requesting tools or the dispatch
    /// is aborted.
    pub async fn dispatch(
        &mut self,
        input: &str,
        attachments: Vec<Attachment>,
    ) -> Result<RunEnd> {
        if self.destroyed {
            return Err(Error::Agent("agent has been destroyed".to_string()));
        }

        // Fresh token per dispatch; abort() cancels exactly this one.
        let cancel = self.destroy_token.child_token();
        *self.current_abort.lock() = cancel.clone();
        self.driver.cancel = cancel;

        // UserPromptSubmit hooks run before the message is committed; a
        // block decision rejects the prompt outright.
        let invocation = HookInvocation::new(
            self.state.session_id(),
            self.state.transcript_path(),
            self.state.workdir(),
            HookEvent::UserPromptSubmit,
        )
        .with_user_prompt(input);
        let outcome =
            executor::run_event(&self.hooks, &invocation, self.config.hook_timeout).await;
        for message in &outcome.system_messages {
            let _ = self.event_tx.send(LoopEvent::SystemMessage {
                message: message.clone(),
            });
        }
        if let Some(reason) = outcome.blocked.or(outcome.stop_reason) {
            return Err(Error::Hook(format!("prompt blocked: {reason}")));
        }

        let content = if outcome.context.is_empty() {
            input.to_string()
        } else {
            format!("{input}\n\n{}", outcome.context.join("\n\n"))
        };
        self.state.add_user_message(&content, attachments)?;

        let end = self
            .driver
            .run(&mut self.state, &mut self.permissions)
            .await?;

        if end == RunEnd::Completed {
            self.run_stop_hooks().await;
        }
        Ok(end)
    }

    /// Abort the active dispatch: stops the model stream, fails the
    /// in-flight tool block, leaves committed blocks intact. Idempotent —
    /// a second call has no additional observable effect.
    pub fn abort(&self) {
        self.current_abort.lock().cancel();
    }

    /// A handle other tasks can use to abort the active dispatch.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            current: Arc::clone(&self.current_abort),
        }
    }

    /// Abort everything and force-terminate all background processes. The
    /// agent accepts no further dispatches.
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.destroy_token.cancel();
        self.process_registry.kill_all().await;
        if let Err(e) = self.state.save_session() {
            warn!("Failed to flush session on destroy: {e}");
        }
        info!(session_id = %self.state.session_id(), "Agent destroyed");
    }

    /// Fire Notification hooks for an out-of-band notification.
    pub async fn notify(&self, message: &str, notification_type: &str) {
        let mut invocation = HookInvocation::new(
            self.state.session_id(),
            self.state.transcript_path(),
            self.state.workdir(),
            HookEvent::Notification,
        );
        invocation.message = Some(message.to_string());
        invocation.notification_type = Some(notification_type.to_string());
        let outcome =
            executor::run_event(&self.hooks, &invocation, self.config.hook_timeout).await;
        for message in outcome.system_messages {
            let _ = self.event_tx.send(LoopEvent::SystemMessage { message });
        }
    }

    async fn run_session_start_hooks(&self) {
        let invocation = HookInvocation::new(
            self.state.session_id(),
            self.state.transcript_path(),
            self.state.workdir(),
            HookEvent::SessionStart,
        );
        let outcome =
            executor::run_event(&self.hooks, &invocation, self.config.hook_timeout).await;
        for message in outcome.system_messages {
            let _ = self.event_tx.send(LoopEvent::SystemMessage { message });
        }
    }

    async fn run_stop_hooks(&self) {
        let invocation = HookInvocation::new(
            self.state.session_id(),
            self.state.transcript_path(),
            self.state.workdir(),
            HookEvent::Stop,
        );
        let outcome =
            executor::run_event(&self.hooks, &invocation, self.config.hook_timeout).await;
        if let Some(reason) = outcome.blocked {
            // The turn already ended; surface the hook's objection.
            let _ = self.event_tx.send(LoopEvent::SystemMessage {
                message: format!("Stop hook: {reason}"),
            });
        }
    }
}
