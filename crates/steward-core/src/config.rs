//! Agent configuration
//!
//! All tunables are resolved exactly once, at construction time, with the
//! precedence: explicit constructor arguments → environment fallback →
//! built-in default. The resolved struct is then threaded through every
//! component; nothing else in the crate reads process state.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Environment fallbacks consulted by [`AgentConfig::resolve`].
pub mod env_keys {
    pub const SESSIONS_DIR: &str = "STEWARD_SESSIONS_DIR";
    pub const MAX_TURNS: &str = "STEWARD_MAX_TURNS";
    pub const COMPACT_THRESHOLD: &str = "STEWARD_COMPACT_THRESHOLD_TOKENS";
    pub const HOOK_TIMEOUT_MS: &str = "STEWARD_HOOK_TIMEOUT_MS";
}

/// Built-in defaults for unset values.
pub mod defaults {
    use std::time::Duration;

    /// Maximum agentic turns per user message.
    pub const MAX_TURNS: usize = 50;
    /// Cumulative token count that triggers a compaction pass.
    pub const COMPACT_THRESHOLD_TOKENS: usize = 120_000;
    /// Per-command hook timeout.
    pub const HOOK_TIMEOUT: Duration = Duration::from_secs(10);
    /// Foreground shell timeout.
    pub const SHELL_TIMEOUT: Duration = Duration::from_secs(120);
    /// Maximum characters of a tool result fed back to the model.
    pub const MAX_TOOL_RESULT_CHARS: usize = 30_000;
    /// Maximum subagent delegation depth.
    pub const MAX_DELEGATION_DEPTH: usize = 3;
}

/// Resolved configuration for one [`crate::agent::Agent`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Working directory the session operates in.
    pub workdir: PathBuf,
    /// Directory holding session transcript files.
    pub sessions_dir: PathBuf,
    /// Maximum agentic turns per user message.
    pub max_turns: usize,
    /// Cumulative token usage that triggers history compaction.
    pub compact_threshold_tokens: usize,
    /// Default per-command hook timeout.
    pub hook_timeout: std::time::Duration,
    /// Default foreground shell timeout.
    pub shell_timeout: std::time::Duration,
    /// Maximum characters of a tool result fed back to the model.
    pub max_tool_result_chars: usize,
    /// Maximum subagent delegation depth.
    pub max_delegation_depth: usize,
    /// Model identifier handed to the model service. Empty is invalid.
    pub model: String,
}

/// Unresolved constructor arguments. Any `None` falls back to the
/// environment, then to the built-in default.
#[derive(Debug, Clone, Default)]
pub struct AgentConfigBuilder {
    pub workdir: Option<PathBuf>,
    pub sessions_dir: Option<PathBuf>,
    pub max_turns: Option<usize>,
    pub compact_threshold_tokens: Option<usize>,
    pub hook_timeout: Option<std::time::Duration>,
    pub shell_timeout: Option<std::time::Duration>,
    pub max_tool_result_chars: Option<usize>,
    pub max_delegation_depth: Option<usize>,
    pub model: Option<String>,
}

impl AgentConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn sessions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sessions_dir = Some(dir.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn max_turns(mut self, n: usize) -> Self {
        self.max_turns = Some(n);
        self
    }

    pub fn compact_threshold_tokens(mut self, n: usize) -> Self {
        self.compact_threshold_tokens = Some(n);
        self
    }

    /// Resolve into a validated [`AgentConfig`]. Invalid values fail here,
    /// not at first use.
    pub fn resolve(self) -> Result<AgentConfig> {
        let workdir = match self.workdir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(|e| Error::Config(format!("cannot determine working directory: {e}")))?,
        };

        let sessions_dir = self
            .sessions_dir
            .or_else(|| std::env::var(env_keys::SESSIONS_DIR).ok().map(PathBuf::from))
            .unwrap_or_else(default_sessions_dir);

        let max_turns = resolve_numeric(self.max_turns, env_keys::MAX_TURNS, defaults::MAX_TURNS)?;
        if max_turns == 0 {
            return Err(Error::Config("max_turns must be at least 1".to_string()));
        }

        let compact_threshold_tokens = resolve_numeric(
            self.compact_threshold_tokens,
            env_keys::COMPACT_THRESHOLD,
            defaults::COMPACT_THRESHOLD_TOKENS,
        )?;
        if compact_threshold_tokens == 0 {
            return Err(Error::Config(
                "compact_threshold_tokens must be positive".to_string(),
            ));
        }

        let hook_timeout = match self.hook_timeout {
            Some(t) => t,
            None => match std::env::var(env_keys::HOOK_TIMEOUT_MS) {
                Ok(raw) => {
                    let ms: u64 = raw.parse().map_err(|_| {
                        Error::Config(format!(
                            "{} must be an integer, got {raw:?}",
                            env_keys::HOOK_TIMEOUT_MS
                        ))
                    })?;
                    std::time::Duration::from_millis(ms)
                }
                Err(_) => defaults::HOOK_TIMEOUT,
            },
        };
        if hook_timeout.is_zero() {
            return Err(Error::Config("hook timeout must be positive".to_string()));
        }

        let model = self
            .model
            .ok_or_else(|| Error::Config("model must be configured".to_string()))?;
        if model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".to_string()));
        }

        Ok(AgentConfig {
            workdir,
            sessions_dir,
            max_turns,
            compact_threshold_tokens,
            hook_timeout,
            shell_timeout: self.shell_timeout.unwrap_or(defaults::SHELL_TIMEOUT),
            max_tool_result_chars: self
                .max_tool_result_chars
                .unwrap_or(defaults::MAX_TOOL_RESULT_CHARS),
            max_delegation_depth: self
                .max_delegation_depth
                .unwrap_or(defaults::MAX_DELEGATION_DEPTH),
            model,
        })
    }
}

fn resolve_numeric(explicit: Option<usize>, env_key: &str, default: usize) -> Result<usize> {
    if let Some(v) = explicit {
        return Ok(v);
    }
    match std::env::var(env_key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{env_key} must be an integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}

/// Default transcript directory: platform data dir, falling back to a
/// dot-directory next to the process.
pub fn default_sessions_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("steward"))
        .unwrap_or_else(|| PathBuf::from(".steward"))
        .join("sessions")
}

/// Project-level settings directory for a workdir.
pub fn project_config_dir(workdir: &std::path::Path) -> PathBuf {
    workdir.join(".steward")
}

/// User-level settings directory.
pub fn user_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".steward"))
}
