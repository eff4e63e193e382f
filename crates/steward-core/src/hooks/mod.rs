//! Hook configuration
//!
//! Hooks are user-configured shell commands run at lifecycle events. The
//! configuration is loaded once per session from merged project + user
//! settings; project entries take precedence on conflict. Malformed
//! configuration (unknown event, empty command) is a blocking validation
//! error at load time, not at execution time.

pub mod executor;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Lifecycle events hooks can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum HookEvent {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    Stop,
    SubagentStop,
    Notification,
}

impl HookEvent {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SessionStart" => Some(Self::SessionStart),
            "UserPromptSubmit" => Some(Self::UserPromptSubmit),
            "PreToolUse" => Some(Self::PreToolUse),
            "PostToolUse" => Some(Self::PostToolUse),
            "Stop" => Some(Self::Stop),
            "SubagentStop" => Some(Self::SubagentStop),
            "Notification" => Some(Self::Notification),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStart => "SessionStart",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::Stop => "Stop",
            Self::SubagentStop => "SubagentStop",
            Self::Notification => "Notification",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One shell command attached to a matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCommand {
    pub command: String,
    /// Per-command timeout in seconds (default 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Whether remaining hooks still run after this one fails (default true).
    #[serde(
        default = "default_continue_on_failure",
        rename = "continueOnFailure"
    )]
    pub continue_on_failure: bool,
}

fn default_continue_on_failure() -> bool {
    true
}

/// A matcher pattern plus its ordered command list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEntry {
    /// Tool-name pattern: exact, glob (`mcp__*`), or alternation (`A|B`).
    /// Absent matches every occurrence of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    pub hooks: Vec<HookCommand>,
}

impl HookEntry {
    /// Does this entry apply to the event's tool name (when the event
    /// carries one)?
    pub fn matches(&self, tool_name: Option<&str>) -> bool {
        let Some(pattern) = &self.matcher else {
            return true;
        };
        let Some(tool) = tool_name else {
            // Matcher present but the event has no tool: entry is tool
            // scoped, skip it.
            return false;
        };
        matcher_matches(pattern, tool)
    }
}

/// Match a matcher pattern against a tool name: alternation of exact or
/// glob-lite (`*` wildcard) alternatives.
pub fn matcher_matches(pattern: &str, tool: &str) -> bool {
    pattern
        .split('|')
        .map(str::trim)
        .any(|alt| glob_matches(alt, tool))
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    // Segment-wise wildcard scan: every literal segment must appear in
    // order; anchored at the ends unless the pattern starts/ends with `*`.
    let mut rest = value;
    let mut first = true;
    let anchored_end = !pattern.ends_with('*');
    let segments: Vec<&str> = pattern.split('*').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            first = false;
            continue;
        }
        match rest.find(segment) {
            Some(pos) => {
                if first && pos != 0 {
                    return false;
                }
                let end = pos + segment.len();
                if anchored_end && i == segments.len() - 1 {
                    return end == rest.len();
                }
                rest = &rest[end..];
                first = false;
            }
            None => return false,
        }
    }
    true
}

/// The merged per-session hook configuration.
#[derive(Debug, Clone, Default)]
pub struct HookConfig {
    pub(crate) entries: HashMap<HookEvent, Vec<HookEntry>>,
}

impl HookConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entries_for(&self, event: HookEvent) -> &[HookEntry] {
        self.entries.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    /// Load and merge project then user settings. Project entries come
    /// first; a user entry whose (event, matcher) collides with a project
    /// entry is shadowed.
    pub fn load(project_dir: &Path, user_dir: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        config.merge_settings_file(&project_dir.join("settings.json"))?;

        if let Some(user_dir) = user_dir {
            let mut user = Self::default();
            user.merge_settings_file(&user_dir.join("settings.json"))?;
            for (event, entries) in user.entries {
                let existing = config.entries.entry(event).or_default();
                for entry in entries {
                    let shadowed = existing.iter().any(|e| e.matcher == entry.matcher);
                    if !shadowed {
                        existing.push(entry);
                    }
                }
            }
        }

        Ok(config)
    }

    fn merge_settings_file(&mut self, path: &Path) -> Result<()> {
        let Ok(raw) = fs::read_to_string(path) else {
            return Ok(()); // absent file = no hooks
        };
        let doc: Value = serde_json::from_str(&raw)
            .map_err(|e| Error::Hook(format!("{}: invalid settings JSON: {e}", path.display())))?;
        let Some(hooks) = doc.get("hooks") else {
            return Ok(());
        };
        let Some(map) = hooks.as_object() else {
            return Err(Error::Hook(format!(
                "{}: \"hooks\" must be an object",
                path.display()
            )));
        };

        for (event_name, raw_entries) in map {
            let event = HookEvent::parse(event_name).ok_or_else(|| {
                Error::Hook(format!(
                    "{}: unknown hook event {event_name:?}",
                    path.display()
                ))
            })?;
            let entries: Vec<HookEntry> = serde_json::from_value(raw_entries.clone())
                .map_err(|e| {
                    Error::Hook(format!("{}: invalid {event_name} entry: {e}", path.display()))
                })?;
            for entry in &entries {
                for hook in &entry.hooks {
                    if hook.command.trim().is_empty() {
                        return Err(Error::Hook(format!(
                            "{}: empty hook command under {event_name}",
                            path.display()
                        )));
                    }
                }
            }
            self.entries.entry(event).or_default().extend(entries);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn matcher_exact_glob_alternation() {
        assert!(matcher_matches("Write", "Write"));
        assert!(!matcher_matches("Write", "Read"));
        assert!(matcher_matches("Write|Edit", "Edit"));
        assert!(matcher_matches("*", "Anything"));
        assert!(matcher_matches("mcp__*", "mcp__github__search"));
        assert!(!matcher_matches("mcp__*", "Bash"));
        assert!(matcher_matches("*Edit", "MultiEdit"));
        assert!(matcher_matches("Bash|mcp__*", "mcp__db__query"));
    }

    #[test]
    fn entry_without_matcher_matches_everything() {
        let entry = HookEntry {
            matcher: None,
            hooks: Vec::new(),
        };
        assert!(entry.matches(Some("Write")));
        assert!(entry.matches(None));

        let scoped = HookEntry {
            matcher: Some("Write".to_string()),
            hooks: Vec::new(),
        };
        assert!(!scoped.matches(None));
    }

    fn write_settings(dir: &Path, body: &str) {
        fs::write(dir.join("settings.json"), body).unwrap();
    }

    #[test]
    fn load_merges_project_over_user() {
        let project = tempdir().unwrap();
        let user = tempdir().unwrap();
        write_settings(
            project.path(),
            r#"{"hooks":{"PreToolUse":[{"matcher":"Write","hooks":[{"command":"echo project"}]}]}}"#,
        );
        write_settings(
            user.path(),
            r#"{"hooks":{"PreToolUse":[
                {"matcher":"Write","hooks":[{"command":"echo user-shadowed"}]},
                {"matcher":"Bash","hooks":[{"command":"echo user"}]}
            ]}}"#,
        );

        let config = HookConfig::load(project.path(), Some(user.path())).unwrap();
        let entries = config.entries_for(HookEvent::PreToolUse);
        assert_eq!(entries.len(), 2);
        // Project entry wins the Write matcher.
        assert_eq!(entries[0].hooks[0].command, "echo project");
        assert_eq!(entries[1].matcher.as_deref(), Some("Bash"));
    }

    #[test]
    fn load_rejects_unknown_event() {
        let project = tempdir().unwrap();
        write_settings(
            project.path(),
            r#"{"hooks":{"BeforeLunch":[{"hooks":[{"command":"echo hi"}]}]}}"#,
        );
        let result = HookConfig::load(project.path(), None);
        assert!(matches!(result, Err(Error::Hook(_))));
    }

    #[test]
    fn load_rejects_empty_command() {
        let project = tempdir().unwrap();
        write_settings(
            project.path(),
            r#"{"hooks":{"Stop":[{"hooks":[{"command":"  "}]}]}}"#,
        );
        assert!(HookConfig::load(project.path(), None).is_err());
    }

    #[test]
    fn absent_settings_is_empty_config() {
        let project = tempdir().unwrap();
        let config = HookConfig::load(project.path(), None).unwrap();
        assert!(config.is_empty());
    }

    #[test]
    fn continue_on_failure_defaults_true() {
        let entry: HookEntry = serde_json::from_str(
            r#"{"hooks":[{"command":"exit 1"}]}"#,
        )
        .unwrap();
        assert!(entry.hooks[0].continue_on_failure);
    }
}
