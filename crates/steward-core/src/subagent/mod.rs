//! Subagent definitions and discovery
//!
//! Subagents are defined via markdown files with YAML frontmatter:
//!
//! ```markdown
//! ---
//! name: code-reviewer
//! description: Reviews diffs for correctness. Use proactively after edits.
//! tools: Read, Grep, Bash
//! model: inherit
//! ---
//!
//! You are a meticulous code reviewer...
//! ```
//!
//! Definitions load from the project directory (`.steward/agents/`) then the
//! user directory (`~/.steward/agents/`); a project definition shadows a
//! user definition of the same name.

pub mod delegate;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Where a definition was loaded from. Project shadows user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionScope {
    Project,
    User,
}

/// Model selection for a subagent: an alias handed to the model service, or
/// inherit the parent's model.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ModelChoice {
    #[default]
    Inherit,
    Named(String),
}

impl ModelChoice {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "inherit" => ModelChoice::Inherit,
            other => ModelChoice::Named(other.to_string()),
        }
    }
}

/// One parsed subagent definition.
#[derive(Debug, Clone)]
pub struct SubagentDefinition {
    /// Unique lowercase-hyphen name (the `subagent_type` parameter).
    pub name: String,
    pub description: String,
    /// Allowed tool subset; `None` inherits the full parent set.
    pub tools: Option<Vec<String>>,
    pub model: ModelChoice,
    /// Markdown body, used verbatim as the system prompt.
    pub system_prompt: String,
    pub source_path: Option<PathBuf>,
    pub scope: DefinitionScope,
}

/// Parse a definition document (frontmatter + body).
pub fn parse_definition(
    content: &str,
    source_path: Option<PathBuf>,
    scope: DefinitionScope,
) -> Result<SubagentDefinition> {
    let (metadata, body) = split_frontmatter(content)?;

    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Delegation("subagent definition missing 'name'".to_string()))?
        .to_string();
    if !is_valid_name(&name) {
        return Err(Error::Delegation(format!(
            "invalid subagent name {name:?}: lowercase letters, digits and hyphens only"
        )));
    }

    let description = metadata
        .get("description")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::Delegation(format!("subagent {name:?} missing 'description'"))
        })?
        .to_string();

    let tools = metadata.get("tools").map(parse_tool_list).filter(|t| !t.is_empty());
    let model = metadata
        .get("model")
        .and_then(Value::as_str)
        .map(ModelChoice::parse)
        .unwrap_or_default();

    Ok(SubagentDefinition {
        name,
        description,
        tools,
        model,
        system_prompt: body,
        source_path,
        scope,
    })
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Split YAML frontmatter from the markdown body.
fn split_frontmatter(content: &str) -> Result<(HashMap<String, Value>, String)> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return Err(Error::Delegation(
            "subagent definition has no frontmatter header".to_string(),
        ));
    }
    let after = trimmed[3..].trim_start_matches(['\r', '\n']);
    let Some(end) = find_closing_delimiter(after) else {
        return Err(Error::Delegation(
            "unterminated frontmatter header".to_string(),
        ));
    };
    let yaml = &after[..end];
    let body = after[end + 3..].trim_start_matches(['\r', '\n']).to_string();

    let parsed: serde_yml::Value = serde_yml::from_str(yaml)
        .map_err(|e| Error::Delegation(format!("invalid frontmatter YAML: {e}")))?;
    let json = serde_json::to_value(parsed)
        .map_err(|e| Error::Delegation(format!("invalid frontmatter: {e}")))?;
    match json {
        Value::Object(map) => Ok((map.into_iter().collect(), body)),
        Value::Null => Ok((HashMap::new(), body)),
        _ => Err(Error::Delegation(
            "frontmatter must be a YAML mapping".to_string(),
        )),
    }
}

fn find_closing_delimiter(input: &str) -> Option<usize> {
    let mut pos = 0;
    for line in input.lines() {
        if line.trim() == "---" {
            return Some(pos);
        }
        pos += line.len() + 1;
    }
    None
}

/// Tool list from a comma-separated string or a YAML sequence.
fn parse_tool_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// The discovered set of subagent definitions.
#[derive(Debug, Clone, Default)]
pub struct SubagentRegistry {
    definitions: Vec<SubagentDefinition>,
}

impl SubagentRegistry {
    pub fn from_definitions(definitions: Vec<SubagentDefinition>) -> Self {
        Self { definitions }
    }

    /// Scan project-level then user-level definition directories. On a name
    /// collision the project definition wins.
    pub fn discover(project_dir: &Path, user_dir: Option<&Path>) -> Self {
        let mut definitions = load_dir(&project_dir.join("agents"), DefinitionScope::Project);
        if let Some(user_dir) = user_dir {
            for definition in load_dir(&user_dir.join("agents"), DefinitionScope::User) {
                let shadowed = definitions.iter().any(|d| d.name == definition.name);
                if shadowed {
                    debug!(name = %definition.name, "User subagent shadowed by project definition");
                } else {
                    definitions.push(definition);
                }
            }
        }
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Self { definitions }
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions.iter().map(|d| d.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SubagentDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    /// Resolve a delegation request: exact name match when given, otherwise
    /// the definition whose description best matches the task. Deterministic:
    /// identical inputs always select the same definition.
    pub fn select(
        &self,
        subagent_type: Option<&str>,
        task_description: &str,
    ) -> Result<&SubagentDefinition> {
        if let Some(name) = subagent_type {
            return self.get(name).ok_or_else(|| self.unknown_error(name));
        }

        self.definitions
            .iter()
            .map(|d| (specificity_score(&d.description, task_description), d))
            .filter(|(score, _)| *score > 0)
            // Ties break on name so repeated calls pick the same definition.
            .max_by(|(sa, a), (sb, b)| sa.cmp(sb).then_with(|| b.name.cmp(&a.name)))
            .map(|(_, d)| d)
            .ok_or_else(|| self.unknown_error(task_description))
    }

    fn unknown_error(&self, requested: &str) -> Error {
        let known = self.names();
        let listing = if known.is_empty() {
            "no subagents are registered".to_string()
        } else {
            format!("registered subagents: {}", known.join(", "))
        };
        Error::Delegation(format!("no subagent matches {requested:?}; {listing}"))
    }
}

fn load_dir(dir: &Path, scope: DefinitionScope) -> Vec<SubagentDefinition> {
    let mut definitions = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return definitions;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "md") {
            continue;
        }
        match fs::read_to_string(&path) {
            Ok(content) => match parse_definition(&content, Some(path.clone()), scope) {
                Ok(definition) => {
                    debug!(name = %definition.name, path = %path.display(), "Loaded subagent");
                    definitions.push(definition);
                }
                Err(e) => warn!(path = %path.display(), "Skipping subagent definition: {e}"),
            },
            Err(e) => warn!(path = %path.display(), "Cannot read subagent definition: {e}"),
        }
    }
    definitions
}

/// Specificity score between a definition description and a task
/// description: shared terms weigh most, emphasis keywords and longer
/// descriptions add detail bonuses.
fn specificity_score(description: &str, task: &str) -> usize {
    let desc_lower = description.to_lowercase();
    let task_lower = task.to_lowercase();

    let desc_terms: Vec<&str> = terms_of(&desc_lower);
    let task_terms: Vec<&str> = terms_of(&task_lower);

    let overlap = task_terms
        .iter()
        .filter(|t| desc_terms.contains(t))
        .count();
    if overlap == 0 {
        return 0;
    }

    let mut score = overlap * 10;
    for keyword in ["use proactively", "must be used", "always use"] {
        if desc_lower.contains(keyword) {
            score += 5;
        }
    }
    // More detailed descriptions win close calls.
    score + desc_terms.len().min(20)
}

fn terms_of(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .collect()
}
