//! Persisted permission rules
//!
//! A rule is a normalized string `ToolName(normalized-input)` stored in the
//! `permissions.allow` array of a settings document. The file is read,
//! modified, and written back as a whole; contention is rare and user-driven,
//! so last-writer-wins is acceptable.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::warn;

use crate::error::Result;

/// One parsed allow rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PermissionRule {
    pub tool: String,
    pub value: String,
}

impl PermissionRule {
    pub fn new(tool: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            value: value.into(),
        }
    }

    /// Parse `Tool(value)`; a bare `Tool` matches any input of that tool.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Some(open) = s.find('(') {
            let inner = s.strip_suffix(')')?;
            return Some(Self {
                tool: inner[..open].to_string(),
                value: inner[open + 1..].to_string(),
            });
        }
        Some(Self {
            tool: s.to_string(),
            value: "*".to_string(),
        })
    }

    /// Does this rule cover the given tool invocation? `value` must already
    /// be normalized with the same function used at save time.
    pub fn matches(&self, tool: &str, normalized_value: &str) -> bool {
        if self.tool != tool {
            return false;
        }
        self.value == "*" || self.value == normalized_value
    }
}

impl std::fmt::Display for PermissionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.value == "*" {
            write!(f, "{}", self.tool)
        } else {
            write!(f, "{}({})", self.tool, self.value)
        }
    }
}

/// The persisted allow-list, backed by one settings.json document.
pub struct RuleStore {
    path: PathBuf,
    rules: Vec<PermissionRule>,
}

impl RuleStore {
    /// Load the allow-list from `<dir>/settings.json`. A missing file is an
    /// empty list; a malformed file is logged and treated as empty.
    pub fn load(settings_dir: &Path) -> Self {
        let path = settings_dir.join("settings.json");
        let rules = read_rules(&path);
        Self { path, rules }
    }

    pub fn rules(&self) -> &[PermissionRule] {
        &self.rules
    }

    pub fn is_allowed(&self, tool: &str, normalized_value: &str) -> bool {
        self.rules.iter().any(|r| r.matches(tool, normalized_value))
    }

    /// Add rules and persist the whole document (read-modify-write).
    /// Duplicates are dropped; order of first insertion is preserved.
    pub fn add_rules(&mut self, new_rules: Vec<PermissionRule>) -> Result<()> {
        let existing: BTreeSet<String> = self.rules.iter().map(|r| r.to_string()).collect();
        let mut changed = false;
        for rule in new_rules {
            if existing.contains(&rule.to_string()) {
                continue;
            }
            self.rules.push(rule);
            changed = true;
        }
        if changed {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        // Re-read so unrelated settings keys survive the rewrite.
        let mut doc: Value = fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| json!({}));

        let allow: Vec<Value> = self
            .rules
            .iter()
            .map(|r| Value::String(r.to_string()))
            .collect();
        doc["permissions"]["allow"] = Value::Array(allow);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&doc)?)?;
        Ok(())
    }
}

fn read_rules(path: &Path) -> Vec<PermissionRule> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let doc: Value = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(path = %path.display(), "Malformed settings file, ignoring rules: {e}");
            return Vec::new();
        }
    };
    doc.pointer("/permissions/allow")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .filter_map(PermissionRule::parse)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_and_display_round_trip() {
        let rule = PermissionRule::parse("Bash(mkdir test)").unwrap();
        assert_eq!(rule.tool, "Bash");
        assert_eq!(rule.value, "mkdir test");
        assert_eq!(rule.to_string(), "Bash(mkdir test)");

        let bare = PermissionRule::parse("Write").unwrap();
        assert_eq!(bare.value, "*");
        assert_eq!(bare.to_string(), "Write");
    }

    #[test]
    fn matching_requires_same_normalization() {
        let rule = PermissionRule::new("Bash", "mkdir test");
        assert!(rule.matches("Bash", "mkdir test"));
        assert!(!rule.matches("Bash", "mkdir  test"));
        assert!(!rule.matches("Write", "mkdir test"));
    }

    #[test]
    fn store_round_trips_and_dedupes() {
        let dir = tempdir().unwrap();
        let mut store = RuleStore::load(dir.path());
        assert!(store.rules().is_empty());

        store
            .add_rules(vec![
                PermissionRule::new("Bash", "mkdir test"),
                PermissionRule::new("Bash", "mkdir test"),
                PermissionRule::new("Bash", "cargo build"),
            ])
            .unwrap();

        let reloaded = RuleStore::load(dir.path());
        assert_eq!(reloaded.rules().len(), 2);
        assert!(reloaded.is_allowed("Bash", "mkdir test"));
        assert!(reloaded.is_allowed("Bash", "cargo build"));
        assert!(!reloaded.is_allowed("Bash", "rm -rf /"));
    }

    #[test]
    fn persist_preserves_unrelated_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"theme": "dark", "permissions": {"allow": []}}"#).unwrap();

        let mut store = RuleStore::load(dir.path());
        store
            .add_rules(vec![PermissionRule::new("Bash", "ls")])
            .unwrap();

        let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["theme"], "dark");
        assert_eq!(doc["permissions"]["allow"][0], "Bash(ls)");
    }

    #[test]
    fn malformed_file_is_empty_list() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("settings.json"), "{broken").unwrap();
        let store = RuleStore::load(dir.path());
        assert!(store.rules().is_empty());
    }
}
