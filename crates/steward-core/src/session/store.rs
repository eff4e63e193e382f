//! Session store - append-only persistence of one conversation
//!
//! Each session lives in `<sessions_dir>/<session_id>.jsonl`: an optional
//! meta record on the first line, then one message record per line. The file
//! has exactly one writer (the owning [`super::MessageState`]); appends are
//! never rewritten.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use super::types::{Message, MessageRecord, SessionMeta, SessionType};
use crate::error::{Error, Result};

/// Generate a fresh session id: millisecond timestamp prefix keeps ids
/// lexicographically sortable by creation time, uuid suffix keeps them opaque.
pub fn generate_session_id() -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), uuid::Uuid::new_v4())
}

/// Summary of one on-disk session, for listing and `ContinueLast`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub path: PathBuf,
    pub workdir: Option<String>,
    pub session_type: SessionType,
    pub modified: std::time::SystemTime,
}

/// Append-only store for one session file.
pub struct SessionStore {
    sessions_dir: PathBuf,
    path: PathBuf,
    session_id: String,
}

impl SessionStore {
    /// Open (creating lazily) the store for a session id.
    pub fn new(sessions_dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        let sessions_dir = sessions_dir.into();
        let session_id = session_id.into();
        let path = sessions_dir.join(format!("{session_id}.jsonl"));
        Self {
            sessions_dir,
            path,
            session_id,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Path of the backing transcript file (handed to hooks).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the meta record. Must be the first line; a no-op if the file
    /// already exists.
    pub fn write_meta(&self, meta: &SessionMeta) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.sessions_dir)?;
        let mut file = File::create(&self.path)?;
        let line = serde_json::to_string(meta)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Append one message record.
    pub fn append_message(&self, message: &Message) -> Result<()> {
        fs::create_dir_all(&self.sessions_dir)?;
        let record = MessageRecord {
            timestamp: Utc::now(),
            message: message.clone(),
        };
        let line = serde_json::to_string(&record)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Rewrite the whole file from current state. Used only when the most
    /// recent assistant message mutated in place (streaming) or after a
    /// compaction pass; the store remains the file's only writer.
    pub fn rewrite(&self, meta: &SessionMeta, messages: &[Message]) -> Result<()> {
        fs::create_dir_all(&self.sessions_dir)?;
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            writeln!(file, "{}", serde_json::to_string(meta)?)?;
            for message in messages {
                let record = MessageRecord {
                    timestamp: Utc::now(),
                    message: message.clone(),
                };
                writeln!(file, "{}", serde_json::to_string(&record)?)?;
            }
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load the session file: meta record (if present) plus all messages.
    /// Individual malformed lines are skipped with a warning; a missing file
    /// is an error the caller treats as non-fatal.
    pub fn load(&self) -> Result<(Option<SessionMeta>, Vec<Message>)> {
        let file = File::open(&self.path).map_err(|e| {
            Error::Session(format!(
                "cannot open session file {}: {e}",
                self.path.display()
            ))
        })?;
        let reader = BufReader::new(file);

        let mut meta = None;
        let mut messages = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if idx == 0
                && let Ok(parsed) = serde_json::from_str::<SessionMeta>(&line)
                && parsed.is_meta
            {
                meta = Some(parsed);
                continue;
            }
            match serde_json::from_str::<MessageRecord>(&line) {
                Ok(record) => messages.push(record.message),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    "Skipping malformed session line: {e}"
                ),
            }
        }

        Ok((meta, messages))
    }

    /// List sessions in a directory, most recently modified first, optionally
    /// filtered to those whose meta workdir matches.
    pub fn list_sessions(
        sessions_dir: &Path,
        workdir: Option<&Path>,
    ) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        if !sessions_dir.exists() {
            return Ok(summaries);
        }

        for entry in fs::read_dir(sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

            let meta = read_meta(&path);
            let session_workdir = meta.as_ref().map(|m| m.workdir.clone());
            if let Some(filter) = workdir {
                let matches = session_workdir
                    .as_deref()
                    .is_some_and(|w| Path::new(w) == filter);
                if !matches {
                    continue;
                }
            }

            summaries.push(SessionSummary {
                session_id: stem.to_string(),
                path: path.clone(),
                workdir: session_workdir,
                session_type: meta.map(|m| m.session_type).unwrap_or_default(),
                modified,
            });
        }

        summaries.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(summaries)
    }

    /// Most recently modified main session for a workdir, if any. Subagent
    /// sessions are never resumed this way.
    pub fn latest_for_workdir(sessions_dir: &Path, workdir: &Path) -> Option<SessionSummary> {
        Self::list_sessions(sessions_dir, Some(workdir))
            .ok()?
            .into_iter()
            .find(|s| s.session_type == SessionType::Main)
    }
}

/// Read just the meta line of a session file.
fn read_meta(path: &Path) -> Option<SessionMeta> {
    let file = File::open(path).ok()?;
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first).ok()?;
    let meta: SessionMeta = serde_json::from_str(first.trim()).ok()?;
    meta.is_meta.then_some(meta)
}

/// Build a meta record for a new session.
pub fn new_meta(
    session_id: &str,
    session_type: SessionType,
    parent_session_id: Option<String>,
    workdir: &Path,
) -> SessionMeta {
    SessionMeta {
        is_meta: true,
        session_id: session_id.to_string(),
        session_type,
        parent_session_id,
        workdir: workdir.to_string_lossy().to_string(),
        started_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{Block, MessageRole};
    use tempfile::tempdir;

    fn message(text: &str, role: MessageRole) -> Message {
        Message {
            role,
            blocks: vec![Block::text(text)],
            usage: None,
        }
    }

    #[test]
    fn round_trips_n_messages() {
        let dir = tempdir().unwrap();
        let id = generate_session_id();
        let store = SessionStore::new(dir.path(), &id);

        let meta = new_meta(&id, SessionType::Main, None, Path::new("/work"));
        store.write_meta(&meta).unwrap();

        let originals: Vec<Message> = (0..5)
            .map(|i| {
                let role = if i % 2 == 0 {
                    MessageRole::User
                } else {
                    MessageRole::Assistant
                };
                message(&format!("message {i}"), role)
            })
            .collect();
        for m in &originals {
            store.append_message(m).unwrap();
        }

        let (loaded_meta, loaded) = store.load().unwrap();
        assert_eq!(loaded_meta.unwrap().session_id, id);
        assert_eq!(loaded.len(), originals.len());
        for (orig, back) in originals.iter().zip(&loaded) {
            assert_eq!(orig.role as u8, back.role as u8);
            match (&orig.blocks[0], &back.blocks[0]) {
                (Block::Text { text: a }, Block::Text { text: b }) => assert_eq!(a, b),
                _ => panic!("expected text blocks"),
            }
        }
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let id = generate_session_id();
        let store = SessionStore::new(dir.path(), &id);
        store
            .write_meta(&new_meta(&id, SessionType::Main, None, Path::new("/w")))
            .unwrap();
        store.append_message(&message("good", MessageRole::User)).unwrap();

        // Corrupt the file with a junk line.
        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        writeln!(file, "{{not json").unwrap();
        store
            .append_message(&message("after", MessageRole::Assistant))
            .unwrap();

        let (_, messages) = store.load().unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path(), "does-not-exist");
        assert!(store.load().is_err());
    }

    #[test]
    fn lists_sessions_by_workdir() {
        let dir = tempdir().unwrap();

        for (id, workdir) in [("a", "/one"), ("b", "/two"), ("c", "/one")] {
            let store = SessionStore::new(dir.path(), id);
            store
                .write_meta(&new_meta(id, SessionType::Main, None, Path::new(workdir)))
                .unwrap();
            store.append_message(&message("x", MessageRole::User)).unwrap();
        }

        let all = SessionStore::list_sessions(dir.path(), None).unwrap();
        assert_eq!(all.len(), 3);

        let one = SessionStore::list_sessions(dir.path(), Some(Path::new("/one"))).unwrap();
        assert_eq!(one.len(), 2);
        assert!(one.iter().all(|s| s.workdir.as_deref() == Some("/one")));
    }

    #[test]
    fn session_ids_sort_by_creation() {
        let a = generate_session_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate_session_id();
        assert!(a < b);
    }
}
