//! Background process registry
//!
//! Tracks shell commands running detached from the tool-calling loop. The
//! registry holds the only handle to each underlying OS process; no other
//! component may signal one directly. Children are spawned in their own
//! process group so termination reaches the whole tree, with a TERM → KILL
//! escalation after a short grace period.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub type TaskId = String;

const MAX_BUFFER_LINES: usize = 2_000;
const MAX_BUFFER_BYTES: usize = 200_000;
const KILL_GRACE: Duration = Duration::from_millis(300);

/// What kind of work a background task is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Shell,
    Subagent,
}

/// Lifecycle status of a background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed { exit_code: i32 },
    Failed { error: String },
    Killed,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

/// Point-in-time view of one task.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub kind: TaskKind,
    pub command: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
}

/// Bounded line buffer for captured output; old lines are dropped once the
/// caps are exceeded.
struct OutputBuffer {
    lines: VecDeque<String>,
    total_bytes: usize,
    dropped_lines: usize,
}

impl OutputBuffer {
    fn new() -> Self {
        Self {
            lines: VecDeque::new(),
            total_bytes: 0,
            dropped_lines: 0,
        }
    }

    fn push_line(&mut self, line: String) {
        self.total_bytes = self.total_bytes.saturating_add(line.len());
        self.lines.push_back(line);
        while self.lines.len() > MAX_BUFFER_LINES || self.total_bytes > MAX_BUFFER_BYTES {
            match self.lines.pop_front() {
                Some(removed) => {
                    self.total_bytes = self.total_bytes.saturating_sub(removed.len());
                    self.dropped_lines += 1;
                }
                None => break,
            }
        }
    }

    fn render(&self, filter: Option<&str>) -> String {
        let mut out = String::new();
        if self.dropped_lines > 0 {
            out.push_str(&format!(
                "[... {} earlier line(s) dropped ...]\n",
                self.dropped_lines
            ));
        }
        for line in &self.lines {
            if filter.is_none_or(|f| line.contains(f)) {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

struct TaskEntry {
    kind: TaskKind,
    command: String,
    description: Option<String>,
    status: TaskStatus,
    started_at: DateTime<Utc>,
    pid: Option<u32>,
    output: Arc<Mutex<OutputBuffer>>,
    /// Keeps the monitor task alive with the entry.
    _monitor: Option<tokio::task::JoinHandle<()>>,
}

impl TaskEntry {
    fn snapshot(&self, id: &str) -> TaskSnapshot {
        TaskSnapshot {
            id: id.to_string(),
            kind: self.kind,
            command: self.command.clone(),
            description: self.description.clone(),
            status: self.status.clone(),
            started_at: self.started_at,
        }
    }
}

/// Registry of background tasks. Cloneable handle over shared state.
#[derive(Clone)]
pub struct BackgroundProcessRegistry {
    tasks: Arc<RwLock<HashMap<TaskId, TaskEntry>>>,
}

impl Default for BackgroundProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundProcessRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn a detached shell command and start tracking it.
    pub async fn spawn_shell(
        &self,
        command: String,
        working_dir: PathBuf,
        description: Option<String>,
    ) -> Result<TaskId> {
        let id = uuid::Uuid::new_v4().to_string();

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.current_dir(&working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            Error::Agent(format!("Failed to spawn background command: {e}"))
        })?;
        let pid = child.id();

        let output = Arc::new(Mutex::new(OutputBuffer::new()));
        let stdout_task = collect_lines(child.stdout.take(), Arc::clone(&output));
        let stderr_task = collect_lines(child.stderr.take(), Arc::clone(&output));

        let registry = self.clone();
        let task_id = id.clone();
        let monitor = tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    if status.success() {
                        TaskStatus::Completed { exit_code: code }
                    } else {
                        TaskStatus::Failed {
                            error: format!("exit code {code}"),
                        }
                    }
                }
                Err(e) => TaskStatus::Failed {
                    error: e.to_string(),
                },
            };
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            registry.finish_if_running(&task_id, status).await;
        });

        info!(id = %id, pid = ?pid, command = %command, "Background process spawned");

        let entry = TaskEntry {
            kind: TaskKind::Shell,
            command,
            description,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            pid,
            output,
            _monitor: Some(monitor),
        };
        self.tasks.write().await.insert(id.clone(), entry);
        Ok(id)
    }

    /// Track a subagent running in the background. The delegator reports
    /// completion through [`Self::update_status`].
    pub async fn register_subagent(&self, id: TaskId, description: String) {
        let entry = TaskEntry {
            kind: TaskKind::Subagent,
            command: description.clone(),
            description: Some(description),
            status: TaskStatus::Running,
            started_at: Utc::now(),
            pid: None,
            output: Arc::new(Mutex::new(OutputBuffer::new())),
            _monitor: None,
        };
        self.tasks.write().await.insert(id, entry);
    }

    /// Status transition for non-process tasks, or process completion from
    /// the monitor. A task already `Killed` is never overwritten.
    pub async fn update_status(&self, id: &str, status: TaskStatus) {
        self.finish_if_running(id, status).await;
    }

    async fn finish_if_running(&self, id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.write().await;
        if let Some(entry) = tasks.get_mut(id)
            && entry.status.is_running()
        {
            info!(id, status = ?status, "Background task finished");
            entry.status = status;
        }
    }

    pub async fn status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.read().await.get(id).map(|e| e.status.clone())
    }

    pub async fn get(&self, id: &str) -> Option<TaskSnapshot> {
        self.tasks.read().await.get(id).map(|e| e.snapshot(id))
    }

    pub async fn list(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .read()
            .await
            .iter()
            .map(|(id, e)| e.snapshot(id))
            .collect()
    }

    /// Non-blocking read of buffered output, optionally filtered to lines
    /// containing `filter`.
    pub async fn read_output(&self, id: &str, filter: Option<&str>) -> Result<String> {
        let tasks = self.tasks.read().await;
        let entry = tasks
            .get(id)
            .ok_or_else(|| Error::Agent(format!("No background task {id}")))?;
        Ok(entry.output.lock().await.render(filter))
    }

    /// Kill a running task: TERM to the whole process group, escalating to
    /// KILL after a grace period. Exactly one transition to `Killed`; after
    /// confirmation the process group receives no further signals.
    pub async fn kill(&self, id: &str) -> Result<()> {
        let pid = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| Error::Agent(format!("No background task {id}")))?;
            if !entry.status.is_running() {
                return Err(Error::Agent(format!(
                    "Background task {id} is not running"
                )));
            }
            // Transition first so the monitor's completion report and any
            // repeated kill() become no-ops.
            entry.status = TaskStatus::Killed;
            entry.pid
        };

        if let Some(pid) = pid {
            terminate_process_group(pid).await;
        }
        info!(id, "Background task killed");
        Ok(())
    }

    /// Kill every running task (Agent destroy).
    pub async fn kill_all(&self) {
        let running: Vec<TaskId> = {
            let tasks = self.tasks.read().await;
            tasks
                .iter()
                .filter(|(_, e)| e.status.is_running())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in running {
            if let Err(e) = self.kill(&id).await {
                warn!(id = %id, "Failed to kill background task: {e}");
            }
        }
    }
}

fn collect_lines<R>(
    pipe: Option<R>,
    buffer: Arc<Mutex<OutputBuffer>>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(pipe) = pipe else {
            return;
        };
        let mut reader = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            buffer.lock().await.push_line(line);
        }
    })
}

/// TERM the group, check after a grace period, KILL if still alive.
#[cfg(unix)]
async fn terminate_process_group(pid: u32) {
    let pgid = format!("-{pid}");

    let group_term_ok = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(&pgid)
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !group_term_ok {
        let _ = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status();
    }

    sleep(KILL_GRACE).await;

    let still_running = std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if still_running {
        let _ = std::process::Command::new("kill")
            .arg("-KILL")
            .arg(&pgid)
            .status();
        let _ = std::process::Command::new("kill")
            .arg("-KILL")
            .arg(pid.to_string())
            .status();
    }
}

#[cfg(not(unix))]
async fn terminate_process_group(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}
