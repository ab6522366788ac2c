use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The collaborator that submitted a task. Used to scope cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A physical or logical resource that at most one task may hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn monitor(index: u32) -> Self {
        Self(format!("monitor-{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Capture,
    Transcode,
    Synthesis,
    Rewrite,
    Scrape,
    Process,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Capture => "capture",
            TaskKind::Transcode => "transcode",
            TaskKind::Synthesis => "synthesis",
            TaskKind::Rewrite => "rewrite",
            TaskKind::Scrape => "scrape",
            TaskKind::Process => "process",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Legal edges of the lifecycle. No state is ever re-entered.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Pending, TaskState::Running) => true,
            (TaskState::Pending, TaskState::Cancelled) => true,
            (TaskState::Running, s) => s.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// Clamps progress to [0,100] and drops anything that would not move it
/// forward.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value to publish, or `None` when it must be suppressed.
    pub fn advance(&mut self, percent: i64) -> Option<u8> {
        let p = percent.clamp(0, 100) as u8;
        match self.last {
            Some(prev) if p <= prev => None,
            _ => {
                self.last = Some(p);
                Some(p)
            }
        }
    }

    pub fn current(&self) -> u8 {
        self.last.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaskOutput {
    File(PathBuf),
    Text(String),
    Json(Value),
}

impl TaskOutput {
    /// Short form used in history rows and trace context.
    pub fn summary(&self) -> String {
        match self {
            TaskOutput::File(p) => p.display().to_string(),
            TaskOutput::Text(t) => {
                let mut s: String = t.chars().take(200).collect();
                if t.chars().count() > 200 {
                    s.push_str("...");
                }
                s
            }
            TaskOutput::Json(v) => {
                let raw = v.to_string();
                if raw.len() > 200 {
                    let cut: String = raw.chars().take(200).collect();
                    format!("{cut}...")
                } else {
                    raw
                }
            }
        }
    }
}

/// Signals delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Progress {
        task_id: TaskId,
        percent: u8,
    },
    Completed {
        task_id: TaskId,
        output: TaskOutput,
    },
    Failed {
        task_id: TaskId,
        code: String,
        message: String,
    },
    Cancelled {
        task_id: TaskId,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEvent::Progress { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Cancelled { task_id } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskEvent::Progress { .. })
    }
}
