use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub pid: Option<u32>,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Reserved for automatic restart; nothing increments it yet.
    pub restart_count: u32,
    pub error: Option<String>,
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Crashed,
    Interrupted,
    Stopped,
}

/// Optional details attached to a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusExtra {
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub traceback: Option<String>,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Crashed => "crashed",
            TaskStatus::Interrupted => "interrupted",
            TaskStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TaskRecord {
    pub fn new(task_id: String) -> Self {
        Self {
            task_id,
            pid: None,
            status: TaskStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            exit_code: None,
            restart_count: 0,
            error: None,
            traceback: None,
        }
    }
}
