use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const STARTED: &str = "started";
pub const COMPLETED: &str = "completed";
pub const ERROR: &str = "error";
pub const INTERRUPTED: &str = "interrupted";
pub const ACK: &str = "ack";

/// A message travelling over one direction of a task's channel pair.
///
/// `type` is an open discriminant: the lifecycle kinds above plus whatever
/// the application defines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Lifecycle messages the supervisor reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Started { pid: Option<u32> },
    Completed,
    Error { error: String, traceback: Option<String> },
    Interrupted,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self { kind: kind.into(), payload }
    }

    pub fn started(task_id: &str, pid: u32) -> Self {
        Self::new(STARTED, json!({ "task_id": task_id, "pid": pid }))
    }

    pub fn completed(task_id: &str) -> Self {
        Self::new(COMPLETED, json!({ "task_id": task_id }))
    }

    pub fn error(task_id: &str, error: &str, traceback: &str) -> Self {
        Self::new(
            ERROR,
            json!({ "task_id": task_id, "error": error, "traceback": traceback }),
        )
    }

    pub fn interrupted(task_id: &str) -> Self {
        Self::new(INTERRUPTED, json!({ "task_id": task_id }))
    }

    pub fn ack() -> Self {
        Self::new(ACK, Value::Null)
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn lifecycle(&self) -> Option<Lifecycle> {
        match self.kind.as_str() {
            STARTED => Some(Lifecycle::Started {
                pid: self
                    .payload
                    .get("pid")
                    .and_then(Value::as_u64)
                    .and_then(|pid| u32::try_from(pid).ok()),
            }),
            COMPLETED => Some(Lifecycle::Completed),
            ERROR => Some(Lifecycle::Error {
                error: self
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                traceback: self
                    .payload
                    .get("traceback")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            INTERRUPTED => Some(Lifecycle::Interrupted),
            _ => None,
        }
    }
}
