//! Error types for the supervisor and its workers.
//!
//! Task-level failures never show up here: they are reported through task
//! status. These types cover misuse of the API itself and IPC setup.

use std::io;

use thiserror::Error;

/// Errors raised by the supervisor itself.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// A configuration value could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidConfig { key: &'static str, value: String },

    /// A configuration value parsed but is out of range.
    #[error("configuration rejected: {0}")]
    ConfigRange(String),

    /// Allocating sockets or shared memory for a task failed.
    #[error("ipc setup failed: {0}")]
    Ipc(#[from] io::Error),

    /// `fork(2)` failed.
    #[error("failed to fork worker process: {0}")]
    Spawn(io::Error),
}

/// Errors from the per-task shared state region.
#[derive(Error, Debug)]
pub enum SharedStateError {
    #[error("no shared state for task {0}")]
    UnknownTask(String),

    #[error("shared state encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("shared state needs {needed} bytes but region holds {capacity}")]
    CapacityExceeded { needed: usize, capacity: usize },
}

/// Returned by a task to end with the `interrupted` status instead of `error`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("task interrupted")]
pub struct Interrupted;
