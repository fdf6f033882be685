//! Run trading-strategy tasks in forked worker processes and supervise them.

pub mod backtest;
pub mod config;
pub mod error;
pub mod ipc;
pub mod manager;
pub mod models;
mod sync;
pub mod worker;

pub use config::ManagerConfig;
pub use error::{Interrupted, SharedStateError, SupervisorError};
pub use manager::TaskManager;
pub use models::message::Message;
pub use models::task::{TaskRecord, TaskStatus};
pub use worker::{ProcessComm, TaskArgs, TaskFn};
