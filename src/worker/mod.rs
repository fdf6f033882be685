//! Code that runs inside worker processes, plus the fork that starts them.

pub mod comm;
pub mod process;
pub mod signals;
pub(crate) mod worker;

pub use comm::{ProcessComm, TaskArgs, TaskFn};
pub use process::WorkerProcess;
