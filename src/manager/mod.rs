//! Supervisor side: registry, lifecycle API and the polling loop.

pub mod registry;
pub(crate) mod supervisor;
pub mod task_manager;

pub use registry::Registry;
pub use task_manager::TaskManager;
