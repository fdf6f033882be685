//! Coordination primitives shared between the supervisor and its workers.

pub mod channel;
pub mod namespace;
pub mod shared;

pub use channel::{Direction, MessageReceiver, MessageSender};
pub use namespace::Namespace;
pub use shared::{TaskEvent, TaskState};
