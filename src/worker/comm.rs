//! What a task sees from inside its worker process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::Interrupted;
use crate::ipc::channel::{MessageReceiver, MessageSender, Polled};
use crate::ipc::{TaskEvent, TaskState};
use crate::models::message::Message;
use crate::worker::signals;

/// Positional and keyword arguments handed to a task.
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.to_string(), value.into());
        self
    }

    pub fn positional<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(index)
            .with_context(|| format!("missing positional argument {}", index))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("positional argument {} has the wrong type", index))
    }

    pub fn keyword<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        match self.kwargs.get(name) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("keyword argument '{}' has the wrong type", name)),
            None => Ok(None),
        }
    }
}

type PlainFn = dyn Fn(&TaskArgs) -> anyhow::Result<()> + Send + Sync;
type CommFn = dyn Fn(&TaskArgs, &mut ProcessComm) -> anyhow::Result<()> + Send + Sync;

/// A task body, declaring up front whether it wants a [`ProcessComm`].
///
/// The worker runs the copy of this value it inherits across `fork`.
#[derive(Clone)]
pub enum TaskFn {
    Plain(Arc<PlainFn>),
    WithComm(Arc<CommFn>),
}

impl TaskFn {
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(&TaskArgs) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        TaskFn::Plain(Arc::new(f))
    }

    pub fn with_comm<F>(f: F) -> Self
    where
        F: Fn(&TaskArgs, &mut ProcessComm) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        TaskFn::WithComm(Arc::new(f))
    }

    pub fn accepts_comm(&self) -> bool {
        matches!(self, TaskFn::WithComm(_))
    }

    pub(crate) fn invoke(&self, args: &TaskArgs, comm: &mut ProcessComm) -> anyhow::Result<()> {
        match self {
            TaskFn::Plain(f) => f(args),
            TaskFn::WithComm(f) => f(args, comm),
        }
    }
}

/// Communication handle injected into tasks that ask for one.
pub struct ProcessComm {
    task_id: String,
    receiver: MessageReceiver,
    sender: MessageSender,
    state: TaskState,
    event: TaskEvent,
}

impl ProcessComm {
    pub(crate) fn new(
        task_id: &str,
        receiver: MessageReceiver,
        sender: MessageSender,
        state: TaskState,
    ) -> Self {
        let event = state.event();
        Self { task_id: task_id.to_string(), receiver, sender, state, event }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next message from the supervisor, waiting at most `timeout`.
    pub fn recv(&self, timeout: Duration) -> Option<Message> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<Message> {
        match self.receiver.try_recv() {
            Polled::Message(message) => Some(message),
            Polled::Empty | Polled::Closed => None,
        }
    }

    pub fn send(&self, message: Message) -> bool {
        self.sender.send(message)
    }

    /// Answers a synchronous send from the supervisor.
    pub fn ack(&self) -> bool {
        self.sender.send(Message::ack())
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn event(&self) -> &TaskEvent {
        &self.event
    }

    /// True once SIGTERM reached this worker.
    pub fn terminate_requested(&self) -> bool {
        signals::terminate_requested()
    }

    /// Fails with [`Interrupted`] once SIGINT reached this worker.
    pub fn check_interrupt(&self) -> Result<(), Interrupted> {
        if signals::interrupt_requested() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_builder_and_accessors() {
        let args = TaskArgs::new().arg(3).arg("x").kwarg("fast", 5).kwarg("name", "ma");
        assert_eq!(args.positional::<i64>(0).unwrap(), 3);
        assert_eq!(args.positional::<String>(1).unwrap(), "x");
        assert_eq!(args.keyword::<u32>("fast").unwrap(), Some(5));
        assert_eq!(args.keyword::<u32>("slow").unwrap(), None);
        assert!(args.positional::<i64>(7).is_err());
        assert!(args.keyword::<u32>("name").is_err());
        assert_eq!(args.kwargs["fast"], json!(5));
    }

    #[test]
    fn capability_is_declared_not_probed() {
        let plain = TaskFn::plain(|_| Ok(()));
        let comm = TaskFn::with_comm(|_, _| Ok(()));
        assert!(!plain.accepts_comm());
        assert!(comm.accepts_comm());
    }
}
