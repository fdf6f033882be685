//! Root of execution inside a forked worker process.

use std::{
    backtrace::{Backtrace, BacktraceStatus},
    os::unix::io::RawFd,
    panic::{self, AssertUnwindSafe},
    process,
    sync::Mutex,
};

use log::{error, info, warn};
use serde_json::{json, Value};

use crate::error::Interrupted;
use crate::ipc::channel::{spawn_reader, spawn_writer, Direction, WorkerSockets};
use crate::ipc::shared::StateGuard;
use crate::ipc::{MessageSender, TaskState};
use crate::models::message::Message;
use crate::models::task::TaskStatus;
use crate::sync::lock;
use crate::worker::comm::{ProcessComm, TaskArgs, TaskFn};
use crate::worker::signals;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

/// Everything the child needs, moved across the fork.
pub(crate) struct WorkerContext {
    pub task_id: String,
    pub func: TaskFn,
    pub args: TaskArgs,
    pub sockets: WorkerSockets,
    pub state: TaskState,
    /// Supervisor-side descriptors the child inherited and must not keep.
    pub close_in_child: Vec<RawFd>,
}

struct PanicReport {
    message: String,
    trace: String,
}

static LAST_PANIC: Mutex<Option<PanicReport>> = Mutex::new(None);

fn record_panic(info: &panic::PanicHookInfo<'_>) {
    let mut message = payload_text(info.payload());
    if let Some(location) = info.location() {
        message = format!("{} at {}", message, location);
    }
    *lock(&LAST_PANIC) = Some(PanicReport {
        message,
        trace: Backtrace::force_capture().to_string(),
    });
}

fn payload_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

fn describe_error(err: &anyhow::Error) -> (String, String) {
    let text = format!("{:#}", err);
    let mut trace = format!("{:?}", err);
    if err.backtrace().status() != BacktraceStatus::Captured {
        trace.push_str("\n\nStack backtrace (at report):\n");
        trace.push_str(&Backtrace::force_capture().to_string());
    }
    (text, trace)
}

fn record(guard: &mut StateGuard<'_>, task_id: &str, key: &str, value: Value) {
    if let Err(e) = guard.set(key, value) {
        warn!("Task '{}' could not record '{}' in shared state: {}", task_id, key, e);
    }
}

/// Runs the task and reports the outcome. Returns the process exit code.
pub(crate) fn run_worker(ctx: WorkerContext) -> i32 {
    let WorkerContext { task_id, func, args, sockets, state, close_in_child } = ctx;
    let pid = process::id();

    // The parent's handles to these are never dropped here; closing the raw
    // descriptors lets the supervisor's ends see EOF.
    for fd in close_in_child {
        unsafe {
            libc::close(fd);
        }
    }

    if let Err(e) = signals::install() {
        warn!("Task '{}' could not install signal handlers: {}", task_id, e);
    }
    panic::set_hook(Box::new(record_panic));

    let (sender, writer) =
        match spawn_writer(&task_id, Direction::Outbound, sockets.to_supervisor) {
            Ok(pair) => pair,
            Err(e) => {
                error!("Task '{}' could not open its outbound channel: {}", task_id, e);
                return EXIT_ERROR;
            }
        };
    let receiver = match spawn_reader(&task_id, sockets.from_supervisor) {
        Ok(receiver) => receiver,
        Err(e) => {
            error!("Task '{}' could not open its inbound channel: {}", task_id, e);
            return EXIT_ERROR;
        }
    };

    {
        let mut guard = state.lock();
        record(&mut guard, &task_id, "pid", json!(pid));
        record(&mut guard, &task_id, "status", json!(TaskStatus::Running.as_str()));
        if !args.kwargs.is_empty() {
            record(&mut guard, &task_id, "kwargs", Value::Object(args.kwargs.clone()));
        }
    }
    sender.send(Message::started(&task_id, pid));
    info!("Task '{}' executing in process {}.", task_id, pid);

    let mut comm = ProcessComm::new(&task_id, receiver, sender.clone(), state.clone());
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| func.invoke(&args, &mut comm)));
    drop(comm);

    let code = match outcome {
        Ok(Ok(())) => {
            record(&mut state.lock(), &task_id, "status", json!(TaskStatus::Completed.as_str()));
            sender.send(Message::completed(&task_id));
            EXIT_OK
        }
        Ok(Err(e)) if e.is::<Interrupted>() => {
            info!("Task '{}' was interrupted.", task_id);
            record(&mut state.lock(), &task_id, "status", json!(TaskStatus::Interrupted.as_str()));
            sender.send(Message::interrupted(&task_id));
            EXIT_INTERRUPTED
        }
        Ok(Err(e)) => {
            let (text, trace) = describe_error(&e);
            report_failure(&task_id, &state, &sender, &text, &trace);
            EXIT_ERROR
        }
        Err(payload) => {
            let report = lock(&LAST_PANIC).take().unwrap_or_else(|| PanicReport {
                message: payload_text(payload.as_ref()),
                trace: Backtrace::force_capture().to_string(),
            });
            report_failure(&task_id, &state, &sender, &report.message, &report.trace);
            EXIT_ERROR
        }
    };

    info!("Task '{}' process {} exiting.", task_id, pid);
    drop(sender);
    if writer.join().is_err() {
        warn!("Task '{}' outbound writer panicked.", task_id);
    }
    code
}

fn report_failure(
    task_id: &str,
    state: &TaskState,
    sender: &MessageSender,
    text: &str,
    trace: &str,
) {
    error!("Task '{}' failed: {}\n{}", task_id, text, trace);
    {
        let mut guard = state.lock();
        record(&mut guard, task_id, "status", json!(TaskStatus::Error.as_str()));
        record(&mut guard, task_id, "error", json!(text));
        record(&mut guard, task_id, "traceback", json!(trace));
    }
    sender.send(Message::error(task_id, text, trace));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_description_keeps_context_chain() {
        let err = anyhow::anyhow!("boom").context("loading bars");
        let (text, trace) = describe_error(&err);
        assert_eq!(text, "loading bars: boom");
        assert!(trace.contains("boom"));
        assert!(trace.to_lowercase().contains("backtrace"));
    }

    #[test]
    fn panic_payloads_become_text() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(payload_text(boxed.as_ref()), "static str");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(payload_text(boxed.as_ref()), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(payload_text(boxed.as_ref()), "panic with non-string payload");
    }
}
