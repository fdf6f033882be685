//! Background thread that watches every worker.
//!
//! Each iteration drains the outbound channels, applies lifecycle messages to
//! the registry, then checks liveness. A process found dead is drained once
//! more before it is judged: if it already reported a terminal status only
//! its exit code is recorded, otherwise it is marked `crashed`.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::ipc::channel::Polled;
use crate::manager::registry::Registry;
use crate::manager::task_manager::{Inner, TaskSlot, Tables};
use crate::models::message::{Lifecycle, Message};
use crate::models::task::{StatusExtra, TaskStatus};
use crate::sync::lock;

/// Upper bound on waiting for a dead worker's last messages.
const EXIT_SETTLE: Duration = Duration::from_millis(100);

pub(crate) fn spawn_supervisor_thread(inner: Arc<Inner>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("strategy-supervisor".to_string())
        .spawn(move || {
            info!("Supervisor loop started.");
            while inner.monitoring.load(Ordering::Acquire) {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| poll_once(&inner))) {
                    error!("Supervisor iteration failed: {}", panic_text(payload.as_ref()));
                }
                thread::sleep(inner.config.poll_interval);
            }
            info!("Supervisor loop stopped.");
        })
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic")
}

/// One supervisor iteration over every slot.
///
/// Dead workers are drained a last time after the tables lock is released,
/// so their settle wait never blocks the lifecycle API.
pub(crate) fn poll_once(inner: &Inner) {
    let mut exited = Vec::new();
    {
        let mut tables = lock(&inner.tables);
        let Tables { registry, slots } = &mut *tables;

        for (task_id, slot) in slots.iter_mut() {
            drain(task_id, slot, registry);

            let Some(process) = slot.process.as_mut() else {
                continue;
            };
            if process.exit_code().is_some() {
                continue;
            }
            match process.try_wait() {
                Ok(Some(code)) => {
                    slot.settling = true;
                    exited.push((task_id.clone(), code, slot.from_worker.clone()));
                }
                Ok(None) => {}
                Err(e) => error!("Liveness check for task '{}' failed: {}", task_id, e),
            }
        }
    }

    for (task_id, code, from_worker) in exited {
        let mut last = Vec::new();
        while let Some(message) = from_worker.recv_timeout(EXIT_SETTLE) {
            last.push(message);
        }
        settle(inner, &task_id, code, last);
    }
}

/// Applies a dead worker's final messages, then records how it ended.
fn settle(inner: &Inner, task_id: &str, code: i32, last: Vec<Message>) {
    let mut tables = lock(&inner.tables);
    let Tables { registry, slots } = &mut *tables;
    // Stopped meanwhile: `stop` already owns the outcome.
    let Some(slot) = slots.get_mut(task_id) else {
        return;
    };
    slot.settling = false;
    for message in last {
        apply(task_id, slot, registry, message);
    }

    let reported = registry
        .get(task_id)
        .map_or(false, |record| record.status.is_terminal());
    if reported {
        debug!("Task '{}' process exited with code {}.", task_id, code);
        registry.set_exit_code(task_id, code);
    } else {
        warn!("Task '{}' process exited unexpectedly, exit code: {}", task_id, code);
        registry.update_status(
            task_id,
            TaskStatus::Crashed,
            StatusExtra { exit_code: Some(code), ..Default::default() },
        );
    }
}

pub(crate) fn drain(task_id: &str, slot: &TaskSlot, registry: &mut Registry) {
    loop {
        match slot.from_worker.try_recv() {
            Polled::Message(message) => apply(task_id, slot, registry, message),
            Polled::Empty | Polled::Closed => break,
        }
    }
}

fn apply(task_id: &str, slot: &TaskSlot, registry: &mut Registry, message: Message) {
    match message.lifecycle() {
        Some(Lifecycle::Started { pid }) => {
            info!("Task '{}' started.", task_id);
            if let Some(pid) = pid {
                registry.set_pid(task_id, pid);
            }
            registry.update_status(task_id, TaskStatus::Running, StatusExtra::default());
        }
        Some(Lifecycle::Completed) => {
            info!("Task '{}' completed.", task_id);
            registry.update_status(task_id, TaskStatus::Completed, StatusExtra::default());
        }
        Some(Lifecycle::Error { error, traceback }) => {
            error!("Task '{}' reported an error: {}", task_id, error);
            registry.update_status(
                task_id,
                TaskStatus::Error,
                StatusExtra { error: Some(error), traceback, ..Default::default() },
            );
        }
        Some(Lifecycle::Interrupted) => {
            info!("Task '{}' was interrupted.", task_id);
            registry.update_status(task_id, TaskStatus::Interrupted, StatusExtra::default());
        }
        None => debug!("Task '{}' sent '{}'.", task_id, message.kind),
    }
    let _ = slot.mailbox_tx.send(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{atomic::AtomicBool, Mutex};
    use std::time::Instant;

    use crate::config::ManagerConfig;
    use crate::ipc::channel::{mailbox, spawn_reader, spawn_writer, ChannelPair, Direction};
    use crate::ipc::Namespace;
    use crate::worker::process::WorkerProcess;

    #[test]
    fn settle_wait_runs_outside_the_tables_lock() {
        let (supervisor, worker) = ChannelPair::new().unwrap().split();
        let (to_worker, _writer) =
            spawn_writer("gone", Direction::Inbound, supervisor.to_worker).unwrap();
        let from_worker = spawn_reader("gone", supervisor.from_worker).unwrap();
        let (mailbox_tx, mailbox) = mailbox();

        // Exits silently while `worker` keeps its channel open, so the settle
        // wait runs its full length.
        let pid = match unsafe { libc::fork() } {
            0 => unsafe { libc::_exit(0) },
            pid => pid,
        };
        thread::sleep(Duration::from_millis(100));

        let mut tables = Tables::default();
        tables.registry.register("gone");
        tables.slots.insert(
            "gone".to_string(),
            TaskSlot {
                process: Some(WorkerProcess::adopt(pid)),
                to_worker,
                from_worker,
                mailbox_tx,
                mailbox,
                stopping: false,
                settling: false,
            },
        );
        let inner = Arc::new(Inner {
            config: ManagerConfig::default(),
            tables: Mutex::new(tables),
            namespace: Namespace::new(4096),
            monitoring: AtomicBool::new(false),
        });

        let poller = {
            let inner = Arc::clone(&inner);
            thread::spawn(move || poll_once(&inner))
        };
        thread::sleep(Duration::from_millis(30));
        let asked = Instant::now();
        drop(lock(&inner.tables));
        assert!(asked.elapsed() < EXIT_SETTLE / 2);

        poller.join().unwrap();
        let record = lock(&inner.tables).registry.get("gone").unwrap();
        assert_eq!(record.status, TaskStatus::Crashed);
        assert_eq!(record.exit_code, Some(0));
        drop(worker);
    }
}
