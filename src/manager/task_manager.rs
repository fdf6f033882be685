use std::{
    collections::HashMap,
    os::unix::io::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use log::{error, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::config::ManagerConfig;
use crate::error::{SharedStateError, SupervisorError};
use crate::ipc::channel::{mailbox, spawn_reader, spawn_writer, ChannelPair, SupervisorSockets};
use crate::ipc::{Direction, MessageReceiver, MessageSender, Namespace, TaskState};
use crate::manager::registry::Registry;
use crate::manager::supervisor::{drain, spawn_supervisor_thread};
use crate::models::message::{Message, ACK};
use crate::models::task::{StatusExtra, TaskRecord, TaskStatus};
use crate::sync::lock;
use crate::worker::process::{self, WorkerProcess};
use crate::worker::worker::WorkerContext;
use crate::worker::{TaskArgs, TaskFn};

/// Longest `receive` waits on the mailbox before draining the worker again.
const RECEIVE_SLICE: Duration = Duration::from_millis(10);

/// Supervisor-side resources of one task.
pub(crate) struct TaskSlot {
    /// `None` while a stop operation owns the process.
    pub process: Option<WorkerProcess>,
    pub to_worker: MessageSender,
    pub from_worker: MessageReceiver,
    pub mailbox_tx: Sender<Message>,
    pub mailbox: MessageReceiver,
    pub stopping: bool,
    /// The supervisor is taking the dead worker's last messages; others keep off.
    pub settling: bool,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub registry: Registry,
    pub slots: HashMap<String, TaskSlot>,
}

pub(crate) struct Inner {
    pub config: ManagerConfig,
    pub tables: Mutex<Tables>,
    pub namespace: Namespace,
    pub monitoring: AtomicBool,
}

/// Starts strategy tasks in worker processes and tracks them.
///
/// Task failures are reported through [`TaskRecord`] status, never as
/// errors from these methods.
pub struct TaskManager {
    inner: Arc<Inner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    // Serialises forks so no child inherits another launch's worker sockets.
    spawn_lock: Mutex<()>,
    closed: AtomicBool,
}

impl TaskManager {
    pub fn new(config: ManagerConfig) -> Result<Self, SupervisorError> {
        config.validate()?;
        info!(
            "Task manager ready, max workers: {}, poll interval: {:?}",
            config.max_workers, config.poll_interval
        );
        let namespace = Namespace::new(config.shared_state_capacity);
        Ok(TaskManager {
            inner: Arc::new(Inner {
                config,
                tables: Mutex::new(Tables::default()),
                namespace,
                monitoring: AtomicBool::new(false),
            }),
            monitor: Mutex::new(None),
            spawn_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Launches `func` in a new worker process under `task_id`.
    ///
    /// Returns false if the id is taken, the worker ceiling is reached, or
    /// the launch itself fails.
    pub fn start(&self, task_id: &str, func: TaskFn, args: TaskArgs) -> bool {
        if self.closed.load(Ordering::Acquire) {
            warn!("Task manager is shut down; not starting '{}'.", task_id);
            return false;
        }
        let _spawn = lock(&self.spawn_lock);
        {
            let mut tables = lock(&self.inner.tables);
            if tables.registry.contains(task_id) {
                warn!("Task '{}' already exists.", task_id);
                return false;
            }
            let active = tables.registry.active_count();
            if active >= self.inner.config.max_workers {
                warn!(
                    "Worker limit {} reached; cannot start task '{}'.",
                    self.inner.config.max_workers, task_id
                );
                return false;
            }
            tables.registry.register(task_id);
        }

        match self.launch(task_id, func, args) {
            Ok(slot) => {
                let pid = slot.process.as_ref().map(WorkerProcess::pid);
                {
                    let mut tables = lock(&self.inner.tables);
                    if let Some(pid) = pid {
                        tables.registry.set_pid(task_id, pid);
                    }
                    tables.slots.insert(task_id.to_string(), slot);
                }
                info!("Task '{}' launched, pid: {:?}", task_id, pid);
                self.ensure_monitoring();
                true
            }
            Err(e) => {
                error!("Failed to start task '{}': {}", task_id, e);
                lock(&self.inner.tables).registry.remove(task_id);
                self.inner.namespace.release(task_id);
                false
            }
        }
    }

    fn launch(&self, task_id: &str, func: TaskFn, args: TaskArgs) -> Result<TaskSlot, SupervisorError> {
        let state = self.inner.namespace.allocate(task_id)?;
        let (supervisor, worker) = ChannelPair::new()?.split();
        let ctx = WorkerContext {
            task_id: task_id.to_string(),
            func,
            args,
            sockets: worker,
            state,
            close_in_child: vec![
                supervisor.to_worker.as_raw_fd(),
                supervisor.from_worker.as_raw_fd(),
            ],
        };
        let mut process = process::spawn(ctx)?;

        match attach(task_id, supervisor) {
            Ok((to_worker, from_worker)) => {
                let (mailbox_tx, mailbox) = mailbox();
                Ok(TaskSlot {
                    process: Some(process),
                    to_worker,
                    from_worker,
                    mailbox_tx,
                    mailbox,
                    stopping: false,
                    settling: false,
                })
            }
            Err(e) => {
                let _ = process.kill();
                let _ = process.wait();
                Err(e.into())
            }
        }
    }

    fn ensure_monitoring(&self) {
        if self.inner.monitoring.swap(true, Ordering::AcqRel) {
            return;
        }
        match spawn_supervisor_thread(Arc::clone(&self.inner)) {
            Ok(handle) => *lock(&self.monitor) = Some(handle),
            Err(e) => {
                error!("Failed to start supervisor thread: {}", e);
                self.inner.monitoring.store(false, Ordering::Release);
            }
        }
    }

    /// Terminates the task, escalating to SIGKILL after `timeout`, then
    /// releases its channels, shared state and record.
    ///
    /// Release means the supervisor stops tracking them; descriptors a sibling
    /// worker inherited close when that worker exits.
    pub fn stop(&self, task_id: &str, timeout: Duration) -> bool {
        let process = {
            let mut tables = lock(&self.inner.tables);
            match tables.slots.get_mut(task_id) {
                Some(slot) if !slot.stopping => {
                    slot.stopping = true;
                    slot.process.take()
                }
                _ => {
                    warn!("Task '{}' does not exist.", task_id);
                    return false;
                }
            }
        };

        let mut exit_code = None;
        if let Some(mut process) = process {
            if process.exit_code().is_none() {
                info!("Stopping task '{}', pid: {}", task_id, process.pid());
                if let Err(e) = process.terminate() {
                    warn!("Failed to signal task '{}': {}", task_id, e);
                }
                let exited = matches!(process.wait_timeout(timeout), Ok(Some(_)));
                if !exited {
                    warn!(
                        "Task '{}' did not exit within {:?}; killing it.",
                        task_id, timeout
                    );
                    if let Err(e) = process.kill() {
                        error!("Failed to kill task '{}': {}", task_id, e);
                    }
                    if let Err(e) = process.wait() {
                        error!("Failed to reap task '{}': {}", task_id, e);
                    }
                }
            }
            exit_code = process.exit_code();
        }

        {
            let mut tables = lock(&self.inner.tables);
            tables.registry.update_status(
                task_id,
                TaskStatus::Stopped,
                StatusExtra { exit_code, ..Default::default() },
            );
            tables.registry.remove(task_id);
            tables.slots.remove(task_id);
        }
        self.inner.namespace.release(task_id);
        info!("Task '{}' stopped.", task_id);
        true
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = lock(&self.inner.tables).slots.keys().cloned().collect();
        info!("Stopping {} task(s).", ids.len());
        for task_id in ids {
            self.stop(&task_id, self.inner.config.stop_timeout);
        }
    }

    /// Queues a message for the worker without blocking.
    pub fn send(&self, task_id: &str, message: Message) -> bool {
        let sender = lock(&self.inner.tables)
            .slots
            .get(task_id)
            .map(|slot| slot.to_worker.clone());
        match sender {
            Some(sender) => sender.send(message),
            None => {
                warn!("No channel for task '{}'.", task_id);
                false
            }
        }
    }

    /// Next message from the worker, waiting at most `timeout`.
    ///
    /// Lifecycle messages are delivered here too, after they have been
    /// applied to the record. The worker's channel is drained on every call,
    /// so a message does not wait for the next supervisor iteration.
    pub fn receive(&self, task_id: &str, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let mailbox = {
                let mut tables = lock(&self.inner.tables);
                let Tables { registry, slots } = &mut *tables;
                let slot = slots.get(task_id)?;
                if !slot.settling {
                    drain(task_id, slot, registry);
                }
                slot.mailbox.clone()
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(message) = mailbox.recv_timeout(remaining.min(RECEIVE_SLICE)) {
                return Some(message);
            }
            if remaining <= RECEIVE_SLICE {
                return None;
            }
        }
    }

    /// Sends and reports whether the next message within `timeout` is an ack.
    /// Whatever arrives first is consumed either way.
    pub fn send_sync(&self, task_id: &str, message: Message, timeout: Duration) -> bool {
        if !self.send(task_id, message) {
            return false;
        }
        self.receive(task_id, timeout)
            .map_or(false, |reply| reply.is(ACK))
    }

    fn task_state(&self, task_id: &str) -> Result<TaskState, SharedStateError> {
        self.inner
            .namespace
            .state(task_id)
            .ok_or_else(|| SharedStateError::UnknownTask(task_id.to_string()))
    }

    pub fn shared_get(&self, task_id: &str, key: &str) -> Result<Option<Value>, SharedStateError> {
        self.task_state(task_id)?.get(key)
    }

    pub fn shared_set(
        &self,
        task_id: &str,
        key: &str,
        value: impl Serialize,
    ) -> Result<(), SharedStateError> {
        self.task_state(task_id)?.set(key, value)
    }

    /// Waits for the task's event; `None` waits forever. False for unknown ids.
    pub fn wait_event(&self, task_id: &str, timeout: Option<Duration>) -> bool {
        match self.task_state(task_id) {
            Ok(state) => state.event().wait(timeout),
            Err(_) => false,
        }
    }

    pub fn set_event(&self, task_id: &str) -> bool {
        self.task_state(task_id).map(|state| state.event().set()).is_ok()
    }

    pub fn clear_event(&self, task_id: &str) -> bool {
        self.task_state(task_id).map(|state| state.event().clear()).is_ok()
    }

    pub fn status(&self, task_id: &str) -> Option<TaskRecord> {
        lock(&self.inner.tables).registry.get(task_id)
    }

    pub fn status_all(&self) -> Vec<TaskRecord> {
        lock(&self.inner.tables).registry.list()
    }

    /// Stops the supervisor loop, every task, and the namespace.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down task manager...");
        self.inner.monitoring.store(false, Ordering::Release);
        if let Some(handle) = lock(&self.monitor).take() {
            if handle.join().is_err() {
                error!("Supervisor thread panicked.");
            }
        }
        self.stop_all();
        self.inner.namespace.release_all();
        info!("Task manager shut down.");
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn attach(
    task_id: &str,
    sockets: SupervisorSockets,
) -> std::io::Result<(MessageSender, MessageReceiver)> {
    let (to_worker, _writer) = spawn_writer(task_id, Direction::Inbound, sockets.to_worker)?;
    let from_worker = spawn_reader(task_id, sockets.from_worker)?;
    Ok((to_worker, from_worker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use anyhow::anyhow;
    use serde_json::json;

    use crate::error::Interrupted;

    fn manager(max_workers: usize) -> TaskManager {
        let config = ManagerConfig::default()
            .with_max_workers(max_workers)
            .with_poll_interval(Duration::from_millis(20))
            .with_stop_timeout(Duration::from_millis(300));
        TaskManager::new(config).unwrap()
    }

    fn wait_for(
        manager: &TaskManager,
        task_id: &str,
        done: impl Fn(&TaskRecord) -> bool,
    ) -> TaskRecord {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(record) = manager.status(task_id) {
                if done(&record) {
                    return record;
                }
            }
            assert!(Instant::now() < deadline, "task '{}' never settled", task_id);
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn finished(manager: &TaskManager, task_id: &str) -> TaskRecord {
        wait_for(manager, task_id, |r| r.status.is_terminal() && r.exit_code.is_some())
    }

    fn running(manager: &TaskManager, task_id: &str) -> TaskRecord {
        wait_for(manager, task_id, |r| r.status == TaskStatus::Running)
    }

    fn sleeper(duration: Duration) -> TaskFn {
        TaskFn::plain(move |_| {
            thread::sleep(duration);
            Ok(())
        })
    }

    fn next_of_kind(manager: &TaskManager, task_id: &str, kind: &str) -> Option<Message> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(message) = manager.receive(task_id, Duration::from_millis(100)) {
                if message.is(kind) {
                    return Some(message);
                }
            }
        }
        None
    }

    #[test]
    fn completed_task_gets_one_terminal_status() {
        let manager = manager(4);
        assert!(manager.start("t1", sleeper(Duration::from_millis(50)), TaskArgs::new()));
        assert_eq!(manager.status("t1").map(|r| r.status), Some(TaskStatus::Pending));

        let record = finished(&manager, "t1");
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.pid.is_some());
        assert!(record.end_time.is_some());
        assert!(record.error.is_none());

        // Later iterations must not turn it into a crash.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(manager.status("t1").map(|r| r.status), Some(TaskStatus::Completed));
        manager.shutdown();
    }

    #[test]
    fn workers_start_while_another_thread_holds_stderr() {
        let manager = manager(8);
        let noisy = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&noisy);
        // Holds the stderr lock most of the time, the way a busy logger does.
        let holder = thread::spawn(move || {
            while flag.load(Ordering::Relaxed) {
                let stderr = std::io::stderr().lock();
                thread::sleep(Duration::from_millis(1));
                drop(stderr);
                thread::sleep(Duration::from_micros(200));
            }
        });

        let ids: Vec<String> = (0..24).map(|i| format!("f{}", i)).collect();
        for id in &ids {
            let func = TaskFn::plain(|_| {
                drop(std::io::stderr().lock());
                Ok(())
            });
            assert!(manager.start(id, func, TaskArgs::new()));
            let record = finished(&manager, id);
            assert_eq!(record.status, TaskStatus::Completed, "{}", id);
            assert!(manager.stop(id, Duration::from_millis(100)));
        }

        noisy.store(false, Ordering::Relaxed);
        holder.join().unwrap();
        manager.shutdown();
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let manager = manager(4);
        assert!(manager.start("dup", sleeper(Duration::from_secs(10)), TaskArgs::new()));
        let before = running(&manager, "dup");
        assert!(!manager.start("dup", sleeper(Duration::ZERO), TaskArgs::new()));

        let after = manager.status("dup").unwrap();
        assert_eq!(after.pid, before.pid);
        assert_eq!(after.status, TaskStatus::Running);
        manager.shutdown();
    }

    #[test]
    fn returned_error_is_recorded() {
        let manager = manager(4);
        let func = TaskFn::plain(|_| Err(anyhow!("boom").context("computing signal")));
        assert!(manager.start("t2", func, TaskArgs::new()));

        let record = finished(&manager, "t2");
        assert_eq!(record.status, TaskStatus::Error);
        assert_eq!(record.exit_code, Some(1));
        let error = record.error.unwrap();
        assert!(error.contains("boom"), "{}", error);
        assert!(record.traceback.is_some());
        let recorded = manager.shared_get("t2", "error").unwrap().unwrap();
        assert!(recorded.as_str().unwrap().contains("boom"));
        assert_eq!(manager.shared_get("t2", "status").unwrap(), Some(json!("error")));
        manager.shutdown();
    }

    #[test]
    fn panic_is_recorded_as_error() {
        let manager = manager(4);
        let func = TaskFn::plain(|_| panic!("strategy blew up"));
        assert!(manager.start("p1", func, TaskArgs::new()));

        let record = finished(&manager, "p1");
        assert_eq!(record.status, TaskStatus::Error);
        assert!(record.error.unwrap().contains("strategy blew up"));
        manager.shutdown();
    }

    #[test]
    fn killed_worker_is_crashed() {
        let manager = manager(4);
        assert!(manager.start("t3", sleeper(Duration::from_secs(30)), TaskArgs::new()));
        let pid = running(&manager, "t3").pid.unwrap();

        assert_eq!(unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) }, 0);
        let record = finished(&manager, "t3");
        assert_eq!(record.status, TaskStatus::Crashed);
        assert_eq!(record.exit_code, Some(-libc::SIGKILL));
        manager.shutdown();
    }

    #[test]
    fn interrupt_ends_as_interrupted() {
        let manager = manager(4);
        let func = TaskFn::with_comm(|_, comm| loop {
            comm.check_interrupt()?;
            thread::sleep(Duration::from_millis(10));
        });
        assert!(manager.start("int", func, TaskArgs::new()));
        let pid = running(&manager, "int").pid.unwrap();

        assert_eq!(unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) }, 0);
        let record = finished(&manager, "int");
        assert_eq!(record.status, TaskStatus::Interrupted);
        assert_eq!(record.exit_code, Some(130));
        manager.shutdown();
    }

    #[test]
    fn explicit_interrupted_error_is_not_a_failure() {
        let manager = manager(4);
        let func = TaskFn::plain(|_| Err(Interrupted.into()));
        assert!(manager.start("int2", func, TaskArgs::new()));
        assert_eq!(finished(&manager, "int2").status, TaskStatus::Interrupted);
        manager.shutdown();
    }

    #[test]
    fn ceiling_rejects_extra_tasks() {
        let manager = manager(3);
        for id in ["c1", "c2", "c3"] {
            assert!(manager.start(id, sleeper(Duration::from_secs(10)), TaskArgs::new()));
        }
        assert!(!manager.start("c4", sleeper(Duration::ZERO), TaskArgs::new()));
        assert!(manager.status("c4").is_none());

        assert!(manager.stop("c1", Duration::from_millis(100)));
        assert!(manager.start("c4", sleeper(Duration::ZERO), TaskArgs::new()));
        manager.shutdown();
    }

    #[test]
    fn stop_releases_everything_and_is_idempotent() {
        let manager = manager(4);
        assert!(manager.start("s1", sleeper(Duration::from_secs(30)), TaskArgs::new()));
        running(&manager, "s1");

        assert!(manager.stop("s1", Duration::from_millis(100)));
        assert!(manager.status("s1").is_none());
        assert!(!manager.send("s1", Message::new("ping", json!(null))));
        assert!(matches!(
            manager.shared_get("s1", "pid"),
            Err(SharedStateError::UnknownTask(_))
        ));
        assert!(!manager.stop("s1", Duration::from_millis(100)));
        manager.shutdown();
    }

    #[test]
    fn cooperative_task_exits_on_terminate() {
        let manager = manager(4);
        let func = TaskFn::with_comm(|_, comm| {
            while !comm.terminate_requested() {
                thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        });
        assert!(manager.start("coop", func, TaskArgs::new()));
        running(&manager, "coop");

        let started = Instant::now();
        assert!(manager.stop("coop", Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(2));
        manager.shutdown();
    }

    #[test]
    fn messages_flow_both_ways() {
        let manager = manager(4);
        let func = TaskFn::with_comm(|_, comm| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                let Some(message) = comm.recv(Duration::from_millis(50)) else {
                    continue;
                };
                match message.kind.as_str() {
                    "ping" => {
                        comm.send(Message::new("pong", message.payload));
                    }
                    "sync" => {
                        comm.ack();
                    }
                    "done" => return Ok(()),
                    _ => {}
                }
            }
            Err(anyhow!("never told to finish"))
        });
        assert!(manager.start("m1", func, TaskArgs::new()));

        assert!(manager.send("m1", Message::new("ping", json!({ "seq": 7 }))));
        let pong = next_of_kind(&manager, "m1", "pong").expect("pong");
        assert_eq!(pong.payload, json!({ "seq": 7 }));

        assert!(manager.send_sync("m1", Message::new("sync", json!(null)), Duration::from_secs(2)));
        assert!(manager.send("m1", Message::new("done", json!(null))));
        assert_eq!(finished(&manager, "m1").status, TaskStatus::Completed);
        manager.shutdown();
    }

    #[test]
    fn receive_does_not_wait_for_the_supervisor_poll() {
        let config = ManagerConfig::default()
            .with_poll_interval(Duration::from_secs(2))
            .with_stop_timeout(Duration::from_millis(300));
        let manager = TaskManager::new(config).unwrap();
        let func = TaskFn::with_comm(|_, comm| {
            thread::sleep(Duration::from_millis(100));
            comm.send(Message::new("hello", json!(1)));
            thread::sleep(Duration::from_secs(5));
            Ok(())
        });
        assert!(manager.start("r1", func, TaskArgs::new()));

        let asked = Instant::now();
        let mut hello = None;
        while hello.is_none() && asked.elapsed() < Duration::from_secs(1) {
            hello = manager
                .receive("r1", Duration::from_millis(50))
                .filter(|message| message.is("hello"));
        }
        assert_eq!(hello.map(|m| m.payload), Some(json!(1)));
        assert!(asked.elapsed() < Duration::from_secs(1));
        manager.shutdown();
    }

    #[test]
    fn shared_state_is_scoped_per_task() {
        let manager = manager(4);
        let func = TaskFn::with_comm(|args, comm| {
            let value: i64 = args.positional(0)?;
            comm.state().set("signal", value)?;
            Ok(())
        });
        assert!(manager.start("a", func.clone(), TaskArgs::new().arg(1)));
        assert!(manager.start("b", func, TaskArgs::new().arg(2).kwarg("fast", 5)));
        let a = finished(&manager, "a");
        finished(&manager, "b");

        assert_eq!(manager.shared_get("a", "signal").unwrap(), Some(json!(1)));
        assert_eq!(manager.shared_get("b", "signal").unwrap(), Some(json!(2)));
        assert_eq!(manager.shared_get("a", "pid").unwrap(), a.pid.map(|p| json!(p)));
        assert_eq!(manager.shared_get("a", "status").unwrap(), Some(json!("completed")));
        assert_eq!(manager.shared_get("b", "kwargs").unwrap(), Some(json!({ "fast": 5 })));
        assert_eq!(manager.shared_get("a", "kwargs").unwrap(), None);

        manager.shared_set("a", "limit", 10).unwrap();
        assert_eq!(manager.shared_get("a", "limit").unwrap(), Some(json!(10)));
        assert_eq!(manager.shared_get("b", "limit").unwrap(), None);
        assert!(manager.shared_set("ghost", "limit", 1).is_err());
        manager.shutdown();
    }

    #[test]
    fn events_cross_the_process_boundary() {
        let manager = manager(4);
        let func = TaskFn::with_comm(|_, comm| {
            if !comm.event().wait(Some(Duration::from_secs(5))) {
                return Err(anyhow!("event never set"));
            }
            comm.event().clear();
            comm.state().set("seen", true)?;
            Ok(())
        });
        assert!(manager.start("e1", func, TaskArgs::new()));
        running(&manager, "e1");

        assert!(!manager.wait_event("e1", Some(Duration::from_millis(20))));
        assert!(manager.set_event("e1"));
        assert_eq!(finished(&manager, "e1").status, TaskStatus::Completed);
        assert_eq!(manager.shared_get("e1", "seen").unwrap(), Some(json!(true)));
        assert!(!manager.wait_event("e1", Some(Duration::ZERO)));
        assert!(!manager.set_event("ghost"));
        assert!(!manager.wait_event("ghost", None));
        manager.shutdown();
    }

    #[test]
    fn status_all_lists_every_task() {
        let manager = manager(4);
        assert!(manager.start("l1", sleeper(Duration::ZERO), TaskArgs::new()));
        assert!(manager.start("l2", sleeper(Duration::ZERO), TaskArgs::new()));
        let ids: Vec<String> = manager.status_all().into_iter().map(|r| r.task_id).collect();
        assert_eq!(ids, vec!["l1".to_string(), "l2".to_string()]);

        manager.shutdown();
        assert!(manager.status_all().is_empty());
        assert!(!manager.start("late", sleeper(Duration::ZERO), TaskArgs::new()));
    }
}
