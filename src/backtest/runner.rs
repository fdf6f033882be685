use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::manager::TaskManager;
use crate::models::message::Message;
use crate::models::task::{TaskRecord, TaskStatus};
use crate::sync::lock;
use crate::worker::{TaskArgs, TaskFn};

pub const BACKTEST_RESULT: &str = "backtest_result";
pub const BACKTEST_ERROR: &str = "backtest_error";

/// How long `wait` keeps draining after the worker ended without a result.
const RESULT_SETTLE: Duration = Duration::from_millis(500);
const RECEIVE_SLICE: Duration = Duration::from_millis(100);

/// Backtest body: strategy parameters and backtest parameters in, result out.
/// Runs inside the worker process.
pub type BacktestFn = Arc<dyn Fn(&Value, &Value) -> anyhow::Result<Value> + Send + Sync>;

/// Called in the supervising process once a result arrives.
pub type ResultCallback = Arc<dyn Fn(&BacktestResult) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub strategy_params: Value,
    pub backtest_params: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
}

struct BacktestTask {
    strategy_params: Value,
    backtest_params: Value,
    status: TaskStatus,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    callback: Option<ResultCallback>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestStatus {
    pub task_id: String,
    pub status: TaskStatus,
    pub strategy_params: Value,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub process: Option<TaskRecord>,
    pub result: Option<BacktestResult>,
}

/// Runs backtests in parallel worker processes and collects their results.
pub struct BacktestRunner {
    manager: TaskManager,
    tasks: Mutex<HashMap<String, BacktestTask>>,
    results: Mutex<HashMap<String, BacktestResult>>,
}

impl BacktestRunner {
    pub fn new(manager: TaskManager) -> Self {
        info!("Backtest runner ready.");
        Self {
            manager,
            tasks: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Starts one backtest. False if the id is taken or the worker could not start.
    pub fn run(
        &self,
        task_id: &str,
        body: BacktestFn,
        strategy_params: Value,
        backtest_params: Value,
        callback: Option<ResultCallback>,
    ) -> bool {
        {
            let mut tasks = lock(&self.tasks);
            if tasks.contains_key(task_id) {
                warn!("Backtest '{}' already exists.", task_id);
                return false;
            }
            tasks.insert(
                task_id.to_string(),
                BacktestTask {
                    strategy_params: strategy_params.clone(),
                    backtest_params: backtest_params.clone(),
                    status: TaskStatus::Pending,
                    start_time: None,
                    end_time: None,
                    callback,
                },
            );
        }

        let args = TaskArgs::new()
            .arg(task_id)
            .arg(strategy_params)
            .arg(backtest_params);
        let started = self.manager.start(task_id, backtest_task(body), args);

        let mut tasks = lock(&self.tasks);
        if started {
            if let Some(task) = tasks.get_mut(task_id) {
                task.status = TaskStatus::Running;
                task.start_time = Some(Utc::now());
            }
            info!("Backtest '{}' started.", task_id);
        } else {
            tasks.remove(task_id);
        }
        started
    }

    /// Starts one backtest per parameter set; returns the ids that started.
    pub fn run_batch(
        &self,
        body: BacktestFn,
        params_list: Vec<Value>,
        backtest_params: Value,
        callback: Option<ResultCallback>,
    ) -> Vec<String> {
        let stamp = Utc::now().timestamp();
        let mut started = Vec::new();
        for (i, params) in params_list.into_iter().enumerate() {
            let task_id = format!("backtest_{}_{}", i, stamp);
            if self.run(
                &task_id,
                body.clone(),
                params,
                backtest_params.clone(),
                callback.clone(),
            ) {
                started.push(task_id);
            } else {
                warn!("Backtest '{}' failed to start.", task_id);
            }
        }
        info!("Started {} backtest(s).", started.len());
        started
    }

    /// Waits for a result. `None` on timeout, or once the worker ended
    /// without producing one.
    pub fn wait(&self, task_id: &str, timeout: Option<Duration>) -> Option<BacktestResult> {
        let started = Instant::now();
        let mut ended_at: Option<Instant> = None;
        loop {
            if let Some(result) = self.result(task_id) {
                return Some(result);
            }
            if let Some(timeout) = timeout {
                if started.elapsed() > timeout {
                    warn!("Timed out waiting for backtest '{}'.", task_id);
                    return None;
                }
            }
            if let Some(message) = self.manager.receive(task_id, RECEIVE_SLICE) {
                self.handle_message(task_id, message);
                continue;
            }
            match self.manager.status(task_id) {
                None => return None,
                Some(record) if record.status.is_terminal() => {
                    if ended_at.get_or_insert_with(Instant::now).elapsed() >= RESULT_SETTLE {
                        warn!(
                            "Backtest '{}' ended as {} without a result.",
                            task_id, record.status
                        );
                        return None;
                    }
                }
                Some(_) => {}
            }
        }
    }

    fn handle_message(&self, task_id: &str, message: Message) {
        let outcome = match message.kind.as_str() {
            BACKTEST_RESULT => {
                match serde_json::from_value::<BacktestResult>(message.payload["result"].clone()) {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Backtest '{}' sent an unreadable result: {}", task_id, e);
                        return;
                    }
                }
            }
            BACKTEST_ERROR => {
                let error = message.payload["error"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string();
                error!("Backtest '{}' failed: {}", task_id, error);
                let (strategy_params, backtest_params) = lock(&self.tasks)
                    .get(task_id)
                    .map(|t| (t.strategy_params.clone(), t.backtest_params.clone()))
                    .unwrap_or_default();
                BacktestResult {
                    task_id: task_id.to_string(),
                    status: TaskStatus::Error,
                    strategy_params,
                    backtest_params,
                    result: None,
                    error: Some(error),
                }
            }
            _ => return,
        };

        let callback = {
            let mut tasks = lock(&self.tasks);
            tasks.get_mut(task_id).and_then(|task| {
                task.status = outcome.status;
                task.end_time = Some(Utc::now());
                task.callback.clone()
            })
        };
        lock(&self.results).insert(task_id.to_string(), outcome.clone());

        if outcome.status == TaskStatus::Completed {
            info!("Backtest '{}' completed.", task_id);
            if let Some(callback) = callback {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))).is_err() {
                    error!("Result callback for backtest '{}' panicked.", task_id);
                }
            }
        }
    }

    pub fn result(&self, task_id: &str) -> Option<BacktestResult> {
        lock(&self.results).get(task_id).cloned()
    }

    pub fn results(&self) -> HashMap<String, BacktestResult> {
        lock(&self.results).clone()
    }

    pub fn status(&self, task_id: &str) -> Option<BacktestStatus> {
        let tasks = lock(&self.tasks);
        let task = tasks.get(task_id)?;
        Some(BacktestStatus {
            task_id: task_id.to_string(),
            status: task.status,
            strategy_params: task.strategy_params.clone(),
            start_time: task.start_time,
            end_time: task.end_time,
            process: self.manager.status(task_id),
            result: self.result(task_id),
        })
    }

    pub fn status_all(&self) -> Vec<BacktestStatus> {
        let ids: Vec<String> = lock(&self.tasks).keys().cloned().collect();
        ids.iter().filter_map(|id| self.status(id)).collect()
    }

    pub fn stop(&self, task_id: &str) -> bool {
        let stopped = self.manager.stop(task_id, self.manager.config().stop_timeout);
        if stopped {
            if let Some(task) = lock(&self.tasks).get_mut(task_id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Stopped;
                }
                task.end_time = Some(Utc::now());
            }
        }
        stopped
    }

    pub fn stop_all(&self) {
        info!("Stopping all backtests...");
        let ids: Vec<String> = lock(&self.tasks).keys().cloned().collect();
        for task_id in ids {
            self.stop(&task_id);
        }
    }

    pub fn close(self) {
        info!("Closing backtest runner...");
        self.stop_all();
        self.manager.shutdown();
    }
}

/// Wraps a backtest body as a worker task that reports over the outbound channel.
fn backtest_task(body: BacktestFn) -> TaskFn {
    TaskFn::with_comm(move |args, comm| {
        let task_id: String = args.positional(0)?;
        let strategy_params: Value = args.positional(1)?;
        let backtest_params: Value = args.positional(2)?;
        info!("Backtest '{}' running.", task_id);

        match body(&strategy_params, &backtest_params) {
            Ok(result) => {
                let outcome = BacktestResult {
                    task_id: task_id.clone(),
                    status: TaskStatus::Completed,
                    strategy_params,
                    backtest_params,
                    result: Some(result),
                    error: None,
                };
                comm.send(Message::new(
                    BACKTEST_RESULT,
                    json!({ "task_id": task_id, "result": outcome }),
                ));
                Ok(())
            }
            Err(e) => {
                comm.send(Message::new(
                    BACKTEST_ERROR,
                    json!({
                        "task_id": task_id,
                        "error": format!("{:#}", e),
                        "traceback": format!("{:?}", e),
                    }),
                ));
                Err(e)
            }
        }
    })
}
