use std::collections::HashMap;

use chrono::Utc;
use log::{debug, info};

use crate::models::task::{StatusExtra, TaskRecord, TaskStatus};

/// One record per task id. Records stay until `remove` is called.
#[derive(Debug, Default)]
pub struct Registry {
    records: HashMap<String, TaskRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a `pending` record, replacing nothing: an existing id is kept.
    pub fn register(&mut self, task_id: &str) -> Option<&TaskRecord> {
        if self.records.contains_key(task_id) {
            return None;
        }
        self.records
            .insert(task_id.to_string(), TaskRecord::new(task_id.to_string()));
        self.records.get(task_id)
    }

    pub fn set_pid(&mut self, task_id: &str, pid: u32) {
        if let Some(record) = self.records.get_mut(task_id) {
            record.pid = Some(pid);
        }
    }

    pub fn set_exit_code(&mut self, task_id: &str, exit_code: i32) {
        if let Some(record) = self.records.get_mut(task_id) {
            record.exit_code = Some(exit_code);
        }
    }

    /// Applies a transition. A terminal record never changes status again.
    pub fn update_status(&mut self, task_id: &str, status: TaskStatus, extra: StatusExtra) -> bool {
        let Some(record) = self.records.get_mut(task_id) else {
            return false;
        };
        if record.status.is_terminal() {
            debug!(
                "Ignoring {} for task '{}': already {}.",
                status, task_id, record.status
            );
            return false;
        }
        if record.status == status {
            return false;
        }

        record.status = status;
        if extra.exit_code.is_some() {
            record.exit_code = extra.exit_code;
        }
        if extra.error.is_some() {
            record.error = extra.error;
        }
        if extra.traceback.is_some() {
            record.traceback = extra.traceback;
        }
        if status.is_terminal() {
            record.end_time = Some(Utc::now());
        }
        info!("Task status updated {}: {}", task_id, status);
        true
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.records.get(task_id).cloned()
    }

    /// Tasks that have not reached a terminal status.
    pub fn active_count(&self) -> usize {
        self.records.values().filter(|r| !r.status.is_terminal()).count()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.records.contains_key(task_id)
    }

    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.task_id.cmp(&b.task_id)));
        records
    }

    pub fn remove(&mut self, task_id: &str) -> Option<TaskRecord> {
        self.records.remove(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicates() {
        let mut registry = Registry::new();
        assert!(registry.register("t1").is_some());
        registry.update_status("t1", TaskStatus::Running, StatusExtra::default());
        assert!(registry.register("t1").is_none());
        assert_eq!(registry.get("t1").unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn terminal_status_is_recorded_once() {
        let mut registry = Registry::new();
        registry.register("t1");
        assert!(registry.update_status("t1", TaskStatus::Running, StatusExtra::default()));
        assert!(registry.update_status("t1", TaskStatus::Completed, StatusExtra::default()));
        assert!(!registry.update_status("t1", TaskStatus::Crashed, StatusExtra::default()));

        let record = registry.get("t1").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.end_time.is_some());
    }

    #[test]
    fn late_exit_code_is_kept_on_terminal_record() {
        let mut registry = Registry::new();
        registry.register("t1");
        registry.update_status("t1", TaskStatus::Completed, StatusExtra::default());
        registry.set_exit_code("t1", 0);
        let record = registry.get("t1").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
    }

    #[test]
    fn error_details_are_attached() {
        let mut registry = Registry::new();
        registry.register("t2");
        registry.update_status(
            "t2",
            TaskStatus::Error,
            StatusExtra {
                error: Some("boom".into()),
                traceback: Some("trace".into()),
                ..Default::default()
            },
        );
        let record = registry.get("t2").unwrap();
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert_eq!(record.traceback.as_deref(), Some("trace"));
        assert_eq!(record.restart_count, 0);
    }

    #[test]
    fn active_count_ignores_terminal_records() {
        let mut registry = Registry::new();
        registry.register("a");
        registry.register("b");
        registry.register("c");
        registry.update_status("b", TaskStatus::Running, StatusExtra::default());
        registry.update_status("c", TaskStatus::Crashed, StatusExtra::default());
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn unknown_ids_are_absent() {
        let mut registry = Registry::new();
        assert!(registry.get("nope").is_none());
        assert!(!registry.update_status("nope", TaskStatus::Running, StatusExtra::default()));
        assert!(registry.remove("nope").is_none());
    }
}
