//! Coordination namespace owned by one `TaskManager`.
//!
//! Holds the shared region of every live task. Nothing here is process-wide:
//! two managers in one process never see each other's state.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::ipc::shared::{SharedRegion, TaskState};
use crate::sync::lock;

pub struct Namespace {
    capacity: usize,
    regions: Mutex<HashMap<String, Arc<SharedRegion>>>,
}

impl Namespace {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, regions: Mutex::new(HashMap::new()) }
    }

    /// Maps a fresh region for `task_id`. Must run before the worker forks.
    pub fn allocate(&self, task_id: &str) -> io::Result<TaskState> {
        let region = Arc::new(SharedRegion::new(self.capacity)?);
        lock(&self.regions).insert(task_id.to_string(), region.clone());
        debug!("Allocated {} byte shared region for task '{}'.", self.capacity, task_id);
        Ok(TaskState::new(task_id, region))
    }

    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        lock(&self.regions)
            .get(task_id)
            .map(|region| TaskState::new(task_id, region.clone()))
    }

    pub fn contains(&self, task_id: &str) -> bool {
        lock(&self.regions).contains_key(task_id)
    }

    /// Clears the task's keys under its lock and stops tracking the region.
    ///
    /// The mapping itself goes away when the last handle drops; a killed
    /// worker's copy is reclaimed by the OS.
    pub fn release(&self, task_id: &str) -> bool {
        let Some(region) = lock(&self.regions).remove(task_id) else {
            return false;
        };
        let state = TaskState::new(task_id, region);
        if let Err(e) = state.lock().clear() {
            warn!("Failed to clear shared state of task '{}': {}", task_id, e);
        }
        true
    }

    pub fn release_all(&self) {
        let ids: Vec<String> = lock(&self.regions).keys().cloned().collect();
        for task_id in ids {
            self.release(&task_id);
        }
    }
}
