//! Cross-process shared state for one task.
//!
//! A region is an anonymous `MAP_SHARED` mapping created by the supervisor
//! before it forks the worker, so both processes see the same pages.
//!
//! ```text
//! offset 0   lock word  (u32, pid of the holder or 0)
//! offset 4   event flag (u32, 0 or 1)
//! offset 8   data len   (u64)
//! offset 16  JSON object {"<task_id>_<key>": value, ...}
//! ```
//!
//! The lock is a pid-tagged spin lock: a waiter that finds the holder's
//! process gone takes the lock over instead of waiting forever.

use std::collections::BTreeMap;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::SharedStateError;

#[repr(C)]
struct Header {
    lock: AtomicU32,
    event: AtomicU32,
    len: AtomicU64,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();

const EVENT_POLL: Duration = Duration::from_millis(2);

pub struct SharedRegion {
    base: NonNull<u8>,
    size: usize,
}

// The mapping is only touched through atomics or while holding the lock word.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn new(size: usize) -> io::Result<Self> {
        if size <= HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared region smaller than its header",
            ));
        }
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // Fresh anonymous pages are zeroed: unlocked, event clear, empty data.
        let base = NonNull::new(addr.cast::<u8>()).ok_or_else(io::Error::last_os_error)?;
        Ok(Self { base, size })
    }

    pub fn capacity(&self) -> usize {
        self.size - HEADER_SIZE
    }

    fn header(&self) -> &Header {
        unsafe { &*self.base.as_ptr().cast::<Header>() }
    }

    /// Acquires the lock word, waiting as long as the holder is alive.
    pub fn lock(&self) -> RegionGuard<'_> {
        let me = unsafe { libc::getpid() } as u32;
        let lock = &self.header().lock;
        let mut backoff = Duration::from_micros(50);
        loop {
            match lock.compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return RegionGuard { region: self, holder: me },
                Err(holder) if holder != me && !process_alive(holder) => {
                    if lock
                        .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        log::warn!("Recovered shared state lock from dead process {}", holder);
                        let guard = RegionGuard { region: self, holder: me };
                        guard.discard_if_torn();
                        return guard;
                    }
                }
                Err(_) => {}
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(1));
        }
    }

    pub fn set_event(&self) {
        self.header().event.store(1, Ordering::Release);
    }

    pub fn clear_event(&self) {
        self.header().event.store(0, Ordering::Release);
    }

    pub fn is_event_set(&self) -> bool {
        self.header().event.load(Ordering::Acquire) == 1
    }

    /// Waits until the event is set. `None` waits forever.
    pub fn wait_event(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_event_set() {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            thread::sleep(EVENT_POLL);
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.size);
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Exclusive access to a region's data.
pub struct RegionGuard<'a> {
    region: &'a SharedRegion,
    holder: u32,
}

impl RegionGuard<'_> {
    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.region.base.as_ptr().add(HEADER_SIZE) }
    }

    pub fn load(&self) -> Result<BTreeMap<String, Value>, SharedStateError> {
        let len = self.region.header().len.load(Ordering::Acquire) as usize;
        if len == 0 {
            return Ok(BTreeMap::new());
        }
        let len = len.min(self.region.capacity());
        let bytes = unsafe { std::slice::from_raw_parts(self.data_ptr(), len) };
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn store(&mut self, map: &BTreeMap<String, Value>) -> Result<(), SharedStateError> {
        let bytes = if map.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(map)?
        };
        let capacity = self.region.capacity();
        if bytes.len() > capacity {
            return Err(SharedStateError::CapacityExceeded { needed: bytes.len(), capacity });
        }
        // Empty while the copy runs: a writer dying mid-copy leaves no torn map.
        self.region.header().len.store(0, Ordering::Release);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr(), bytes.len());
        }
        self.region.header().len.store(bytes.len() as u64, Ordering::Release);
        Ok(())
    }

    /// Resets data a dead holder left undecodable.
    fn discard_if_torn(&self) {
        if let Err(e) = self.load() {
            log::warn!("Discarding shared state left unreadable by dead holder: {}", e);
            self.region.header().len.store(0, Ordering::Release);
        }
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        let _ = self.region.header().lock.compare_exchange(
            self.holder,
            0,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }
}

/// Key under which a task's entry lives in the namespace.
pub fn scoped_key(task_id: &str, key: &str) -> String {
    format!("{}_{}", task_id, key)
}

/// Locked view of one task's keys; every key is prefixed with the task id.
pub struct StateGuard<'a> {
    task_id: &'a str,
    guard: RegionGuard<'a>,
}

impl StateGuard<'_> {
    pub fn get(&self, key: &str) -> Result<Option<Value>, SharedStateError> {
        let mut map = self.guard.load()?;
        Ok(map.remove(&scoped_key(self.task_id, key)))
    }

    pub fn set(&mut self, key: &str, value: Value) -> Result<(), SharedStateError> {
        let mut map = self.guard.load()?;
        map.insert(scoped_key(self.task_id, key), value);
        self.guard.store(&map)
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, SharedStateError> {
        let mut map = self.guard.load()?;
        let removed = map.remove(&scoped_key(self.task_id, key));
        if removed.is_some() {
            self.guard.store(&map)?;
        }
        Ok(removed)
    }

    /// Removes exactly the keys carrying this task's prefix.
    pub fn clear(&mut self) -> Result<usize, SharedStateError> {
        let mut map = self.guard.load()?;
        let prefix = scoped_key(self.task_id, "");
        let before = map.len();
        map.retain(|k, _| !k.starts_with(&prefix));
        let removed = before - map.len();
        self.guard.store(&map)?;
        Ok(removed)
    }

    /// Snapshot with the task prefix stripped.
    pub fn entries(&self) -> Result<BTreeMap<String, Value>, SharedStateError> {
        let prefix = scoped_key(self.task_id, "");
        Ok(self
            .guard
            .load()?
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|k| (k.to_string(), v)))
            .collect())
    }
}

/// Handle to one task's shared state, lock and event.
#[derive(Clone)]
pub struct TaskState {
    task_id: String,
    region: std::sync::Arc<SharedRegion>,
}

impl TaskState {
    pub fn new(task_id: &str, region: std::sync::Arc<SharedRegion>) -> Self {
        Self { task_id: task_id.to_string(), region }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Holds the task's lock for several operations at once.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard { task_id: &self.task_id, guard: self.region.lock() }
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, SharedStateError> {
        self.lock().get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SharedStateError> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &str, value: impl Serialize) -> Result<(), SharedStateError> {
        let value = serde_json::to_value(value)?;
        self.lock().set(key, value)
    }

    pub fn event(&self) -> TaskEvent {
        TaskEvent { region: self.region.clone() }
    }
}

/// Binary event shared by the supervisor and one worker.
#[derive(Clone)]
pub struct TaskEvent {
    region: std::sync::Arc<SharedRegion>,
}

impl TaskEvent {
    pub fn set(&self) {
        self.region.set_event();
    }

    pub fn clear(&self) {
        self.region.clear_event();
    }

    pub fn is_set(&self) -> bool {
        self.region.is_event_set()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.region.wait_event(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn state(task_id: &str) -> TaskState {
        TaskState::new(task_id, Arc::new(SharedRegion::new(64 * 1024).unwrap()))
    }

    #[test]
    fn set_then_get() {
        let s = state("a");
        s.set("pid", 42).unwrap();
        assert_eq!(s.get("pid").unwrap(), Some(json!(42)));
        assert_eq!(s.get_as::<u32>("pid").unwrap(), Some(42));
        assert_eq!(s.get("missing").unwrap(), None);
    }

    #[test]
    fn keys_are_stored_with_task_prefix() {
        let s = state("a");
        s.set("status", "running").unwrap();
        let raw = s.region.lock().load().unwrap();
        assert!(raw.contains_key("a_status"));
        assert_eq!(s.lock().entries().unwrap().keys().collect::<Vec<_>>(), vec!["status"]);
    }

    #[test]
    fn clear_only_removes_own_prefix() {
        let region = Arc::new(SharedRegion::new(64 * 1024).unwrap());
        let a = TaskState::new("a", region.clone());
        let b = TaskState::new("b", region);
        a.set("x", 1).unwrap();
        b.set("x", 2).unwrap();

        assert_eq!(a.lock().clear().unwrap(), 1);
        assert_eq!(a.get("x").unwrap(), None);
        assert_eq!(b.get("x").unwrap(), Some(json!(2)));
    }

    #[test]
    fn oversized_value_is_rejected() {
        let s = TaskState::new("a", Arc::new(SharedRegion::new(HEADER_SIZE + 32).unwrap()));
        let err = s.set("blob", "x".repeat(100)).unwrap_err();
        assert!(matches!(err, SharedStateError::CapacityExceeded { .. }));
        assert_eq!(s.get("blob").unwrap(), None);
    }

    #[test]
    fn lock_is_exclusive_between_threads() {
        let s = state("a");
        s.set("n", 0).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        let mut guard = s.lock();
                        let n = guard.get("n").unwrap().and_then(|v| v.as_u64()).unwrap();
                        guard.set("n", json!(n + 1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.get_as::<u64>("n").unwrap(), Some(100));
    }

    #[test]
    fn dead_writer_leaves_region_usable() {
        let s = state("a");
        s.set("status", "running").unwrap();

        // The child dies holding the lock after overwriting the bytes but
        // before publishing the new length.
        match unsafe { libc::fork() } {
            0 => {
                let guard = s.region.lock();
                let torn = [0xffu8; 8];
                unsafe {
                    ptr::copy_nonoverlapping(torn.as_ptr(), guard.data_ptr(), torn.len());
                }
                std::mem::forget(guard);
                unsafe { libc::_exit(0) }
            }
            pid => {
                let mut status = 0;
                assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
            }
        }

        assert_eq!(s.get("status").unwrap(), None);
        s.set("status", "crashed").unwrap();
        assert_eq!(s.get("status").unwrap(), Some(json!("crashed")));
        assert_eq!(s.lock().clear().unwrap(), 1);
    }

    #[test]
    fn event_wait_times_out_then_succeeds() {
        let event = state("a").event();
        assert!(!event.wait(Some(Duration::from_millis(20))));
        let setter = event.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(event.wait(Some(Duration::from_secs(2))));
        t.join().unwrap();
        event.clear();
        assert!(!event.is_set());
    }
}
