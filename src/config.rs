//! Supervisor configuration.
//!
//! Defaults suit an interactive session; [`ManagerConfig::from_env`] lets a
//! deployment override them through `SUPERVISOR_*` variables.

use std::env;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use crate::error::SupervisorError;
use crate::ipc::shared::HEADER_SIZE;

pub const ENV_MAX_WORKERS: &str = "SUPERVISOR_MAX_WORKERS";
pub const ENV_POLL_INTERVAL_MS: &str = "SUPERVISOR_POLL_INTERVAL_MS";
pub const ENV_STOP_TIMEOUT_MS: &str = "SUPERVISOR_STOP_TIMEOUT_MS";
pub const ENV_SHARED_STATE_BYTES: &str = "SUPERVISOR_SHARED_STATE_BYTES";

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Ceiling on tasks that are still pending or running.
    pub max_workers: usize,
    /// Sleep between supervisor iterations.
    pub poll_interval: Duration,
    /// Grace period used by `stop_all` and `shutdown`.
    pub stop_timeout: Duration,
    /// Size in bytes of each task's shared memory region.
    pub shared_state_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let max_workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_workers,
            poll_interval: Duration::from_millis(200),
            stop_timeout: Duration::from_secs(5),
            shared_state_capacity: 1 << 20,
        }
    }
}

impl ManagerConfig {
    /// Builds a config from defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, SupervisorError> {
        let mut config = Self::default();
        if let Some(n) = read_var::<usize>(ENV_MAX_WORKERS)? {
            config.max_workers = n;
        }
        if let Some(ms) = read_var::<u64>(ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = read_var::<u64>(ENV_STOP_TIMEOUT_MS)? {
            config.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = read_var::<usize>(ENV_SHARED_STATE_BYTES)? {
            config.shared_state_capacity = bytes;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.max_workers == 0 {
            return Err(SupervisorError::ConfigRange(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SupervisorError::ConfigRange(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        if self.shared_state_capacity <= HEADER_SIZE {
            return Err(SupervisorError::ConfigRange(format!(
                "shared_state_capacity must exceed {} bytes",
                HEADER_SIZE
            )));
        }
        Ok(())
    }
}

fn read_var<T: FromStr>(key: &'static str) -> Result<Option<T>, SupervisorError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SupervisorError::InvalidConfig { key, value: raw }),
        Err(_) => Ok(None),
    }
}
