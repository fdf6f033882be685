//! OS process handle for one worker, and the fork that creates it.

use std::{
    io::{self, Write},
    panic::{self, AssertUnwindSafe},
    thread,
    time::{Duration, Instant},
};

use log::warn;

use crate::error::SupervisorError;
use crate::worker::worker::{run_worker, WorkerContext, EXIT_ERROR};

const WAIT_POLL: Duration = Duration::from_millis(10);

/// A forked worker. Reaping is cached so the pid is never signalled after
/// it may have been reused.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: libc::pid_t,
    exit_code: Option<i32>,
}

impl WorkerProcess {
    #[cfg(test)]
    pub(crate) fn adopt(pid: libc::pid_t) -> Self {
        Self { pid, exit_code: None }
    }

    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Non-blocking liveness check. `Some(code)` once the process is gone.
    pub fn try_wait(&mut self) -> io::Result<Option<i32>> {
        self.reap(libc::WNOHANG)
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<i32>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.try_wait()? {
                return Ok(Some(code));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(WAIT_POLL);
        }
    }

    pub fn wait(&mut self) -> io::Result<i32> {
        loop {
            if let Some(code) = self.reap(0)? {
                return Ok(code);
            }
        }
    }

    /// Sends SIGTERM.
    pub fn terminate(&self) -> io::Result<()> {
        self.signal(libc::SIGTERM)
    }

    /// Sends SIGKILL.
    pub fn kill(&self) -> io::Result<()> {
        self.signal(libc::SIGKILL)
    }

    pub fn signal(&self, signum: libc::c_int) -> io::Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        if unsafe { libc::kill(self.pid, signum) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(()),
            _ => Err(err),
        }
    }

    fn reap(&mut self, flags: libc::c_int) -> io::Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(self.pid, &mut status, flags) };
        match rc {
            0 => Ok(None),
            -1 => {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => Ok(None),
                    Some(libc::ECHILD) => {
                        warn!("Process {} was reaped elsewhere; exit code unknown.", self.pid);
                        self.exit_code = Some(-1);
                        Ok(self.exit_code)
                    }
                    _ => Err(err),
                }
            }
            _ => {
                self.exit_code = Some(decode_status(status));
                Ok(self.exit_code)
            }
        }
    }
}

/// Exit status as a single code: the exit value, or `-signal` when killed.
pub fn decode_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        -libc::WTERMSIG(status)
    } else {
        -1
    }
}

/// Forks a worker running `ctx`. The child never returns from this call.
///
/// The stdio locks are held across the fork so the child never inherits
/// them locked by a parent thread that does not exist on its side; loggers
/// write through them.
pub(crate) fn spawn(ctx: WorkerContext) -> Result<WorkerProcess, SupervisorError> {
    let mut stdout = io::stdout().lock();
    let stderr = io::stderr().lock();
    // Buffered output would otherwise be written again by the child.
    let _ = stdout.flush();
    let pid = unsafe { libc::fork() };
    drop(stderr);
    drop(stdout);

    match pid {
        -1 => Err(SupervisorError::Spawn(io::Error::last_os_error())),
        0 => {
            let code = panic::catch_unwind(AssertUnwindSafe(|| run_worker(ctx)))
                .unwrap_or(EXIT_ERROR);
            unsafe { libc::_exit(code) }
        }
        pid => {
            // Close the worker's socket ends on this side.
            drop(ctx);
            Ok(WorkerProcess { pid, exit_code: None })
        }
    }
}
