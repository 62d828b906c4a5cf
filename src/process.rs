//! Lifecycle of a spawned worker process.

use std::{
    fmt,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use crate::{
    channel::ChannelHandle,
    error::LaunchError,
    worker::{self, WorkerConfig},
};

/// How often a bounded join checks whether the worker has exited.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The worker finished normally.
    Success,
    /// The worker process exited with a non-zero status. `code` is [`None`] if it was terminated
    /// by a signal.
    Failed { code: Option<i32> },
    /// The in-process worker panicked.
    Panicked { message: String },
    /// The worker did not exit within the join timeout and was killed.
    Hung { timeout: Duration },
}

impl WorkerExit {
    /// Returns `true` for [`WorkerExit::Success`].
    pub fn success(&self) -> bool {
        matches!(self, WorkerExit::Success)
    }

    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            WorkerExit::Success
        } else {
            WorkerExit::Failed {
                code: status.code(),
            }
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Success => f.write_str("exited successfully"),
            WorkerExit::Failed { code: Some(code) } => write!(f, "exited with code {code}"),
            WorkerExit::Failed { code: None } => f.write_str("was terminated by a signal"),
            WorkerExit::Panicked { message } => write!(f, "panicked: {message}"),
            WorkerExit::Hung { timeout } => {
                write!(f, "was presumed hung after {timeout:?} and killed")
            }
        }
    }
}

/// An owned worker child process.
///
/// Dropping a [`WorkerProcess`] that is still running kills and reaps it, so no worker outlives
/// the run that started it.
pub(crate) struct WorkerProcess {
    child: Child,
    name: String,
}

impl WorkerProcess {
    /// Starts `program` as a worker writing into `handle`.
    pub(crate) fn spawn(
        program: &Path,
        name: &str,
        config: &WorkerConfig,
        handle: &ChannelHandle,
    ) -> Result<Self, LaunchError> {
        let mut command = Command::new(program);
        command
            .arg("--channel")
            .arg(handle.path())
            .arg("--duration")
            .arg(worker::format_duration(config.requested_duration))
            .stdin(Stdio::null());
        if config.force_error {
            command.arg("--force-error");
        }

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
        log::info!("spawned worker '{}' with PID {}", name, child.id());

        Ok(Self {
            child,
            name: name.to_string(),
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Blocks until the worker has exited.
    ///
    /// Without a `timeout` this waits for as long as the worker runs. With one, a worker that is
    /// still running when it expires is killed and reported as [`WorkerExit::Hung`].
    pub(crate) fn join(&mut self, timeout: Option<Duration>) -> Result<WorkerExit, LaunchError> {
        let Some(timeout) = timeout else {
            let status = self.wait()?;
            return Ok(self.exited(status));
        };

        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(status) = self.try_wait()? {
                return Ok(self.exited(status));
            }
            thread::sleep(POLL_INTERVAL);
        }
        // It may have exited during the last sleep.
        if let Some(status) = self.try_wait()? {
            return Ok(self.exited(status));
        }

        log::warn!(
            "worker '{}' (PID {}) did not exit within {:?}, killing it",
            self.name,
            self.pid(),
            timeout
        );
        self.child.kill().map_err(|source| LaunchError::Kill {
            pid: self.pid(),
            timeout,
            source,
        })?;
        self.wait()?;
        Ok(WorkerExit::Hung { timeout })
    }

    fn wait(&mut self) -> Result<ExitStatus, LaunchError> {
        let pid = self.pid();
        self.child
            .wait()
            .map_err(|source| LaunchError::Wait { pid, source })
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>, LaunchError> {
        let pid = self.pid();
        self.child
            .try_wait()
            .map_err(|source| LaunchError::Wait { pid, source })
    }

    fn exited(&self, status: ExitStatus) -> WorkerExit {
        log::debug!("worker '{}' exited with {}", self.name, status);
        WorkerExit::from_status(status)
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            log::warn!(
                "worker '{}' (PID {}) dropped while still running, killing it",
                self.name,
                self.pid()
            );
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}
