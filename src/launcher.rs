//! Running a worker and collecting its result.

use std::{
    any::Any,
    env, io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::{
    channel::{ChannelBuilder, ChannelHandle, ResultChannel},
    cleanup::{RemovalPolicy, Reporter},
    error::{LaunchError, ResultAbsent},
    process::{WorkerExit, WorkerProcess},
    record::ResultRecord,
    task::Task,
    worker::{self, WorkerConfig, WRITE_FAILURE_EXIT_CODE},
};

/// File name of the worker executable built alongside this library.
pub const WORKER_BIN: &str = "longtask-worker";

/// Where the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// In a separate OS process. Runs truly in parallel and survives a crashing worker.
    #[default]
    Process,
    /// Synchronously on the calling thread. Mostly useful for tests and debugging.
    InProcess,
}

/// A builder object that can be used to configure a [`Launcher`].
#[derive(Clone)]
pub struct LauncherBuilder {
    name: Option<String>,
    mode: ExecutionMode,
    program: Option<PathBuf>,
    join_timeout: Option<Duration>,
    channel: ChannelBuilder,
}

impl LauncherBuilder {
    /// Sets the name used for log messages and background threads.
    #[inline]
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets where the worker runs. Defaults to [`ExecutionMode::Process`].
    #[inline]
    pub fn mode(self, mode: ExecutionMode) -> Self {
        Self { mode, ..self }
    }

    /// Sets the worker executable.
    ///
    /// By default, `longtask-worker` is looked up next to the current executable and in its
    /// parent directory.
    #[inline]
    pub fn worker_program<P: Into<PathBuf>>(self, program: P) -> Self {
        Self {
            program: Some(program.into()),
            ..self
        }
    }

    /// Bounds how long a worker process may run before it is presumed hung and killed.
    ///
    /// By default there is no bound, and the launcher waits for as long as the worker runs.
    #[inline]
    pub fn join_timeout(self, timeout: Duration) -> Self {
        Self {
            join_timeout: Some(timeout),
            ..self
        }
    }

    /// Sets the directory staging directories are created in.
    #[inline]
    pub fn staging_base_dir<P: Into<PathBuf>>(self, base: P) -> Self {
        Self {
            channel: self.channel.base_dir(base),
            ..self
        }
    }

    /// Sets the retry policy for removing staging directories.
    #[inline]
    pub fn removal_policy(self, policy: RemovalPolicy) -> Self {
        Self {
            channel: self.channel.removal_policy(policy),
            ..self
        }
    }

    /// Sets the callback that is told when a staging directory could not be removed.
    #[inline]
    pub fn on_cleanup_failure(self, reporter: Reporter) -> Self {
        Self {
            channel: self.channel.on_cleanup_failure(reporter),
            ..self
        }
    }

    /// Finishes configuration. Nothing is checked or started until [`Launcher::run`].
    pub fn build(self) -> Launcher {
        Launcher {
            name: self.name.unwrap_or_else(|| WORKER_BIN.to_string()),
            mode: self.mode,
            program: self.program.unwrap_or_else(default_worker_program),
            join_timeout: self.join_timeout,
            channel: self.channel,
            last_uuid: Arc::new(Mutex::new(None)),
        }
    }
}

/// The outcome of one [`Launcher::run`].
#[derive(Debug)]
pub struct RunOutcome {
    pub exit: WorkerExit,
    pub result: Result<ResultRecord, ResultAbsent>,
}

impl RunOutcome {
    /// The delivered record, if there is one.
    pub fn record(&self) -> Option<&ResultRecord> {
        self.result.as_ref().ok()
    }

    /// Discards the cause of an absent result and returns the record, if there is one.
    pub fn into_record(self) -> Option<ResultRecord> {
        self.result.ok()
    }
}

/// Owns the result handoff for worker runs.
///
/// Every [`run`](Launcher::run) creates a fresh [`ResultChannel`], starts the worker with the
/// channel's handle, waits for it to finish, and reads the channel exactly once. A [`Launcher`]
/// can be cloned and used from any thread; clones share the stale-result check.
#[derive(Clone)]
pub struct Launcher {
    name: String,
    mode: ExecutionMode,
    program: PathBuf,
    join_timeout: Option<Duration>,
    channel: ChannelBuilder,
    /// Identifier of the last record delivered, to catch leftovers from an earlier run.
    last_uuid: Arc<Mutex<Option<Uuid>>>,
}

impl Launcher {
    /// Returns a builder that can be used to configure a [`Launcher`].
    #[inline]
    pub fn builder() -> LauncherBuilder {
        LauncherBuilder {
            name: None,
            mode: ExecutionMode::default(),
            program: None,
            join_timeout: None,
            channel: ResultChannel::builder(),
        }
    }

    /// The name used for log messages and background threads.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the worker runs.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The worker executable used in [`ExecutionMode::Process`].
    pub fn worker_program(&self) -> &Path {
        &self.program
    }

    /// Runs the worker to completion and collects its result.
    ///
    /// Failing to create the staging directory or to start the worker process is returned as an
    /// error. Everything after that (the worker crashing, hanging, or not writing a usable
    /// result) is logged and reported through the returned [`RunOutcome`].
    pub fn run(&self, config: &WorkerConfig) -> Result<RunOutcome, LaunchError> {
        let start = Instant::now();
        let mut channel = self.channel.clone().create()?;

        let exit = match self.mode {
            ExecutionMode::Process => {
                let mut process =
                    WorkerProcess::spawn(&self.program, &self.name, config, &channel.handle())?;
                process.join(self.join_timeout)?
            }
            ExecutionMode::InProcess => run_in_process(config, &channel.handle()),
        };
        if !exit.success() {
            log::error!(
                "worker '{}' {} (staging directory '{}')",
                self.name,
                exit,
                channel.staging_dir().display()
            );
        }

        // The worker has exited, so the artifact is complete if it exists at all.
        let result = channel
            .read_with_cause()
            .and_then(|record| self.check_fresh(record));

        log::info!("'{}' run took {:?}", self.name, start.elapsed());
        Ok(RunOutcome { exit, result })
    }

    /// Starts [`Launcher::run`] on a background thread.
    ///
    /// The returned [`Task`] delivers the record, or [`None`] if there is none, exactly once.
    pub fn spawn(&self, config: WorkerConfig) -> io::Result<Task> {
        Task::spawn(self.clone(), config)
    }

    fn check_fresh(&self, record: ResultRecord) -> Result<ResultRecord, ResultAbsent> {
        let mut last = self
            .last_uuid
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *last == Some(record.uuid) {
            let absent = ResultAbsent::Stale { uuid: record.uuid };
            log::error!("{absent}");
            return Err(absent);
        }
        *last = Some(record.uuid);
        Ok(record)
    }
}

impl Default for Launcher {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn run_in_process(config: &WorkerConfig, handle: &ChannelHandle) -> WorkerExit {
    match panic::catch_unwind(AssertUnwindSafe(|| worker::run(config, handle))) {
        Ok(Ok(_)) => WorkerExit::Success,
        Ok(Err(e)) => {
            log::error!("worker could not deliver its result: {e}");
            WorkerExit::Failed {
                code: Some(WRITE_FAILURE_EXIT_CODE),
            }
        }
        Err(payload) => WorkerExit::Panicked {
            message: panic_message(&*payload),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Looks for the worker executable next to the running one, then one directory up (where Cargo
/// puts binaries relative to test executables). Falls back to a `PATH` lookup.
fn default_worker_program() -> PathBuf {
    let file_name = format!("{WORKER_BIN}{}", env::consts::EXE_SUFFIX);
    if let Ok(exe) = env::current_exe() {
        let candidates = exe.parent().into_iter().flat_map(|dir| {
            let parent = dir.parent().map(|p| p.join(&file_name));
            std::iter::once(dir.join(&file_name)).chain(parent)
        });
        for candidate in candidates {
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(file_name)
}
