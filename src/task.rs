use std::{
    io,
    panic::resume_unwind,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::{launcher::Launcher, record::ResultRecord, worker::WorkerConfig};

/// A worker run driven from an owned background thread.
///
/// Created by [`Launcher::spawn`]. This is the bridge between a thread that must stay responsive
/// (a UI event loop, for example) and the blocking join on the worker: the background thread waits
/// for the worker, reads the result, and sends it through [`Task::receiver`] exactly once. `None`
/// is sent when no result is available; the reason has been logged by then.
///
/// Calling [`Task::wait`] or dropping a [`Task`] joins the background thread. If it panicked, the
/// panic is propagated to the owner.
pub struct Task {
    outcome: Receiver<Option<ResultRecord>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                if !thread::panicking() {
                    resume_unwind(payload);
                }
            }
        }
    }
}

impl Task {
    pub(crate) fn spawn(launcher: Launcher, config: WorkerConfig) -> io::Result<Self> {
        let (sender, outcome) = crossbeam_channel::bounded(1);
        let name = launcher.name().to_string();
        let handle = thread::Builder::new()
            .name(format!("{name}-task"))
            .spawn(move || {
                log::trace!("task '{name}' starting");
                let record = match launcher.run(&config) {
                    Ok(outcome) => outcome.into_record(),
                    Err(e) => {
                        log::error!("task '{name}' could not run its worker: {e}");
                        None
                    }
                };
                // Nobody may be listening anymore, which is fine.
                sender.send(record).ok();
                log::trace!("task '{name}' exiting");
            })?;

        Ok(Self {
            outcome,
            handle: Some(handle),
        })
    }

    /// The channel the outcome arrives on.
    ///
    /// Exactly one message is ever sent. This can be used with [`crossbeam_channel::select!`] to
    /// wait for the task alongside other events.
    pub fn receiver(&self) -> &Receiver<Option<ResultRecord>> {
        &self.outcome
    }

    /// Takes the outcome if the task has finished, without blocking.
    ///
    /// Returns `Some(outcome)` once; before the task has finished, and after the outcome has been
    /// taken, this returns [`None`].
    pub fn try_result(&self) -> Option<Option<ResultRecord>> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Checks whether the background thread has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Blocks until the task has finished and returns its outcome.
    ///
    /// If the outcome was already taken with [`Task::try_result`], this returns [`None`].
    pub fn wait(mut self) -> Option<ResultRecord> {
        let outcome = self.outcome.recv().ok().flatten();
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                resume_unwind(payload);
            }
        }
        outcome
    }
}
