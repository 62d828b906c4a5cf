//! Run a long computation in a separate process and hand its result back exactly once.
//!
//! (if the computation can run on a thread of the current process instead, you probably don't need
//! this; a plain thread or a channel is simpler and faster)
//!
//! # Overview
//!
//! Running expensive work in a worker *process* rather than a thread buys true parallelism and
//! crash isolation: if the worker dies, the launching process survives. The price is that the two
//! sides no longer share memory, so the result has to be handed over some other way. This library
//! does that through the filesystem, with a protocol that needs no locks.
//!
//! ## Result channels
//!
//! A [`ResultChannel`] owns a freshly created, uniquely named staging directory. Its
//! [`ChannelHandle`] is nothing but that directory's path, so it can be put on a command line. The
//! worker writes exactly one [`ResultRecord`] through the handle, and the launching side reads it
//! exactly once after the worker has exited. Reading removes the staging directory (retrying
//! if the OS is slow to let go of it, see [`cleanup`]).
//!
//! Reading never fails loudly. A missing, malformed or unreadable result is logged and reported as
//! an absent result, since the read typically happens on a background thread that must not be
//! taken down by an unexpected error.
//!
//! ## Launchers
//!
//! [`Launcher`] ties this together: it creates the channel, starts the `longtask-worker`
//! executable (or runs the worker in-process, see [`ExecutionMode`]), joins it, and reads the
//! channel. [`Launcher::spawn`] does the same from an owned background thread and delivers the
//! outcome through a [`Task`].
//!
//! # Usage
//!
//! Write and read a channel directly:
//!
//! ```
//! use longtask::{ResultChannel, ResultRecord};
//!
//! let mut channel = ResultChannel::create().unwrap();
//!
//! // Only the handle crosses the process boundary.
//! let handle = channel.handle().to_string();
//! let record = ResultRecord::new();
//! handle.parse::<longtask::ChannelHandle>().unwrap().write(&record).unwrap();
//!
//! assert_eq!(channel.read(), Some(record));
//! assert!(!channel.staging_dir().exists());
//! assert_eq!(channel.read(), None);
//! ```
//!
//! Run a worker process from a background thread and pick up its result later:
//!
//! ```no_run
//! use std::time::Duration;
//! use longtask::{Launcher, WorkerConfig};
//!
//! let launcher = Launcher::builder().name("compute-e").build();
//! let task = launcher.spawn(WorkerConfig::new(Duration::from_secs(3))).unwrap();
//!
//! // <keep the UI responsive>
//!
//! match task.wait() {
//!     Some(record) => println!("e = {} after {} iterations", record.e_value, record.iterations),
//!     None => println!("the worker did not produce a result"),
//! }
//! ```

pub mod cleanup;
mod channel;
mod error;
mod launcher;
mod process;
mod record;
mod task;
pub mod worker;

pub use channel::{ChannelBuilder, ChannelHandle, ResultChannel};
pub use error::{
    CleanupFailure, LaunchError, ResultAbsent, SerializationError, StagingAllocationError,
};
pub use launcher::{ExecutionMode, Launcher, LauncherBuilder, RunOutcome, WORKER_BIN};
pub use process::WorkerExit;
pub use record::ResultRecord;
pub use task::Task;
pub use worker::WorkerConfig;
