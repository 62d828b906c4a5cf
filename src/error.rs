//! Error types.
//!
//! Errors fall into two groups. [`StagingAllocationError`], [`SerializationError`] and
//! [`LaunchError`] are returned to the caller, since they happen on a thread that can still react
//! to them. [`ResultAbsent`] and [`CleanupFailure`] are logged and turned into a fallback value
//! instead, since they typically happen on a background thread where an unhandled error would
//! take down the whole process without a useful diagnostic.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;
use uuid::Uuid;

/// The staging directory of a [`ResultChannel`][crate::ResultChannel] could not be created.
#[derive(Debug, Error)]
#[error("could not create a staging directory in '{}'", base.display())]
pub struct StagingAllocationError {
    pub(crate) base: PathBuf,
    #[source]
    pub(crate) source: io::Error,
}

impl StagingAllocationError {
    /// The directory in which the staging directory was supposed to be created.
    pub fn base(&self) -> &std::path::Path {
        &self.base
    }
}

/// A [`ResultRecord`][crate::ResultRecord] could not be written to its staging artifact.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("failed to encode result record")]
    Encode(#[source] bincode::Error),

    #[error("failed to write result artifact '{}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("result artifact '{}' has already been written", path.display())]
    AlreadyWritten { path: PathBuf },
}

/// Why [`ResultChannel::read`][crate::ResultChannel::read] did not produce a record.
///
/// This is not thrown anywhere; it is logged and the caller gets an absent result.
#[derive(Debug, Error)]
pub enum ResultAbsent {
    #[error("no result artifact at '{}'", path.display())]
    Missing { path: PathBuf },

    #[error("result artifact '{}' is not a regular file", path.display())]
    NotAFile { path: PathBuf },

    #[error("result artifact '{}' could not be read", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("result artifact '{}' is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("result channel has already been read")]
    AlreadyRead,

    #[error("result {uuid} was already delivered by a previous run")]
    Stale { uuid: Uuid },
}

/// A staging directory survived every removal attempt.
#[derive(Debug, Error)]
#[error("could not remove '{}' after {attempts} attempts", path.display())]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub attempts: u32,
    #[source]
    pub last_error: Option<io::Error>,
}

/// A [`Launcher`][crate::Launcher] run could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Staging(#[from] StagingAllocationError),

    #[error("failed to spawn worker process '{}'", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for worker process {pid}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("worker process {pid} did not exit within {timeout:?} and could not be killed")]
    Kill {
        pid: u32,
        timeout: Duration,
        #[source]
        source: io::Error,
    },
}
