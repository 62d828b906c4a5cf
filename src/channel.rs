//! Single-use result handoff between two processes.
//!
//! A [`ResultChannel`] owns a freshly created staging directory. The launching side hands its
//! [`ChannelHandle`] (just the directory path) to a worker process, which writes exactly one
//! [`ResultRecord`] through it before exiting. After joining the worker, the launching side calls
//! [`ResultChannel::read`] once, which returns the record and removes the staging directory.
//!
//! No lock protects the artifact. Ordering comes from the protocol instead: there is a single
//! writer, and the reader only looks at the artifact after the writer's process has exited.

use std::{
    env,
    error::Error as _,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    cleanup::{self, RemovalPolicy, Reporter},
    error::{ResultAbsent, SerializationError, StagingAllocationError},
    record::ResultRecord,
};

/// Name of the artifact file inside the staging directory.
const ARTIFACT_NAME: &str = "result.bin";

const STAGING_PREFIX: &str = "longtask-";

/// A builder for [`ResultChannel`]s.
#[derive(Clone)]
pub struct ChannelBuilder {
    base: Option<PathBuf>,
    policy: RemovalPolicy,
    reporter: Option<Reporter>,
}

impl ChannelBuilder {
    /// Sets the directory the staging directory is created in.
    ///
    /// Defaults to the system temporary directory. It has to be local storage that both processes
    /// can reach.
    #[inline]
    pub fn base_dir<P: Into<PathBuf>>(self, base: P) -> Self {
        Self {
            base: Some(base.into()),
            ..self
        }
    }

    /// Sets the retry policy used when removing the staging directory.
    #[inline]
    pub fn removal_policy(self, policy: RemovalPolicy) -> Self {
        Self { policy, ..self }
    }

    /// Sets the callback that is told when the staging directory could not be removed.
    ///
    /// By default, the failure is logged at error level.
    #[inline]
    pub fn on_cleanup_failure(self, reporter: Reporter) -> Self {
        Self {
            reporter: Some(reporter),
            ..self
        }
    }

    /// Creates the staging directory and returns the [`ResultChannel`] owning it.
    pub fn create(self) -> Result<ResultChannel, StagingAllocationError> {
        let base = self.base.unwrap_or_else(env::temp_dir);
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&base)
            .map_err(|source| StagingAllocationError {
                base: base.clone(),
                source,
            })?;
        // Removal is handled by `ResultChannel` itself, with retries.
        let staging_dir = dir.into_path();
        log::debug!("created staging directory '{}'", staging_dir.display());

        Ok(ResultChannel {
            artifact: staging_dir.join(ARTIFACT_NAME),
            staging_dir,
            consumed: false,
            policy: self.policy,
            reporter: self.reporter.unwrap_or_else(cleanup::log_reporter),
        })
    }
}

/// The launching side of a single-use result handoff.
///
/// Created with [`ResultChannel::create`] or [`ResultChannel::builder`]. The staging directory
/// exists as soon as the channel does, so its [`handle`](ResultChannel::handle) can be given to a
/// worker before any data has been written.
///
/// The staging directory is removed by the first [`read`](ResultChannel::read), or when the
/// channel is dropped without having been read.
pub struct ResultChannel {
    staging_dir: PathBuf,
    artifact: PathBuf,
    consumed: bool,
    policy: RemovalPolicy,
    reporter: Reporter,
}

impl ResultChannel {
    /// Returns a builder that can be used to configure and create a [`ResultChannel`].
    #[inline]
    pub fn builder() -> ChannelBuilder {
        ChannelBuilder {
            base: None,
            policy: RemovalPolicy::new(),
            reporter: None,
        }
    }

    /// Creates a channel with a fresh staging directory in the system temporary directory.
    pub fn create() -> Result<Self, StagingAllocationError> {
        Self::builder().create()
    }

    /// Returns the handle a worker needs to write its result into this channel.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle(self.staging_dir.clone())
    }

    /// The staging directory owned by this channel.
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Where the worker's result ends up inside the staging directory.
    pub fn artifact_path(&self) -> &Path {
        &self.artifact
    }

    /// Writes `record` into the channel. See [`ChannelHandle::write`].
    pub fn write(&self, record: &ResultRecord) -> Result<(), SerializationError> {
        self.handle().write(record)
    }

    /// Takes the result out of the channel and removes the staging directory.
    ///
    /// Returns [`None`] if there is no usable result, after logging why. Only the first call can
    /// return a record; later calls always return [`None`].
    pub fn read(&mut self) -> Option<ResultRecord> {
        self.read_with_cause().ok()
    }

    /// Like [`ResultChannel::read`], but tells the caller why no record was available.
    ///
    /// The cause has already been logged when this returns.
    pub fn read_with_cause(&mut self) -> Result<ResultRecord, ResultAbsent> {
        if self.consumed {
            log::warn!(
                "result channel '{}' has already been read",
                self.staging_dir.display()
            );
            return Err(ResultAbsent::AlreadyRead);
        }
        self.consumed = true;

        let result = self.load();
        match &result {
            Ok(record) => log::debug!(
                "read result {} from '{}'",
                record.uuid,
                self.artifact.display()
            ),
            Err(absent) => match absent.source() {
                Some(source) => log::error!("{absent}: {source}"),
                None => log::error!("{absent}"),
            },
        }

        self.remove_staging_dir();
        result
    }

    fn load(&self) -> Result<ResultRecord, ResultAbsent> {
        let path = &self.artifact;
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ResultAbsent::Missing { path: path.clone() });
            }
            Err(source) => {
                return Err(ResultAbsent::Unreadable {
                    path: path.clone(),
                    source,
                })
            }
        };
        if !meta.is_file() {
            return Err(ResultAbsent::NotAFile { path: path.clone() });
        }

        let bytes = fs::read(path).map_err(|source| ResultAbsent::Unreadable {
            path: path.clone(),
            source,
        })?;
        ResultRecord::decode(&bytes).map_err(|reason| ResultAbsent::Corrupt {
            path: path.clone(),
            reason,
        })
    }

    fn remove_staging_dir(&self) {
        if cleanup::remove_dir(&self.staging_dir, &self.policy, &self.reporter) {
            log::trace!("removed staging directory '{}'", self.staging_dir.display());
        }
    }
}

impl Drop for ResultChannel {
    fn drop(&mut self) {
        if !self.consumed {
            log::debug!(
                "result channel '{}' dropped without being read",
                self.staging_dir.display()
            );
            self.remove_staging_dir();
        }
    }
}

impl fmt::Debug for ResultChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultChannel")
            .field("staging_dir", &self.staging_dir)
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

/// The worker side of a [`ResultChannel`]: the path of its staging directory.
///
/// This is all a worker process gets. It can be turned into a string for a command line and
/// parsed back with [`FromStr`] or [`From<PathBuf>`], and it (de)serializes as a plain path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelHandle(PathBuf);

impl ChannelHandle {
    /// The staging directory this handle points at.
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// The artifact path a write through this handle targets.
    pub fn artifact_path(&self) -> PathBuf {
        self.0.join(ARTIFACT_NAME)
    }

    /// Writes `record` into the channel this handle belongs to.
    ///
    /// The record is written to a temporary file in the staging directory first and then renamed
    /// onto the artifact path, so a reader never sees a partially written artifact. A channel can
    /// only be written once; a second write fails with [`SerializationError::AlreadyWritten`].
    pub fn write(&self, record: &ResultRecord) -> Result<(), SerializationError> {
        let artifact = self.artifact_path();
        if artifact.exists() {
            return Err(SerializationError::AlreadyWritten { path: artifact });
        }

        let bytes = record.encode().map_err(SerializationError::Encode)?;
        let io_err = |source| SerializationError::Io {
            path: artifact.clone(),
            source,
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&self.0)
            .map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist_noclobber(&artifact).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                SerializationError::AlreadyWritten {
                    path: artifact.clone(),
                }
            } else {
                io_err(e.error)
            }
        })?;

        log::debug!("wrote result {} to '{}'", record.uuid, artifact.display());
        Ok(())
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for ChannelHandle {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl FromStr for ChannelHandle {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use uuid::Uuid;

    use super::*;
    use crate::error::CleanupFailure;

    fn assert_send<T: Send>() {}

    fn channel_in(base: &Path) -> ResultChannel {
        ResultChannel::builder()
            .base_dir(base)
            .removal_policy(
                RemovalPolicy::new()
                    .initial_delay(Duration::from_millis(1))
                    .settle(Duration::ZERO),
            )
            .create()
            .unwrap()
    }

    fn sample() -> ResultRecord {
        ResultRecord {
            uuid: Uuid::new_v4(),
            e_value: 2.718,
            duration: Duration::from_secs(3),
            iterations: 42,
        }
    }

    #[test]
    fn staging_dir_exists_before_write() {
        let base = tempfile::tempdir().unwrap();
        let channel = channel_in(base.path());
        assert!(channel.staging_dir().is_dir());
        assert!(channel.staging_dir().starts_with(base.path()));
        assert!(!channel.artifact_path().exists());
    }

    #[test]
    fn channels_get_distinct_dirs() {
        let base = tempfile::tempdir().unwrap();
        let a = channel_in(base.path());
        let b = channel_in(base.path());
        assert_ne!(a.staging_dir(), b.staging_dir());
    }

    #[test]
    fn write_then_read_round_trips() {
        let base = tempfile::tempdir().unwrap();
        let mut channel = channel_in(base.path());
        let record = sample();
        channel.write(&record).unwrap();

        assert_eq!(channel.read(), Some(record));
        assert!(!channel.staging_dir().exists());
    }

    #[test]
    fn write_through_reconstructed_handle() {
        let base = tempfile::tempdir().unwrap();
        let mut channel = channel_in(base.path());
        let handle: ChannelHandle = channel.handle().to_string().parse().unwrap();
        assert_eq!(handle, channel.handle());

        let record = sample();
        handle.write(&record).unwrap();
        assert_eq!(channel.read(), Some(record));
    }

    #[test]
    fn read_before_write_is_absent_and_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        let mut channel = channel_in(base.path());
        let dir = channel.staging_dir().to_path_buf();

        let err = channel.read_with_cause().unwrap_err();
        assert!(matches!(err, ResultAbsent::Missing { .. }), "{err:?}");
        assert!(err.to_string().contains(&*dir.to_string_lossy()));
        assert!(!dir.exists());
    }

    #[test]
    fn second_read_is_absent() {
        let base = tempfile::tempdir().unwrap();
        let mut channel = channel_in(base.path());
        channel.write(&sample()).unwrap();

        assert!(channel.read().is_some());
        assert!(matches!(
            channel.read_with_cause(),
            Err(ResultAbsent::AlreadyRead)
        ));
        assert!(channel.read().is_none());
    }

    #[test]
    fn second_write_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let mut channel = channel_in(base.path());
        let first = sample();
        channel.write(&first).unwrap();

        let err = channel.write(&sample()).unwrap_err();
        assert!(matches!(err, SerializationError::AlreadyWritten { .. }), "{err:?}");
        assert_eq!(channel.read(), Some(first));
    }

    #[test]
    fn write_after_cleanup_fails() {
        let base = tempfile::tempdir().unwrap();
        let mut channel = channel_in(base.path());
        let handle = channel.handle();
        assert!(channel.read().is_none());

        let err = handle.write(&sample()).unwrap_err();
        assert!(matches!(err, SerializationError::Io { .. }), "{err:?}");
    }

    #[test]
    fn corrupt_artifact_is_absent() {
        let base = tempfile::tempdir().unwrap();
        let mut channel = channel_in(base.path());
        fs::write(channel.artifact_path(), b"not a record").unwrap();

        let err = channel.read_with_cause().unwrap_err();
        assert!(matches!(err, ResultAbsent::Corrupt { .. }), "{err:?}");
        assert!(!channel.staging_dir().exists());
    }

    #[test]
    fn artifact_that_is_a_directory_is_absent() {
        let base = tempfile::tempdir().unwrap();
        let mut channel = channel_in(base.path());
        fs::create_dir(channel.artifact_path()).unwrap();

        let err = channel.read_with_cause().unwrap_err();
        assert!(matches!(err, ResultAbsent::NotAFile { .. }), "{err:?}");
        assert!(!channel.staging_dir().exists());
    }

    #[test]
    fn drop_without_read_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        let channel = channel_in(base.path());
        channel.write(&sample()).unwrap();
        let dir = channel.staging_dir().to_path_buf();
        drop(channel);
        assert!(!dir.exists());
    }

    #[test]
    fn allocation_failure_is_reported() {
        let base = tempfile::tempdir().unwrap();
        let missing = base.path().join("does/not/exist");
        let err = ResultChannel::builder()
            .base_dir(&missing)
            .create()
            .unwrap_err();
        assert_eq!(err.base(), missing);
    }

    #[test]
    fn cleanup_failure_goes_to_reporter() {
        let base = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let mut channel = ResultChannel::builder()
            .base_dir(base.path())
            .removal_policy(RemovalPolicy::new().attempts(0))
            .on_cleanup_failure(Arc::new(move |failure: &CleanupFailure| {
                seen2.lock().unwrap().push(failure.path.clone());
            }))
            .create()
            .unwrap();
        let record = sample();
        channel.write(&record).unwrap();

        // A failed cleanup does not spoil an otherwise successful read.
        assert_eq!(channel.read(), Some(record));
        assert_eq!(*seen.lock().unwrap(), vec![channel.staging_dir().to_path_buf()]);
    }

    #[test]
    fn handle_serializes_as_a_path() {
        let handle = ChannelHandle::from(PathBuf::from("/tmp/longtask-abc"));
        let bytes = bincode::serialize(&handle).unwrap();
        assert_eq!(bytes, bincode::serialize(Path::new("/tmp/longtask-abc")).unwrap());
        let back: ChannelHandle = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, handle);
    }

    #[test]
    fn channel_is_send() {
        assert_send::<ResultChannel>();
        assert_send::<ChannelHandle>();
    }
}
