//! Robust removal of staging directories.
//!
//! Removing a directory right after another process has exited can fail for transient reasons:
//! the OS may not have released the other process's file handles yet, a virus scanner or indexer
//! may be holding a file open, or a file may have been left read-only. [`remove_dir`] retries with
//! exponential backoff and clears read-only flags before each attempt. If the directory still
//! exists after the retry budget is spent, the failure is handed to a [`Reporter`] instead of
//! being returned, because a stray temporary directory must never abort the surrounding work.

use std::{fs, io, path::Path, sync::Arc, thread, time::Duration};

use crate::error::CleanupFailure;

/// Callback invoked when a directory could not be removed.
pub type Reporter = Arc<dyn Fn(&CleanupFailure) + Send + Sync>;

/// Returns the default [`Reporter`], which logs the failure at error level.
pub fn log_reporter() -> Reporter {
    Arc::new(|failure: &CleanupFailure| match &failure.last_error {
        Some(e) => log::error!("{failure}: {e}"),
        None => log::error!("{failure}"),
    })
}

/// Retry parameters for [`remove_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalPolicy {
    attempts: u32,
    initial_delay: Duration,
    settle: Duration,
}

impl RemovalPolicy {
    /// Four attempts, starting with a one second delay that doubles after every attempt.
    pub const fn new() -> Self {
        Self {
            attempts: 4,
            initial_delay: Duration::from_secs(1),
            settle: Duration::from_millis(100),
        }
    }

    /// Sets the maximum number of removal attempts.
    #[inline]
    pub fn attempts(self, attempts: u32) -> Self {
        Self { attempts, ..self }
    }

    /// Sets the delay after the first failed attempt. It doubles after each further attempt.
    #[inline]
    pub fn initial_delay(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..self
        }
    }

    /// Sets the pause after every attempt, before checking whether the directory is gone.
    ///
    /// Some platforms report a successful removal before the directory entry disappears.
    #[inline]
    pub fn settle(self, settle: Duration) -> Self {
        Self { settle, ..self }
    }
}

impl Default for RemovalPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the directory at `path` and everything in it.
///
/// Returns `true` if the directory no longer exists afterwards (including when it never existed).
/// Otherwise `report` is called once with a [`CleanupFailure`] and `false` is returned.
pub fn remove_dir(path: &Path, policy: &RemovalPolicy, report: &Reporter) -> bool {
    remove_dir_with(
        path,
        policy,
        report,
        |path| {
            clear_readonly(path);
            fs::remove_dir_all(path)
        },
        thread::sleep,
    )
}

fn remove_dir_with<F, S>(
    path: &Path,
    policy: &RemovalPolicy,
    report: &Reporter,
    mut remove: F,
    mut sleep: S,
) -> bool
where
    F: FnMut(&Path) -> io::Result<()>,
    S: FnMut(Duration),
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;
    let mut last_error = None;

    while path.exists() && attempts < policy.attempts {
        match remove(path) {
            Ok(()) => {}
            // Another party may have removed parts of the tree while we walked it.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("removing '{}': {e}", path.display());
                last_error = Some(e);
            }
            Err(e) => {
                log::info!("removing '{}': {e}", path.display());
                last_error = Some(e);
            }
        }
        attempts += 1;

        sleep(policy.settle);
        if path.exists() && attempts < policy.attempts {
            sleep(delay);
            delay = delay.saturating_mul(2);
        }
    }

    if path.exists() {
        report(&CleanupFailure {
            path: path.to_path_buf(),
            attempts,
            last_error,
        });
        false
    } else {
        true
    }
}

/// Best-effort: makes every entry below `path` writable by its owner.
fn clear_readonly(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if meta.file_type().is_symlink() {
        return;
    }

    let mut perms = meta.permissions();
    if perms.readonly() {
        make_writable(&mut perms);
        fs::set_permissions(path, perms).ok();
    }

    if meta.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                clear_readonly(&entry.path());
            }
        }
    }
}

#[cfg(unix)]
fn make_writable(perms: &mut fs::Permissions) {
    use std::os::unix::fs::PermissionsExt;

    perms.set_mode(perms.mode() | 0o700);
}

#[cfg(not(unix))]
#[allow(clippy::permissions_set_readonly_false)]
fn make_writable(perms: &mut fs::Permissions) {
    perms.set_readonly(false);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn quick() -> RemovalPolicy {
        RemovalPolicy::new()
            .initial_delay(Duration::from_millis(1))
            .settle(Duration::ZERO)
    }

    fn capture() -> (Reporter, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let reporter: Reporter = Arc::new(move |failure: &CleanupFailure| {
            seen2.lock().unwrap().push(failure.to_string());
        });
        (reporter, seen)
    }

    #[test]
    fn removes_nested_tree() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("staging");
        fs::create_dir_all(dir.join("a/b")).unwrap();
        fs::write(dir.join("a/b/file"), b"data").unwrap();
        fs::write(dir.join("top"), b"data").unwrap();

        let (reporter, seen) = capture();
        assert!(remove_dir(&dir, &quick(), &reporter));
        assert!(!dir.exists());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn removes_readonly_entries() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("staging");
        fs::create_dir(&dir).unwrap();
        let file = dir.join("locked");
        fs::write(&file, b"data").unwrap();

        let mut perms = fs::metadata(&file).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&file, perms).unwrap();
        let mut perms = fs::metadata(&dir).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&dir, perms).unwrap();

        let (reporter, seen) = capture();
        assert!(remove_dir(&dir, &quick(), &reporter));
        assert!(!dir.exists());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_directory_is_not_a_failure() {
        let base = tempfile::tempdir().unwrap();
        let (reporter, seen) = capture();
        let mut calls = 0;
        let removed = remove_dir_with(
            &base.path().join("gone"),
            &quick(),
            &reporter,
            |_| {
                calls += 1;
                Ok(())
            },
            |_| {},
        );
        assert!(removed);
        assert_eq!(calls, 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn reports_failure_after_retry_budget() {
        let base = tempfile::tempdir().unwrap();
        let (reporter, seen) = capture();
        let mut calls = 0;
        let removed = remove_dir_with(
            base.path(),
            &quick(),
            &reporter,
            |_| {
                calls += 1;
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "in use"))
            },
            |_| {},
        );

        assert!(!removed);
        assert_eq!(calls, 4);
        assert!(base.path().exists());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("after 4 attempts"), "{}", seen[0]);
    }

    #[test]
    fn succeeds_on_a_later_attempt() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("staging");
        fs::create_dir(&dir).unwrap();

        let (reporter, seen) = capture();
        let mut calls = 0;
        let removed = remove_dir_with(
            &dir,
            &quick().attempts(3),
            &reporter,
            |path| {
                calls += 1;
                if calls < 3 {
                    Err(io::Error::new(io::ErrorKind::Other, "busy"))
                } else {
                    fs::remove_dir_all(path)
                }
            },
            |_| {},
        );

        assert!(removed);
        assert_eq!(calls, 3);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn backoff_doubles_between_attempts() {
        let base = tempfile::tempdir().unwrap();
        let (reporter, _seen) = capture();
        let settle = Duration::from_millis(7);
        let delay = Duration::from_millis(100);
        let policy = RemovalPolicy::new().initial_delay(delay).settle(settle);

        let mut sleeps = Vec::new();
        let removed = remove_dir_with(
            base.path(),
            &policy,
            &reporter,
            |_| Err(io::Error::new(io::ErrorKind::PermissionDenied, "in use")),
            |d| sleeps.push(d),
        );

        assert!(!removed);
        // No backoff after the final attempt, only the settle pause.
        assert_eq!(
            sleeps,
            [settle, delay, settle, delay * 2, settle, delay * 4, settle]
        );
    }

    #[test]
    fn no_backoff_once_removed() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("staging");
        fs::create_dir(&dir).unwrap();
        let (reporter, _seen) = capture();
        let settle = Duration::from_millis(7);
        let delay = Duration::from_millis(100);
        let policy = RemovalPolicy::new().initial_delay(delay).settle(settle);

        let mut calls = 0;
        let mut sleeps = Vec::new();
        let removed = remove_dir_with(
            &dir,
            &policy,
            &reporter,
            |path| {
                calls += 1;
                if calls < 2 {
                    Err(io::Error::new(io::ErrorKind::Other, "busy"))
                } else {
                    fs::remove_dir_all(path)
                }
            },
            |d| sleeps.push(d),
        );

        assert!(removed);
        assert_eq!(sleeps, [settle, delay, settle]);
    }
}
