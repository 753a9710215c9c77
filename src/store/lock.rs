//! Lock managers guarding the primary allow-list file.
//!
//! Readers take a shared lock, writers an exclusive one. Every acquisition is a single
//! non-blocking attempt; callers loop with a [`BackoffPolicy`] instead of blocking forever.

use std::{
    collections::HashMap,
    fmt::Debug,
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use super::{StoreError, backoff::BackoffPolicy, backoff::retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

/// A held lock. Dropping it releases the lock.
pub struct LockGuard {
    mode: LockMode,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(mode: LockMode, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            mode,
            release: Some(Box::new(release)),
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("mode", &self.mode)
            .field("held", &self.release.is_some())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

pub trait LockManager: Send + Sync + Debug + 'static {
    /// Tries once to lock `path` (opened as `file`) in `mode`.
    ///
    /// Returns `Ok(None)` when the lock is held elsewhere in a conflicting mode.
    fn try_acquire(
        &self,
        file: &File,
        path: &Path,
        mode: LockMode,
    ) -> io::Result<Option<LockGuard>>;

    fn try_acquire_shared(&self, file: &File, path: &Path) -> io::Result<Option<LockGuard>> {
        self.try_acquire(file, path, LockMode::Shared)
    }

    fn try_acquire_exclusive(&self, file: &File, path: &Path) -> io::Result<Option<LockGuard>> {
        self.try_acquire(file, path, LockMode::Exclusive)
    }
}

/// Acquires a lock, retrying contended attempts per `policy`.
///
/// Fails with [`StoreError::LockTimeout`] once the policy gives up.
pub(crate) fn acquire(
    locks: &dyn LockManager,
    file: &File,
    path: &Path,
    mode: LockMode,
    policy: &dyn BackoffPolicy,
) -> Result<LockGuard, StoreError> {
    retry(policy, |attempt| {
        locks
            .try_acquire(file, path, mode)?
            .ok_or(StoreError::LockTimeout {
                mode,
                attempts: attempt,
            })
    })
}

/// OS advisory locks via `flock(2)`.
///
/// Locks belong to the open file description, so two independent opens of the same path
/// conflict even inside one process.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlockLockManager;

impl LockManager for FlockLockManager {
    fn try_acquire(
        &self,
        file: &File,
        _path: &Path,
        mode: LockMode,
    ) -> io::Result<Option<LockGuard>> {
        let held = file.try_clone()?;
        if !try_flock(&held, mode)? {
            return Ok(None);
        }
        Ok(Some(LockGuard::new(mode, move || {
            let _ = unlock(&held);
        })))
    }
}

#[cfg(unix)]
fn try_flock(file: &File, mode: LockMode) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid descriptor owned by `file` for the duration of the call.
    let result = unsafe { libc::flock(fd, op | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: fd is a valid descriptor owned by `file`.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File, _mode: LockMode) -> io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}

/// Reader/writer locks keyed by path, visible only inside this process.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLockManager {
    table: Arc<Mutex<HashMap<PathBuf, Holders>>>,
}

#[derive(Debug, Default)]
struct Holders {
    readers: usize,
    writer: bool,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockManager for InMemoryLockManager {
    fn try_acquire(
        &self,
        _file: &File,
        path: &Path,
        mode: LockMode,
    ) -> io::Result<Option<LockGuard>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let holders = table.entry(path.to_path_buf()).or_default();
        match mode {
            LockMode::Shared if holders.writer => return Ok(None),
            LockMode::Shared => holders.readers += 1,
            LockMode::Exclusive if holders.writer || holders.readers > 0 => return Ok(None),
            LockMode::Exclusive => holders.writer = true,
        }
        drop(table);

        let table = self.table.clone();
        let key = path.to_path_buf();
        Ok(Some(LockGuard::new(mode, move || {
            let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(holders) = table.get_mut(&key) else {
                return;
            };
            match mode {
                LockMode::Shared => holders.readers = holders.readers.saturating_sub(1),
                LockMode::Exclusive => holders.writer = false,
            }
            if holders.readers == 0 && !holders.writer {
                table.remove(&key);
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::OpenOptions, time::Duration};

    use super::*;
    use crate::store::backoff::FixedBackoff;

    fn open(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    fn assert_rw_semantics(locks: &dyn LockManager, path: &Path) {
        let a = open(path);
        let b = open(path);
        let c = open(path);

        let shared_a = locks.try_acquire_shared(&a, path).unwrap().unwrap();
        let shared_b = locks.try_acquire_shared(&b, path).unwrap().unwrap();
        assert_eq!(shared_a.mode(), LockMode::Shared);
        assert!(locks.try_acquire_exclusive(&c, path).unwrap().is_none());

        drop(shared_a);
        assert!(locks.try_acquire_exclusive(&c, path).unwrap().is_none());
        drop(shared_b);

        let exclusive = locks.try_acquire_exclusive(&c, path).unwrap().unwrap();
        assert!(locks.try_acquire_shared(&a, path).unwrap().is_none());
        assert!(locks.try_acquire_exclusive(&b, path).unwrap().is_none());
        drop(exclusive);

        assert!(locks.try_acquire_shared(&a, path).unwrap().is_some());
    }

    #[test]
    fn in_memory_locks_follow_reader_writer_rules() {
        let tmp = tempfile::tempdir().unwrap();
        assert_rw_semantics(&InMemoryLockManager::new(), &tmp.path().join("ips.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn flock_locks_follow_reader_writer_rules() {
        let tmp = tempfile::tempdir().unwrap();
        assert_rw_semantics(&FlockLockManager, &tmp.path().join("ips.txt"));
    }

    #[test]
    fn in_memory_locks_are_per_path() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = InMemoryLockManager::new();
        let one = tmp.path().join("one.txt");
        let two = tmp.path().join("two.txt");
        let _held = locks.try_acquire_exclusive(&open(&one), &one).unwrap().unwrap();
        assert!(locks.try_acquire_exclusive(&open(&two), &two).unwrap().is_some());
    }

    #[test]
    fn acquire_times_out_after_policy_gives_up() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ips.txt");
        let locks = InMemoryLockManager::new();
        let _held = locks.try_acquire_exclusive(&open(&path), &path).unwrap().unwrap();

        let policy = FixedBackoff::new(3, Duration::from_millis(1));
        let err = acquire(&locks, &open(&path), &path, LockMode::Shared, &policy).unwrap_err();
        assert!(matches!(
            err,
            StoreError::LockTimeout {
                mode: LockMode::Shared,
                attempts: 3
            }
        ));
    }
}
