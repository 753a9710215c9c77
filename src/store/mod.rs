//! Persistence core: the primary allow-list file and its snapshot history.
//!
//! - [`AllowListStore`] reads under a shared lock and writes under an exclusive lock, archiving
//!   the previous content through [`SnapshotStore`] before every overwrite.
//! - [`SnapshotStore`] keeps timestamp-named, immutable copies and restores them on request.
//! - [`LockManager`] and [`BackoffPolicy`] are the seams for alternative lock backends and retry
//!   strategies.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::debug;

pub mod allowlist;
pub mod backoff;
pub mod lock;
pub mod snapshot;

pub use allowlist::AllowListStore;
pub use backoff::{BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use lock::{FlockLockManager, InMemoryLockManager, LockGuard, LockManager, LockMode};
pub use snapshot::{SnapshotId, SnapshotStore};

/// Where the store keeps its files. Built once at startup and injected into the stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub ip_file: PathBuf,
    pub versions_dir: PathBuf,
    pub snapshot_prefix: String,
    pub snapshot_extension: String,
}

impl StoreConfig {
    pub fn new(ip_file: impl Into<PathBuf>, versions_dir: impl Into<PathBuf>) -> Self {
        Self {
            ip_file: ip_file.into(),
            versions_dir: versions_dir.into(),
            snapshot_prefix: snapshot::DEFAULT_PREFIX.to_string(),
            snapshot_extension: snapshot::DEFAULT_EXTENSION.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    LockTimeout { mode: LockMode, attempts: u32 },
    Io(io::Error),
    SnapshotNotFound { id: String },
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Io(_) => "io",
            Self::SnapshotNotFound { .. } => "snapshot_not_found",
        }
    }

    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Io(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockTimeout { mode, attempts } => write!(
                f,
                "timed out acquiring {} lock after {attempts} attempts",
                mode.as_str()
            ),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SnapshotNotFound { id } => write!(f, "snapshot not found: {id}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::LockTimeout { .. } | Self::SnapshotNotFound { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// The allow-list store and its snapshot history, sharing one lock manager and backoff policy.
#[derive(Debug, Clone)]
pub struct Store {
    pub allowlist: AllowListStore,
    pub snapshots: Arc<SnapshotStore>,
}

impl Store {
    /// Opens the store with `flock` locking and the default fixed backoff.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with(
            config,
            Arc::new(FlockLockManager),
            Arc::new(FixedBackoff::default()),
        )
    }

    pub fn open_with(
        config: StoreConfig,
        locks: Arc<dyn LockManager>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = config.ip_file.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let snapshots = Arc::new(SnapshotStore::open(&config, locks.clone(), backoff.clone())?);
        let allowlist =
            AllowListStore::new(config.ip_file.clone(), snapshots.clone(), locks, backoff);
        Ok(Self {
            allowlist,
            snapshots,
        })
    }
}

/// Parses the one-address-per-line format. Surrounding whitespace and blank lines are ignored.
pub(crate) fn parse_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn encode_lines(list: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(list.iter().map(|ip| ip.len() + 1).sum());
    for ip in list {
        out.extend_from_slice(ip.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Replaces the whole content of an already-locked file and flushes it to disk.
pub(crate) fn overwrite_locked(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(bytes)?;
    file.sync_all()
}

static STAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Complete content waiting in a hidden temp file to be linked under its final name.
///
/// The temp file is removed on drop.
#[derive(Debug)]
pub(crate) struct StagedFile {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl StagedFile {
    /// Writes `bytes` to `.<stem>.tmp.<pid>.<seq>` inside `dir` and flushes it.
    pub(crate) fn write(dir: &Path, stem: &str, bytes: &[u8]) -> io::Result<Self> {
        let seq = STAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        let staged = Self {
            path: dir.join(format!(".{stem}.tmp.{}.{seq}", std::process::id())),
            bytes: bytes.to_vec(),
        };
        write_new(&staged.path, bytes)?;
        Ok(staged)
    }

    /// Publishes the content at `dest` unless something already lives there.
    ///
    /// Returns `false` when `dest` is taken. Readers never see `dest` half-written, except on
    /// filesystems without hard links, where the content is written to `dest` directly.
    pub(crate) fn publish(&self, dest: &Path) -> io::Result<bool> {
        match fs::hard_link(&self.path, dest) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
                ) =>
            {
                debug!(dest = %dest.display(), error = %err, "hard link refused, copying instead");
                copy_new(dest, &self.bytes)
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Writes `bytes` to a file that must not exist yet. Returns `false` when `dest` is taken.
pub(crate) fn copy_new(dest: &Path, bytes: &[u8]) -> io::Result<bool> {
    match write_new(dest, bytes) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => {
            let _ = fs::remove_file(dest);
            Err(err)
        }
    }
}

fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
