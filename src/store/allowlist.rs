//! The primary allow-list file: locked loads and archiving saves.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};

use super::{
    BackoffPolicy, LockManager, LockMode, SnapshotId, SnapshotStore, StoreError, backoff::retry,
    encode_lines, overwrite_locked, parse_lines, snapshot::publish_primary,
};

/// Owns the primary allow-list file.
///
/// Loads run in parallel under a shared lock. A save holds the exclusive lock for the whole
/// archive-then-overwrite sequence, so readers see either the old list or the new one.
#[derive(Debug, Clone)]
pub struct AllowListStore {
    path: PathBuf,
    snapshots: Arc<SnapshotStore>,
    locks: Arc<dyn LockManager>,
    backoff: Arc<dyn BackoffPolicy>,
}

impl AllowListStore {
    pub fn new(
        path: PathBuf,
        snapshots: Arc<SnapshotStore>,
        locks: Arc<dyn LockManager>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Self {
        Self {
            path,
            snapshots,
            locks,
            backoff,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current list, or an empty list when the file is absent or cannot be read in time.
    ///
    /// Lock timeouts and I/O failures are logged and degrade to an empty list; callers cannot
    /// tell them apart from a genuinely empty file.
    pub fn load(&self) -> Vec<String> {
        match self.try_load() {
            Ok(list) => list,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "allow list unreadable, serving empty list"
                );
                Vec::new()
            }
        }
    }

    /// Like [`load`](Self::load) but reports why the file could not be read.
    pub fn try_load(&self) -> Result<Vec<String>, StoreError> {
        retry(self.backoff.as_ref(), |attempt| self.load_once(attempt))
    }

    fn load_once(&self, attempt: u32) -> Result<Vec<String>, StoreError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let Some(_guard) = self.locks.try_acquire_shared(&file, &self.path)? else {
            return Err(StoreError::LockTimeout {
                mode: LockMode::Shared,
                attempts: attempt,
            });
        };
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        Ok(parse_lines(&text))
    }

    /// Replaces the list on disk, archiving the previous content first.
    ///
    /// Returns the snapshot holding the previous content, or `None` when the file did not exist.
    /// An absent file is created with its full content in one step, so a failed save never
    /// leaves one behind.
    pub fn save(&self, list: &[String]) -> Result<Option<SnapshotId>, StoreError> {
        let bytes = encode_lines(list);
        let archived = retry(self.backoff.as_ref(), |attempt| self.save_once(&bytes, attempt))?;
        info!(
            path = %self.path.display(),
            count = list.len(),
            snapshot_id = archived.as_ref().map(|id| id.as_str()),
            "saved allow list"
        );
        Ok(archived)
    }

    fn save_once(&self, bytes: &[u8], attempt: u32) -> Result<Option<SnapshotId>, StoreError> {
        loop {
            match OpenOptions::new().read(true).write(true).open(&self.path) {
                Ok(file) => return self.replace_locked(file, bytes, attempt).map(Some),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    if publish_primary(&self.path, bytes)? {
                        return Ok(None);
                    }
                    debug!(path = %self.path.display(), "allow list created concurrently");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn replace_locked(
        &self,
        mut file: File,
        bytes: &[u8],
        attempt: u32,
    ) -> Result<SnapshotId, StoreError> {
        let Some(_guard) = self.locks.try_acquire_exclusive(&file, &self.path)? else {
            debug!(attempt, path = %self.path.display(), "allow list locked, save deferred");
            return Err(StoreError::LockTimeout {
                mode: LockMode::Exclusive,
                attempts: attempt,
            });
        };

        let mut current = Vec::new();
        file.read_to_end(&mut current)?;
        let archived = self.snapshots.archive_bytes(&current)?;

        overwrite_locked(&mut file, bytes)?;
        Ok(archived)
    }
}
