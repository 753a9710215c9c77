//! Timestamp-named snapshots of the allow list and restoring them.

use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, NaiveDateTime, SubsecRound as _, TimeDelta, Utc};
use tracing::{debug, info};

use super::{
    BackoffPolicy, LockManager, LockMode, StagedFile, StoreConfig, StoreError, lock::acquire,
    overwrite_locked, parse_lines,
};

pub const DEFAULT_PREFIX: &str = "allowed_ips";
pub const DEFAULT_EXTENSION: &str = "txt";

const KEY_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";
// YYYYMMDD_HHMMSS_ffffff
const KEY_LEN: usize = 22;

/// Name of one snapshot file, e.g. `allowed_ips_20240131_235959_000123.txt`.
///
/// Ordering follows the file name, which for a fixed prefix is chronological.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId {
    name: String,
    created_at: DateTime<Utc>,
}

impl SnapshotId {
    /// Parses a snapshot file name. Returns `None` for anything that is not a snapshot.
    pub fn parse(name: &str, prefix: &str, extension: &str) -> Option<Self> {
        let key = name
            .strip_prefix(prefix)?
            .strip_prefix('_')?
            .strip_suffix(extension)?
            .strip_suffix('.')?;
        let created_at = parse_key(key)?;
        Some(Self {
            name: name.to_string(),
            created_at,
        })
    }

    fn new(created_at: DateTime<Utc>, prefix: &str, extension: &str) -> Self {
        Self {
            name: format!("{prefix}_{}.{extension}", created_at.format(KEY_FORMAT)),
            created_at,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

fn parse_key(key: &str) -> Option<DateTime<Utc>> {
    let bytes = key.as_bytes();
    if bytes.len() != KEY_LEN {
        return None;
    }
    let shape_ok = bytes.iter().enumerate().all(|(i, b)| match i {
        8 | 15 => *b == b'_',
        _ => b.is_ascii_digit(),
    });
    if !shape_ok {
        return None;
    }
    let seconds = NaiveDateTime::parse_from_str(&key[..15], "%Y%m%d_%H%M%S").ok()?;
    let micros: i64 = key[16..].parse().ok()?;
    let at = seconds.checked_add_signed(TimeDelta::microseconds(micros))?;
    Some(at.and_utc())
}

/// Append-only archive of allow-list states, one file per snapshot.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    prefix: String,
    extension: String,
    primary: PathBuf,
    locks: Arc<dyn LockManager>,
    backoff: Arc<dyn BackoffPolicy>,
    last_key: Mutex<Option<DateTime<Utc>>>,
}

impl SnapshotStore {
    pub fn open(
        config: &StoreConfig,
        locks: Arc<dyn LockManager>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.versions_dir)?;
        let store = Self {
            dir: config.versions_dir.clone(),
            prefix: config.snapshot_prefix.clone(),
            extension: config.snapshot_extension.clone(),
            primary: config.ip_file.clone(),
            locks,
            backoff,
            last_key: Mutex::new(None),
        };
        // New keys must sort after existing history even if the clock went backwards.
        let newest = store.list()?.into_iter().next().map(|id| id.created_at());
        *store.last_key.lock().unwrap_or_else(PoisonError::into_inner) = newest;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, id: &SnapshotId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    /// Copies the current bytes of `source` into a new snapshot.
    pub fn archive(&self, source: &Path) -> Result<SnapshotId, StoreError> {
        let bytes = fs::read(source)?;
        self.archive_bytes(&bytes)
    }

    /// Publishes `bytes` as a new snapshot.
    ///
    /// The content is written to a hidden temp file and hard-linked under its final name, so a
    /// listed snapshot is always complete and an existing one is never overwritten. A name taken
    /// by another process moves the key forward by one microsecond.
    pub(crate) fn archive_bytes(&self, bytes: &[u8]) -> Result<SnapshotId, StoreError> {
        let staged = StagedFile::write(&self.dir, &self.prefix, bytes)?;
        let id = loop {
            let id = SnapshotId::new(self.next_timestamp(), &self.prefix, &self.extension);
            if staged.publish(&self.path_of(&id))? {
                break id;
            }
            debug!(snapshot_id = %id, "snapshot name taken, advancing key");
        };
        info!(snapshot_id = %id, bytes = bytes.len(), "archived allow list");
        Ok(id)
    }

    /// All snapshots, most recent first.
    pub fn list(&self) -> Result<Vec<SnapshotId>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = SnapshotId::parse(name, &self.prefix, &self.extension) {
                ids.push(id);
            }
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    /// Looks up a listed snapshot by name.
    pub fn get(&self, id: &str) -> Result<SnapshotId, StoreError> {
        self.list()?
            .into_iter()
            .find(|snapshot| snapshot.as_str() == id)
            .ok_or_else(|| StoreError::SnapshotNotFound { id: id.to_string() })
    }

    /// Addresses stored in one snapshot.
    pub fn read(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let id = self.get(id)?;
        let text = fs::read_to_string(self.path_of(&id))?;
        Ok(parse_lines(&text))
    }

    /// Copies a snapshot's bytes over the primary file.
    ///
    /// The overwritten state is not archived. An existing primary file is written under its
    /// exclusive lock; an absent one is published whole. The copy itself is attempted once.
    pub fn restore(&self, id: &str) -> Result<SnapshotId, StoreError> {
        let id = self.get(id)?;
        let bytes = fs::read(self.path_of(&id))?;

        loop {
            match OpenOptions::new().write(true).open(&self.primary) {
                Ok(mut file) => {
                    let _guard = acquire(
                        self.locks.as_ref(),
                        &file,
                        &self.primary,
                        LockMode::Exclusive,
                        self.backoff.as_ref(),
                    )?;
                    overwrite_locked(&mut file, &bytes)?;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    if publish_primary(&self.primary, &bytes)? {
                        break;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!(
            snapshot_id = %id,
            path = %self.primary.display(),
            "restored allow list from snapshot"
        );
        Ok(id)
    }

    /// Next key: the current time in microseconds, strictly after the last key issued or found.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_key.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now().trunc_subsecs(6);
        let next = match *last {
            Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }
}

/// Creates an absent primary file with its full content. Returns `false` if it appeared meanwhile.
pub(crate) fn publish_primary(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let stem = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("primary");
    StagedFile::write(dir, stem, bytes)?.publish(path)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, fs::File, time::Duration};

    use chrono::TimeZone as _;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::{FixedBackoff, InMemoryLockManager};

    fn store_in(dir: &Path) -> SnapshotStore {
        let config = StoreConfig::new(dir.join("allowed_ips.txt"), dir.join("versions"));
        SnapshotStore::open(
            &config,
            Arc::new(InMemoryLockManager::new()),
            Arc::new(FixedBackoff::new(2, Duration::from_millis(1))),
        )
        .unwrap()
    }

    #[test]
    fn snapshot_names_round_trip_through_parse() {
        let at = Utc
            .with_ymd_and_hms(2024, 1, 31, 23, 59, 59)
            .unwrap()
            .checked_add_signed(TimeDelta::microseconds(123))
            .unwrap();
        let id = SnapshotId::new(at, "allowed_ips", "txt");
        assert_eq!(id.as_str(), "allowed_ips_20240131_235959_000123.txt");

        let parsed = SnapshotId::parse(id.as_str(), "allowed_ips", "txt").unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.created_at(), at);
    }

    #[test]
    fn parse_rejects_foreign_names() {
        for name in [
            "allowed_ips.txt",
            "allowed_ips_20240131_235959.txt",
            "allowed_ips_20240131_235959_000123.bak",
            "other_20240131_235959_000123.txt",
            "allowed_ips_2024013a_235959_000123.txt",
            "allowed_ips_20241331_235959_000123.txt",
            ".allowed_ips.tmp.1.0",
            "../allowed_ips_20240131_235959_000123.txt",
        ] {
            assert_eq!(SnapshotId::parse(name, "allowed_ips", "txt"), None, "{name}");
        }
    }

    #[test]
    fn rapid_archives_get_distinct_ordered_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        let mut created = Vec::new();
        for i in 0..50 {
            created.push(store.archive_bytes(format!("10.0.0.{i}\n").as_bytes()).unwrap());
        }

        let unique: BTreeSet<_> = created.iter().map(|id| id.as_str().to_string()).collect();
        assert_eq!(unique.len(), 50);

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 50);
        let mut expected = created.clone();
        expected.reverse();
        assert_eq!(listed, expected);
    }

    #[test]
    fn list_ignores_unrelated_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        fs::write(store.dir().join("README"), "notes").unwrap();
        fs::write(store.dir().join(".allowed_ips.tmp.99.0"), "partial").unwrap();
        let id = store.archive_bytes(b"8.8.8.8\n").unwrap();

        assert_eq!(store.list().unwrap(), vec![id]);
    }

    #[test]
    fn archive_copies_file_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let source = tmp.path().join("allowed_ips.txt");
        fs::write(&source, "8.8.8.8\n1.1.1.1\n").unwrap();

        let id = store.archive(&source).unwrap();
        assert_eq!(fs::read(store.path_of(&id)).unwrap(), b"8.8.8.8\n1.1.1.1\n");
        assert_eq!(store.read(id.as_str()).unwrap(), vec!["8.8.8.8", "1.1.1.1"]);
    }

    #[test]
    fn archive_of_missing_source_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let err = store.archive(&tmp.path().join("missing.txt")).unwrap_err();
        assert_eq!(err.kind(), "io");
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn restore_overwrites_primary_without_archiving() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let primary = tmp.path().join("allowed_ips.txt");
        let id = store.archive_bytes(b"8.8.8.8\n").unwrap();
        fs::write(&primary, "1.1.1.1\n9.9.9.9\n").unwrap();

        let restored = store.restore(id.as_str()).unwrap();
        assert_eq!(restored, id);
        assert_eq!(fs::read_to_string(&primary).unwrap(), "8.8.8.8\n");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn restore_unknown_id_leaves_primary_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let primary = tmp.path().join("allowed_ips.txt");
        fs::write(&primary, "1.1.1.1\n").unwrap();
        store.archive_bytes(b"8.8.8.8\n").unwrap();

        let err = store
            .restore("allowed_ips_19990101_000000_000000.txt")
            .unwrap_err();
        assert!(matches!(err, StoreError::SnapshotNotFound { .. }));
        let err = store.restore("../allowed_ips.txt").unwrap_err();
        assert!(matches!(err, StoreError::SnapshotNotFound { .. }));
        assert_eq!(fs::read_to_string(&primary).unwrap(), "1.1.1.1\n");
    }

    #[test]
    fn restore_times_out_while_primary_is_locked() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = InMemoryLockManager::new();
        let config = StoreConfig::new(
            tmp.path().join("allowed_ips.txt"),
            tmp.path().join("versions"),
        );
        let store = SnapshotStore::open(
            &config,
            Arc::new(locks.clone()),
            Arc::new(FixedBackoff::new(2, Duration::from_millis(1))),
        )
        .unwrap();
        fs::write(&config.ip_file, "1.1.1.1\n").unwrap();
        let id = store.archive_bytes(b"8.8.8.8\n").unwrap();

        let reader = File::open(&config.ip_file).unwrap();
        let _held = locks
            .try_acquire_shared(&reader, &config.ip_file)
            .unwrap()
            .unwrap();
        let err = store.restore(id.as_str()).unwrap_err();
        assert_eq!(err.kind(), "lock_timeout");
        assert_eq!(fs::read_to_string(&config.ip_file).unwrap(), "1.1.1.1\n");
    }

    #[test]
    fn new_keys_sort_after_existing_history() {
        let tmp = tempfile::tempdir().unwrap();
        let versions = tmp.path().join("versions");
        fs::create_dir_all(&versions).unwrap();
        let future = "allowed_ips_29991231_235959_999999.txt";
        fs::write(versions.join(future), "8.8.8.8\n").unwrap();

        let store = store_in(tmp.path());
        let id = store.archive_bytes(b"1.1.1.1\n").unwrap();

        assert!(id.as_str() > future, "{id}");
        let listed = store.list().unwrap();
        assert_eq!(listed[0], id);
        assert_eq!(listed[1].as_str(), future);
    }

    #[test]
    fn restore_recreates_absent_primary() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let primary = tmp.path().join("allowed_ips.txt");
        let id = store.archive_bytes(b"8.8.8.8\n").unwrap();

        store.restore(id.as_str()).unwrap();
        assert_eq!(fs::read_to_string(&primary).unwrap(), "8.8.8.8\n");
        assert_eq!(store.list().unwrap(), vec![id]);
    }
}
