//! Repository state providers.
//!
//! A provider holds the small amount of state a batching repository needs to
//! resume an interrupted fetch. Writes are staged and become visible only when
//! committed, all at once.

use crate::error::{SyncError, SyncResult};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Last `lastModified` seen by an oldest-first fetch.
pub const HIGH_WATER_MARK: &str = "highWaterMark";
/// Server offset token to resume a paged fetch from.
pub const OFFSET: &str = "offset";
/// `newer` bound the stored offset belongs to.
pub const OFFSET_SINCE: &str = "offsetSince";
/// Sort order the stored offset belongs to.
pub const OFFSET_ORDER: &str = "offsetOrder";

/// Keys cleared by [`RepositoryStateProvider::reset_and_commit`].
pub const BATCHING_KEYS: [&str; 4] = [HIGH_WATER_MARK, OFFSET, OFFSET_SINCE, OFFSET_ORDER];

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// An integer.
    Long(i64),
    /// A string.
    String(String),
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateValue::Long(v) => write!(f, "{}", v),
            StateValue::String(v) => f.write_str(v),
        }
    }
}

/// Pending writes, applied atomically by `commit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedWrites {
    ops: Vec<(String, Option<StateValue>)>,
}

impl StagedWrites {
    /// Creates an empty set of writes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages an integer.
    pub fn put_long(mut self, key: impl Into<String>, value: i64) -> Self {
        self.ops.push((key.into(), Some(StateValue::Long(value))));
        self
    }

    /// Stages a string.
    pub fn put_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops
            .push((key.into(), Some(StateValue::String(value.into()))));
        self
    }

    /// Stages a removal.
    pub fn clear(mut self, key: impl Into<String>) -> Self {
        self.ops.push((key.into(), None));
        self
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn apply_to(&self, base: &BTreeMap<String, StateValue>) -> BTreeMap<String, StateValue> {
        let mut next = base.clone();
        for (key, value) in &self.ops {
            match value {
                Some(value) => {
                    next.insert(key.clone(), value.clone());
                }
                None => {
                    next.remove(key);
                }
            }
        }
        next
    }
}

/// Storage for repository resume state.
pub trait RepositoryStateProvider: Send + Sync {
    /// Returns true if committed state survives the process.
    fn is_persistent(&self) -> bool;

    /// Returns a committed integer.
    fn get_long(&self, key: &str) -> Option<i64>;

    /// Returns a committed string.
    fn get_string(&self, key: &str) -> Option<String>;

    /// Applies staged writes atomically.
    fn commit(&self, writes: StagedWrites) -> SyncResult<()>;

    /// Returns every committed entry.
    fn snapshot(&self) -> BTreeMap<String, StateValue>;

    /// Clears the batching keys and commits.
    fn reset_and_commit(&self) -> SyncResult<()> {
        let writes = BATCHING_KEYS
            .iter()
            .fold(StagedWrites::new(), |writes, key| writes.clear(*key));
        self.commit(writes)
    }
}

fn long_of(map: &BTreeMap<String, StateValue>, key: &str) -> Option<i64> {
    match map.get(key) {
        Some(StateValue::Long(v)) => Some(*v),
        Some(StateValue::String(s)) => s.parse().ok(),
        None => None,
    }
}

fn string_of(map: &BTreeMap<String, StateValue>, key: &str) -> Option<String> {
    map.get(key).map(ToString::to_string)
}

/// In-memory provider; state is lost with the process.
#[derive(Debug, Default)]
pub struct NonPersistentRepositoryStateProvider {
    committed: RwLock<BTreeMap<String, StateValue>>,
}

impl NonPersistentRepositoryStateProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RepositoryStateProvider for NonPersistentRepositoryStateProvider {
    fn is_persistent(&self) -> bool {
        false
    }

    fn get_long(&self, key: &str) -> Option<i64> {
        long_of(&self.committed.read(), key)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        string_of(&self.committed.read(), key)
    }

    fn commit(&self, writes: StagedWrites) -> SyncResult<()> {
        let mut committed = self.committed.write();
        *committed = writes.apply_to(&committed);
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, StateValue> {
        self.committed.read().clone()
    }
}

/// File-backed provider.
///
/// State is a JSON object. Commits write a temporary file, fsync it and
/// rename it over the previous state. An exclusive lock on a sibling
/// `.lock` file keeps two processes from sharing one state file.
#[derive(Debug)]
pub struct PersistentRepositoryStateProvider {
    path: PathBuf,
    committed: RwLock<BTreeMap<String, StateValue>>,
    _lock_file: File,
}

fn storage_error(context: &str, path: &Path, err: impl std::fmt::Display) -> SyncError {
    SyncError::Storage(format!("{} {}: {}", context, path.display(), err))
}

impl PersistentRepositoryStateProvider {
    /// Opens (or creates) the state file at `path`.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_path = path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| storage_error("cannot open lock", &lock_path, e))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::Storage(format!(
                "state file is locked by another process: {}",
                path.display()
            )));
        }

        let committed = if path.exists() {
            let data =
                fs::read_to_string(&path).map_err(|e| storage_error("cannot read", &path, e))?;
            if data.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&data).map_err(|e| storage_error("corrupt", &path, e))?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = committed.len(), "opened state file");

        Ok(Self {
            path,
            committed: RwLock::new(committed),
            _lock_file: lock_file,
        })
    }

    /// Returns the state file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, state: &BTreeMap<String, StateValue>) -> SyncResult<()> {
        let temp_path = self.path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(state)?;

        let mut file =
            File::create(&temp_path).map_err(|e| storage_error("cannot create", &temp_path, e))?;
        file.write_all(&data)
            .and_then(|_| file.sync_all())
            .map_err(|e| storage_error("cannot write", &temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &self.path)
            .map_err(|e| storage_error("cannot replace", &self.path, e))?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> SyncResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| storage_error("cannot sync", dir, e))
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> SyncResult<()> {
        Ok(())
    }
}

impl RepositoryStateProvider for PersistentRepositoryStateProvider {
    fn is_persistent(&self) -> bool {
        true
    }

    fn get_long(&self, key: &str) -> Option<i64> {
        long_of(&self.committed.read(), key)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        string_of(&self.committed.read(), key)
    }

    fn commit(&self, writes: StagedWrites) -> SyncResult<()> {
        let mut committed = self.committed.write();
        let next = writes.apply_to(&committed);
        self.write_file(&next)?;
        *committed = next;
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, StateValue> {
        self.committed.read().clone()
    }
}
