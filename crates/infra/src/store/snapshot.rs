//! Persistence of committed database state.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use strata_core::RecordId;

use super::error::{StoreError, StoreResult};
use super::table::Table;

/// Everything needed to reopen a database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseState {
    pub commit_seq: u64,
    pub tables: BTreeMap<String, Table>,
    /// Last id handed out per table; ids are never reused.
    pub sequences: BTreeMap<String, RecordId>,
}

/// Durable home of committed database states.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, db: &str) -> StoreResult<Option<DatabaseState>>;
    fn save(&self, db: &str, state: &DatabaseState) -> StoreResult<()>;
    /// Names of the databases this store holds.
    fn list(&self) -> StoreResult<Vec<String>>;
}

impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    fn load(&self, db: &str) -> StoreResult<Option<DatabaseState>> {
        (**self).load(db)
    }

    fn save(&self, db: &str, state: &DatabaseState) -> StoreResult<()> {
        (**self).save(db, state)
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        (**self).list()
    }
}

/// Snapshot store kept in process memory, for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    states: RwLock<HashMap<String, DatabaseState>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(&self, db: &str) -> StoreResult<Option<DatabaseState>> {
        let states = self
            .states
            .read()
            .map_err(|_| StoreError::Snapshot("lock poisoned".to_string()))?;
        Ok(states.get(db).cloned())
    }

    fn save(&self, db: &str, state: &DatabaseState) -> StoreResult<()> {
        let mut states = self
            .states
            .write()
            .map_err(|_| StoreError::Snapshot("lock poisoned".to_string()))?;
        states.insert(db.to_string(), state.clone());
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let states = self
            .states
            .read()
            .map_err(|_| StoreError::Snapshot("lock poisoned".to_string()))?;
        let mut names: Vec<_> = states.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Snapshot store writing one JSON document per database under a directory.
///
/// Files are replaced atomically through a temporary file and a rename.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Snapshot(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, db: &str) -> PathBuf {
        self.dir.join(format!("{db}.json"))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, db: &str) -> StoreResult<Option<DatabaseState>> {
        let path = self.path(db);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)
            .map_err(|e| StoreError::Snapshot(format!("cannot read {}: {e}", path.display())))?;
        let state = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Snapshot(format!("corrupt snapshot {}: {e}", path.display())))?;
        Ok(Some(state))
    }

    fn save(&self, db: &str, state: &DatabaseState) -> StoreResult<()> {
        let path = self.path(db);
        let tmp = self.dir.join(format!("{db}.json.tmp"));
        let raw = serde_json::to_vec(state)
            .map_err(|e| StoreError::Snapshot(format!("cannot encode snapshot: {e}")))?;
        fs::write(&tmp, raw)
            .map_err(|e| StoreError::Snapshot(format!("cannot write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| StoreError::Snapshot(format!("cannot replace {}: {e}", path.display())))?;
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::Snapshot(format!("cannot list {}: {e}", self.dir.display())))?;
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }
}
