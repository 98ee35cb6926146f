//! Ties `Zone`, `Map`, and `History` together: owns the write protocol,
//! the persistence of Version and ValueChange records, and the public
//! read/write API.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::fs_layout::record_path;
use crate::history::{version as make_history_version, History};
use crate::map::Map;
use crate::merge::{self, MergeArbiter};
use crate::value::{deltas_from_changes, fresh_version_id, Predecessors, Value, ValueChange, Version, VersionId};
use crate::zone::{FsZone, Zone, ZoneRef};

/// The outcome of `Store::merge`: either the two versions were already
/// ordered (no new version is written), or a new two-predecessor version
/// was created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    FastForward(VersionId),
    Merged(VersionId),
}

/// Ties a values `Zone`, a map-nodes `Zone`-backed `Map`, and a `History`
/// together behind the write/read/merge/exchange-ingestion API. Cheaply
/// clonable (an `Arc` handle), so a CLI or exchange task can hold it
/// without owning the store outright.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    values: Arc<dyn Zone>,
    map: Arc<Map>,
    history: History,
    // Held for as long as any clone of this Store is alive; released (and
    // the advisory lock dropped) once the last one goes out of scope.
    _lock: Arc<File>,
}

impl Store {
    /// Opens (creating if absent) a store rooted at `root`, replaying every
    /// persisted version through History and the Map. Takes out an
    /// exclusive advisory lock on the store root so a second process
    /// cannot open the same root concurrently and race the Zone/Map/record
    /// writers.
    pub fn open(root: impl Into<PathBuf>) -> CResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let lock_file = File::create(root.join(".lock"))?;
        lock_file.try_lock_exclusive()?;

        let values = Arc::new(FsZone::open(root.join("values"))?);
        let map_zone: Arc<dyn Zone> = Arc::new(FsZone::open(root.join("map"))?);
        let map = Arc::new(Map::new(map_zone));
        let history = History::new();

        let store = Store { root, values, map, history, _lock: Arc::new(lock_file) };
        store.load()?;
        Ok(store)
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join("versions")
    }

    fn changes_dir(&self) -> PathBuf {
        self.root.join("changes")
    }

    fn version_record_path(&self, id: &str) -> PathBuf {
        record_path(&self.records_dir(), id, "json")
    }

    fn changes_record_path(&self, id: &str) -> PathBuf {
        record_path(&self.changes_dir(), id, "json")
    }

    /// Load protocol: enumerate every serialized Version record,
    /// register with History in two phases (insert-all, then relink), then
    /// replay each version's ValueChange record through the Map in
    /// predecessor-first order so map roots exist for every version.
    fn load(&self) -> CResult<()> {
        let mut records = Vec::new();
        for path in json_files_under(&self.records_dir())? {
            let bytes = fs::read(&path)?;
            records.push(serde_json::from_slice::<Version>(&bytes)?);
        }
        if records.is_empty() {
            return Ok(());
        }

        self.history.query_mut(|h| -> CResult<()> {
            for version in &records {
                h.add(version.clone(), false)?;
            }
            h.relink()
        })?;

        for id in self.history.query(|h| h.topological_iter()).into_iter().rev() {
            let changes = self.read_changes(&id)?;
            let predecessor = self.history.query(|h| h.version(&id)).and_then(|v| match v.predecessors {
                Predecessors::None => None,
                Predecessors::One(p) => Some(p),
                Predecessors::Two(p, _) => Some(p),
            });
            let deltas = deltas_from_changes(&changes, &id);
            self.map.add_version(id, predecessor, deltas)?;
        }
        Ok(())
    }

    fn read_changes(&self, version: &str) -> CResult<Vec<ValueChange>> {
        let bytes = fs::read(self.changes_record_path(version))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_record_atomic(path: &Path, bytes: &[u8]) -> CResult<()> {
        let dir = path.parent().ok_or_else(|| Error::Internal("record path has no parent".into()))?;
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(
            ".{}.tmp-{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
            std::process::id()
        ));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn map(&self) -> &Map {
        self.map.as_ref()
    }

    /// Write protocol. `predecessor` is `None` only for the very first
    /// version in a store.
    pub fn make_version(
        &self,
        predecessor: Option<VersionId>,
        changes: Vec<ValueChange>,
        metadata: BTreeMap<String, String>,
    ) -> CResult<VersionId> {
        let predecessors = match &predecessor {
            None => Predecessors::None,
            Some(p) => Predecessors::One(p.clone()),
        };
        self.commit(predecessors, changes, metadata)
    }

    /// The two-predecessor form used by the merge engine.
    fn make_merge_version(
        &self,
        a: VersionId,
        b: VersionId,
        changes: Vec<ValueChange>,
        metadata: BTreeMap<String, String>,
    ) -> CResult<VersionId> {
        self.commit(Predecessors::Two(a, b), changes, metadata)
    }

    fn commit(
        &self,
        predecessors: Predecessors,
        changes: Vec<ValueChange>,
        metadata: BTreeMap<String, String>,
    ) -> CResult<VersionId> {
        let next_version = fresh_version_id();
        let timestamp = Utc::now();

        let mut written_changes = Vec::with_capacity(changes.len());
        for change in changes {
            let change = match change {
                ValueChange::Insert(mut v) => {
                    self.values.put(&ZoneRef { key: v.id.clone(), version: next_version.clone() }, &v.bytes)?;
                    v.version = Some(next_version.clone());
                    ValueChange::Insert(v)
                }
                ValueChange::Update(mut v) => {
                    self.values.put(&ZoneRef { key: v.id.clone(), version: next_version.clone() }, &v.bytes)?;
                    v.version = Some(next_version.clone());
                    ValueChange::Update(v)
                }
                other => other,
            };
            written_changes.push(change);
        }

        let based_on = match &predecessors {
            Predecessors::None => None,
            Predecessors::One(p) => Some(p.clone()),
            Predecessors::Two(p, _) => Some(p.clone()),
        };
        let deltas = deltas_from_changes(&written_changes, &next_version);
        self.map.add_version(next_version.clone(), based_on, deltas)?;

        let changes_bytes = serde_json::to_vec(&written_changes)?;
        Self::write_record_atomic(&self.changes_record_path(&next_version), &changes_bytes)?;

        let version = make_history_version(next_version.clone(), predecessors, timestamp, metadata);
        let version_bytes = serde_json::to_vec(&version)?;
        // Commit point: the Version record becomes discoverable last, so a
        // crash before this write leaves the version invisible and its
        // Zone/changes/map writes orphaned but harmless.
        Self::write_record_atomic(&self.version_record_path(&next_version), &version_bytes)?;

        self.history.query_mut(|h| h.add(version, true))?;
        log::info!("committed version {next_version}");
        Ok(next_version)
    }

    /// Read protocol.
    pub fn value(&self, key: &str, at_version: &VersionId) -> CResult<Option<Value>> {
        let Some(value_ref) = self.map.value_reference(key, at_version)? else { return Ok(None) };
        let at = ZoneRef { key: value_ref.id.clone(), version: value_ref.version.clone() };
        let Some(bytes) = self.values.get(&at)? else {
            return Err(Error::Internal(format!("map points at missing blob {at:?}")));
        };
        Ok(Some(Value { id: value_ref.id, version: Some(value_ref.version), bytes }))
    }

    /// Merge entry point: fast-forwards when one side is an ancestor of
    /// the other, otherwise diffs against the GCA, asks `arbiter` to
    /// resolve conflicts, and commits a two-predecessor version.
    pub fn merge(&self, a: &VersionId, b: &VersionId, arbiter: &dyn MergeArbiter) -> CResult<MergeOutcome> {
        if a == b {
            return Ok(MergeOutcome::FastForward(a.clone()));
        }
        if self.history.query(|h| h.is_ancestor(a, b)) {
            return Ok(MergeOutcome::FastForward(b.clone()));
        }
        if self.history.query(|h| h.is_ancestor(b, a)) {
            return Ok(MergeOutcome::FastForward(a.clone()));
        }

        let built = merge::build_merge(self, a, b)?;
        let changes = merge::resolve(&built, self, arbiter)?;
        let version = self.make_merge_version(a.clone(), b.clone(), changes, BTreeMap::new())?;
        Ok(MergeOutcome::Merged(version))
    }

    /// Ingests a remote version during exchange: writes Zone bytes for any
    /// `Insert`/`Update` in `changes` (re-keyed at `version.id`, matching
    /// what the originating store wrote), persists the changes/version
    /// records, builds the Map delta, and registers with History. Callers
    /// (the exchange orchestration) are responsible for predecessor-first
    /// ordering; `History::add` rejects a version whose predecessor is
    /// still unknown locally.
    pub fn add_version(&self, version: Version, changes: Vec<ValueChange>) -> CResult<()> {
        for change in &changes {
            if let ValueChange::Insert(v) | ValueChange::Update(v) = change {
                self.values.put(&ZoneRef { key: v.id.clone(), version: version.id.clone() }, &v.bytes)?;
            }
        }

        let based_on = match &version.predecessors {
            Predecessors::None => None,
            Predecessors::One(p) => Some(p.clone()),
            Predecessors::Two(p, _) => Some(p.clone()),
        };
        let deltas = deltas_from_changes(&changes, &version.id);
        self.map.add_version(version.id.clone(), based_on, deltas)?;

        let changes_bytes = serde_json::to_vec(&changes)?;
        Self::write_record_atomic(&self.changes_record_path(&version.id), &changes_bytes)?;
        let version_bytes = serde_json::to_vec(&version)?;
        Self::write_record_atomic(&self.version_record_path(&version.id), &version_bytes)?;

        self.history.query_mut(|h| h.add(version, true))
    }

    /// The changes record persisted for `version`, used by the exchange
    /// protocol's `fetch_changes` and by diff-displaying clients.
    pub fn changes_for(&self, version: &str) -> CResult<Vec<ValueChange>> {
        self.read_changes(version)
    }

    /// The Version record for `id`, from History's in-memory copy.
    pub fn version(&self, id: &str) -> Option<Version> {
        self.history.query(|h| h.version(id))
    }

    pub fn all_version_ids(&self) -> std::collections::HashSet<VersionId> {
        self.history.query(|h| h.all_ids())
    }
}

fn json_files_under(dir: &Path) -> CResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("json")
                && !path.file_name().and_then(|n| n.to_str()).unwrap_or("").starts_with('.')
            {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MostRecentBranchFavoring;

    fn dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn insert(key: &str, bytes: &[u8]) -> ValueChange {
        ValueChange::Insert(Value::new(key, bytes.to_vec()))
    }

    #[test]
    fn make_version_then_read_back() {
        let root = dir();
        let store = Store::open(root.path()).unwrap();
        let v0 = store.make_version(None, vec![insert("AB1111", b"hello")], BTreeMap::new()).unwrap();
        let value = store.value("AB1111", &v0).unwrap().unwrap();
        assert_eq!(value.bytes, b"hello");
    }

    #[test]
    fn linear_history_prevailing_value_is_the_latest_write() {
        let root = dir();
        let store = Store::open(root.path()).unwrap();
        let v0 = store.make_version(None, vec![insert("K", b"1")], BTreeMap::new()).unwrap();
        let v1 = store.make_version(Some(v0.clone()), vec![insert("K", b"2")], BTreeMap::new()).unwrap();
        assert_eq!(store.value("K", &v0).unwrap().unwrap().bytes, b"1");
        assert_eq!(store.value("K", &v1).unwrap().unwrap().bytes, b"2");
    }

    #[test]
    fn reopening_a_store_replays_its_history() {
        let root = dir();
        let v1 = {
            let store = Store::open(root.path()).unwrap();
            let v0 = store.make_version(None, vec![insert("K", b"1")], BTreeMap::new()).unwrap();
            store.make_version(Some(v0), vec![insert("K", b"2")], BTreeMap::new()).unwrap()
        };
        let reopened = Store::open(root.path()).unwrap();
        assert_eq!(reopened.value("K", &v1).unwrap().unwrap().bytes, b"2");
        assert_eq!(reopened.history().query(|h| h.heads()), std::collections::HashSet::from([v1]));
    }

    #[test]
    fn opening_the_same_root_twice_concurrently_fails_the_second_open() {
        let root = dir();
        let _first = Store::open(root.path()).unwrap();
        assert!(Store::open(root.path()).is_err());
    }

    #[test]
    fn merge_of_fast_forwardable_versions_returns_descendant() {
        let root = dir();
        let store = Store::open(root.path()).unwrap();
        let v0 = store.make_version(None, vec![insert("K", b"1")], BTreeMap::new()).unwrap();
        let v1 = store.make_version(Some(v0.clone()), vec![insert("K", b"2")], BTreeMap::new()).unwrap();
        let outcome = store.merge(&v0, &v1, &MostRecentBranchFavoring).unwrap();
        assert_eq!(outcome, MergeOutcome::FastForward(v1));
    }

    #[test]
    fn merge_of_diverged_branches_commits_a_two_predecessor_version() {
        let root = dir();
        let store = Store::open(root.path()).unwrap();
        let v0 = store.make_version(None, vec![insert("K", b"0")], BTreeMap::new()).unwrap();
        let a = store.make_version(Some(v0.clone()), vec![insert("K", b"a")], BTreeMap::new()).unwrap();
        let b = store.make_version(Some(v0), vec![insert("K", b"b")], BTreeMap::new()).unwrap();

        let outcome = store.merge(&a, &b, &MostRecentBranchFavoring).unwrap();
        let MergeOutcome::Merged(merged) = outcome else { panic!("expected a merge commit") };
        let merged_version = store.version(&merged).unwrap();
        assert!(matches!(merged_version.predecessors, Predecessors::Two(..)));
    }

    #[test]
    fn most_recent_branch_favoring_resolves_every_conflict_to_the_later_branch() {
        let root = dir();
        let store = Store::open(root.path()).unwrap();
        let v0 = store
            .make_version(
                None,
                vec![insert("AB1111", b"base-ab"), insert("MM1111", b"base-mm")],
                BTreeMap::new(),
            )
            .unwrap();

        let a = store
            .make_version(Some(v0.clone()), vec![insert("AB1111", b"a-ab")], BTreeMap::new())
            .unwrap();
        // b is committed after a, so its head timestamp is strictly later.
        let b = store
            .make_version(
                Some(v0),
                vec![insert("AB1111", b"b-ab"), insert("MM1111", b"b-mm"), insert("ZZ2222", b"b-zz")],
                BTreeMap::new(),
            )
            .unwrap();
        assert!(store.version(&b).unwrap().timestamp >= store.version(&a).unwrap().timestamp);

        let outcome = store.merge(&a, &b, &MostRecentBranchFavoring).unwrap();
        let MergeOutcome::Merged(merged) = outcome else { panic!("expected a merge commit") };

        assert_eq!(store.value("AB1111", &merged).unwrap().unwrap().bytes, b"b-ab");
        assert_eq!(store.value("MM1111", &merged).unwrap().unwrap().bytes, b"b-mm");
        assert_eq!(store.value("ZZ2222", &merged).unwrap().unwrap().bytes, b"b-zz");
    }
}
