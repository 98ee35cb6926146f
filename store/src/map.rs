//! The hierarchical trie index answering "which `ValueRef`s existed at
//! version V" and "which keys differ between V1 and V2" without scanning
//! every value.
//!
//! Nodes are persisted as content blobs in a `Zone` dedicated to map nodes
//! (a second `Zone` instance, distinct from the one holding value payloads,
//! reusing the `Zone` abstraction without sharing one instance's key space
//! with values). Each node's `ZoneRef` is `(prefix, version)`: a node
//! unaffected by a version's deltas is never rewritten — the new root
//! simply references the old `NodeRef`, giving structural sharing between
//! versions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::value::{MapDelta, ValueId, ValueRef, VersionId};
use crate::zone::{Zone, ZoneRef};

/// A leaf node holds at most this many entries directly before splitting
/// into child nodes keyed by the next character of the key. Chosen small so
/// tests can exercise splitting without building large fixtures; not spec-
/// mandated.
const SPLIT_THRESHOLD: usize = 4;

/// Addresses a map node: the key prefix it covers and the version that
/// wrote it. Doubles as the node's `Zone` reference (`prefix` as the
/// Zone's `key`, `version` as the Zone's `version`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub prefix: String,
    pub version: VersionId,
}

/// A node either lists the `ValueRef`s sharing its prefix, or further
/// splits the prefix across child nodes. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Children {
    Values(Vec<ValueRef>),
    Nodes(Vec<NodeRef>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct MapNode {
    children: Children,
}

/// Which of the two branches a `Fork` variant's state came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Branch {
    First,
    Second,
}

/// The per-key classification of how two branches diverged since their
/// greatest common ancestor. Ephemeral — produced only by `differences`,
/// consumed only by the merge engine.
#[derive(Clone, Debug, PartialEq)]
pub enum Fork {
    Inserted { branch: Branch, value: ValueRef },
    TwiceInserted { first: ValueRef, second: ValueRef },
    Updated { branch: Branch, value: ValueRef },
    TwiceUpdated { first: ValueRef, second: ValueRef },
    Removed { branch: Branch },
    TwiceRemoved,
    RemovedAndUpdated { removed_on: Branch, updated_value: ValueRef },
}

/// A `Fork` paired with the key it describes.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedFork {
    pub key: ValueId,
    pub fork: Fork,
}

/// The trie index. One `Map` per `Store`, backed by a node-dedicated `Zone`.
pub struct Map {
    zone: Arc<dyn Zone>,
    roots: RwLock<HashMap<VersionId, Option<NodeRef>>>,
}

impl Map {
    pub fn new(zone: Arc<dyn Zone>) -> Self {
        Map { zone, roots: RwLock::new(HashMap::new()) }
    }

    fn load_node(&self, node_ref: &NodeRef) -> CResult<MapNode> {
        let at = ZoneRef { key: node_ref.prefix.clone(), version: node_ref.version.clone() };
        let bytes = self
            .zone
            .get(&at)?
            .ok_or_else(|| Error::Internal(format!("missing map node {node_ref:?}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn store_node(&self, node_ref: &NodeRef, node: &MapNode) -> CResult<()> {
        let at = ZoneRef { key: node_ref.prefix.clone(), version: node_ref.version.clone() };
        let bytes = serde_json::to_vec(node)?;
        self.zone.put(&at, &bytes)
    }

    fn root_of(&self, version: &VersionId) -> CResult<Option<NodeRef>> {
        self.roots
            .read()
            .expect("map roots lock poisoned")
            .get(version)
            .cloned()
            .ok_or_else(|| Error::MissingVersion(version.clone()))
    }

    /// Registers a fresh root for `new` without persisting anything — used
    /// by `Store::open` to seed the root of the very first version (whose
    /// delta list and predecessor are both trivial) before replay begins.
    fn set_root(&self, new: VersionId, root: Option<NodeRef>) {
        self.roots.write().expect("map roots lock poisoned").insert(new, root);
    }

    /// Produces a new map rooted at `new`, built from `based_on`'s map
    /// updated by `deltas`. Subtrees untouched by `deltas` are shared with
    /// `based_on`'s tree rather than rewritten.
    pub fn add_version(
        &self,
        new: VersionId,
        based_on: Option<VersionId>,
        deltas: Vec<MapDelta>,
    ) -> CResult<()> {
        let base_root = match based_on {
            Some(v) => self.root_of(&v)?,
            None => None,
        };

        if deltas.is_empty() {
            self.set_root(new, base_root);
            return Ok(());
        }

        let base_node = match &base_root {
            Some(node_ref) => Some(self.load_node(node_ref)?),
            None => None,
        };

        let new_root = self.rebuild("", base_node, &deltas, &new)?;
        self.set_root(new, new_root);
        Ok(())
    }

    /// Rebuilds the subtree covering `prefix`. `deltas` is already filtered
    /// to keys under `prefix` and is guaranteed non-empty by the caller.
    fn rebuild(
        &self,
        prefix: &str,
        node: Option<MapNode>,
        deltas: &[MapDelta],
        new_version: &VersionId,
    ) -> CResult<Option<NodeRef>> {
        match node.map(|n| n.children) {
            Some(Children::Nodes(children)) => self.rebuild_split(prefix, children, deltas, new_version),
            Some(Children::Values(values)) => {
                self.rebuild_leaf(prefix, to_map(values), deltas, new_version)
            }
            None => self.rebuild_leaf(prefix, BTreeMap::new(), deltas, new_version),
        }
    }

    fn rebuild_leaf(
        &self,
        prefix: &str,
        mut values: BTreeMap<ValueId, ValueRef>,
        deltas: &[MapDelta],
        new_version: &VersionId,
    ) -> CResult<Option<NodeRef>> {
        for delta in deltas {
            if delta.removed {
                values.remove(&delta.key);
            } else if let Some(added) = &delta.added {
                values.insert(delta.key.clone(), added.clone());
            }
        }

        if values.is_empty() {
            return Ok(None);
        }

        if values.len() <= SPLIT_THRESHOLD {
            let node_ref = NodeRef { prefix: prefix.to_string(), version: new_version.clone() };
            self.store_node(
                &node_ref,
                &MapNode { children: Children::Values(values.into_values().collect()) },
            )?;
            return Ok(Some(node_ref));
        }

        // Over threshold: split into fresh leaves keyed by the next
        // character, expressed as synthetic insert deltas so the usual leaf
        // path handles each bucket (and may itself split further).
        let mut buckets: BTreeMap<char, Vec<MapDelta>> = BTreeMap::new();
        for (key, value) in values {
            let bucket = next_char(&key, prefix.len());
            buckets.entry(bucket).or_default().push(MapDelta {
                key,
                added: Some(value),
                removed: false,
            });
        }

        let mut children = Vec::new();
        for (bucket, bucket_deltas) in buckets {
            let child_prefix = format!("{prefix}{bucket}");
            if let Some(child_ref) = self.rebuild_leaf(&child_prefix, BTreeMap::new(), &bucket_deltas, new_version)? {
                children.push(child_ref);
            }
        }

        let node_ref = NodeRef { prefix: prefix.to_string(), version: new_version.clone() };
        self.store_node(&node_ref, &MapNode { children: Children::Nodes(children) })?;
        Ok(Some(node_ref))
    }

    fn rebuild_split(
        &self,
        prefix: &str,
        children: Vec<NodeRef>,
        deltas: &[MapDelta],
        new_version: &VersionId,
    ) -> CResult<Option<NodeRef>> {
        let mut by_bucket: HashMap<char, Vec<MapDelta>> = HashMap::new();
        for delta in deltas {
            by_bucket.entry(next_char(&delta.key, prefix.len())).or_default().push(delta.clone());
        }

        let mut new_children = Vec::new();
        for child in children {
            let bucket = child.prefix.chars().last().unwrap_or('\u{0}');
            match by_bucket.remove(&bucket) {
                None => new_children.push(child),
                Some(bucket_deltas) => {
                    let child_node = self.load_node(&child)?;
                    if let Some(new_ref) =
                        self.rebuild(&child.prefix, Some(child_node), &bucket_deltas, new_version)?
                    {
                        new_children.push(new_ref);
                    }
                }
            }
        }

        // Buckets with deltas but no existing child: brand new subtrees.
        for (bucket, bucket_deltas) in by_bucket {
            let child_prefix = format!("{prefix}{bucket}");
            if let Some(new_ref) = self.rebuild(&child_prefix, None, &bucket_deltas, new_version)? {
                new_children.push(new_ref);
            }
        }

        if new_children.is_empty() {
            return Ok(None);
        }
        let node_ref = NodeRef { prefix: prefix.to_string(), version: new_version.clone() };
        self.store_node(&node_ref, &MapNode { children: Children::Nodes(new_children) })?;
        Ok(Some(node_ref))
    }

    /// Full enumeration of the `ValueRef`s live at `at`, via traversal of
    /// its root.
    pub fn value_references(&self, at: &VersionId) -> CResult<Vec<ValueRef>> {
        let root = self.root_of(at)?;
        let mut out = Vec::new();
        if let Some(node_ref) = root {
            self.collect(&node_ref, &mut out)?;
        }
        Ok(out)
    }

    fn collect(&self, node_ref: &NodeRef, out: &mut Vec<ValueRef>) -> CResult<()> {
        match self.load_node(node_ref)?.children {
            Children::Values(values) => out.extend(values),
            Children::Nodes(children) => {
                for child in children {
                    self.collect(&child, out)?;
                }
            }
        }
        Ok(())
    }

    /// Descends the prefix path for `key`, returning its live `ValueRef` at
    /// `at`, or `None` if absent.
    pub fn value_reference(&self, key: &str, at: &VersionId) -> CResult<Option<ValueRef>> {
        match self.root_of(at)? {
            Some(root) => self.descend(&root, key),
            None => Ok(None),
        }
    }

    /// Walks down from `root` along `key`'s prefix path, O(depth) rather
    /// than a full traversal. Shared by `value_reference` and by
    /// `differences`, which only needs this for the handful of keys a
    /// tree-diff actually flagged as changed.
    fn descend(&self, root: &NodeRef, key: &str) -> CResult<Option<ValueRef>> {
        let mut node_ref = root.clone();
        loop {
            match self.load_node(&node_ref)?.children {
                Children::Values(values) => {
                    return Ok(values.into_iter().find(|v| v.id == key));
                }
                Children::Nodes(children) => {
                    let bucket = next_char(key, node_ref.prefix.len());
                    match children.into_iter().find(|c| c.prefix.chars().last() == Some(bucket)) {
                        Some(child) => node_ref = child,
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Structural tree-diff of two versions' subtrees rooted at `base` and
    /// `branch` (both relative to the same prefix). Identical `NodeRef`s
    /// prune the whole subtree; otherwise the two sides' shapes are
    /// compared node-by-node, recursing only into children whose ref
    /// actually differs. Results accumulate into `out` as the branch's
    /// `BranchChange` relative to `base` for every key found to differ.
    fn tree_diff(
        &self,
        base: Option<&NodeRef>,
        branch: Option<&NodeRef>,
        out: &mut HashMap<ValueId, BranchChange>,
    ) -> CResult<()> {
        if base == branch {
            return Ok(());
        }

        let base_children = match base {
            Some(r) => Some(self.load_node(r)?.children),
            None => None,
        };
        let branch_children = match branch {
            Some(r) => Some(self.load_node(r)?.children),
            None => None,
        };

        match (base_children, branch_children) {
            (Some(Children::Nodes(base_kids)), Some(Children::Nodes(branch_kids))) => {
                self.diff_node_children(base_kids, branch_kids, out)
            }
            (Some(Children::Values(base_values)), Some(Children::Values(branch_values))) => {
                diff_value_lists(&to_map(base_values), &to_map(branch_values), out);
                Ok(())
            }
            (base_children, branch_children) => {
                // Shapes diverge (a leaf on one side split on the other, or
                // one side is absent entirely): this subtree is where the
                // two trees actually differ, so enumerate just it rather
                // than the whole map.
                let base_map = self.enumerate(base_children)?;
                let branch_map = self.enumerate(branch_children)?;
                diff_value_lists(&base_map, &branch_map, out);
                Ok(())
            }
        }
    }

    fn diff_node_children(
        &self,
        base_children: Vec<NodeRef>,
        branch_children: Vec<NodeRef>,
        out: &mut HashMap<ValueId, BranchChange>,
    ) -> CResult<()> {
        let mut base_by_bucket: HashMap<char, NodeRef> = base_children
            .into_iter()
            .map(|c| (c.prefix.chars().last().unwrap_or('\u{0}'), c))
            .collect();
        let mut branch_by_bucket: HashMap<char, NodeRef> = branch_children
            .into_iter()
            .map(|c| (c.prefix.chars().last().unwrap_or('\u{0}'), c))
            .collect();

        let mut buckets: Vec<char> = base_by_bucket.keys().chain(branch_by_bucket.keys()).copied().collect();
        buckets.sort();
        buckets.dedup();

        for bucket in buckets {
            let base_child = base_by_bucket.remove(&bucket);
            let branch_child = branch_by_bucket.remove(&bucket);
            self.tree_diff(base_child.as_ref(), branch_child.as_ref(), out)?;
        }
        Ok(())
    }

    /// Full enumeration of one subtree (or the empty map for `None`). Only
    /// called from `tree_diff`'s shape-mismatch arm, so its cost is local
    /// to the region that actually diverged, not the whole map.
    fn enumerate(&self, children: Option<Children>) -> CResult<BTreeMap<ValueId, ValueRef>> {
        match children {
            None => Ok(BTreeMap::new()),
            Some(Children::Values(values)) => Ok(to_map(values)),
            Some(Children::Nodes(nodes)) => {
                let mut out = Vec::new();
                for node in &nodes {
                    self.collect(node, &mut out)?;
                }
                Ok(to_map(out))
            }
        }
    }

    /// Per-key Forks between `a` and `b` relative to `gca`. `gca = None`
    /// treats the common base as empty.
    ///
    /// Computed as two structural tree-diffs (gca-vs-a, gca-vs-b) that walk
    /// the two node trees in lockstep: whenever a prefix's `NodeRef` is the
    /// same on both sides, the subtree is known byte-identical (structural
    /// sharing guarantees an untouched subtree is never rewritten under a
    /// fresh `NodeRef`) and recursion stops without loading it. Only the
    /// keys that actually changed ever get materialized into a `ValueRef`.
    pub fn differences(
        &self,
        a: &VersionId,
        b: &VersionId,
        gca: Option<&VersionId>,
    ) -> CResult<Vec<KeyedFork>> {
        let gca_root = match gca {
            Some(g) => self.root_of(g)?,
            None => None,
        };
        let a_root = self.root_of(a)?;
        let b_root = self.root_of(b)?;

        let mut changes_a = HashMap::new();
        self.tree_diff(gca_root.as_ref(), a_root.as_ref(), &mut changes_a)?;
        let mut changes_b = HashMap::new();
        self.tree_diff(gca_root.as_ref(), b_root.as_ref(), &mut changes_b)?;

        let mut keys: Vec<&ValueId> = changes_a.keys().chain(changes_b.keys()).collect();
        keys.sort();
        keys.dedup();

        let mut forks = Vec::with_capacity(keys.len());
        for key in keys {
            let ca = changes_a.get(key);
            let cb = changes_b.get(key);
            // Only keys that changed on at least one branch reach this
            // point, so one targeted descent per key stays proportional to
            // the diff size rather than the whole map.
            let in_gca = match &gca_root {
                Some(root) => self.descend(root, key)?.is_some(),
                None => false,
            };
            let fork = match (ca, cb) {
                (Some(BranchChange::Present(v)), None) => {
                    if in_gca { Fork::Updated { branch: Branch::First, value: v.clone() } }
                    else { Fork::Inserted { branch: Branch::First, value: v.clone() } }
                }
                (None, Some(BranchChange::Present(v))) => {
                    if in_gca { Fork::Updated { branch: Branch::Second, value: v.clone() } }
                    else { Fork::Inserted { branch: Branch::Second, value: v.clone() } }
                }
                (Some(BranchChange::Present(va)), Some(BranchChange::Present(vb))) => {
                    if in_gca {
                        Fork::TwiceUpdated { first: va.clone(), second: vb.clone() }
                    } else {
                        Fork::TwiceInserted { first: va.clone(), second: vb.clone() }
                    }
                }
                (Some(BranchChange::Removed), None) => Fork::Removed { branch: Branch::First },
                (None, Some(BranchChange::Removed)) => Fork::Removed { branch: Branch::Second },
                (Some(BranchChange::Removed), Some(BranchChange::Removed)) => Fork::TwiceRemoved,
                (Some(BranchChange::Removed), Some(BranchChange::Present(v))) => {
                    Fork::RemovedAndUpdated { removed_on: Branch::First, updated_value: v.clone() }
                }
                (Some(BranchChange::Present(v)), Some(BranchChange::Removed)) => {
                    Fork::RemovedAndUpdated { removed_on: Branch::Second, updated_value: v.clone() }
                }
                (None, None) => continue,
            };
            forks.push(KeyedFork { key: key.clone(), fork });
        }
        Ok(forks)
    }
}

enum BranchChange {
    Present(ValueRef),
    Removed,
}

/// Classifies each key's change on one branch relative to `base` and
/// merges the result into `out`: present in the branch but absent/different
/// from `base` is `Present`; present in `base` but absent from the branch
/// is `Removed`; unchanged keys are left untouched.
fn diff_value_lists(
    base: &BTreeMap<ValueId, ValueRef>,
    branch: &BTreeMap<ValueId, ValueRef>,
    out: &mut HashMap<ValueId, BranchChange>,
) {
    for (key, value) in branch {
        match base.get(key) {
            Some(base_value) if base_value == value => {}
            _ => {
                out.insert(key.clone(), BranchChange::Present(value.clone()));
            }
        }
    }
    for key in base.keys() {
        if !branch.contains_key(key) {
            out.insert(key.clone(), BranchChange::Removed);
        }
    }
}

fn to_map(values: Vec<ValueRef>) -> BTreeMap<ValueId, ValueRef> {
    values.into_iter().map(|v| (v.id.clone(), v)).collect()
}

fn next_char(key: &str, prefix_len: usize) -> char {
    key.chars().nth(prefix_len).unwrap_or('\u{0}')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::FsZone;

    fn map() -> (tempfile::TempDir, Map) {
        let dir = tempfile::tempdir().unwrap();
        let zone: Arc<dyn Zone> = Arc::new(FsZone::open(dir.path()).unwrap());
        (dir, Map::new(zone))
    }

    fn vref(id: &str, version: &str) -> ValueRef {
        ValueRef { id: id.into(), version: version.into() }
    }

    fn insert(key: &str, version: &str) -> MapDelta {
        MapDelta { key: key.into(), added: Some(vref(key, version)), removed: false }
    }

    fn remove(key: &str) -> MapDelta {
        MapDelta { key: key.into(), added: None, removed: true }
    }

    #[test]
    fn empty_base_with_no_deltas_has_no_root() {
        let (_dir, map) = map();
        map.add_version("v0".into(), None, vec![]).unwrap();
        assert_eq!(map.value_references(&"v0".to_string()).unwrap(), vec![]);
    }

    #[test]
    fn insert_then_read_back() {
        let (_dir, map) = map();
        map.add_version("v0".into(), None, vec![insert("AB1111", "v0")]).unwrap();
        assert_eq!(
            map.value_reference("AB1111", &"v0".to_string()).unwrap(),
            Some(vref("AB1111", "v0"))
        );
    }

    #[test]
    fn unrelated_prior_version_is_unaffected() {
        let (_dir, map) = map();
        map.add_version("v0".into(), None, vec![insert("AB1111", "v0")]).unwrap();
        map.add_version("v1".into(), Some("v0".into()), vec![insert("AB1111", "v1")]).unwrap();
        assert_eq!(
            map.value_reference("AB1111", &"v0".to_string()).unwrap(),
            Some(vref("AB1111", "v0"))
        );
        assert_eq!(
            map.value_reference("AB1111", &"v1".to_string()).unwrap(),
            Some(vref("AB1111", "v1"))
        );
    }

    #[test]
    fn remove_drops_the_key_entirely() {
        let (_dir, map) = map();
        map.add_version("v0".into(), None, vec![insert("AB1111", "v0")]).unwrap();
        map.add_version("v1".into(), Some("v0".into()), vec![remove("AB1111")]).unwrap();
        assert_eq!(map.value_reference("AB1111", &"v1".to_string()).unwrap(), None);
    }

    #[test]
    fn splitting_past_threshold_still_enumerates_everything() {
        let (_dir, map) = map();
        let keys = ["AB1111", "AB2222", "CD1111", "CD2222", "EF1111", "EF2222"];
        let deltas: Vec<_> = keys.iter().map(|k| insert(k, "v0")).collect();
        map.add_version("v0".into(), None, deltas).unwrap();
        let mut refs = map.value_references(&"v0".to_string()).unwrap();
        refs.sort_by(|a, b| a.id.cmp(&b.id));
        let mut expected: Vec<_> = keys.iter().map(|k| vref(k, "v0")).collect();
        expected.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(refs, expected);
        for key in keys {
            assert_eq!(map.value_reference(key, &"v0".to_string()).unwrap(), Some(vref(key, "v0")));
        }
    }

    #[test]
    fn disjoint_branch_diff_yields_six_inserts() {
        // S2: v0 empty; branch A inserts 3 keys, branch B inserts 3 others.
        let (_dir, map) = map();
        map.add_version("v0".into(), None, vec![]).unwrap();
        map.add_version(
            "a".into(),
            Some("v0".into()),
            vec![insert("AB1111", "a"), insert("AB1155", "a"), insert("CD1111", "a")],
        )
        .unwrap();
        map.add_version(
            "b".into(),
            Some("v0".into()),
            vec![insert("AB2222", "b"), insert("AB1166", "b"), insert("CD2222", "b")],
        )
        .unwrap();

        let forks = map.differences(&"a".to_string(), &"b".to_string(), Some(&"v0".to_string())).unwrap();
        assert_eq!(forks.len(), 6);
        let first = forks.iter().filter(|f| matches!(f.fork, Fork::Inserted { branch: Branch::First, .. })).count();
        let second = forks.iter().filter(|f| matches!(f.fork, Fork::Inserted { branch: Branch::Second, .. })).count();
        assert_eq!(first, 3);
        assert_eq!(second, 3);
    }

    #[test]
    fn conflicting_updates_classify_per_table() {
        // S3: v0 inserts AB1111, MM1111. A updates AB1111. B updates
        // AB1111 and MM1111, inserts ZZ2222.
        let (_dir, map) = map();
        map.add_version("v0".into(), None, vec![insert("AB1111", "v0"), insert("MM1111", "v0")]).unwrap();
        map.add_version("a".into(), Some("v0".into()), vec![insert("AB1111", "a")]).unwrap();
        map.add_version(
            "b".into(),
            Some("v0".into()),
            vec![insert("AB1111", "b"), insert("MM1111", "b"), insert("ZZ2222", "b")],
        )
        .unwrap();

        let forks = map.differences(&"a".to_string(), &"b".to_string(), Some(&"v0".to_string())).unwrap();
        let find = |key: &str| forks.iter().find(|f| f.key == key).unwrap().fork.clone();
        assert!(matches!(find("AB1111"), Fork::TwiceUpdated { .. }));
        assert!(matches!(find("MM1111"), Fork::Updated { branch: Branch::Second, .. }));
        assert!(matches!(find("ZZ2222"), Fork::Inserted { branch: Branch::Second, .. }));
    }

    #[test]
    fn remove_update_conflict_reports_removed_and_updated() {
        // S4: v0 inserts AB1111. A removes it, B updates it.
        let (_dir, map) = map();
        map.add_version("v0".into(), None, vec![insert("AB1111", "v0")]).unwrap();
        map.add_version("a".into(), Some("v0".into()), vec![remove("AB1111")]).unwrap();
        map.add_version("b".into(), Some("v0".into()), vec![insert("AB1111", "b")]).unwrap();

        let forks = map.differences(&"a".to_string(), &"b".to_string(), Some(&"v0".to_string())).unwrap();
        assert_eq!(forks.len(), 1);
        assert!(matches!(
            forks[0].fork,
            Fork::RemovedAndUpdated { removed_on: Branch::First, .. }
        ));
    }

    #[test]
    fn diff_handles_a_subtree_that_only_splits_on_one_branch() {
        // v0 has two keys under a shared prefix (still a single leaf). A
        // leaves it alone; B inserts enough more AB-prefixed keys to force
        // that subtree to split into child nodes, so gca's node and B's
        // node at that prefix have different `Children` shapes entirely.
        let (_dir, map) = map();
        map.add_version("v0".into(), None, vec![insert("AB1111", "v0"), insert("AB2222", "v0")]).unwrap();
        map.add_version("a".into(), Some("v0".into()), vec![]).unwrap();
        map.add_version(
            "b".into(),
            Some("v0".into()),
            vec![insert("AB3333", "b"), insert("AB4444", "b"), insert("AB5555", "b")],
        )
        .unwrap();

        let forks = map.differences(&"a".to_string(), &"b".to_string(), Some(&"v0".to_string())).unwrap();
        assert_eq!(forks.len(), 3);
        for key in ["AB3333", "AB4444", "AB5555"] {
            let fork = forks.iter().find(|f| f.key == key).unwrap().fork.clone();
            assert!(matches!(fork, Fork::Inserted { branch: Branch::Second, .. }));
        }
    }

    #[test]
    fn diff_is_symmetric_with_branches_swapped() {
        let (_dir, map) = map();
        map.add_version("v0".into(), None, vec![insert("AB1111", "v0")]).unwrap();
        map.add_version("a".into(), Some("v0".into()), vec![remove("AB1111")]).unwrap();
        map.add_version("b".into(), Some("v0".into()), vec![insert("AB1111", "b")]).unwrap();

        let ab = map.differences(&"a".to_string(), &"b".to_string(), Some(&"v0".to_string())).unwrap();
        let ba = map.differences(&"b".to_string(), &"a".to_string(), Some(&"v0".to_string())).unwrap();
        assert!(matches!(ab[0].fork, Fork::RemovedAndUpdated { removed_on: Branch::First, .. }));
        assert!(matches!(ba[0].fork, Fork::RemovedAndUpdated { removed_on: Branch::Second, .. }));
    }
}
