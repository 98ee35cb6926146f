//! The in-memory DAG of versions: head tracking, topological iteration,
//! prevailing-version lookup, and greatest-common-ancestor search.
//!
//! `History` hands out access through a scoped "query" closure rather than
//! ambient locking, so a lock is never held longer than the closure's
//! extent. The guard is an `RwLock` read or write guard (not a `Mutex`),
//! so readers can proceed in parallel while a writer excludes all others.

use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{CResult, Error};
use crate::value::{Predecessors, Version, VersionId};

/// The DAG itself. Not exposed directly — callers reach it only through
/// `History::query`/`query_mut`.
#[derive(Default)]
pub struct HistoryInner {
    versions: HashMap<VersionId, Version>,
    heads: HashSet<VersionId>,
}

impl HistoryInner {
    /// Fails with `Duplicate` if `version.id` exists; fails with
    /// `MissingPredecessor` if any named predecessor is unknown, unless
    /// `require_known_predecessors` is false (used by `Store::open`'s
    /// two-phase load, where versions may arrive out of predecessor order).
    pub fn add(&mut self, version: Version, require_known_predecessors: bool) -> CResult<()> {
        if self.versions.contains_key(&version.id) {
            return Err(Error::Duplicate(version.id));
        }
        if require_known_predecessors {
            for predecessor in version.predecessors.iter() {
                if !self.versions.contains_key(predecessor) {
                    return Err(Error::MissingPredecessor {
                        version: version.id.clone(),
                        predecessor: predecessor.clone(),
                    });
                }
            }
        }

        let id = version.id.clone();
        for predecessor in version.predecessors.iter() {
            if let Some(p) = self.versions.get_mut(predecessor) {
                p.successors.insert(id.clone());
            }
            self.heads.remove(predecessor);
        }
        self.versions.insert(id.clone(), version);
        if self.versions[&id].successors.is_empty() {
            self.heads.insert(id);
        }
        Ok(())
    }

    /// Second phase of the relaxed load: now that every version is present,
    /// recompute `successors` and `heads` from the predecessor links alone.
    pub fn relink(&mut self) -> CResult<()> {
        let ids: Vec<VersionId> = self.versions.keys().cloned().collect();
        for id in &ids {
            if let Some(v) = self.versions.get_mut(id) {
                v.successors.clear();
            }
        }
        let links: Vec<(VersionId, VersionId)> = self
            .versions
            .values()
            .flat_map(|v| v.predecessors.iter().map(move |p| (p.clone(), v.id.clone())))
            .collect();
        for (predecessor, id) in links {
            if let Some(p) = self.versions.get_mut(&predecessor) {
                p.successors.insert(id);
            } else {
                return Err(Error::MissingPredecessor { version: id, predecessor });
            }
        }
        self.heads = self
            .versions
            .values()
            .filter(|v| v.successors.is_empty())
            .map(|v| v.id.clone())
            .collect();
        Ok(())
    }

    pub fn heads(&self) -> HashSet<VersionId> {
        self.heads.clone()
    }

    /// Breaks timestamp ties deterministically by `VersionId` ordering.
    pub fn most_recent_head(&self) -> Option<VersionId> {
        self.heads
            .iter()
            .map(|id| (self.versions[id].timestamp, id))
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .map(|(_, id)| id.clone())
    }

    pub fn version(&self, id: &str) -> Option<Version> {
        self.versions.get(id).cloned()
    }

    pub fn all_ids(&self) -> HashSet<VersionId> {
        self.versions.keys().cloned().collect()
    }

    fn successors_of(&self, id: &str) -> HashSet<VersionId> {
        self.versions.get(id).map(|v| v.successors.clone()).unwrap_or_default()
    }

    fn predecessors_of(&self, id: &str) -> Vec<VersionId> {
        self.versions.get(id).map(|v| v.predecessors.iter().cloned().collect()).unwrap_or_default()
    }

    /// All ancestors of `starts` (including `starts` themselves), found by
    /// walking predecessor edges.
    fn ancestors_of_set(&self, starts: impl IntoIterator<Item = VersionId>) -> HashSet<VersionId> {
        let mut seen: HashSet<VersionId> = HashSet::new();
        let mut stack: Vec<VersionId> = starts.into_iter().collect();
        while let Some(id) = stack.pop() {
            if seen.insert(id.clone()) {
                stack.extend(self.predecessors_of(&id));
            }
        }
        seen
    }

    /// Kahn's algorithm over the subgraph of ancestors of `starts`, treating
    /// "successor within the subgraph" as the outstanding dependency: a
    /// version is emitted once every such successor has already been
    /// emitted, then its predecessors become eligible. Ties among
    /// simultaneously eligible versions are broken by `VersionId` for
    /// determinism.
    fn topo_from(&self, starts: impl IntoIterator<Item = VersionId>) -> Vec<VersionId> {
        let subgraph = self.ancestors_of_set(starts);

        let mut remaining: HashMap<VersionId, usize> = subgraph
            .iter()
            .map(|id| {
                let count = self.successors_of(id).iter().filter(|s| subgraph.contains(*s)).count();
                (id.clone(), count)
            })
            .collect();

        let mut frontier: BinaryHeap<std::cmp::Reverse<VersionId>> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| std::cmp::Reverse(id.clone()))
            .collect();

        let mut order = Vec::with_capacity(subgraph.len());
        while let Some(std::cmp::Reverse(id)) = frontier.pop() {
            order.push(id.clone());
            for predecessor in self.predecessors_of(&id) {
                if let Some(count) = remaining.get_mut(&predecessor) {
                    *count -= 1;
                    if *count == 0 {
                        frontier.push(std::cmp::Reverse(predecessor));
                    }
                }
            }
        }
        order
    }

    /// Walks ancestors of `at_version` (including `at_version` itself) in
    /// topological order; returns the first one that is a member of
    /// `candidates`.
    pub fn prevailing(&self, candidates: &HashSet<VersionId>, at_version: &str) -> Option<VersionId> {
        self.topo_from([at_version.to_string()]).into_iter().find(|id| candidates.contains(id))
    }

    pub fn topological_iter(&self) -> Vec<VersionId> {
        self.topo_from(self.heads.iter().cloned())
    }

    /// BFS-labels every ancestor of `start` (including `start`, generation
    /// 0) with its minimum generation distance.
    fn ancestor_generations(&self, start: &str) -> BTreeMap<VersionId, u32> {
        let mut generations = BTreeMap::new();
        generations.insert(start.to_string(), 0u32);
        let mut frontier = vec![start.to_string()];
        let mut gen = 0u32;
        while !frontier.is_empty() {
            gen += 1;
            let mut next = Vec::new();
            for id in frontier {
                for predecessor in self.predecessors_of(&id) {
                    if !generations.contains_key(&predecessor) {
                        generations.insert(predecessor.clone(), gen);
                        next.push(predecessor);
                    }
                }
            }
            frontier = next;
        }
        generations
    }

    /// The most recent version reachable from both `a` and `b` via
    /// predecessor edges, or `None` if they share no ancestor.
    ///
    /// Implemented as: label every ancestor of `a` and of `b` with its
    /// minimum generation distance, then pick the id present in both label
    /// sets minimizing `(a_generation, b_generation, VersionId)`. Ties
    /// break by smallest a-generation, then smallest b-generation, then by
    /// VersionId.
    pub fn greatest_common_ancestor(&self, a: &str, b: &str) -> Option<VersionId> {
        let gens_a = self.ancestor_generations(a);
        let gens_b = self.ancestor_generations(b);
        gens_a
            .iter()
            .filter_map(|(id, ga)| gens_b.get(id).map(|gb| (*ga, *gb, id.clone())))
            .min()
            .map(|(_, _, id)| id)
    }

    /// True if `ancestor` is `descendant` or a transitive predecessor of it.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        if ancestor == descendant {
            return true;
        }
        self.ancestor_generations(descendant).contains_key(ancestor)
    }
}

/// A shared, lock-guarded handle to a `HistoryInner`. All reads and
/// mutations go through `query`/`query_mut`; the returned guard (and thus
/// the lock) is released on every exit path when the closure returns.
#[derive(Clone, Default)]
pub struct History {
    inner: Arc<RwLock<HistoryInner>>,
}

impl History {
    pub fn new() -> Self {
        History::default()
    }

    /// Grants read-only access to the DAG for the duration of `f`. Multiple
    /// readers may run concurrently.
    pub fn query<R>(&self, f: impl FnOnce(&HistoryInner) -> R) -> R {
        let guard = self.inner.read().expect("history lock poisoned");
        f(&guard)
    }

    /// Grants exclusive read-write access to the DAG for the duration of
    /// `f`. Excludes all other readers and writers.
    pub fn query_mut<R>(&self, f: impl FnOnce(&mut HistoryInner) -> R) -> R {
        let mut guard = self.inner.write().expect("history lock poisoned");
        f(&mut guard)
    }
}

/// Convenience constructor used by tests and by `Store::make_version`.
pub fn version(
    id: VersionId,
    predecessors: Predecessors,
    timestamp: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
) -> Version {
    Version { id, predecessors, successors: HashSet::new(), timestamp, metadata }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn v(id: &str, predecessors: Predecessors, t: i64) -> Version {
        version(id.to_string(), predecessors, DateTime::<Utc>::from_timestamp(t, 0).unwrap(), BTreeMap::new())
    }

    #[test]
    fn linear_history_tracks_a_single_head() {
        let h = History::new();
        h.query_mut(|hi| hi.add(v("v0", Predecessors::None, 0), true)).unwrap();
        h.query_mut(|hi| hi.add(v("v1", Predecessors::One("v0".into()), 1), true)).unwrap();
        assert_eq!(h.query(|hi| hi.heads()), HashSet::from(["v1".to_string()]));
    }

    #[test]
    fn duplicate_insert_fails() {
        let h = History::new();
        h.query_mut(|hi| hi.add(v("v0", Predecessors::None, 0), true)).unwrap();
        let err = h.query_mut(|hi| hi.add(v("v0", Predecessors::None, 0), true));
        assert!(matches!(err, Err(Error::Duplicate(_))));
    }

    #[test]
    fn missing_predecessor_fails_when_required() {
        let h = History::new();
        let err = h.query_mut(|hi| hi.add(v("v1", Predecessors::One("v0".into()), 1), true));
        assert!(matches!(err, Err(Error::MissingPredecessor { .. })));
    }

    #[test]
    fn topological_iter_yields_heads_before_ancestors() {
        let h = History::new();
        h.query_mut(|hi| hi.add(v("v0", Predecessors::None, 0), true)).unwrap();
        h.query_mut(|hi| hi.add(v("v1", Predecessors::One("v0".into()), 1), true)).unwrap();
        h.query_mut(|hi| hi.add(v("v2", Predecessors::One("v1".into()), 2), true)).unwrap();
        let order = h.query(|hi| hi.topological_iter());
        assert_eq!(order, vec!["v2".to_string(), "v1".to_string(), "v0".to_string()]);
    }

    #[test]
    fn topological_iter_handles_merges() {
        let h = History::new();
        h.query_mut(|hi| hi.add(v("v0", Predecessors::None, 0), true)).unwrap();
        h.query_mut(|hi| hi.add(v("a1", Predecessors::One("v0".into()), 1), true)).unwrap();
        h.query_mut(|hi| hi.add(v("b1", Predecessors::One("v0".into()), 1), true)).unwrap();
        h.query_mut(|hi| {
            hi.add(v("m", Predecessors::Two("a1".into(), "b1".into()), 2), true)
        })
        .unwrap();
        let order = h.query(|hi| hi.topological_iter());
        assert_eq!(order[0], "m");
        assert_eq!(order.last().unwrap(), "v0");
        assert!(order.contains(&"a1".to_string()));
        assert!(order.contains(&"b1".to_string()));
    }

    #[test]
    fn prevailing_returns_first_ancestor_in_candidates() {
        let h = History::new();
        h.query_mut(|hi| hi.add(v("v0", Predecessors::None, 0), true)).unwrap();
        h.query_mut(|hi| hi.add(v("v1", Predecessors::One("v0".into()), 1), true)).unwrap();
        h.query_mut(|hi| hi.add(v("v2", Predecessors::One("v1".into()), 2), true)).unwrap();
        let candidates = HashSet::from(["v0".to_string(), "v1".to_string()]);
        assert_eq!(h.query(|hi| hi.prevailing(&candidates, "v2")), Some("v1".to_string()));
    }

    #[test]
    fn prevailing_includes_self() {
        let h = History::new();
        h.query_mut(|hi| hi.add(v("v0", Predecessors::None, 0), true)).unwrap();
        let candidates = HashSet::from(["v0".to_string()]);
        assert_eq!(h.query(|hi| hi.prevailing(&candidates, "v0")), Some("v0".to_string()));
    }

    #[test]
    fn gca_of_diverged_branches_is_the_fork_point() {
        let h = History::new();
        h.query_mut(|hi| hi.add(v("v0", Predecessors::None, 0), true)).unwrap();
        h.query_mut(|hi| hi.add(v("a1", Predecessors::One("v0".into()), 1), true)).unwrap();
        h.query_mut(|hi| hi.add(v("b1", Predecessors::One("v0".into()), 1), true)).unwrap();
        assert_eq!(h.query(|hi| hi.greatest_common_ancestor("a1", "b1")), Some("v0".to_string()));
    }

    #[test]
    fn gca_picks_nearest_common_ancestor() {
        let h = History::new();
        h.query_mut(|hi| hi.add(v("v0", Predecessors::None, 0), true)).unwrap();
        h.query_mut(|hi| hi.add(v("v1", Predecessors::One("v0".into()), 1), true)).unwrap();
        h.query_mut(|hi| hi.add(v("a2", Predecessors::One("v1".into()), 2), true)).unwrap();
        h.query_mut(|hi| hi.add(v("b2", Predecessors::One("v1".into()), 2), true)).unwrap();
        assert_eq!(h.query(|hi| hi.greatest_common_ancestor("a2", "b2")), Some("v1".to_string()));
    }

    #[test]
    fn gca_is_none_for_disjoint_histories() {
        let h = History::new();
        h.query_mut(|hi| hi.add(v("a0", Predecessors::None, 0), true)).unwrap();
        h.query_mut(|hi| hi.add(v("b0", Predecessors::None, 0), true)).unwrap();
        assert_eq!(h.query(|hi| hi.greatest_common_ancestor("a0", "b0")), None);
    }

    #[test]
    fn relaxed_load_links_out_of_order_versions() {
        let h = History::new();
        // v1 arrives before its predecessor v0 is known.
        h.query_mut(|hi| hi.add(v("v1", Predecessors::One("v0".into()), 1), false)).unwrap();
        h.query_mut(|hi| hi.add(v("v0", Predecessors::None, 0), false)).unwrap();
        h.query_mut(|hi| hi.relink()).unwrap();
        assert_eq!(h.query(|hi| hi.heads()), HashSet::from(["v1".to_string()]));
        assert_eq!(h.query(|hi| hi.greatest_common_ancestor("v1", "v0")), Some("v0".to_string()));
    }
}
