//! The three-way merge pipeline: diff two heads against their greatest
//! common ancestor, classify per-key Forks, and delegate conflict
//! resolution to a pluggable `MergeArbiter`.

use std::collections::HashMap;

use crate::error::CResult;
use crate::map::{Branch, Fork, KeyedFork};
use crate::store::Store;
use crate::value::{ValueChange, ValueId, VersionId};

/// The inputs an arbiter sees: the two merged versions, their common
/// ancestor (`None` if they share no ancestor), and every Fork keyed by
/// the value id it concerns.
pub struct Merge {
    pub versions: (VersionId, VersionId),
    pub common_ancestor: Option<VersionId>,
    pub forks_by_value_id: HashMap<ValueId, Fork>,
}

impl Merge {
    fn from_forks(a: VersionId, b: VersionId, gca: Option<VersionId>, forks: Vec<KeyedFork>) -> Self {
        Merge {
            versions: (a, b),
            common_ancestor: gca,
            forks_by_value_id: forks.into_iter().map(|kf| (kf.key, kf.fork)).collect(),
        }
    }

    /// Forks requiring a resolving change: `TwiceInserted`, `TwiceUpdated`,
    /// `RemovedAndUpdated`. All other variants resolve trivially — the
    /// engine synthesizes their `Preserve`/`PreserveRemoval` itself.
    pub fn conflicts(&self) -> impl Iterator<Item = (&ValueId, &Fork)> {
        self.forks_by_value_id.iter().filter(|(_, fork)| is_conflict(fork))
    }
}

fn is_conflict(fork: &Fork) -> bool {
    matches!(fork, Fork::TwiceInserted { .. } | Fork::TwiceUpdated { .. } | Fork::RemovedAndUpdated { .. })
}

/// Synthesizes the trivial resolution for a non-conflicting Fork: the
/// state of whichever branch actually changed, expressed as a
/// `ValueChange` against the *merge's* predecessor set (so `make_version`
/// can treat conflict resolutions and trivial carries identically).
fn trivial_change(key: &ValueId, fork: &Fork) -> Option<ValueChange> {
    match fork {
        Fork::Inserted { value, .. } | Fork::Updated { value, .. } => {
            Some(ValueChange::Preserve(value.clone()))
        }
        Fork::Removed { .. } | Fork::TwiceRemoved => Some(ValueChange::PreserveRemoval(key.clone())),
        Fork::TwiceInserted { .. } | Fork::TwiceUpdated { .. } | Fork::RemovedAndUpdated { .. } => None,
    }
}

/// Pluggable conflict-resolution policy. Implementors emit exactly one
/// resolving change per conflicting Fork (`Merge::conflicts`); the merge
/// engine synthesizes the trivial changes for every other Fork and for
/// keys untouched by either branch.
pub trait MergeArbiter {
    fn changes(&self, merge: &Merge, store: &Store) -> CResult<Vec<ValueChange>>;
}

/// Merges the full delta set: the arbiter's resolving changes for every
/// conflict, plus the engine's trivial carries for every non-conflicting
/// Fork.
pub fn resolve(merge: &Merge, store: &Store, arbiter: &dyn MergeArbiter) -> CResult<Vec<ValueChange>> {
    let mut changes = arbiter.changes(merge, store)?;
    for (key, fork) in &merge.forks_by_value_id {
        if !is_conflict(fork) {
            if let Some(change) = trivial_change(key, fork) {
                changes.push(change);
            }
        }
    }
    Ok(changes)
}

/// Builds the `Merge` struct for `(a, b)`: computes the GCA and the
/// per-key Forks relative to it.
pub fn build_merge(store: &Store, a: &VersionId, b: &VersionId) -> CResult<Merge> {
    let gca = store.history().query(|h| h.greatest_common_ancestor(a, b));
    let forks = store.map().differences(a, b, gca.as_ref())?;
    Ok(Merge::from_forks(a.clone(), b.clone(), gca, forks))
}

/// Picks the branch whose head has the later timestamp and, for every
/// conflict, preserves that branch's state.
pub struct MostRecentBranchFavoring;

impl MergeArbiter for MostRecentBranchFavoring {
    fn changes(&self, merge: &Merge, store: &Store) -> CResult<Vec<ValueChange>> {
        let (a, b) = &merge.versions;
        let ts_a = store.history().query(|h| h.version(a).map(|v| v.timestamp));
        let ts_b = store.history().query(|h| h.version(b).map(|v| v.timestamp));
        let favor_first = ts_a >= ts_b;

        let mut changes = Vec::new();
        for (key, fork) in merge.conflicts() {
            let change = match fork {
                Fork::TwiceInserted { first, second } | Fork::TwiceUpdated { first, second } => {
                    ValueChange::Preserve(if favor_first { first.clone() } else { second.clone() })
                }
                Fork::RemovedAndUpdated { removed_on, updated_value } => {
                    let removed_is_favored = matches!(
                        (removed_on, favor_first),
                        (Branch::First, true) | (Branch::Second, false)
                    );
                    if removed_is_favored {
                        ValueChange::PreserveRemoval(key.clone())
                    } else {
                        ValueChange::Preserve(updated_value.clone())
                    }
                }
                _ => continue,
            };
            changes.push(change);
        }
        Ok(changes)
    }
}

/// For each conflicting key independently, picks the branch whose most
/// recent write to *that key* has the later timestamp.
pub struct MostRecentChangeFavoring;

impl MergeArbiter for MostRecentChangeFavoring {
    fn changes(&self, merge: &Merge, store: &Store) -> CResult<Vec<ValueChange>> {
        let mut changes = Vec::new();
        for (key, fork) in merge.conflicts() {
            let change = match fork {
                Fork::TwiceInserted { first, second } | Fork::TwiceUpdated { first, second } => {
                    let ts_first = store.history().query(|h| h.version(&first.version).map(|v| v.timestamp));
                    let ts_second = store.history().query(|h| h.version(&second.version).map(|v| v.timestamp));
                    ValueChange::Preserve(if ts_first >= ts_second { first.clone() } else { second.clone() })
                }
                Fork::RemovedAndUpdated { removed_on, updated_value } => {
                    let (a, b) = &merge.versions;
                    let removed_version = match removed_on {
                        Branch::First => a,
                        Branch::Second => b,
                    };
                    let ts_removed = store.history().query(|h| h.version(removed_version).map(|v| v.timestamp));
                    let ts_updated =
                        store.history().query(|h| h.version(&updated_value.version).map(|v| v.timestamp));
                    if ts_removed >= ts_updated {
                        ValueChange::PreserveRemoval(key.clone())
                    } else {
                        ValueChange::Preserve(updated_value.clone())
                    }
                }
                _ => continue,
            };
            changes.push(change);
        }
        Ok(changes)
    }
}
