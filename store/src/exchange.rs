//! The peer synchronization orchestration: enumerate local vs. remote
//! versions, fetch/push the missing set, and install remote versions in
//! an order that respects the predecessor relation.
//!
//! The orchestration here is transport-agnostic and synchronous: a
//! `RemotePeer` implementation owns whatever I/O (network, filesystem)
//! its transport needs and reports failure through `CResult`, the same
//! error channel every other operation in this crate uses. Suspension on
//! real network I/O is the peer implementation's concern; the
//! orchestration itself never holds the History lock across a peer call.

use std::collections::{HashMap, HashSet};

use crate::error::{CResult, Error};
use crate::store::Store;
use crate::value::{ValueChange, Version, VersionId};

/// An abstraction over any peer that can list its version ids, fetch
/// version and change records, and accept pushes. Concrete network
/// transports are external collaborators outside this crate's scope;
/// `DirectoryPeer` below is the filesystem reference implementation.
pub trait RemotePeer {
    /// Peer-specific warmup (e.g. token refresh) before a receive.
    fn prepare_to_retrieve(&self) -> CResult<()> {
        Ok(())
    }

    fn list_versions(&self) -> CResult<Vec<VersionId>>;
    fn fetch_versions(&self, ids: &[VersionId]) -> CResult<Vec<Version>>;
    fn fetch_changes(&self, ids: &[VersionId]) -> CResult<HashMap<VersionId, Vec<ValueChange>>>;

    /// Peer-specific warmup before a send.
    fn prepare_to_send(&self) -> CResult<()> {
        Ok(())
    }

    fn send_versions(&self, versions: Vec<(Version, Vec<ValueChange>)>) -> CResult<()>;
}

/// The filesystem reference `RemotePeer`: a remote that is simply another
/// `Store`'s on-disk root, read and written directly with no network
/// transport. Lets the orchestration above be exercised without standing
/// up real I/O; the one production caller is the CLI's `sync` subcommand,
/// which opens the remote directory as a second `Store` and hands it here.
pub struct DirectoryPeer {
    remote: Store,
}

impl DirectoryPeer {
    pub fn new(remote: Store) -> Self {
        DirectoryPeer { remote }
    }

    pub fn into_store(self) -> Store {
        self.remote
    }
}

impl RemotePeer for DirectoryPeer {
    fn list_versions(&self) -> CResult<Vec<VersionId>> {
        Ok(self.remote.all_version_ids().into_iter().collect())
    }

    fn fetch_versions(&self, ids: &[VersionId]) -> CResult<Vec<Version>> {
        ids.iter().map(|id| self.remote.version(id).ok_or_else(|| Error::MissingVersion(id.clone()))).collect()
    }

    fn fetch_changes(&self, ids: &[VersionId]) -> CResult<HashMap<VersionId, Vec<ValueChange>>> {
        ids.iter().map(|id| Ok((id.clone(), self.remote.changes_for(id)?))).collect()
    }

    fn send_versions(&self, versions: Vec<(Version, Vec<ValueChange>)>) -> CResult<()> {
        for (version, changes) in versions {
            self.remote.add_version(version, changes)?;
        }
        Ok(())
    }
}

/// Something an orchestration can poll between batch boundaries to learn
/// whether it should stop early. `()` (used by callers with no cancellation
/// source) always answers "keep going".
pub trait Cancellation {
    /// Returns `true` once the caller wants the in-flight exchange to stop.
    fn is_cancelled(&self) -> bool;
}

impl Cancellation for () {
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl<F: Fn() -> bool> Cancellation for F {
    fn is_cancelled(&self) -> bool {
        self()
    }
}

/// Installs `pending` into `store` in predecessor-first order: repeatedly
/// picks a version all of whose predecessors are already known locally,
/// ingests it, and removes it from the pending set. Fails with
/// `RemoteVersionsWithUnknownPredecessors` if no progress can be made
/// while pending is non-empty. Checked for cancellation before installing
/// each version, so a cancelled run leaves `store` at a consistent,
/// predecessor-complete prefix of `pending` rather than a partial version.
fn install_predecessor_first(
    store: &Store,
    mut pending: HashMap<VersionId, (Version, Vec<ValueChange>)>,
    cancel: &dyn Cancellation,
) -> CResult<()> {
    while !pending.is_empty() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let known = store.all_version_ids();
        let ready: Vec<VersionId> = pending
            .iter()
            .filter(|(_, (version, _))| version.predecessors.iter().all(|p| known.contains(p)))
            .map(|(id, _)| id.clone())
            .collect();

        if ready.is_empty() {
            let remaining: Vec<VersionId> = pending.keys().cloned().collect();
            return Err(Error::RemoteVersionsWithUnknownPredecessors(remaining));
        }

        for id in ready {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (version, changes) = pending.remove(&id).expect("id came from pending's own keys");
            store.add_version(version, changes)?;
        }
    }
    Ok(())
}

/// Number of versions fetched and installed together before the next
/// cancellation check. Keeps `receive` responsive to cancellation on a
/// large backlog without checking (and paying a trait-call) per version.
const BATCH_SIZE: usize = 64;

/// The receive side: pulls every version `peer` has that `store`
/// doesn't, and installs them locally, stopping between batches if
/// `cancel` reports cancellation.
pub fn receive(store: &Store, peer: &dyn RemotePeer) -> CResult<Vec<VersionId>> {
    receive_cancellable(store, peer, &())
}

/// `receive`, but checked against `cancel` between every batch boundary and
/// before installing each version.
pub fn receive_cancellable(
    store: &Store,
    peer: &dyn RemotePeer,
    cancel: &dyn Cancellation,
) -> CResult<Vec<VersionId>> {
    peer.prepare_to_retrieve()?;

    let remote_ids: HashSet<VersionId> = peer.list_versions()?.into_iter().collect();
    let local_ids = store.all_version_ids();
    let missing: Vec<VersionId> = remote_ids.difference(&local_ids).cloned().collect();
    if missing.is_empty() {
        return Ok(vec![]);
    }

    let mut installed = Vec::with_capacity(missing.len());
    for batch in missing.chunks(BATCH_SIZE) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let versions = peer.fetch_versions(batch)?;
        let mut changes = peer.fetch_changes(batch)?;

        let pending: HashMap<VersionId, (Version, Vec<ValueChange>)> = versions
            .into_iter()
            .map(|version| {
                let id = version.id.clone();
                let version_changes = changes.remove(&id).unwrap_or_default();
                (id, (version, version_changes))
            })
            .collect();

        installed.extend(pending.keys().cloned());
        install_predecessor_first(store, pending, cancel)?;
    }
    Ok(installed)
}

/// The send side: pushes every version `store` has that `peer` doesn't,
/// in predecessor-first order so a partial push leaves the peer
/// consistent.
pub fn send(store: &Store, peer: &dyn RemotePeer) -> CResult<Vec<VersionId>> {
    send_cancellable(store, peer, &())
}

/// `send`, but checked against `cancel` between every batch boundary.
pub fn send_cancellable(
    store: &Store,
    peer: &dyn RemotePeer,
    cancel: &dyn Cancellation,
) -> CResult<Vec<VersionId>> {
    peer.prepare_to_send()?;

    let local_ids = store.all_version_ids();
    let remote_ids: HashSet<VersionId> = peer.list_versions()?.into_iter().collect();
    let mut to_send: Vec<VersionId> = local_ids.difference(&remote_ids).cloned().collect();

    if to_send.is_empty() {
        return Ok(vec![]);
    }

    // Predecessor-first: topological_iter yields heads-first, so the
    // reverse is oldest-ancestor-first; keep only the ids actually being
    // sent, in that relative order.
    let order = store.history().query(|h| h.topological_iter());
    let position: HashMap<&VersionId, usize> = order.iter().enumerate().map(|(i, id)| (id, i)).collect();
    to_send.sort_by_key(|id| std::cmp::Reverse(position.get(id).copied().unwrap_or(0)));

    for batch in to_send.chunks(BATCH_SIZE) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut payload = Vec::with_capacity(batch.len());
        for id in batch {
            let version = store.version(id).ok_or_else(|| Error::MissingVersion(id.clone()))?;
            let changes = store.changes_for(id)?;
            payload.push((version, changes));
        }
        peer.send_versions(payload)?;
    }
    Ok(to_send)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::collections::BTreeMap;

    fn insert(key: &str, bytes: &[u8]) -> ValueChange {
        ValueChange::Insert(Value::new(key, bytes.to_vec()))
    }

    #[test]
    fn receive_pulls_every_missing_version_in_order() {
        let remote_dir = tempfile::tempdir().unwrap();
        let remote = Store::open(remote_dir.path()).unwrap();
        let r0 = remote.make_version(None, vec![insert("K", b"1")], BTreeMap::new()).unwrap();
        let r1 = remote.make_version(Some(r0.clone()), vec![insert("K", b"2")], BTreeMap::new()).unwrap();

        let local_dir = tempfile::tempdir().unwrap();
        let local = Store::open(local_dir.path()).unwrap();
        let peer = DirectoryPeer::new(remote);

        let installed = receive(&local, &peer).unwrap();
        assert_eq!(installed.len(), 2);
        assert_eq!(local.value("K", &r1).unwrap().unwrap().bytes, b"2");
        assert_eq!(local.value("K", &r0).unwrap().unwrap().bytes, b"1");
    }

    #[test]
    fn receive_is_a_no_op_when_up_to_date() {
        let remote_dir = tempfile::tempdir().unwrap();
        let remote = Store::open(remote_dir.path()).unwrap();
        remote.make_version(None, vec![insert("K", b"1")], BTreeMap::new()).unwrap();

        let local_dir = tempfile::tempdir().unwrap();
        let local = Store::open(local_dir.path()).unwrap();
        let peer = DirectoryPeer::new(remote);
        receive(&local, &peer).unwrap();

        assert_eq!(receive(&local, &peer).unwrap(), Vec::<VersionId>::new());
    }

    #[test]
    fn send_pushes_every_local_only_version() {
        let local_dir = tempfile::tempdir().unwrap();
        let local = Store::open(local_dir.path()).unwrap();
        let v0 = local.make_version(None, vec![insert("K", b"1")], BTreeMap::new()).unwrap();
        let v1 = local.make_version(Some(v0), vec![insert("K", b"2")], BTreeMap::new()).unwrap();

        let remote_dir = tempfile::tempdir().unwrap();
        let remote = Store::open(remote_dir.path()).unwrap();
        let peer = DirectoryPeer::new(remote);

        let sent = send(&local, &peer).unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(peer.remote.value("K", &v1).unwrap().unwrap().bytes, b"2");
    }

    #[test]
    fn receive_cancellable_stops_before_installing_anything() {
        let remote_dir = tempfile::tempdir().unwrap();
        let remote = Store::open(remote_dir.path()).unwrap();
        remote.make_version(None, vec![insert("K", b"1")], BTreeMap::new()).unwrap();

        let local_dir = tempfile::tempdir().unwrap();
        let local = Store::open(local_dir.path()).unwrap();
        let peer = DirectoryPeer::new(remote);

        let always_cancelled = || true;
        let result = receive_cancellable(&local, &peer, &always_cancelled);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(local.all_version_ids().is_empty());
    }

    #[test]
    fn send_cancellable_stops_before_pushing_anything() {
        let local_dir = tempfile::tempdir().unwrap();
        let local = Store::open(local_dir.path()).unwrap();
        local.make_version(None, vec![insert("K", b"1")], BTreeMap::new()).unwrap();

        let remote_dir = tempfile::tempdir().unwrap();
        let remote = Store::open(remote_dir.path()).unwrap();
        let peer = DirectoryPeer::new(remote);

        let always_cancelled = || true;
        let result = send_cancellable(&local, &peer, &always_cancelled);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(peer.remote.all_version_ids().is_empty());
    }

    #[test]
    fn round_trip_exchange_converges_both_stores() {
        let a_dir = tempfile::tempdir().unwrap();
        let a = Store::open(a_dir.path()).unwrap();
        let v0 = a.make_version(None, vec![insert("K", b"1")], BTreeMap::new()).unwrap();

        let b_dir = tempfile::tempdir().unwrap();
        let b = Store::open(b_dir.path()).unwrap();

        // A sends everything to B.
        let peer_b = DirectoryPeer::new(b);
        send(&a, &peer_b).unwrap();

        // B makes its own version, then sends everything back to A.
        let v1 = peer_b.remote.make_version(Some(v0), vec![insert("J", b"2")], BTreeMap::new()).unwrap();
        let peer_a = DirectoryPeer::new(a);
        send(&peer_b.remote, &peer_a).unwrap();

        assert_eq!(peer_a.remote.all_version_ids(), peer_b.remote.all_version_ids());
        assert_eq!(
            peer_a.remote.value("J", &v1).unwrap().unwrap().bytes,
            peer_b.remote.value("J", &v1).unwrap().unwrap().bytes
        );
    }
}
