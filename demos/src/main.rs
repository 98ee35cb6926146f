//! A runnable walkthrough of `verso-store`'s API: open a store, write a
//! couple of versions, fork into two branches, and merge them back
//! together. No CLI parsing, no config, just the library surface.

use std::collections::BTreeMap;

use verso_store::error::CResult;
use verso_store::exchange::{self, DirectoryPeer};
use verso_store::merge::MostRecentBranchFavoring;
use verso_store::store::{MergeOutcome, Store};
use verso_store::value::{Value, ValueChange};

fn main() {
    run().unwrap();
    println!("done");
}

fn run() -> CResult<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path())?;

    let v0 = store.make_version(
        None,
        vec![ValueChange::Insert(Value::new("greeting", b"hello".to_vec()))],
        BTreeMap::new(),
    )?;
    println!("v0 = {v0}");

    let v1 = store.make_version(
        Some(v0.clone()),
        vec![ValueChange::Insert(Value::new("name", b"world".to_vec()))],
        BTreeMap::new(),
    )?;
    println!("v1 = {v1}");

    let greeting = store.value("greeting", &v1)?.expect("greeting is present at v1");
    println!("greeting@v1 = {}", String::from_utf8_lossy(&greeting.bytes));

    // Fork v1 into two branches that touch different keys, so the merge
    // below has no conflicts to resolve.
    let branch_a = store.make_version(
        Some(v1.clone()),
        vec![ValueChange::Update(Value::new("greeting", b"hi".to_vec()))],
        BTreeMap::new(),
    )?;
    let branch_b = store.make_version(
        Some(v1.clone()),
        vec![ValueChange::Insert(Value::new("farewell", b"bye".to_vec()))],
        BTreeMap::new(),
    )?;
    println!("branch_a = {branch_a}, branch_b = {branch_b}");

    let merged = match store.merge(&branch_a, &branch_b, &MostRecentBranchFavoring)? {
        MergeOutcome::Merged(v) => v,
        MergeOutcome::FastForward(v) => v,
    };
    println!("merged = {merged}");

    let greeting = store.value("greeting", &merged)?.expect("greeting survives the merge");
    let farewell = store.value("farewell", &merged)?.expect("farewell survives the merge");
    println!("greeting@merged = {}", String::from_utf8_lossy(&greeting.bytes));
    println!("farewell@merged = {}", String::from_utf8_lossy(&farewell.bytes));

    // A second, empty store can catch up to the first over the exchange
    // protocol, without ever sharing a process or a filesystem root.
    let replica_dir = tempfile::tempdir().expect("tempdir");
    let replica = Store::open(replica_dir.path())?;
    let peer = DirectoryPeer::new(store);
    let installed = exchange::receive(&replica, &peer)?;
    println!("replica installed {} version(s)", installed.len());
    assert_eq!(replica.value("farewell", &merged)?.unwrap().bytes, b"bye");

    Ok(())
}
