use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use log::info;

use verso_store::exchange::{self, DirectoryPeer};
use verso_store::map::Fork;
use verso_store::merge::{MergeArbiter, MostRecentBranchFavoring, MostRecentChangeFavoring};
use verso_store::store::{MergeOutcome, Store};
use verso_store::value::{Value, ValueChange};

/// The CLI's subcommands: `init`, `put`, `get`, `versions`, `diff`,
/// `merge`, `sync` — a versioned blob store has no query language to
/// parse, so there's no REPL here, just one subcommand per operation.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create (or open) a store at `root`.
    Init {
        root: PathBuf,
    },
    /// Insert or update a key, writing a new version.
    Put {
        root: PathBuf,
        key: String,
        value: String,
        /// The version this write builds on; omit for a store's first version.
        #[clap(long)]
        base_version: Option<String>,
    },
    /// Read a key's bytes as of a version.
    Get {
        root: PathBuf,
        key: String,
        #[clap(long)]
        at: String,
    },
    /// List every version (heads first) in topological order.
    Versions {
        root: PathBuf,
    },
    /// Show the per-key Forks between two versions.
    Diff {
        root: PathBuf,
        a: String,
        b: String,
    },
    /// Three-way merge two versions.
    Merge {
        root: PathBuf,
        a: String,
        b: String,
        /// Conflict resolution policy: `branch` (default) or `change`.
        #[clap(long, default_value = "branch")]
        arbiter: ArbiterChoice,
    },
    /// Exchange versions with another store directory.
    Sync {
        root: PathBuf,
        remote_root: PathBuf,
        #[clap(long, value_enum, default_value = "both")]
        direction: SyncDirection,
    },
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum ArbiterChoice {
    Branch,
    Change,
}

impl ArbiterChoice {
    fn resolve(&self) -> Box<dyn MergeArbiter> {
        match self {
            ArbiterChoice::Branch => Box::new(MostRecentBranchFavoring),
            ArbiterChoice::Change => Box::new(MostRecentChangeFavoring),
        }
    }
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum SyncDirection {
    Send,
    Receive,
    Both,
}

/// Runs a parsed `Command`, printing results to stdout and surfacing
/// failures as `anyhow::Error` with human-readable context.
pub fn run(command: Command) -> Result<()> {
    match command {
        Command::Init { root } => {
            Store::open(&root).with_context(|| format!("opening store at {}", root.display()))?;
            println!("initialized store at {}", root.display());
        }
        Command::Put { root, key, value, base_version } => {
            let store = open(&root)?;
            let change = ValueChange::Insert(Value::new(key.clone(), value.into_bytes()));
            let version = store
                .make_version(base_version, vec![change], BTreeMap::new())
                .with_context(|| format!("writing key {key:?}"))?;
            println!("{version}");
        }
        Command::Get { root, key, at } => {
            let store = open(&root)?;
            match store.value(&key, &at).with_context(|| format!("reading key {key:?} at {at}"))? {
                Some(value) => std::io::stdout().write_all(&value.bytes)?,
                None => anyhow::bail!("no value for {key:?} at version {at}"),
            }
        }
        Command::Versions { root } => {
            let store = open(&root)?;
            for id in store.history().query(|h| h.topological_iter()) {
                println!("{id}");
            }
        }
        Command::Diff { root, a, b } => {
            let store = open(&root)?;
            let gca = store.history().query(|h| h.greatest_common_ancestor(&a, &b));
            let forks = store.map().differences(&a, &b, gca.as_ref())?;
            for keyed in forks {
                println!("{}: {}", keyed.key, describe_fork(&keyed.fork));
            }
        }
        Command::Merge { root, a, b, arbiter } => {
            let store = open(&root)?;
            let outcome = store.merge(&a, &b, arbiter.resolve().as_ref()).context("merging versions")?;
            match outcome {
                MergeOutcome::FastForward(v) => println!("fast-forward: {v}"),
                MergeOutcome::Merged(v) => println!("merged: {v}"),
            }
        }
        Command::Sync { root, remote_root, direction } => {
            let store = open(&root)?;
            let remote_store = open(&remote_root)?;
            let peer = DirectoryPeer::new(remote_store);
            match direction {
                SyncDirection::Receive => {
                    let installed = exchange::receive(&store, &peer).context("receiving from remote")?;
                    info!("installed {} version(s)", installed.len());
                    println!("received {} version(s)", installed.len());
                }
                SyncDirection::Send => {
                    let sent = exchange::send(&store, &peer).context("sending to remote")?;
                    println!("sent {} version(s)", sent.len());
                }
                SyncDirection::Both => {
                    let installed = exchange::receive(&store, &peer).context("receiving from remote")?;
                    let sent = exchange::send(&store, &peer).context("sending to remote")?;
                    println!("received {} version(s), sent {} version(s)", installed.len(), sent.len());
                }
            }
        }
    }
    Ok(())
}

fn open(root: &PathBuf) -> Result<Store> {
    Store::open(root).with_context(|| format!("opening store at {}", root.display()))
}

fn describe_fork(fork: &Fork) -> String {
    match fork {
        Fork::Inserted { branch, .. } => format!("inserted on {branch:?}"),
        Fork::TwiceInserted { .. } => "inserted on both branches".to_string(),
        Fork::Updated { branch, .. } => format!("updated on {branch:?}"),
        Fork::TwiceUpdated { .. } => "updated on both branches (conflict)".to_string(),
        Fork::Removed { branch } => format!("removed on {branch:?}"),
        Fork::TwiceRemoved => "removed on both branches".to_string(),
        Fork::RemovedAndUpdated { removed_on, .. } => {
            format!("removed on {removed_on:?}, updated on the other (conflict)")
        }
    }
}
