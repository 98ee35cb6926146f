//! A decentralized, versioned key-value store: values are addressed by an
//! opaque key, every mutation produces a new immutable version in a DAG of
//! predecessors, and divergent branches reconcile through a three-way merge
//! with a pluggable conflict-resolution policy.
//!
//! ```
//! use std::collections::BTreeMap;
//! use verso_store::store::Store;
//! use verso_store::value::{Value, ValueChange};
//!
//! # fn main() -> verso_store::error::CResult<()> {
//! let dir = tempfile::tempdir().unwrap();
//! let store = Store::open(dir.path())?;
//! let v0 = store.make_version(
//!     None,
//!     vec![ValueChange::Insert(Value::new("greeting", b"hello".to_vec()))],
//!     BTreeMap::new(),
//! )?;
//! assert_eq!(store.value("greeting", &v0)?.unwrap().bytes, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod exchange;
pub mod fs_layout;
pub mod history;
pub mod map;
pub mod merge;
pub mod store;
pub mod value;
pub mod zone;
