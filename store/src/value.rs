//! The core entity types: `ValueId`, `VersionId`, `Value`,
//! `Predecessors`, `Version`, `ValueChange`, `ValueRef` and `MapDelta`.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

/// An opaque, non-empty string naming a value. Doubles as the `key` half of
/// a `ZoneRef` — the Zone is addressed by `(ValueId, VersionId)`.
pub type ValueId = String;

/// An opaque, globally-unique string identifying a version. Assigned at
/// version creation; typically UUID-shaped but never parsed as such.
pub type VersionId = String;

/// Mints a fresh, globally-unique version id.
pub fn fresh_version_id() -> VersionId {
    uuid::Uuid::new_v4().to_string()
}

/// `(ValueId, VersionId, bytes)` — the `VersionId` field records the version
/// that wrote *these* bytes, not necessarily the version being read at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub id: ValueId,
    pub version: Option<VersionId>,
    #[serde(with = "value_bytes")]
    pub bytes: Vec<u8>,
}

impl Value {
    /// A freshly authored value with no version yet assigned; `make_version`
    /// fills in `version` as it writes the bytes to the Zone.
    pub fn new(id: impl Into<ValueId>, bytes: Vec<u8>) -> Self {
        Value { id: id.into(), version: None, bytes }
    }

    /// The `ValueRef` locating this value, if it has been assigned a version.
    pub fn value_ref(&self) -> crate::error::CResult<ValueRef> {
        match &self.version {
            Some(version) => Ok(ValueRef { id: self.id.clone(), version: version.clone() }),
            None => Err(crate::error::Error::AttemptToLocateUnversionedValue(self.id.clone())),
        }
    }
}

/// Serializes `Vec<u8>` as a JSON array of numbers (the default), kept as a
/// named module so the representation can change in one place if a more
/// compact wire format is ever needed.
mod value_bytes {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(bytes, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        serde::Deserialize::deserialize(d)
    }
}

/// Locates a stored value: the `(ValueId, VersionId)` pair that is a `Zone`
/// reference for the value's bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueRef {
    pub id: ValueId,
    pub version: VersionId,
}

/// A version's predecessor set: none (root), one (ordinary commit), or two
/// (merge commit).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predecessors {
    None,
    One(VersionId),
    Two(VersionId, VersionId),
}

impl Predecessors {
    pub fn iter(&self) -> impl Iterator<Item = &VersionId> {
        let (a, b) = match self {
            Predecessors::None => (None, None),
            Predecessors::One(a) => (Some(a), None),
            Predecessors::Two(a, b) => (Some(a), Some(b)),
        };
        a.into_iter().chain(b)
    }
}

/// An immutable commit: a node in the DAG. `successors` grows monotonically
/// as descendants are registered with History.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub predecessors: Predecessors,
    #[serde(default)]
    pub successors: HashSet<VersionId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A per-key change emitted by callers (`make_version`) or a `MergeArbiter`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ValueChange {
    Insert(Value),
    Update(Value),
    Remove(ValueId),
    Preserve(ValueRef),
    PreserveRemoval(ValueId),
}

impl ValueChange {
    pub fn value_id(&self) -> &ValueId {
        match self {
            ValueChange::Insert(v) | ValueChange::Update(v) => &v.id,
            ValueChange::Remove(id) | ValueChange::PreserveRemoval(id) => id,
            ValueChange::Preserve(r) => &r.id,
        }
    }
}

/// Per-version, per-key delta applied to the Map: `added` carries the
/// `ValueRef`s written or preserved for `key`; `removed` drops the key's
/// `ValueId` from the prefix list entirely. At most one of the two is
/// non-trivial for any given `MapDelta` produced by `Store`.
#[derive(Clone, Debug, PartialEq)]
pub struct MapDelta {
    pub key: ValueId,
    pub added: Option<ValueRef>,
    pub removed: bool,
}

/// Derives the `[MapDelta]` for a version's `ValueChange` list: additions
/// from Insert/Update/Preserve (pointing at `next_version` for
/// Insert/Update, or at the preserved `ValueRef`'s own version for
/// Preserve); removals from Remove/PreserveRemoval.
pub fn deltas_from_changes(changes: &[ValueChange], next_version: &VersionId) -> Vec<MapDelta> {
    changes
        .iter()
        .map(|change| match change {
            ValueChange::Insert(v) | ValueChange::Update(v) => MapDelta {
                key: v.id.clone(),
                added: Some(ValueRef { id: v.id.clone(), version: next_version.clone() }),
                removed: false,
            },
            ValueChange::Preserve(r) => {
                MapDelta { key: r.id.clone(), added: Some(r.clone()), removed: false }
            }
            ValueChange::Remove(id) => MapDelta { key: id.clone(), added: None, removed: true },
            ValueChange::PreserveRemoval(id) => {
                MapDelta { key: id.clone(), added: None, removed: true }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_produces_addition_at_next_version() {
        let changes = vec![ValueChange::Insert(Value::new("K", b"1".to_vec()))];
        let deltas = deltas_from_changes(&changes, &"v1".to_string());
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].key, "K");
        assert_eq!(deltas[0].added.as_ref().unwrap().version, "v1");
        assert!(!deltas[0].removed);
    }

    #[test]
    fn preserve_points_at_the_preserved_version() {
        let r = ValueRef { id: "K".into(), version: "v0".into() };
        let changes = vec![ValueChange::Preserve(r.clone())];
        let deltas = deltas_from_changes(&changes, &"v7".to_string());
        assert_eq!(deltas[0].added, Some(r));
    }

    #[test]
    fn remove_and_preserve_removal_both_remove() {
        let changes =
            vec![ValueChange::Remove("A".into()), ValueChange::PreserveRemoval("B".into())];
        let deltas = deltas_from_changes(&changes, &"v1".to_string());
        assert!(deltas.iter().all(|d| d.removed && d.added.is_none()));
    }

    #[test]
    fn value_ref_requires_a_version() {
        let v = Value::new("K", vec![1]);
        assert!(matches!(v.value_ref(), Err(crate::error::Error::AttemptToLocateUnversionedValue(_))));
    }
}
