use std::fmt;

use crate::value::{ValueId, VersionId};

/// The error type for every fallible operation in this crate.
#[derive(Debug)]
pub enum Error {
    /// Underlying storage or network failure; retryable at the operation level.
    Io(std::io::Error),

    /// A Zone write targeted an existing `(key, version)` with different bytes.
    ConflictingWrite { key: String, version: VersionId },

    /// A version id already exists in History.
    Duplicate(VersionId),

    /// A requested version id is unknown locally.
    MissingVersion(VersionId),

    /// `History::add` was asked to link a version whose predecessor is unknown.
    MissingPredecessor { version: VersionId, predecessor: VersionId },

    /// The exchange install phase cannot make progress: every pending remote
    /// version still has at least one unknown predecessor.
    RemoteVersionsWithUnknownPredecessors(Vec<VersionId>),

    /// A `ValueChange::Preserve`/`PreserveRemoval` named a `Value` with no
    /// version attached where a `ValueRef` was required.
    AttemptToLocateUnversionedValue(ValueId),

    /// A version or change record on disk or wire was malformed.
    SerializationInvalid(String),

    /// Catch-all for programming errors and conditions with no dedicated variant.
    Internal(String),

    /// An exchange orchestration observed cancellation between batch
    /// boundaries and stopped before installing or sending the rest.
    Cancelled,
}

/// The result type used throughout this crate, named `CResult` (rather than
/// shadowing `std::result::Result`) so call sites can freely glob-import
/// `std::io` alongside it.
pub type CResult<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::ConflictingWrite { key, version } => {
                write!(f, "conflicting write for key {key:?} at version {version}")
            }
            Error::Duplicate(id) => write!(f, "version {id} already exists"),
            Error::MissingVersion(id) => write!(f, "unknown version {id}"),
            Error::MissingPredecessor { version, predecessor } => {
                write!(f, "version {version} names unknown predecessor {predecessor}")
            }
            Error::RemoteVersionsWithUnknownPredecessors(ids) => {
                write!(f, "remote versions with unresolvable predecessors: {ids:?}")
            }
            Error::AttemptToLocateUnversionedValue(id) => {
                write!(f, "value {id:?} has no version and cannot be located")
            }
            Error::SerializationInvalid(msg) => write!(f, "invalid record: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Cancelled => write!(f, "exchange cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationInvalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        let err = Error::MissingVersion("v1".to_string());
        assert_eq!(err.to_string(), "unknown version v1");
    }

    #[test]
    fn io_errors_round_trip_through_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
