//! The content blob repository keyed by `(key, version)`.
//!
//! `FsZone` is the reference filesystem backend: one file per `ZoneRef`,
//! written via create-in-temp-file-then-atomic-rename so a reader never
//! observes a partial blob and a crash between steps leaves the Zone
//! unchanged.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CResult, Error};
use crate::fs_layout::blob_path;
use crate::value::VersionId;

/// A reference to a blob: the key it was written under and the version that
/// wrote it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneRef {
    pub key: String,
    pub version: VersionId,
}

/// A content blob store keyed by `(key, version)`.
pub trait Zone: Send + Sync {
    /// Idempotent: writing identical bytes for an existing reference is a
    /// no-op; writing different bytes fails with `Error::ConflictingWrite`.
    fn put(&self, at: &ZoneRef, bytes: &[u8]) -> CResult<()>;

    /// Returns the stored bytes, or `None` if nothing was ever written at `at`.
    fn get(&self, at: &ZoneRef) -> CResult<Option<Vec<u8>>>;

    /// Every version that wrote the given key.
    fn versions_for(&self, key: &str) -> CResult<Vec<VersionId>>;
}

/// The reference filesystem-backed `Zone`.
///
/// Layout: `<root>/<key[..2]>/<key[2..]>/<version[..1]>/<version[1..]>.bin`.
pub struct FsZone {
    root: PathBuf,
}

impl FsZone {
    pub fn open(root: impl Into<PathBuf>) -> CResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FsZone { root })
    }

    fn path_for(&self, at: &ZoneRef) -> PathBuf {
        blob_path(&self.root, &at.key, &at.version, "bin")
    }

    /// Writes `bytes` to `path` via a sibling temp file and an atomic rename,
    /// so a crash mid-write never leaves a half-written blob at `path`.
    fn write_atomic(path: &Path, bytes: &[u8]) -> CResult<()> {
        let dir = path.parent().ok_or_else(|| Error::Internal("blob path has no parent".into()))?;
        fs::create_dir_all(dir)?;

        let tmp_name = format!(".{}.tmp-{}", file_name(path), std::process::id());
        let tmp_path = dir.join(tmp_name);

        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("blob").to_string()
}

impl Zone for FsZone {
    fn put(&self, at: &ZoneRef, bytes: &[u8]) -> CResult<()> {
        let path = self.path_for(at);
        match fs::read(&path) {
            Ok(existing) if existing == bytes => Ok(()),
            Ok(_) => Err(Error::ConflictingWrite { key: at.key.clone(), version: at.version.clone() }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Self::write_atomic(&path, bytes)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get(&self, at: &ZoneRef) -> CResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(at)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn versions_for(&self, key: &str) -> CResult<Vec<VersionId>> {
        let (key_prefix, key_rest) = if key.len() <= 2 { (key, "") } else { key.split_at(2) };
        let key_rest = if key_rest.is_empty() { "_" } else { key_rest };
        let dir = self.root.join(key_prefix).join(key_rest);

        let mut versions = HashSet::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };
        for ver_prefix_entry in entries {
            let ver_prefix_entry = ver_prefix_entry?;
            if !ver_prefix_entry.file_type()?.is_dir() {
                continue;
            }
            let ver_prefix = ver_prefix_entry.file_name().to_string_lossy().to_string();
            for file_entry in fs::read_dir(ver_prefix_entry.path())? {
                let file_entry = file_entry?;
                let name = file_entry.file_name().to_string_lossy().to_string();
                if let Some(rest) = name.strip_suffix(".bin") {
                    let rest = if rest == "_" { "" } else { rest };
                    versions.insert(format!("{ver_prefix}{rest}"));
                }
            }
        }
        Ok(versions.into_iter().collect())
    }
}
