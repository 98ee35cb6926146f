//! Path layout shared by every `Zone` instance (values, map nodes).
//!
//! Splits both halves of a `(key, version)` reference into a short prefix
//! directory and a remainder, so that no single directory accumulates an
//! unbounded number of entries for typical UUID-shaped version ids.

use std::path::{Path, PathBuf};

/// Splits `s` into a `n`-byte prefix and the remainder. Falls back to the
/// whole string as the prefix if it is shorter than `n`.
fn split(s: &str, n: usize) -> (&str, &str) {
    if s.len() <= n {
        (s, "")
    } else {
        s.split_at(n)
    }
}

/// `<root>/<key[..2]>/<key[2..]>/<version[..1]>/<version[1..]>.<ext>`
pub fn blob_path(root: &Path, key: &str, version: &str, ext: &str) -> PathBuf {
    let (key_prefix, key_rest) = split(key, 2);
    let (ver_prefix, ver_rest) = split(version, 1);
    let key_rest = if key_rest.is_empty() { "_" } else { key_rest };
    let ver_rest = if ver_rest.is_empty() { "_" } else { ver_rest };
    root.join(key_prefix)
        .join(key_rest)
        .join(ver_prefix)
        .join(format!("{ver_rest}.{ext}"))
}

/// `<root>/<id[..1]>/<id[1..]>.<ext>`, used for records keyed by a single id
/// (version records, change records).
pub fn record_path(root: &Path, id: &str, ext: &str) -> PathBuf {
    let (prefix, rest) = split(id, 1);
    let rest = if rest.is_empty() { "_" } else { rest };
    root.join(prefix).join(format!("{rest}.{ext}"))
}
