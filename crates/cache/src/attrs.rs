//! Metadata sidecars
//!
//! Metadata attached to a cached table is stored beside the artifact as
//! `<fingerprint>.<attrs-extension>`, a JSON object holding the metadata plus a
//! `lock` entry. The lock is a digest over the metadata's key set; a sidecar
//! whose lock does not match its own keys is ignored.
//!
//! Restoring is total: a missing, truncated, foreign or tampered sidecar leaves
//! the target untouched and never produces an error.

use crate::config::CacheConfig;
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Metadata mapping attached to a table
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Reserved sidecar entry holding the lock
pub const LOCK_KEY: &str = "lock";

/// Values carrying a metadata mapping
pub trait Attributed {
    /// Attached metadata
    fn attrs(&self) -> &Metadata;

    /// Attached metadata, mutably
    fn attrs_mut(&mut self) -> &mut Metadata;
}

impl Attributed for Metadata {
    fn attrs(&self) -> &Metadata {
        self
    }

    fn attrs_mut(&mut self) -> &mut Metadata {
        self
    }
}

fn is_lockable(key: &str) -> bool {
    !key.is_empty() && key != LOCK_KEY
}

/// Compute the lock over a mapping's key set
///
/// Values do not contribute. The empty key and the reserved `lock` key are
/// skipped, so two mappings with the same remaining keys lock identically.
#[must_use]
pub fn lock(mapping: &Metadata) -> String {
    let mut keys: Vec<&str> = mapping
        .keys()
        .map(String::as_str)
        .filter(|k| is_lockable(k))
        .collect();
    keys.sort_unstable();

    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Persist metadata beside an artifact
///
/// Returns `None` without touching the filesystem when `metadata` is empty,
/// otherwise the path of the written sidecar.
pub fn save(
    metadata: &Metadata,
    artifact: &Path,
    config: &CacheConfig,
) -> Result<Option<PathBuf>> {
    if metadata.is_empty() {
        return Ok(None);
    }

    let mut document = metadata.clone();
    document.insert(LOCK_KEY.to_string(), lock(metadata).into());

    let path = config.sidecar_path(artifact);
    let json = serde_json::to_vec_pretty(&document)
        .map_err(|e| Error::serialization(format!("Failed to serialize metadata: {e}")))?;
    fs::write(&path, json).map_err(|e| Error::io(e, &path, "write"))?;

    tracing::trace!(path = %path.display(), keys = metadata.len(), "Saved metadata sidecar");
    Ok(Some(path))
}

/// Why a sidecar was not trusted
#[derive(Debug)]
enum Rejected {
    Unreadable(std::io::Error),
    Malformed(serde_json::Error),
    NotAnObject,
    MissingLock,
    LockMismatch,
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreadable(e) => write!(f, "unreadable: {e}"),
            Self::Malformed(e) => write!(f, "malformed JSON: {e}"),
            Self::NotAnObject => f.write_str("not a JSON object"),
            Self::MissingLock => f.write_str("missing lock"),
            Self::LockMismatch => f.write_str("lock mismatch"),
        }
    }
}

fn load(path: &Path) -> std::result::Result<Metadata, Rejected> {
    let bytes = fs::read(path).map_err(Rejected::Unreadable)?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(Rejected::Malformed)?;
    let serde_json::Value::Object(mut metadata) = value else {
        return Err(Rejected::NotAnObject);
    };

    let stored = metadata.remove(LOCK_KEY).ok_or(Rejected::MissingLock)?;
    if stored.as_str() != Some(lock(&metadata).as_str()) {
        return Err(Rejected::LockMismatch);
    }
    Ok(metadata)
}

/// Merge the sidecar of `artifact` into the target's metadata
///
/// Any problem with the sidecar returns the target unchanged.
pub fn restore<T: Attributed>(mut target: T, artifact: &Path, config: &CacheConfig) -> T {
    let path = config.sidecar_path(artifact);
    match load(&path) {
        Ok(metadata) => {
            tracing::trace!(path = %path.display(), keys = metadata.len(), "Restored metadata sidecar");
            target.attrs_mut().extend(metadata);
        }
        Err(Rejected::Unreadable(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(reason) => {
            tracing::debug!(path = %path.display(), %reason, "Ignoring metadata sidecar");
        }
    }
    target
}
