//! Cache directory management
//!
//! The store owns exactly the files directly under the cache directory whose
//! name starts with a fingerprint-shaped hex string (`^[0-9a-f]{2N}`, case
//! insensitive). Artifacts and their sidecars both match; anything else in the
//! directory is never touched.
//!
//! ```text
//! .plume_cache/
//!   3f9a...c1.tbl    (artifact)
//!   3f9a...c1.json   (metadata sidecar, optional)
//! ```

use crate::config::CacheConfig;
use crate::expires::Expires;
use crate::fingerprint::Fingerprint;
use crate::{Error, Result};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Size summary of a cache directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache-owned files (artifacts and sidecars)
    pub file_count: usize,
    /// Total size in bytes
    pub total_size: u64,
    /// Total size formatted for humans
    pub human_size: String,
}

/// Artifacts and sidecars under one cache directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    attrs_extension: String,
    pattern: Regex,
}

impl CacheStore {
    /// Store over the configured cache directory
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration is invalid.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        Self::at(&config.dir, config)
    }

    /// Store over `dir`, using the remaining settings of `config`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration is invalid.
    pub fn at(dir: impl Into<PathBuf>, config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let pattern = Regex::new(&format!("(?i)^[0-9a-f]{{{}}}", config.fingerprint_len()))
            .map_err(|e| Error::configuration(format!("invalid cache file pattern: {e}")))?;
        Ok(Self {
            dir: dir.into(),
            attrs_extension: config.attrs_extension.clone(),
            pattern,
        })
    }

    /// Cache directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a file name belongs to the cache
    #[must_use]
    pub fn owns(&self, file_name: &str) -> bool {
        self.pattern.is_match(file_name)
    }

    /// Path of an artifact without its format extension
    #[must_use]
    pub fn artifact_base(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(fingerprint.as_str())
    }

    /// Path of an artifact with the given format extension
    #[must_use]
    pub fn artifact_path(&self, fingerprint: &Fingerprint, extension: &str) -> PathBuf {
        self.artifact_base(fingerprint).with_extension(extension)
    }

    /// Sidecar path belonging to an artifact
    #[must_use]
    pub fn sidecar_path(&self, artifact: &Path) -> PathBuf {
        artifact.with_extension(&self.attrs_extension)
    }

    /// Whether an artifact exists for `fingerprint`
    #[must_use]
    pub fn is_cache_hit(&self, fingerprint: &Fingerprint, extension: &str) -> bool {
        self.artifact_path(fingerprint, extension).is_file()
    }

    /// Create the cache directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(e, &self.dir, "create_dir_all"))
    }

    /// Remove an artifact and its sidecar; missing files are fine
    ///
    /// # Errors
    ///
    /// Returns error if an existing file cannot be removed
    pub fn delete(&self, artifact: &Path) -> Result<()> {
        remove_if_exists(artifact)?;
        remove_if_exists(&self.sidecar_path(artifact))
    }

    /// Remove the sidecar of an artifact, if there is one
    ///
    /// # Errors
    ///
    /// Returns error if an existing sidecar cannot be removed
    pub fn remove_sidecar(&self, artifact: &Path) -> Result<()> {
        remove_if_exists(&self.sidecar_path(artifact))
    }

    /// Cache-owned regular files directly under the cache directory
    ///
    /// Symlinks are followed; dangling ones are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be listed
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in walk(&self.dir) {
            let entry = match entry {
                Err(e) if is_dangling(&e) => continue,
                other => other,
            };
            let entry = entry.map_err(|e| Error::Io {
                path: e.path().map(Into::into),
                source: e.into(),
                operation: "read_dir_entry".into(),
            })?;
            if entry.file_type().is_file() && self.owns(&entry.file_name().to_string_lossy()) {
                entries.push(entry.into_path());
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Count and size of cache-owned files
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be listed
    pub fn stats(&self) -> Result<CacheStats> {
        let mut file_count = 0;
        let mut total_size = 0;
        for path in self.entries()? {
            // Entries removed since listing are not counted
            if let Ok(metadata) = fs::metadata(&path) {
                file_count += 1;
                total_size += metadata.len();
            }
        }
        Ok(CacheStats {
            file_count,
            total_size,
            human_size: human_size(total_size),
        })
    }

    /// Delete expired cache-owned files and return the number of failures
    ///
    /// Without `expires` every cache-owned file is expired. Failures never
    /// abort the sweep. Symlinks are judged by their target's age and removed
    /// as links; dangling ones are skipped.
    #[must_use]
    pub fn sweep(&self, expires: Option<&Expires>) -> usize {
        self.sweep_with(expires, |path| self.delete(path))
    }

    /// [`CacheStore::sweep`] with a custom deletion step
    pub fn sweep_with<F>(&self, expires: Option<&Expires>, mut delete: F) -> usize
    where
        F: FnMut(&Path) -> Result<()>,
    {
        if !self.dir.is_dir() {
            return 0;
        }

        let now = Utc::now();
        let mut errors = 0;
        let mut removed = 0;

        for entry in walk(&self.dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if is_dangling(&e) => continue,
                Err(e) => {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to list cache entry");
                    errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.owns(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let path = entry.path();
            if let Some(expires) = expires {
                let modified = match entry.metadata().map(|m| m.modified()) {
                    Ok(Ok(modified)) => modified,
                    // Removed since listing, e.g. as the sidecar of an earlier artifact
                    Err(e) if e.io_error().map(std::io::Error::kind)
                        == Some(std::io::ErrorKind::NotFound) =>
                    {
                        continue;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to read modification time");
                        errors += 1;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to read cache file metadata");
                        errors += 1;
                        continue;
                    }
                };
                if !expires.is_expired_at(modified, now) {
                    continue;
                }
            }

            match delete(path) {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(path = %path.display(), "Removed cache file");
                }
                Err(e) => {
                    errors += 1;
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove cache file");
                }
            }
        }

        tracing::debug!(dir = %self.dir.display(), removed, errors, "Cache sweep finished");
        errors
    }
}

/// Direct entries of `dir`, following symlinks
fn walk(dir: &Path) -> walkdir::IntoIter {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
}

fn is_dangling(error: &walkdir::Error) -> bool {
    error.io_error().map(std::io::Error::kind) == Some(std::io::ErrorKind::NotFound)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(e, path, "remove_file")),
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Delete a cache artifact and its sidecar
///
/// # Errors
///
/// Returns error if an existing file cannot be removed
pub fn delete_cache(artifact: &Path, config: &CacheConfig) -> Result<()> {
    remove_if_exists(artifact)?;
    remove_if_exists(&config.sidecar_path(artifact))
}

/// Sweep `dir` and return the number of files that could not be removed
///
/// # Errors
///
/// Returns a configuration error if the configuration is invalid; deletion
/// failures are only counted.
pub fn clear_cache(dir: &Path, expires: Option<&Expires>, config: &CacheConfig) -> Result<usize> {
    Ok(CacheStore::at(dir, config)?.sweep(expires))
}
