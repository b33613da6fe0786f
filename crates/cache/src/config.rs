//! Cache configuration
//!
//! A [`CacheConfig`] is built once at startup and handed by reference to the
//! hashing and storage layers. Nothing in this crate reads configuration from
//! global state.

use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use std::path::{Path, PathBuf};

/// Default directory for cache artifacts, relative to the working directory
pub const DEFAULT_CACHE_DIR: &str = ".plume_cache";

/// Default digest size in bytes (32 hex characters)
pub const DEFAULT_DIGEST_SIZE: usize = 16;

/// Largest supported digest size, bounded by SHA-256 output
pub const MAX_DIGEST_SIZE: usize = 32;

/// Default extension of metadata sidecar files
pub const DEFAULT_ATTRS_EXTENSION: &str = "json";

/// Environment variable overriding the cache directory in [`CacheConfig::from_env`]
pub const CACHE_DIR_ENV: &str = "PLUME_CACHE_DIR";

/// Settings shared by fingerprinting and storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Package version; its first 8 bytes salt every fingerprint
    pub version: String,
    /// Directory holding artifacts and sidecars
    pub dir: PathBuf,
    /// Digest size in bytes; fingerprints are twice as many hex characters
    pub digest_size: usize,
    /// Extension of metadata sidecar files (without the leading dot)
    pub attrs_extension: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            dir: PathBuf::from(DEFAULT_CACHE_DIR),
            digest_size: DEFAULT_DIGEST_SIZE,
            attrs_extension: DEFAULT_ATTRS_EXTENSION.to_string(),
        }
    }
}

impl CacheConfig {
    /// Build a configuration whose cache directory is resolved from the environment
    ///
    /// Resolution order (first writable wins):
    /// 1) `PLUME_CACHE_DIR`
    /// 2) `XDG_CACHE_HOME/plume`
    /// 3) OS cache dir/plume
    /// 4) `~/.plume/cache`
    /// 5) `TMPDIR/plume/cache`
    pub fn from_env() -> Result<Self> {
        let inputs = DirInputs {
            plume_cache_dir: std::env::var(CACHE_DIR_ENV)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            xdg_cache_home: std::env::var("XDG_CACHE_HOME")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            os_cache_dir: cache_dir(),
            home_dir: home_dir(),
            temp_dir: std::env::temp_dir(),
        };
        Ok(Self::default().with_dir(dir_from_inputs(inputs)?))
    }

    /// Replace the cache directory
    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Replace the digest size
    #[must_use]
    pub fn with_digest_size(mut self, digest_size: usize) -> Self {
        self.digest_size = digest_size;
        self
    }

    /// Replace the version used for salting
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Check that the configuration can produce valid fingerprints and sidecars
    pub fn validate(&self) -> Result<()> {
        if self.digest_size == 0 || self.digest_size > MAX_DIGEST_SIZE {
            return Err(Error::configuration(format!(
                "digest size must be between 1 and {MAX_DIGEST_SIZE} bytes, got {}",
                self.digest_size
            )));
        }
        if self.version.is_empty() {
            return Err(Error::configuration("version must not be empty"));
        }
        if self.attrs_extension.is_empty() || self.attrs_extension.starts_with('.') {
            return Err(Error::configuration(format!(
                "attrs extension must be non-empty and without a leading dot, got {:?}",
                self.attrs_extension
            )));
        }
        Ok(())
    }

    /// Length of a fingerprint in hex characters
    #[must_use]
    pub fn fingerprint_len(&self) -> usize {
        self.digest_size * 2
    }

    /// Salt derived from the first 8 bytes of the version string
    #[must_use]
    pub fn salt(&self) -> &[u8] {
        let bytes = self.version.as_bytes();
        &bytes[..bytes.len().min(8)]
    }

    /// Sidecar path for an artifact: the artifact path with the attrs extension
    #[must_use]
    pub fn sidecar_path(&self, artifact: &Path) -> PathBuf {
        artifact.with_extension(&self.attrs_extension)
    }
}

/// Inputs for determining the cache directory
#[derive(Debug, Clone)]
struct DirInputs {
    plume_cache_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn dir_from_inputs(inputs: DirInputs) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.plume_cache_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("plume"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("plume"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".plume/cache"));
    }
    candidates.push(inputs.temp_dir.join("plume/cache"));

    for path in candidates {
        // An existing directory may still be read-only (CI caches under $HOME)
        if path.exists() {
            let probe = path.join(".write_probe");
            match std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
            {
                Ok(_) => {
                    let _ = std::fs::remove_file(&probe);
                    return Ok(path);
                }
                Err(_) => continue,
            }
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}
