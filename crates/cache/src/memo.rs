//! Memoized computations
//!
//! [`Memoized`] wraps a table-producing computation. Each call fingerprints the
//! arguments together with the computation identity. If a fresh artifact exists
//! for that fingerprint, the call replays it. Otherwise the computation runs and
//! its result is stored.

use crate::attrs::{self, Attributed};
use crate::config::CacheConfig;
use crate::expires::{self, Expires};
use crate::fingerprint::{self, Fingerprint, FunctionIdentity};
use crate::store::CacheStore;
use crate::table::{ArtifactFormat, JsonTableFormat, Table};
use crate::{Args, Error, Result};
use std::path::{Path, PathBuf};

type Pepper = Box<dyn Fn() -> Vec<u8> + Send + Sync>;

/// A computation whose results are cached on disk
pub struct Memoized<F> {
    identity: FunctionIdentity,
    function: F,
    config: CacheConfig,
    expires: Option<Expires>,
    cache_attrs: bool,
    pepper: Option<Pepper>,
    format: Box<dyn ArtifactFormat + Send + Sync>,
}

impl<F> std::fmt::Debug for Memoized<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memoized")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("expires", &self.expires)
            .field("cache_attrs", &self.cache_attrs)
            .field("pepper", &self.pepper.is_some())
            .field("extension", &self.format.extension())
            .finish_non_exhaustive()
    }
}

impl<F, E> Memoized<F>
where
    F: Fn(&Args) -> std::result::Result<Table, E>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    /// Wrap `function` under the given identity with default options
    ///
    /// Artifacts never expire, metadata is cached and tables are stored as
    /// plain JSON.
    pub fn new(identity: FunctionIdentity, function: F) -> Self {
        Self {
            identity,
            function,
            config: CacheConfig::default(),
            expires: None,
            cache_attrs: true,
            pepper: None,
            format: Box::new(JsonTableFormat::new()),
        }
    }

    /// Use `config` for hashing and storage
    #[must_use]
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Store artifacts under `dir`
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.dir = dir.into();
        self
    }

    /// Recompute artifacts older than `expires`
    #[must_use]
    pub fn with_expires(mut self, expires: impl Into<Expires>) -> Self {
        self.expires = Some(expires.into());
        self
    }

    /// Recompute artifacts older than a loosely typed expiration spec
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the spec is neither an integer nor a
    /// mapping of known units to numbers.
    pub fn with_expires_value(self, value: &serde_json::Value) -> Result<Self> {
        Ok(self.with_expires(Expires::from_value(value)?))
    }

    /// Whether table metadata is stored in and restored from sidecars
    #[must_use]
    pub fn with_cache_attrs(mut self, cache_attrs: bool) -> Self {
        self.cache_attrs = cache_attrs;
        self
    }

    /// Mix extra bytes into every fingerprint
    #[must_use]
    pub fn with_pepper(mut self, pepper: impl Fn() -> Vec<u8> + Send + Sync + 'static) -> Self {
        self.pepper = Some(Box::new(pepper));
        self
    }

    /// Persist tables with `format`
    #[must_use]
    pub fn with_format(mut self, format: impl ArtifactFormat + Send + Sync + 'static) -> Self {
        self.format = Box::new(format);
        self
    }

    /// Computation identity
    #[must_use]
    pub fn identity(&self) -> &FunctionIdentity {
        &self.identity
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fingerprint of a call with `args`
    ///
    /// # Errors
    ///
    /// Propagates representation, not-found and configuration errors.
    pub fn fingerprint(&self, args: &Args) -> Result<Fingerprint> {
        let pepper = self.pepper.as_deref().map(|p| p as &dyn Fn() -> Vec<u8>);
        fingerprint::fingerprint(&self.identity, args, &self.config, pepper)
    }

    /// Where the artifact of a call with `args` is stored
    ///
    /// # Errors
    ///
    /// Propagates representation, not-found and configuration errors.
    pub fn artifact_path(&self, args: &Args) -> Result<PathBuf> {
        let store = CacheStore::new(&self.config)?;
        let fingerprint = self.fingerprint(args)?;
        Ok(self.format.artifact_path(&store.artifact_base(&fingerprint)))
    }

    /// Call the computation, replaying a fresh cached result when one exists
    ///
    /// Replayed tables report [`Table::is_from_cache`]; freshly computed ones
    /// do not.
    ///
    /// # Errors
    ///
    /// Returns representation, not-found and configuration errors before any
    /// cache I/O. Failures of the computation are wrapped in
    /// [`Error::Computation`]; failures reading or writing the artifact are
    /// returned as I/O or serialization errors. Failing to write the metadata
    /// sidecar is only logged, and any sidecar of an earlier run is removed.
    pub fn call(&self, args: &Args) -> Result<Table> {
        let store = CacheStore::new(&self.config)?;
        let fingerprint = self.fingerprint(args)?;
        let base = store.artifact_base(&fingerprint);
        let artifact = self.format.artifact_path(&base);

        if self.is_fresh(&store, &fingerprint, &artifact)? {
            match self.replay(&artifact) {
                Ok(table) => {
                    tracing::debug!(
                        function = self.identity.qualname(),
                        %fingerprint,
                        path = %artifact.display(),
                        "Cache hit"
                    );
                    return Ok(table);
                }
                Err(e) if is_vanished(&e) => {
                    tracing::debug!(path = %artifact.display(), "Cache artifact removed before replay");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(function = self.identity.qualname(), %fingerprint, "Cache miss");
        let table = (self.function)(args)
            .map_err(|e| Error::computation(self.identity.qualname(), e))?;

        store.ensure_dir()?;
        let written = self.format.write(&table, &base)?;
        if self.cache_attrs {
            self.store_attrs(&store, &table, &written)?;
        }
        tracing::debug!(path = %written.display(), rows = table.len(), "Stored cache artifact");
        Ok(table)
    }

    /// Write the sidecar of a fresh artifact, dropping one left by an earlier run
    fn store_attrs(&self, store: &CacheStore, table: &Table, artifact: &Path) -> Result<()> {
        match attrs::save(table.attrs(), artifact, &self.config) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => store.remove_sidecar(artifact),
            Err(e) => {
                tracing::warn!(path = %artifact.display(), error = %e, "Failed to save metadata sidecar");
                // Never pair the new artifact with an earlier run's sidecar
                store.remove_sidecar(artifact)
            }
        }
    }

    fn is_fresh(
        &self,
        store: &CacheStore,
        fingerprint: &Fingerprint,
        artifact: &Path,
    ) -> Result<bool> {
        if !store.is_cache_hit(fingerprint, self.format.extension()) {
            return Ok(false);
        }
        match expires::is_expired(artifact, self.expires.as_ref()) {
            Ok(expired) => Ok(!expired),
            Err(e) if is_vanished(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn replay(&self, artifact: &Path) -> Result<Table> {
        let mut table = self.format.read(artifact)?;
        if self.cache_attrs {
            table = attrs::restore(table, artifact, &self.config);
        }
        table.mark_from_cache(artifact);
        Ok(table)
    }
}

/// Whether an error means the artifact was swept while it was being looked up
fn is_vanished(error: &Error) -> bool {
    match error {
        Error::NotFound { .. } => true,
        Error::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use std::convert::Infallible;
    use std::fs;
    use tempfile::TempDir;

    fn identity() -> FunctionIdentity {
        FunctionIdentity::new("memo::tests::load", "v1")
    }

    fn load(args: &Args) -> std::result::Result<Table, Infallible> {
        let n = args.positional().len();
        Ok(Table::new(["n"], vec![vec![json!(n)]]).with_attr("source", "load"))
    }

    #[test]
    fn test_miss_then_hit() {
        let tmp = TempDir::new().unwrap();
        let calls = Cell::new(0);
        let memo = Memoized::new(identity(), |args: &Args| {
            calls.set(calls.get() + 1);
            load(args)
        })
        .with_cache_dir(tmp.path());

        let args = Args::new().arg(1);
        let first = memo.call(&args).unwrap();
        let second = memo.call(&args).unwrap();

        assert_eq!(calls.get(), 1);
        assert!(!first.is_from_cache());
        assert!(second.is_from_cache());
        assert_eq!(first, second);
        assert_eq!(second.cache_file(), Some(memo.artifact_path(&args).unwrap().as_path()));
    }

    #[test]
    fn test_cache_attrs_disabled() {
        let tmp = TempDir::new().unwrap();
        let memo = Memoized::new(identity(), load)
            .with_cache_dir(tmp.path())
            .with_cache_attrs(false);

        let args = Args::new();
        memo.call(&args).unwrap();
        let artifact = memo.artifact_path(&args).unwrap();
        assert!(!memo.config().sidecar_path(&artifact).exists());

        let replayed = memo.call(&args).unwrap();
        assert!(replayed.is_from_cache());
        assert!(replayed.attrs().is_empty());
    }

    #[test]
    fn test_computation_error_is_wrapped() {
        let tmp = TempDir::new().unwrap();
        let memo = Memoized::new(identity(), |_: &Args| -> std::result::Result<Table, std::io::Error> {
            Err(std::io::Error::other("source offline"))
        })
        .with_cache_dir(tmp.path());

        let err = memo.call(&Args::new()).unwrap_err();
        assert!(matches!(err, Error::Computation { ref name, .. } if name == "memo::tests::load"));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_expires_rejected_before_io() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cache");
        let result = Memoized::new(identity(), load)
            .with_cache_dir(&dir)
            .with_expires_value(&json!({"years": 100}));
        assert!(matches!(result, Err(Error::Configuration { .. })));
        assert!(!dir.exists());
    }

    #[test]
    fn test_unrepresentable_argument_rejected_before_io() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cache");
        let memo = Memoized::new(identity(), load).with_cache_dir(&dir);

        let result = memo.call(&Args::new().arg(crate::Arg::List(vec![1.into()])));
        assert!(matches!(result, Err(Error::NotRepresentable { .. })));
        assert!(!dir.exists());
    }

    #[test]
    fn test_pepper_changes_artifact() {
        let tmp = TempDir::new().unwrap();
        let plain = Memoized::new(identity(), load).with_cache_dir(tmp.path());
        let peppered = Memoized::new(identity(), load)
            .with_cache_dir(tmp.path())
            .with_pepper(|| b"2024-q3".to_vec());

        let args = Args::new().arg("north");
        assert_ne!(plain.fingerprint(&args).unwrap(), peppered.fingerprint(&args).unwrap());
    }

    #[test]
    fn test_compressed_format() {
        let tmp = TempDir::new().unwrap();
        let memo = Memoized::new(identity(), load)
            .with_cache_dir(tmp.path())
            .with_format(JsonTableFormat::compressed(3));

        let args = Args::new();
        memo.call(&args).unwrap();
        let artifact = memo.artifact_path(&args).unwrap();
        assert_eq!(artifact.extension().unwrap(), "tbz");

        let replayed = memo.call(&args).unwrap();
        assert!(replayed.is_from_cache());
        assert_eq!(replayed.attrs().get("source"), Some(&json!("load")));
    }

    #[test]
    fn test_corrupt_artifact_is_reported() {
        let tmp = TempDir::new().unwrap();
        let memo = Memoized::new(identity(), load).with_cache_dir(tmp.path());
        let args = Args::new();
        memo.call(&args).unwrap();

        fs::write(memo.artifact_path(&args).unwrap(), b"garbage").unwrap();
        assert!(matches!(memo.call(&args), Err(Error::Serialization { .. })));
    }

    /// Plain JSON tables whose artifact is swept as soon as a read starts
    struct SweptOnRead;

    impl ArtifactFormat for SweptOnRead {
        fn extension(&self) -> &str {
            JsonTableFormat::EXTENSION
        }

        fn write(&self, table: &Table, base: &Path) -> Result<PathBuf> {
            JsonTableFormat::new().write(table, base)
        }

        fn read(&self, path: &Path) -> Result<Table> {
            fs::remove_file(path).map_err(|e| Error::io(e, path, "remove_file"))?;
            JsonTableFormat::new().read(path)
        }
    }

    #[test]
    fn test_artifact_swept_before_replay_recomputes() {
        let tmp = TempDir::new().unwrap();
        let calls = Cell::new(0);
        let memo = Memoized::new(identity(), |args: &Args| {
            calls.set(calls.get() + 1);
            load(args)
        })
        .with_cache_dir(tmp.path())
        .with_format(SweptOnRead);

        let args = Args::new();
        memo.call(&args).unwrap();
        let table = memo.call(&args).unwrap();

        assert_eq!(calls.get(), 2);
        assert!(!table.is_from_cache());
        assert!(memo.artifact_path(&args).unwrap().is_file());
    }

    #[test]
    fn test_artifact_path_that_is_not_a_file_misses() {
        let tmp = TempDir::new().unwrap();
        let memo = Memoized::new(identity(), load).with_cache_dir(tmp.path());
        let args = Args::new();
        fs::create_dir_all(memo.artifact_path(&args).unwrap()).unwrap();

        assert!(matches!(memo.call(&args), Err(Error::Io { .. })));
    }

    #[test]
    fn test_stale_sidecar_removed_on_recompute() {
        let tmp = TempDir::new().unwrap();
        let memo = Memoized::new(identity(), |_: &Args| -> std::result::Result<Table, Infallible> {
            Ok(Table::new(["n"], vec![vec![json!(1)]]))
        })
        .with_cache_dir(tmp.path());

        let args = Args::new();
        let artifact = memo.artifact_path(&args).unwrap();
        let sidecar = memo.config().sidecar_path(&artifact);
        fs::create_dir_all(tmp.path()).unwrap();
        let mut leftover = crate::Metadata::new();
        leftover.insert("source".into(), json!("earlier run"));
        attrs::save(&leftover, &artifact, memo.config()).unwrap();
        assert!(sidecar.is_file());

        memo.call(&args).unwrap();
        assert!(!sidecar.exists());
        assert!(memo.call(&args).unwrap().attrs().is_empty());
    }
}
