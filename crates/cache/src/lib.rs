//! Disk-backed memoization of table-producing computations
//!
//! This crate caches the results of expensive computations that return a
//! [`Table`]:
//! - Deterministic fingerprints over arguments, computation name and code
//! - Artifacts stored as `<fingerprint>.<ext>` in a cache directory
//! - Table metadata persisted in a lock-checked JSON sidecar
//! - Age-based expiration and sweeping of stale artifacts
//!
//! # Overview
//!
//! ```no_run
//! use plume_cache::{Args, CacheConfig, Expires, FunctionIdentity, Memoized, Table};
//! use serde_json::json;
//!
//! fn load_sales(_args: &Args) -> Result<Table, std::io::Error> {
//!     Ok(Table::new(["region", "total"], vec![vec![json!("north"), json!(42)]]))
//! }
//!
//! # fn main() -> plume_cache::Result<()> {
//! let sales = Memoized::new(FunctionIdentity::of(&load_sales, "v1"), load_sales)
//!     .with_config(CacheConfig::from_env()?)
//!     .with_expires(Expires::seconds(3600));
//!
//! let table = sales.call(&Args::new().kwarg("region", "north"))?;
//! assert!(!table.is_from_cache());
//! # Ok(())
//! # }
//! ```
//!
//! # Fingerprints
//!
//! Fingerprints are computed from:
//! - The crate version (first 8 bytes) and the digest size
//! - Canonical bytes of every positional and keyword argument
//! - The computation's qualified name and code bytes
//! - An optional caller-supplied pepper

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

mod error;

pub mod args;
pub mod attrs;
pub mod config;
pub mod expires;
pub mod fingerprint;
pub mod memo;
pub mod store;
pub mod table;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use args::{Arg, Args, ArgsDigest, NumericArray, Record, combine, represent};
pub use attrs::{Attributed, LOCK_KEY, Metadata, lock, restore, save};
pub use config::CacheConfig;
pub use expires::{Expires, ExpiryUnit, is_expired};
pub use fingerprint::{Fingerprint, FunctionIdentity, fingerprint, hash_wrapped};
pub use memo::Memoized;
pub use store::{CacheStats, CacheStore, clear_cache, delete_cache};
pub use table::{ArtifactFormat, JsonTableFormat, Table, from_cache};
