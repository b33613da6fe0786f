//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(plume::cache::io),
        help("Check file permissions and ensure the cache directory is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(plume::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// An argument cannot be canonicalized into stable bytes
    #[error("Argument of type {type_name} is not representable")]
    #[diagnostic(
        code(plume::cache::not_representable),
        help("Wrap lists and maps in a record with named fields, or pass an immutable value")
    )]
    NotRepresentable {
        /// Name of the rejected argument type
        type_name: String,
    },

    /// A path argument or cache artifact does not exist
    #[error("File not found: {}", path.display())]
    #[diagnostic(
        code(plume::cache::not_found),
        help("Pass a path that exists when the computation is called")
    )]
    NotFound {
        /// The missing path
        path: Box<Path>,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(plume::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// The wrapped computation failed
    #[error("Computation {name} failed")]
    #[diagnostic(code(plume::cache::computation))]
    Computation {
        /// Qualified name of the computation
        name: String,
        /// The error returned by the computation
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a not representable error
    #[must_use]
    pub fn not_representable(type_name: impl Into<String>) -> Self {
        Self::NotRepresentable {
            type_name: type_name.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(path: impl AsRef<Path>) -> Self {
        Self::NotFound {
            path: path.as_ref().into(),
        }
    }

    /// Map a metadata lookup failure, keeping missing files distinct from other I/O errors
    #[must_use]
    pub fn stat(source: std::io::Error, path: impl AsRef<Path>) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(path)
        } else {
            Self::io(source, path, "metadata")
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Wrap the error of a failed computation
    #[must_use]
    pub fn computation(
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Computation {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
