//! Tables and the artifact formats that persist them
//!
//! A [`Table`] is the result type of a memoized computation: column labels,
//! rows of JSON values, and an attached metadata mapping. The on-disk format
//! is pluggable through [`ArtifactFormat`]; formats persist tabular content
//! only, metadata travels in the sidecar handled by [`crate::attrs`].

use crate::attrs::{Attributed, Metadata};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Column-labelled rows with attached metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    attrs: Metadata,
    /// Artifact this table was replayed from
    #[serde(skip)]
    cache_file: Option<PathBuf>,
}

impl Table {
    /// Create a table from column labels and rows
    pub fn new<I, S>(columns: I, rows: Vec<Vec<Value>>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows,
            attrs: Metadata::new(),
            cache_file: None,
        }
    }

    /// Build a table column by column
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the columns differ in length.
    pub fn from_columns<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<Value>)>,
        S: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<Vec<Value>>) = columns
            .into_iter()
            .map(|(name, values)| (name.into(), values))
            .unzip();

        let height = values.first().map_or(0, Vec::len);
        if let Some((name, column)) = names
            .iter()
            .zip(&values)
            .find(|(_, column)| column.len() != height)
        {
            return Err(Error::configuration(format!(
                "column {name} has {} values, expected {height}",
                column.len()
            )));
        }

        let rows = (0..height)
            .map(|i| values.iter().map(|column| column[i].clone()).collect())
            .collect();
        Ok(Self::new(names, rows))
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Column labels
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in insertion order
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column, if it exists
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let index = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().filter_map(|row| row.get(index)).collect())
    }

    /// Whether tabular content (columns and rows) is equal, ignoring metadata
    #[must_use]
    pub fn content_eq(&self, other: &Self) -> bool {
        self.columns == other.columns && self.rows == other.rows
    }

    /// Artifact this table was replayed from, if it came from the cache
    #[must_use]
    pub fn cache_file(&self) -> Option<&Path> {
        self.cache_file.as_deref()
    }

    /// Whether this table was replayed from the cache
    #[must_use]
    pub fn is_from_cache(&self) -> bool {
        self.cache_file.is_some()
    }

    pub(crate) fn mark_from_cache(&mut self, artifact: &Path) {
        self.cache_file = Some(artifact.to_path_buf());
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.content_eq(other) && self.attrs == other.attrs
    }
}

impl Attributed for Table {
    fn attrs(&self) -> &Metadata {
        &self.attrs
    }

    fn attrs_mut(&mut self) -> &mut Metadata {
        &mut self.attrs
    }
}

/// Check whether a table was loaded from the cache
#[must_use]
pub fn from_cache(table: &Table) -> bool {
    table.is_from_cache()
}

/// Persistence of tabular content under a cache path
///
/// `read(write(t))` must round-trip the columns and rows of `t`. Metadata is
/// not part of the contract.
pub trait ArtifactFormat {
    /// Extension appended to the fingerprint, without the leading dot
    fn extension(&self) -> &str;

    /// Write a table next to `base` and return the path actually written
    fn write(&self, table: &Table, base: &Path) -> Result<PathBuf>;

    /// Read a table previously written by [`ArtifactFormat::write`]
    fn read(&self, path: &Path) -> Result<Table>;

    /// Path that [`ArtifactFormat::write`] produces for `base`
    fn artifact_path(&self, base: &Path) -> PathBuf {
        base.with_extension(self.extension())
    }
}

#[derive(Serialize)]
struct TableContentRef<'a> {
    columns: &'a [String],
    rows: &'a [Vec<Value>],
}

#[derive(Deserialize)]
struct TableContent {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// JSON table format with optional zstd compression
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonTableFormat {
    compression_level: Option<i32>,
}

impl JsonTableFormat {
    /// Extension of uncompressed artifacts
    pub const EXTENSION: &'static str = "tbl";

    /// Extension of zstd-compressed artifacts
    pub const COMPRESSED_EXTENSION: &'static str = "tbz";

    /// Plain JSON artifacts
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// zstd-compressed JSON artifacts at the given level
    #[must_use]
    pub fn compressed(level: i32) -> Self {
        Self {
            compression_level: Some(level),
        }
    }
}

impl ArtifactFormat for JsonTableFormat {
    fn extension(&self) -> &str {
        if self.compression_level.is_some() {
            Self::COMPRESSED_EXTENSION
        } else {
            Self::EXTENSION
        }
    }

    fn write(&self, table: &Table, base: &Path) -> Result<PathBuf> {
        let path = self.artifact_path(base);
        let content = TableContentRef {
            columns: &table.columns,
            rows: &table.rows,
        };
        let json = serde_json::to_vec(&content)
            .map_err(|e| Error::serialization(format!("Failed to serialize table: {e}")))?;
        let bytes = match self.compression_level {
            Some(level) => zstd::encode_all(json.as_slice(), level)
                .map_err(|e| Error::serialization(format!("zstd encoder error: {e}")))?,
            None => json,
        };
        fs::write(&path, bytes).map_err(|e| Error::io(e, &path, "write"))?;
        Ok(path)
    }

    fn read(&self, path: &Path) -> Result<Table> {
        let bytes = fs::read(path).map_err(|e| Error::io(e, path, "read"))?;
        let json = if self.compression_level.is_some() {
            zstd::decode_all(bytes.as_slice())
                .map_err(|e| Error::serialization(format!("zstd decoder error: {e}")))?
        } else {
            bytes
        };
        let content: TableContent = serde_json::from_slice(&json).map_err(|e| {
            Error::serialization(format!("Failed to parse table {}: {e}", path.display()))
        })?;
        Ok(Table::new(content.columns, content.rows))
    }
}
