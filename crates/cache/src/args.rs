//! Canonical byte representation of call arguments
//!
//! Every argument of a memoized call is an [`Arg`], a closed set of variants
//! with a fixed encoding. [`represent`] turns one argument into bytes that are
//! stable across runs and independent of object identity; [`combine`] feeds a
//! whole [`Args`] set into one running digest, keyword arguments sorted by name.
//!
//! Bare lists, bare maps and opaque objects are rejected with
//! [`Error::NotRepresentable`]: their contents have no stable identity as a
//! call argument. Inside a [`Record`] they are accepted, maps key-sorted.

use crate::config::CacheConfig;
use crate::fingerprint::FunctionIdentity;
use crate::table::Table;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Numeric array passed by value
///
/// Canonicalized by content: element type, shape and raw little-endian buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericArray {
    dtype: String,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl NumericArray {
    /// One-dimensional array of `f64`
    #[must_use]
    pub fn from_f64(values: &[f64]) -> Self {
        Self {
            dtype: "f64".to_string(),
            shape: vec![values.len()],
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// One-dimensional array of `i64`
    #[must_use]
    pub fn from_i64(values: &[i64]) -> Self {
        Self {
            dtype: "i64".to_string(),
            shape: vec![values.len()],
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Reinterpret the buffer with a different shape
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the shape does not cover the same
    /// number of elements.
    pub fn reshape(mut self, shape: Vec<usize>) -> Result<Self> {
        let current: usize = self.shape.iter().product();
        let wanted: usize = shape.iter().product();
        if current != wanted {
            return Err(Error::configuration(format!(
                "cannot reshape {} elements into {shape:?}",
                current
            )));
        }
        self.shape = shape;
        Ok(self)
    }

    /// Element type name
    #[must_use]
    pub fn dtype(&self) -> &str {
        &self.dtype
    }

    /// Array shape
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
}

/// Composite value with named fields
///
/// Fields are encoded sorted by name, so construction order does not matter.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    type_name: String,
    fields: Vec<(String, Arg)>,
}

impl Record {
    /// Empty record of the given type
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Set a field, replacing any previous value
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Arg>) -> Self {
        upsert(&mut self.fields, name.into(), value.into());
        self
    }
}

/// One argument of a memoized call
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Text
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Point in time
    Timestamp(DateTime<Utc>),
    /// Calendar date
    Date(NaiveDate),
    /// Table, by content and attached metadata
    Table(Table),
    /// Numeric array, by content
    Array(NumericArray),
    /// File, by size and modification time
    Path(PathBuf),
    /// Function, by code only
    Callable(FunctionIdentity),
    /// Composite with named fields
    Record(Record),
    /// Ordered sequence; only representable inside a record
    List(Vec<Self>),
    /// Keyed mapping; only representable inside a record
    Map(Vec<(String, Self)>),
    /// Value of a type without a canonical form
    Opaque(String),
}

impl Arg {
    /// Name of the variant, used in error messages
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Timestamp(_) => "timestamp",
            Self::Date(_) => "date",
            Self::Table(_) => "table",
            Self::Array(_) => "array",
            Self::Path(_) => "path",
            Self::Callable(_) => "callable",
            Self::Record(_) => "record",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Opaque(name) => name,
        }
    }
}

macro_rules! impl_from_for_arg {
    ($($ty:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(impl From<$ty> for Arg {
            fn from($v: $ty) -> Self {
                $body
            }
        })*
    };
}

impl_from_for_arg! {
    bool => |v| Self::Bool(v),
    i32 => |v| Self::Int(i64::from(v)),
    u32 => |v| Self::Int(i64::from(v)),
    i64 => |v| Self::Int(v),
    f64 => |v| Self::Float(v),
    &str => |v| Self::Str(v.to_string()),
    String => |v| Self::Str(v),
    DateTime<Utc> => |v| Self::Timestamp(v),
    NaiveDate => |v| Self::Date(v),
    Table => |v| Self::Table(v),
    &Table => |v| Self::Table(v.clone()),
    NumericArray => |v| Self::Array(v),
    PathBuf => |v| Self::Path(v),
    &Path => |v| Self::Path(v.to_path_buf()),
    FunctionIdentity => |v| Self::Callable(v),
    Record => |v| Self::Record(v),
    Vec<Arg> => |v| Self::List(v),
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

fn upsert(entries: &mut Vec<(String, Arg)>, key: String, value: Arg) {
    if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
        slot.1 = value;
    } else {
        entries.push((key, value));
    }
}

/// Positional and keyword arguments of one call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Arg>,
    keyword: Vec<(String, Arg)>,
}

impl Args {
    /// No arguments
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    #[must_use]
    pub fn arg(mut self, value: impl Into<Arg>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument, replacing any previous value for `key`
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Arg>) -> Self {
        upsert(&mut self.keyword, key.into(), value.into());
        self
    }

    /// Positional arguments in call order
    #[must_use]
    pub fn positional(&self) -> &[Arg] {
        &self.positional
    }

    /// Keyword arguments in insertion order
    #[must_use]
    pub fn keyword(&self) -> &[(String, Arg)] {
        &self.keyword
    }

    /// Look up a keyword argument
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Arg> {
        self.keyword.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const INT: u8 = 2;
    pub const FLOAT: u8 = 3;
    pub const STR: u8 = 4;
    pub const BYTES: u8 = 5;
    pub const TIMESTAMP: u8 = 6;
    pub const DATE: u8 = 7;
    pub const TABLE: u8 = 8;
    pub const ARRAY: u8 = 9;
    pub const PATH: u8 = 10;
    pub const CALLABLE: u8 = 11;
    pub const RECORD: u8 = 12;
    pub const LIST: u8 = 13;
    pub const MAP: u8 = 14;
}

fn push_chunk(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Canonical bytes of one argument
///
/// # Errors
///
/// - [`Error::NotRepresentable`] for bare lists, bare maps and opaque values
/// - [`Error::NotFound`] for paths that do not exist
pub fn represent(arg: &Arg) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode(arg, false, &mut out)?;
    Ok(out)
}

fn encode(arg: &Arg, nested: bool, out: &mut Vec<u8>) -> Result<()> {
    match arg {
        Arg::Null => out.push(tag::NULL),
        Arg::Bool(v) => out.extend_from_slice(&[tag::BOOL, u8::from(*v)]),
        Arg::Int(v) => {
            out.push(tag::INT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Arg::Float(v) => {
            out.push(tag::FLOAT);
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Arg::Str(v) => {
            out.push(tag::STR);
            push_chunk(out, v.as_bytes());
        }
        Arg::Bytes(v) => {
            out.push(tag::BYTES);
            push_chunk(out, v);
        }
        Arg::Timestamp(v) => {
            out.push(tag::TIMESTAMP);
            push_chunk(out, v.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
        }
        Arg::Date(v) => {
            out.push(tag::DATE);
            push_chunk(out, v.format("%Y-%m-%d").to_string().as_bytes());
        }
        Arg::Table(table) => {
            let json = serde_json::to_vec(table)
                .map_err(|e| Error::serialization(format!("Failed to serialize table: {e}")))?;
            out.push(tag::TABLE);
            out.extend_from_slice(&Sha256::digest(json));
        }
        Arg::Array(array) => {
            let mut hasher = Sha256::new();
            hasher.update(array.dtype.as_bytes());
            for dim in &array.shape {
                hasher.update((*dim as u64).to_le_bytes());
            }
            hasher.update(&array.data);
            out.push(tag::ARRAY);
            out.extend_from_slice(&hasher.finalize());
        }
        Arg::Path(path) => {
            let (size, mtime) = file_stamp(path)?;
            out.push(tag::PATH);
            push_chunk(out, path.as_os_str().as_encoded_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&mtime.to_le_bytes());
        }
        Arg::Callable(function) => {
            out.push(tag::CALLABLE);
            push_chunk(out, function.code());
        }
        Arg::Record(record) => {
            out.push(tag::RECORD);
            push_chunk(out, record.type_name.as_bytes());
            encode_entries(&record.fields, out)?;
        }
        Arg::List(items) if nested => {
            out.push(tag::LIST);
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                encode(item, true, out)?;
            }
        }
        Arg::Map(entries) if nested => {
            out.push(tag::MAP);
            encode_entries(entries, out)?;
        }
        Arg::List(_) | Arg::Map(_) | Arg::Opaque(_) => {
            return Err(Error::not_representable(arg.type_name()));
        }
    }
    Ok(())
}

fn encode_entries(entries: &[(String, Arg)], out: &mut Vec<u8>) -> Result<()> {
    let sorted: BTreeMap<&str, &Arg> = entries.iter().map(|(k, v)| (k.as_str(), v)).collect();
    out.extend_from_slice(&(sorted.len() as u64).to_le_bytes());
    for (key, value) in sorted {
        push_chunk(out, key.as_bytes());
        encode(value, true, out)?;
    }
    Ok(())
}

/// Size and modification time (nanoseconds relative to the epoch) of a file
fn file_stamp(path: &Path) -> Result<(u64, i128)> {
    let metadata = std::fs::metadata(path).map_err(|e| Error::stat(e, path))?;
    let modified = metadata
        .modified()
        .map_err(|e| Error::io(e, path, "modified"))?;
    let mtime = match modified.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos() as i128,
        Err(before) => -(before.duration().as_nanos() as i128),
    };
    Ok((metadata.len(), mtime))
}

/// Running digest over canonical argument bytes
///
/// Seeded with the version salt and the digest size, then extended by
/// [`combine`] and later by the fingerprinter.
#[derive(Clone)]
pub struct ArgsDigest {
    hasher: Sha256,
    digest_size: usize,
}

impl ArgsDigest {
    /// Empty digest for the given configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration is invalid.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let mut hasher = Sha256::new();
        hasher.update([config.digest_size as u8]);
        let salt = config.salt();
        hasher.update([salt.len() as u8]);
        hasher.update(salt);
        Ok(Self {
            hasher,
            digest_size: config.digest_size,
        })
    }

    /// Feed more bytes
    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.hasher.update(data.as_ref());
    }

    /// Size of the final digest in bytes
    #[must_use]
    pub fn digest_size(&self) -> usize {
        self.digest_size
    }

    /// Digest of everything fed so far; the running state is kept
    #[must_use]
    pub fn digest(&self) -> Vec<u8> {
        let full = self.hasher.clone().finalize();
        full[..self.digest_size].to_vec()
    }

    /// Lowercase hex form of [`ArgsDigest::digest`]
    #[must_use]
    pub fn hexdigest(&self) -> String {
        hex::encode(self.digest())
    }

    pub(crate) fn feed_chunk(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }
}

impl std::fmt::Debug for ArgsDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgsDigest")
            .field("digest_size", &self.digest_size)
            .field("hexdigest", &self.hexdigest())
            .finish()
    }
}

/// Feed a whole argument set into a fresh digest
///
/// Positional arguments go in call order, then keyword arguments sorted by
/// name, each as its name followed by its representation.
///
/// # Errors
///
/// Propagates any [`represent`] failure unchanged.
pub fn combine(args: &Args, config: &CacheConfig) -> Result<ArgsDigest> {
    let _span = tracing::trace_span!(
        "combine",
        positional = args.positional.len(),
        keyword = args.keyword.len()
    )
    .entered();

    let mut digest = ArgsDigest::new(config)?;

    digest.update((args.positional.len() as u64).to_le_bytes());
    for arg in &args.positional {
        digest.feed_chunk(&represent(arg)?);
    }

    let mut keyword: Vec<&(String, Arg)> = args.keyword.iter().collect();
    keyword.sort_by(|a, b| a.0.cmp(&b.0));
    digest.update((keyword.len() as u64).to_le_bytes());
    for (key, value) in keyword {
        digest.feed_chunk(key.as_bytes());
        digest.feed_chunk(&represent(value)?);
    }

    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config() -> CacheConfig {
        CacheConfig::default()
    }

    fn hex(args: &Args) -> String {
        combine(args, &config()).unwrap().hexdigest()
    }

    fn table() -> Table {
        Table::from_columns([
            ("a", vec![json!(1), json!(2), json!(3)]),
            (" b", vec![json!(4), json!(5), json!(6)]),
        ])
        .unwrap()
    }

    #[test]
    fn test_represent_rejects_bare_containers() {
        for arg in [
            Arg::List(vec![]),
            Arg::Map(vec![]),
            Arg::List(vec![Arg::Int(1)]),
            Arg::Opaque("Mutable".into()),
        ] {
            assert!(
                matches!(represent(&arg), Err(Error::NotRepresentable { .. })),
                "{} should be rejected",
                arg.type_name()
            );
        }
    }

    #[test]
    fn test_represent_scalars_and_time() {
        let now = Utc::now();
        for arg in [
            Arg::Null,
            Arg::from(true),
            Arg::from(42),
            Arg::from(1.5),
            Arg::from("string"),
            Arg::Bytes(vec![0, 1, 2]),
            Arg::from(now),
            Arg::from(now.date_naive()),
        ] {
            let first = represent(&arg).unwrap();
            assert!(!first.is_empty());
            assert_eq!(first, represent(&arg).unwrap());
        }
    }

    #[test]
    fn test_represent_distinguishes_types() {
        assert_ne!(represent(&Arg::Int(1)).unwrap(), represent(&Arg::Float(1.0)).unwrap());
        assert_ne!(represent(&Arg::from("1")).unwrap(), represent(&Arg::Int(1)).unwrap());
        assert_ne!(
            represent(&Arg::from("ab")).unwrap(),
            represent(&Arg::Bytes(b"ab".to_vec())).unwrap()
        );
    }

    #[test]
    fn test_table_hash_ignores_identity() {
        let a = table();
        let b = table();
        assert_eq!(
            represent(&Arg::from(&a)).unwrap(),
            represent(&Arg::from(&b)).unwrap()
        );
    }

    #[test]
    fn test_table_hash_includes_attrs() {
        let a = table().with_attr("salt", "foo");
        let b = table().with_attr("salt", "bar");
        assert_ne!(
            represent(&Arg::from(a)).unwrap(),
            represent(&Arg::from(b)).unwrap()
        );
        assert_ne!(
            represent(&Arg::from(table())).unwrap(),
            represent(&Arg::from(table().with_attr("salt", "foo"))).unwrap()
        );
    }

    #[test]
    fn test_array_hash_by_content() {
        let a = NumericArray::from_i64(&[1, 2, 3]);
        let b = NumericArray::from_i64(&[1, 2, 3]);
        let c = NumericArray::from_f64(&[1.0, 2.0, 3.0]);
        assert_eq!(represent(&a.clone().into()).unwrap(), represent(&b.into()).unwrap());
        assert_ne!(represent(&a.into()).unwrap(), represent(&c.into()).unwrap());
    }

    #[test]
    fn test_array_hash_includes_shape() {
        let flat = NumericArray::from_i64(&[1, 2, 3, 4]);
        let square = flat.clone().reshape(vec![2, 2]).unwrap();
        assert_ne!(
            represent(&flat.into()).unwrap(),
            represent(&square.into()).unwrap()
        );
        assert!(NumericArray::from_i64(&[1, 2, 3]).reshape(vec![2, 2]).is_err());
    }

    #[test]
    fn test_path_changes_with_size() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "foo").unwrap();
        file.flush().unwrap();
        let foo = represent(&Arg::from(file.path())).unwrap();

        writeln!(file, "bar").unwrap();
        file.flush().unwrap();
        let bar = represent(&Arg::from(file.path())).unwrap();

        assert_ne!(foo, bar);
    }

    #[test]
    fn test_path_missing_is_not_found() {
        let result = represent(&Arg::from(Path::new("/nonexistent/plume/input.csv")));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_callable_uses_code_only() {
        let foo = FunctionIdentity::new("foo", b"return 1".to_vec());
        let bar = FunctionIdentity::new("bar", b"return 1".to_vec());
        let changed = FunctionIdentity::new("foo", b"return 2".to_vec());
        assert_eq!(represent(&foo.clone().into()).unwrap(), represent(&bar.into()).unwrap());
        assert_ne!(represent(&foo.into()).unwrap(), represent(&changed.into()).unwrap());
    }

    #[test]
    fn test_record_field_order_and_nested_containers() {
        let a = Record::new("Query")
            .field("tags", vec![Arg::from("x"), Arg::from("y")])
            .field("limit", 10);
        let b = Record::new("Query")
            .field("limit", 10)
            .field("tags", vec![Arg::from("x"), Arg::from("y")]);
        assert_eq!(represent(&a.into()).unwrap(), represent(&b.into()).unwrap());

        let nested_map = Record::new("Query").field(
            "filters",
            Arg::Map(vec![("b".into(), Arg::Int(2)), ("a".into(), Arg::Int(1))]),
        );
        let sorted_map = Record::new("Query").field(
            "filters",
            Arg::Map(vec![("a".into(), Arg::Int(1)), ("b".into(), Arg::Int(2))]),
        );
        assert_eq!(
            represent(&nested_map.into()).unwrap(),
            represent(&sorted_map.into()).unwrap()
        );
    }

    #[test]
    fn test_record_rejects_opaque_field() {
        let record = Record::new("Holder").field("inner", Arg::Opaque("Mutable".into()));
        assert!(matches!(
            represent(&record.into()),
            Err(Error::NotRepresentable { .. })
        ));
    }

    #[test]
    fn test_combine_keyword_order_independent() {
        let now = Utc::now();
        let unsorted = Args::new()
            .arg(1)
            .arg("two")
            .arg(now)
            .kwarg("c", table())
            .kwarg("b", NumericArray::from_i64(&[1, 2, 3]))
            .kwarg("a", 3.5);
        let sorted = Args::new()
            .arg(1)
            .arg("two")
            .arg(now)
            .kwarg("a", 3.5)
            .kwarg("b", NumericArray::from_i64(&[1, 2, 3]))
            .kwarg("c", table());
        assert_eq!(hex(&unsorted), hex(&sorted));
    }

    #[test]
    fn test_combine_positional_order_matters() {
        assert_ne!(
            hex(&Args::new().arg(1).arg(2)),
            hex(&Args::new().arg(2).arg(1))
        );
    }

    #[test]
    fn test_combine_keyword_boundaries() {
        assert_ne!(
            hex(&Args::new().kwarg("ab", "c")),
            hex(&Args::new().kwarg("a", "bc"))
        );
        assert_ne!(hex(&Args::new().arg("a")), hex(&Args::new().kwarg("a", Arg::Null)));
        assert_ne!(hex(&Args::new()), hex(&Args::new().arg(Arg::Null)));
    }

    #[test]
    fn test_combine_propagates_representation_errors() {
        let args = Args::new().arg(1).kwarg("rows", Arg::List(vec![]));
        assert!(matches!(
            combine(&args, &config()),
            Err(Error::NotRepresentable { .. })
        ));
    }

    #[test]
    fn test_kwarg_replaces_previous_value() {
        let args = Args::new().kwarg("a", 1).kwarg("a", 2);
        assert_eq!(args.keyword().len(), 1);
        assert_eq!(args.get("a"), Some(&Arg::Int(2)));
        assert_eq!(hex(&args), hex(&Args::new().kwarg("a", 2)));
    }

    #[test]
    fn test_digest_size_and_salt() {
        let args = Args::new().arg(1);
        let digest = combine(&args, &config()).unwrap();
        assert_eq!(digest.digest_size(), 16);
        assert_eq!(digest.hexdigest().len(), 32);

        let wide = combine(&args, &config().with_digest_size(32)).unwrap();
        assert_eq!(wide.hexdigest().len(), 64);

        let other_version = combine(&args, &config().with_version("9.9.9")).unwrap();
        assert_ne!(digest.hexdigest(), other_version.hexdigest());
    }

    #[test]
    fn test_digest_is_updatable() {
        let mut digest = combine(&Args::new(), &config()).unwrap();
        let before = digest.hexdigest();
        assert_eq!(before, digest.hexdigest());
        digest.update(b"more");
        assert_ne!(before, digest.hexdigest());
    }
}
