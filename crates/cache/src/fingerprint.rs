//! Fingerprints of memoized calls
//!
//! A fingerprint extends the argument digest from [`crate::args::combine`] with
//! the computation's qualified name and its code bytes, plus an optional
//! caller-supplied pepper. Hashing both name and code keeps a redefinition
//! with the same name apart from the original.

use crate::args::{Args, ArgsDigest, combine};
use crate::config::CacheConfig;
use crate::{Error, Result};
use std::fmt;

/// Identity of a computation: qualified name and code bytes
///
/// The code bytes stand in for the executable logic. Callers choose them,
/// typically the function source or a version tag bumped on every change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionIdentity {
    qualname: String,
    code: Vec<u8>,
}

impl FunctionIdentity {
    /// Identity from an explicit name and code
    pub fn new(qualname: impl Into<String>, code: impl Into<Vec<u8>>) -> Self {
        Self {
            qualname: qualname.into(),
            code: code.into(),
        }
    }

    /// Identity named after the type of `function`
    ///
    /// For function items this is the full path, e.g. `my_crate::load_sales`.
    pub fn of<F>(_function: &F, code: impl Into<Vec<u8>>) -> Self {
        Self::new(std::any::type_name::<F>(), code)
    }

    /// Fully qualified name
    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    /// Code bytes
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

/// Lowercase hex key of a memoized call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Validate a hex string against the configured digest size
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the length or alphabet is wrong.
    pub fn from_hex(hex: impl Into<String>, config: &CacheConfig) -> Result<Self> {
        let s = hex.into();
        if s.len() != config.fingerprint_len() {
            return Err(Error::configuration(format!(
                "fingerprint must be {} hex characters, got {}",
                config.fingerprint_len(),
                s.len()
            )));
        }
        if !s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            return Err(Error::configuration(
                "fingerprint must contain only lowercase hex digits",
            ));
        }
        Ok(Self(s))
    }

    /// Hex representation
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Argument digest extended with the computation identity
///
/// # Errors
///
/// Propagates representation, not-found and configuration errors.
pub fn hash_wrapped(
    function: &FunctionIdentity,
    args: &Args,
    config: &CacheConfig,
) -> Result<ArgsDigest> {
    let mut digest = combine(args, config)?;
    digest.feed_chunk(function.qualname.as_bytes());
    digest.feed_chunk(&function.code);
    Ok(digest)
}

/// Fingerprint of calling `function` with `args`
///
/// # Errors
///
/// Propagates representation, not-found and configuration errors.
pub fn fingerprint(
    function: &FunctionIdentity,
    args: &Args,
    config: &CacheConfig,
    pepper: Option<&dyn Fn() -> Vec<u8>>,
) -> Result<Fingerprint> {
    let mut digest = hash_wrapped(function, args, config)?;
    if let Some(pepper) = pepper {
        digest.update(pepper());
    }
    Ok(Fingerprint(digest.hexdigest()))
}
