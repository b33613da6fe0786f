//! Expiration specs and the file-age predicate
//!
//! An expiration spec is either a whole number of seconds or a mapping of
//! signed amounts over a fixed set of units. The threshold is the literal sum
//! of the signed components: `{"days": 7, "hours": -3}` is 6 days 21 hours, and
//! a negative total makes every file count as expired.

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

/// Units accepted in an expiration mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryUnit {
    /// Seconds
    Seconds,
    /// Minutes
    Minutes,
    /// Hours
    Hours,
    /// Days
    Days,
    /// Weeks
    Weeks,
}

impl ExpiryUnit {
    /// Every accepted unit, smallest first
    pub const ALL: [Self; 5] = [
        Self::Seconds,
        Self::Minutes,
        Self::Hours,
        Self::Days,
        Self::Weeks,
    ];

    /// Length of one unit in seconds
    #[must_use]
    pub const fn seconds(self) -> i64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 60 * 60,
            Self::Days => 24 * 60 * 60,
            Self::Weeks => 7 * 24 * 60 * 60,
        }
    }

    /// Lowercase name as used in expiration mappings
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Weeks => "weeks",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|unit| unit.as_str() == key)
    }
}

/// How long a cache artifact stays fresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, try_from = "Value")]
pub enum Expires {
    /// A whole number of seconds
    Seconds(i64),
    /// Signed amounts per unit, summed
    Units(BTreeMap<ExpiryUnit, f64>),
}

impl Expires {
    /// Expire after `seconds` seconds
    #[must_use]
    pub const fn seconds(seconds: i64) -> Self {
        Self::Seconds(seconds)
    }

    /// Expire after the sum of the given unit amounts
    #[must_use]
    pub fn units(amounts: impl IntoIterator<Item = (ExpiryUnit, f64)>) -> Self {
        let mut map = BTreeMap::new();
        for (unit, amount) in amounts {
            *map.entry(unit).or_insert(0.0) += amount;
        }
        Self::Units(map)
    }

    /// Parse a loosely typed spec, such as one read from a config file
    ///
    /// # Errors
    ///
    /// Returns a configuration error for anything but an integer or a mapping
    /// of known units to numbers.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Seconds).ok_or_else(|| {
                Error::configuration(format!("expiration seconds must be an integer, got {n}"))
            }),
            Value::Object(map) => {
                let mut amounts = Vec::with_capacity(map.len());
                for (key, amount) in map {
                    let unit = ExpiryUnit::from_key(key).ok_or_else(|| {
                        Error::configuration(format!(
                            "unknown expiration unit {key:?}, expected one of seconds, minutes, hours, days, weeks"
                        ))
                    })?;
                    let amount = amount.as_f64().ok_or_else(|| {
                        Error::configuration(format!(
                            "expiration amount for {key} must be a number, got {amount}"
                        ))
                    })?;
                    amounts.push((unit, amount));
                }
                Ok(Self::units(amounts))
            }
            other => Err(Error::configuration(format!(
                "expiration must be an integer or a mapping of units, got {other}"
            ))),
        }
    }

    /// Freshness window as a signed duration
    #[must_use]
    pub fn duration(&self) -> Duration {
        match self {
            Self::Seconds(seconds) => Duration::microseconds(seconds.saturating_mul(1_000_000)),
            Self::Units(amounts) => {
                let total: f64 = amounts
                    .iter()
                    .map(|(unit, amount)| amount * unit.seconds() as f64)
                    .sum();
                Duration::microseconds((total * 1e6).round() as i64)
            }
        }
    }

    /// Whether something last modified at `modified` is expired at `now`
    #[must_use]
    pub fn is_expired_at(&self, modified: SystemTime, now: DateTime<Utc>) -> bool {
        let age = now - DateTime::<Utc>::from(modified);
        age > self.duration()
    }
}

impl TryFrom<Value> for Expires {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(&value)
    }
}

impl From<i64> for Expires {
    fn from(seconds: i64) -> Self {
        Self::Seconds(seconds)
    }
}

/// Last modification time of `path`
///
/// # Errors
///
/// Returns [`Error::NotFound`] if the path does not exist.
pub fn modified(path: &Path) -> Result<SystemTime> {
    let metadata = std::fs::metadata(path).map_err(|e| Error::stat(e, path))?;
    metadata
        .modified()
        .map_err(|e| Error::io(e, path, "modified"))
}

/// Whether the file at `path` has outlived `expires`
///
/// Without a spec nothing expires.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if a spec is given and the path does not exist.
pub fn is_expired(path: &Path, expires: Option<&Expires>) -> Result<bool> {
    let Some(expires) = expires else {
        return Ok(false);
    };
    Ok(expires.is_expired_at(modified(path)?, Utc::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration as StdDuration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_value_accepts_integer_and_units() {
        assert_eq!(Expires::from_value(&json!(60)).unwrap(), Expires::Seconds(60));
        assert_eq!(Expires::from_value(&json!(-60)).unwrap(), Expires::Seconds(-60));

        for (spec, seconds) in [
            (json!({"seconds": 60}), 60),
            (json!({"minutes": 1}), 60),
            (json!({"hours": 8}), 8 * 3600),
            (json!({"days": 7}), 7 * 86_400),
            (json!({"weeks": 1}), 7 * 86_400),
            (json!({"days": 7, "hours": -3}), 7 * 86_400 - 3 * 3600),
            (json!({"minutes": 1.5}), 90),
            (json!({}), 0),
        ] {
            let expires = Expires::from_value(&spec).unwrap();
            assert_eq!(expires.duration(), Duration::seconds(seconds), "{spec}");
        }
    }

    #[test]
    fn test_from_value_rejects_bad_shapes() {
        for spec in [
            json!("None"),
            json!("60"),
            json!(60.5),
            json!(null),
            json!(true),
            json!([60]),
            json!({"years": 100}),
            json!({"centuries": 1}),
            json!({"days": "7"}),
        ] {
            assert!(
                matches!(Expires::from_value(&spec), Err(Error::Configuration { .. })),
                "{spec} should be rejected"
            );
        }
    }

    #[test]
    fn test_deserialize_goes_through_validation() {
        let expires: Expires = serde_json::from_str(r#"{"days": 1}"#).unwrap();
        assert_eq!(expires.duration(), Duration::days(1));
        assert!(serde_json::from_str::<Expires>(r#"{"years": 1}"#).is_err());
    }

    #[test]
    fn test_serialize_roundtrip_shape() {
        let json = serde_json::to_value(Expires::units([(ExpiryUnit::Days, 2.0)])).unwrap();
        assert_eq!(json, json!({"days": 2.0}));
        assert_eq!(serde_json::to_value(Expires::seconds(5)).unwrap(), json!(5));
    }

    #[test]
    fn test_units_sum_repeated_entries() {
        let expires = Expires::units([(ExpiryUnit::Hours, 1.0), (ExpiryUnit::Hours, 1.0)]);
        assert_eq!(expires.duration(), Duration::hours(2));
    }

    #[test]
    fn test_is_expired_at_boundary() {
        let now = Utc::now();
        let modified = SystemTime::from(now) - StdDuration::from_secs(120);

        assert!(Expires::seconds(60).is_expired_at(modified, now));
        assert!(!Expires::seconds(180).is_expired_at(modified, now));
        assert!(!Expires::seconds(120).is_expired_at(modified, now));
    }

    #[test]
    fn test_negative_spec_expires_fresh_files() {
        let now = Utc::now();
        let modified = SystemTime::from(now);
        assert!(Expires::seconds(-60).is_expired_at(modified, now));
        assert!(
            Expires::units([(ExpiryUnit::Hours, 1.0), (ExpiryUnit::Days, -1.0)])
                .is_expired_at(modified, now)
        );
    }

    #[test]
    fn test_is_expired_on_real_file() {
        let file = NamedTempFile::new().unwrap();
        assert!(!is_expired(file.path(), None).unwrap());
        assert!(!is_expired(file.path(), Some(&Expires::units([(ExpiryUnit::Days, 1.0)]))).unwrap());
        assert!(is_expired(file.path(), Some(&Expires::seconds(-60))).unwrap());
    }

    #[test]
    fn test_is_expired_missing_file() {
        let result = is_expired(Path::new("not_a_file"), Some(&Expires::seconds(60)));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
