//! Temporal data types and time handling

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const MICROS_PER_SEC: i64 = 1_000_000;

/// Timestamp representing a point in time with microsecond precision.
///
/// Microseconds keep the whole `0001..=9999` calendar range representable,
/// which the open-ended valid-time sentinel relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Microseconds since Unix epoch
    micros: i64,
}

impl Timestamp {
    /// `9999-12-31T23:59:59Z`, used as the "until further notice" end of a valid-time range
    pub const END_OF_TIME: Timestamp = Timestamp {
        micros: 253_402_300_799 * MICROS_PER_SEC,
    };

    /// Unix epoch
    pub const EPOCH: Timestamp = Timestamp { micros: 0 };

    /// Create a timestamp from microseconds since Unix epoch
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from milliseconds since Unix epoch
    pub fn from_millis(millis: i64) -> Self {
        Self {
            micros: millis.saturating_mul(1_000),
        }
    }

    /// Create a timestamp from seconds since Unix epoch
    pub fn from_secs(secs: i64) -> Self {
        Self {
            micros: secs.saturating_mul(MICROS_PER_SEC),
        }
    }

    /// Midnight UTC on the given calendar day
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Self::from(dt.and_utc()))
    }

    /// Parse an RFC 3339 string such as `2024-07-01T00:00:00Z`
    pub fn parse_rfc3339(s: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self::from(dt.with_timezone(&Utc)))
            .map_err(|e| Error::Validation(format!("invalid timestamp {s:?}: {e}")))
    }

    /// Get current timestamp
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    /// Get microseconds since Unix epoch
    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Get milliseconds since Unix epoch
    pub fn as_millis(&self) -> i64 {
        self.micros.div_euclid(1_000)
    }

    /// Get seconds since Unix epoch
    pub fn as_secs(&self) -> i64 {
        self.micros.div_euclid(MICROS_PER_SEC)
    }

    /// Convert to chrono DateTime, `None` outside chrono's range
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let nanos = (self.micros.rem_euclid(MICROS_PER_SEC) * 1_000) as u32;
        DateTime::from_timestamp(self.as_secs(), nanos)
    }

    /// Add duration in microseconds
    pub fn add_micros(&self, micros: i64) -> Self {
        Self {
            micros: self.micros.saturating_add(micros),
        }
    }

    /// Subtract duration in microseconds
    pub fn sub_micros(&self, micros: i64) -> Self {
        Self {
            micros: self.micros.saturating_sub(micros),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => write!(f, "{}us", self.micros),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            micros: dt.timestamp_micros(),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.to_datetime() {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => Err(serde::ser::Error::custom(format!(
                "timestamp {}us out of range",
                self.micros
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| Self::from(dt.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom)
    }
}

/// Half-open valid-time range `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidInterval {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl ValidInterval {
    /// Create a range, rejecting empty or inverted ones and bounds that
    /// cannot be represented as a calendar date
    pub fn new(from: Timestamp, to: Timestamp) -> Result<Self> {
        for bound in [from, to] {
            if bound.to_datetime().is_none() {
                return Err(Error::Validation(format!(
                    "timestamp {}us is outside the supported range",
                    bound.as_micros()
                )));
            }
        }
        if from >= to {
            return Err(Error::InvalidInterval {
                valid_from: from,
                valid_to: to,
            });
        }
        Ok(Self { from, to })
    }

    /// Range valid from `from` until [`Timestamp::END_OF_TIME`]
    pub fn open_ended(from: Timestamp) -> Result<Self> {
        Self::new(from, Timestamp::END_OF_TIME)
    }

    /// Check if a timestamp is within this range
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.from <= ts && ts < self.to
    }
}
