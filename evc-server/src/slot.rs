//! Reservation slot arithmetic
//!
//! A slot is exactly 30 minutes long and starts on :00 or :30 with zero
//! seconds. Requested times arrive as strings and may carry a UTC offset; those
//! are kept as [`RequestedTime::Aware`] so the scheduler can reject them instead
//! of silently converting.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of every reservation slot, in minutes
pub const SLOT_MINUTES: i64 = 30;

const AWARE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Input string is not a recognizable date-time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid date-time '{0}', expected YYYY-MM-DDTHH:MM[:SS]")]
pub struct TimeParseError(pub String);

/// A date-time as submitted by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedTime {
    Naive(NaiveDateTime),
    Aware(DateTime<FixedOffset>),
}

impl RequestedTime {
    /// The naive value, or `None` if the client sent a timezone
    pub fn naive(&self) -> Option<NaiveDateTime> {
        match self {
            RequestedTime::Naive(t) => Some(*t),
            RequestedTime::Aware(_) => None,
        }
    }

    pub fn is_aware(&self) -> bool {
        matches!(self, RequestedTime::Aware(_))
    }
}

impl From<NaiveDateTime> for RequestedTime {
    fn from(t: NaiveDateTime) -> Self {
        RequestedTime::Naive(t)
    }
}

impl FromStr for RequestedTime {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Ok(RequestedTime::Aware(t));
        }
        for fmt in AWARE_FORMATS {
            if let Ok(t) = DateTime::parse_from_str(s, fmt) {
                return Ok(RequestedTime::Aware(t));
            }
        }
        // A trailing `Z` marks UTC with or without seconds
        if let Some(utc) = s.strip_suffix(['Z', 'z']) {
            if let Some(t) = parse_naive(utc) {
                return Ok(RequestedTime::Aware(t.and_utc().fixed_offset()));
            }
        }
        if let Some(t) = parse_naive(s) {
            return Ok(RequestedTime::Naive(t));
        }

        Err(TimeParseError(s.to_string()))
    }
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

impl fmt::Display for RequestedTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestedTime::Naive(t) => write!(f, "{}", t.format("%Y-%m-%dT%H:%M:%S")),
            RequestedTime::Aware(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl Serialize for RequestedTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RequestedTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Duration of one slot
pub fn slot_length() -> Duration {
    Duration::minutes(SLOT_MINUTES)
}

/// True for HH:00:00 and HH:30:00 with no sub-second part
pub fn is_slot_boundary(t: &NaiveDateTime) -> bool {
    matches!(t.minute(), 0 | 30) && t.second() == 0 && t.nanosecond() == 0
}

/// True if `end` is exactly one slot after `start`
pub fn is_single_slot(start: &NaiveDateTime, end: &NaiveDateTime) -> bool {
    *end - *start == slot_length()
}

/// Whole seconds from `now` until `end` (negative once `end` has passed)
pub fn seconds_until(end: &NaiveDateTime, now: &NaiveDateTime) -> i64 {
    (*end - *now).num_seconds()
}
