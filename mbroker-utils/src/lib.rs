//! Small helpers shared by the mbroker crates.
//!
//! - [`Counter`]: lock-free statistic keeping the current value and its peak
//! - [`to_duration`] / [`deserialize_duration`]: `"1m30s"`, `"50ms"` style durations in config files
//! - [`timestamp_millis`]: wall clock helper
//!
//! ```
//! use mbroker_utils::to_duration;
//!
//! assert_eq!(to_duration("1m30s").unwrap().as_secs(), 90);
//! assert_eq!(to_duration("50ms").unwrap().as_millis(), 50);
//! assert!(to_duration("50 millis").is_err());
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::{de, de::Deserializer, Deserialize};
use thiserror::Error;

mod counter;

pub use counter::Counter;

/// Milliseconds since the Unix epoch
pub type TimestampMillis = i64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,
    #[error("malformed duration '{0}', expected e.g. \"1m30s\" or \"50ms\"")]
    Malformed(String),
    #[error("duration '{0}' is out of range")]
    Overflow(String),
}

/// Deserialize a [`Duration`] written in human form, e.g. `"2s"`.
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    to_duration(&v).map_err(de::Error::custom)
}

/// Convert a human-readable duration string to a [`Duration`].
///
/// The text is a sequence of `<number><unit>` segments without spaces between them. Units are
/// `ms`, `s`, `m`, `h` and `d`, case-insensitive.
///
/// ```
/// assert_eq!(mbroker_utils::to_duration("1h30m15s").unwrap().as_secs(), 5415);
/// assert_eq!(mbroker_utils::to_duration("2d").unwrap().as_secs(), 172_800);
/// ```
pub fn to_duration(text: &str) -> Result<Duration, DurationError> {
    let lower = text.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return Err(DurationError::Empty);
    }
    let malformed = || DurationError::Malformed(text.to_owned());

    let mut rest = lower.as_str();
    let mut ms: u64 = 0;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(malformed());
        }
        let v = rest[..digits].parse::<u64>().map_err(|_| DurationError::Overflow(text.to_owned()))?;
        rest = &rest[digits..];
        let (unit, len) = if rest.starts_with("ms") {
            (1, 2)
        } else {
            match rest.chars().next() {
                Some('s') => (1000, 1),
                Some('m') => (60_000, 1),
                Some('h') => (3_600_000, 1),
                Some('d') => (86_400_000, 1),
                _ => return Err(malformed()),
            }
        };
        rest = &rest[len..];
        ms = v
            .checked_mul(unit)
            .and_then(|v| ms.checked_add(v))
            .ok_or_else(|| DurationError::Overflow(text.to_owned()))?;
    }
    Ok(Duration::from_millis(ms))
}

/// Current wall clock time in milliseconds.
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}
