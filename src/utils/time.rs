// src/utils/time.rs

//! Timestamp normalization and the server clock.
//!
//! Stores may hold timestamps either as RFC 3339 text or as epoch
//! milliseconds. Everything leaving the crate is rendered in one textual
//! form: `YYYY-MM-DDTHH:MM:SS.mmmZ`.

use std::sync::Mutex;

use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};
use serde_json::Value;

use crate::error::{AppError, Result};

/// Render a timestamp in the canonical UTC text form.
pub fn format_utc(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse RFC 3339 text into UTC.
pub fn parse_utc(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::invalid_input(format!("bad timestamp '{text}': {e}")))
}

/// Interpret epoch milliseconds as UTC.
pub fn from_epoch_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| AppError::invalid_input(format!("epoch millis out of range: {millis}")))
}

/// Normalize a stored JSON timestamp, textual or numeric.
pub fn from_json(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_utc(s),
        Value::Number(n) => match n.as_i64() {
            Some(ms) => from_epoch_millis(ms),
            None => Err(AppError::invalid_input(format!("non-integer timestamp: {n}"))),
        },
        other => Err(AppError::invalid_input(format!(
            "timestamp must be text or epoch millis, got {other}"
        ))),
    }
}

/// Truncate to the millisecond precision the wire format carries.
pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(ts)
}

/// Serde adapter: accepts text or epoch millis, always writes text.
pub mod flexible {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_utc(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        super::from_json(&value).map_err(D::Error::custom)
    }
}

/// Monotonic millisecond clock.
///
/// Every tick is strictly later than the previous one, even when the
/// wall clock stalls or steps backwards.
#[derive(Debug)]
pub struct ServerClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    /// Next timestamp.
    pub fn tick(&self) -> DateTime<Utc> {
        let wall = truncate_millis(Utc::now());
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = match *last {
            Some(prev) if wall <= prev => prev + TimeDelta::milliseconds(1),
            _ => wall,
        };
        *last = Some(next);
        next
    }

    /// Make sure future ticks land after `ts` (used when restoring state).
    pub fn observe(&self, ts: DateTime<Utc>) {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.is_none_or(|prev| ts > prev) {
            *last = Some(ts);
        }
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_epoch_millis_and_text_normalize_identically() {
        let from_text = from_json(&json!("2024-01-01T00:00:00Z")).unwrap();
        let from_millis = from_json(&json!(1_704_067_200_000_i64)).unwrap();
        assert_eq!(from_text, from_millis);
        assert_eq!(format_utc(&from_millis), "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_offset_text_converted_to_utc() {
        let ts = parse_utc("2024-01-01T09:00:00+09:00").unwrap();
        assert_eq!(format_utc(&ts), "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(from_json(&json!("yesterday")).is_err());
        assert!(from_json(&json!(true)).is_err());
        assert!(from_json(&json!(1.5)).is_err());
    }

    #[test]
    fn test_clock_strictly_increases() {
        let clock = ServerClock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_clock_observe_moves_forward() {
        let clock = ServerClock::new();
        let future = Utc::now() + TimeDelta::hours(1);
        clock.observe(truncate_millis(future));
        assert!(clock.tick() > future);
    }
}
