use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// Timestamps above this are treated as epoch milliseconds rather than seconds.
const EPOCH_MILLIS_CUTOFF: i64 = 100_000_000_000;

const NAIVE_DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"];
const NAIVE_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

/// Expense date as it arrives from user data: a native value, an epoch timestamp (integral,
/// fractional or `{seconds, nanoseconds}`), or a string. Anything else deserializes as
/// `Unparsed` so one bad record never fails a whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawDate {
    Epoch(i64),
    FractionalEpoch(f64),
    Text(String),
    Timestamp {
        #[serde(alias = "_seconds")]
        seconds: i64,
        #[serde(default, alias = "_nanoseconds")]
        nanoseconds: u32,
    },
    #[serde(skip_deserializing)]
    Native(DateTime<Utc>),
    Unparsed(serde_json::Value),
}

impl Default for RawDate {
    fn default() -> Self {
        RawDate::Unparsed(serde_json::Value::Null)
    }
}

impl From<DateTime<Utc>> for RawDate {
    fn from(value: DateTime<Utc>) -> Self {
        RawDate::Native(value)
    }
}

impl From<NaiveDate> for RawDate {
    fn from(value: NaiveDate) -> Self {
        RawDate::Native(value.and_time(chrono::NaiveTime::MIN).and_utc())
    }
}

impl RawDate {
    /// Normalizes to a UTC instant. `None` when the value cannot be interpreted.
    pub fn normalize(&self) -> Option<DateTime<Utc>> {
        match self {
            RawDate::Native(dt) => Some(*dt),
            RawDate::Epoch(ts) => from_epoch(*ts),
            RawDate::FractionalEpoch(ts) => from_fractional_epoch(*ts),
            RawDate::Text(s) => parse_text(s),
            RawDate::Timestamp {
                seconds,
                nanoseconds,
            } => DateTime::<Utc>::from_timestamp(*seconds, *nanoseconds),
            RawDate::Unparsed(_) => None,
        }
    }
}

/// Like `normalize`, but unparsable values become `now` with a warning.
pub fn normalize_or_now(raw: &RawDate, now: DateTime<Utc>) -> DateTime<Utc> {
    match raw.normalize() {
        Some(dt) => dt,
        None => {
            tracing::warn!(?raw, "unparsable date; falling back to now");
            now
        }
    }
}

fn from_epoch(ts: i64) -> Option<DateTime<Utc>> {
    if ts.abs() >= EPOCH_MILLIS_CUTOFF {
        Utc.timestamp_millis_opt(ts).single()
    } else {
        Utc.timestamp_opt(ts, 0).single()
    }
}

fn from_fractional_epoch(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() {
        return None;
    }
    let millis = if ts.abs() >= EPOCH_MILLIS_CUTOFF as f64 {
        ts
    } else {
        ts * 1000.0
    };
    if millis.abs() > i64::MAX as f64 {
        return None;
    }
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

fn parse_text(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(ts) = s.parse::<i64>() {
        return from_epoch(ts);
    }

    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }

    for fmt in NAIVE_DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d.and_time(chrono::NaiveTime::MIN).and_utc());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jan_27() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 27, 0, 0, 0).unwrap()
    }

    #[test]
    fn normalizes_heterogeneous_shapes_to_one_instant() {
        let expected = jan_27();
        let shapes = [
            RawDate::Native(expected),
            RawDate::Epoch(expected.timestamp()),
            RawDate::Epoch(expected.timestamp_millis()),
            RawDate::Text("2026-01-27".to_string()),
            RawDate::Text("2026-01-27T00:00:00Z".to_string()),
            RawDate::Text("2026-01-27T00:00:00".to_string()),
            RawDate::Text("01/27/2026".to_string()),
        ];
        for raw in shapes {
            assert_eq!(raw.normalize(), Some(expected), "shape {raw:?}");
        }
    }

    #[test]
    fn deserializes_numbers_and_strings() {
        let n: RawDate = serde_json::from_value(serde_json::json!(1769472000)).unwrap();
        assert_eq!(n.normalize(), Some(jan_27()));
        let s: RawDate = serde_json::from_value(serde_json::json!("2026-01-27")).unwrap();
        assert_eq!(s.normalize(), Some(jan_27()));
    }

    #[test]
    fn odd_shapes_deserialize_without_failing_the_record() {
        let frac: RawDate = serde_json::from_value(serde_json::json!(1769472000.5)).unwrap();
        assert_eq!(frac.normalize(), Some(jan_27() + chrono::Duration::milliseconds(500)));

        let ts: RawDate =
            serde_json::from_value(serde_json::json!({"seconds": 1769472000, "nanoseconds": 0})).unwrap();
        assert_eq!(ts.normalize(), Some(jan_27()));
        let underscored: RawDate = serde_json::from_value(serde_json::json!({"_seconds": 1769472000})).unwrap();
        assert_eq!(underscored.normalize(), Some(jan_27()));

        for junk in [serde_json::json!(null), serde_json::json!({"when": "soon"}), serde_json::json!(true)] {
            let raw: RawDate = serde_json::from_value(junk).unwrap();
            assert!(matches!(raw, RawDate::Unparsed(_)));
            assert_eq!(raw.normalize(), None);
        }
    }

    #[test]
    fn unparsable_falls_back_to_now() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let raw = RawDate::Text("next tuesday".to_string());
        assert_eq!(raw.normalize(), None);
        assert_eq!(normalize_or_now(&raw, now), now);
    }
}
