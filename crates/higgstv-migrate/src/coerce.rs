//! Lenient conversions for source fields whose stored type drifted over
//! time. None of these fail: an unusable value becomes a default.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Integer value of a number, numeric string, string with leading digits
/// (`"123秒"`) or extended-JSON number wrapper. Floats are truncated.
pub fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => leading_integer(s),
        Value::Object(map) => ["$numberInt", "$numberLong", "$numberDouble", "$numberDecimal"]
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(|inner| match inner {
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .or_else(|| s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64)),
                other => integer(other),
            }),
        _ => None,
    }
}

fn leading_integer(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'-') => (-1, &s[1..]),
        Some(b'+') => (1, &s[1..]),
        _ => (1, s),
    };
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse::<i64>().ok().map(|n| sign * n)
}

/// Seconds; 0 when the value cannot be read as a number.
pub fn duration(value: &Value) -> i64 {
    integer(value).unwrap_or(0)
}

/// Integer list such as tags or a program order; entries that do not parse
/// are dropped.
pub fn integer_list(value: &Value) -> Vec<i64> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(integer).collect())
        .unwrap_or_default()
}

/// `contents_seq` was stored both as a number and as a string.
pub fn contents_seq(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => integer(other).map(|n| n.to_string()).unwrap_or_else(|| other.to_string()),
    }
}

pub fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(other) => integer(other).is_some_and(|n| n != 0),
        None => false,
    }
}

pub fn text(value: Option<&Value>) -> String {
    value.and_then(Value::as_str).unwrap_or_default().to_string()
}

/// RFC 3339 string or epoch milliseconds.
pub fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc)),
        other => integer(other).and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duration_variants() {
        assert_eq!(duration(&json!(95)), 95);
        assert_eq!(duration(&json!(95.9)), 95);
        assert_eq!(duration(&json!(" 42 ")), 42);
        assert_eq!(duration(&json!("123秒")), 123);
        assert_eq!(duration(&json!({"$numberLong": "7"})), 7);
        assert_eq!(duration(&json!({"$numberDouble": "8.5"})), 8);
        assert_eq!(duration(&json!("abc")), 0);
        assert_eq!(duration(&json!(null)), 0);
        assert_eq!(duration(&json!([1])), 0);
    }

    #[test]
    fn test_integer_list_drops_garbage() {
        assert_eq!(integer_list(&json!([1, "2", "x", 3.0, {"$numberInt": "4"}, null])), vec![1, 2, 3, 4]);
        assert!(integer_list(&json!("1,2")).is_empty());
    }

    #[test]
    fn test_contents_seq() {
        assert_eq!(contents_seq(Some(&json!(12))), "12");
        assert_eq!(contents_seq(Some(&json!("a,b"))), "a,b");
        assert_eq!(contents_seq(None), "");
        assert_eq!(contents_seq(Some(&json!({"$numberInt": "3"}))), "3");
    }

    #[test]
    fn test_flags_and_timestamps() {
        assert!(flag(Some(&json!(true))));
        assert!(flag(Some(&json!(1))));
        assert!(!flag(Some(&json!("no"))));
        assert!(!flag(None));

        let ts = timestamp(Some(&json!("2024-05-01T12:00:00Z"))).unwrap();
        assert_eq!(ts.timestamp(), 1_714_564_800);
        assert_eq!(timestamp(Some(&json!(1_714_564_800_000i64))), Some(ts));
        assert_eq!(timestamp(Some(&json!("yesterday"))), None);
    }
}
