//! Scalar coercion helpers shared by note and folder validation

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Coerce a scalar JSON value into a string.
///
/// Strings pass through, numbers and booleans are stringified, `null`,
/// arrays and objects yield `None`.
pub(crate) fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Coerce an array into a list of strings, dropping non-scalar entries
pub(crate) fn coerce_string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| coerce_string(Some(item)))
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// Coerce to a non-negative integer; negatives clamp to 0, fractions floor
pub(crate) fn coerce_u64(value: &Value) -> Option<u64> {
    let float = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !float.is_finite() {
        return None;
    }
    Some(float.max(0.0).floor() as u64)
}

/// Parse an RFC 3339 string or epoch milliseconds
pub(crate) fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

/// Normalize a color to lowercase `#rrggbb`, or `None` if it isn't 6 hex digits
pub fn normalize_color(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("#{}", hex.to_ascii_lowercase()))
    } else {
        None
    }
}

/// Keep at most `max` characters
pub(crate) fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Keep at most `max` bytes without splitting a character
pub(crate) fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_u64() {
        assert_eq!(coerce_u64(&json!(5)), Some(5));
        assert_eq!(coerce_u64(&json!(-3)), Some(0));
        assert_eq!(coerce_u64(&json!(2.9)), Some(2));
        assert_eq!(coerce_u64(&json!("17")), Some(17));
        assert_eq!(coerce_u64(&json!("many")), None);
        assert_eq!(coerce_u64(&json!(null)), None);
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_truncate_bytes_boundary() {
        // "é" is two bytes; cutting at 2 would split it
        assert_eq!(truncate_bytes("aé", 2), "a");
        assert_eq!(truncate_bytes("abc", 2), "ab");
    }

    #[test]
    fn test_normalize_color() {
        assert_eq!(normalize_color("#FFFFFF").as_deref(), Some("#ffffff"));
        assert_eq!(normalize_color(" 00ff00 ").as_deref(), Some("#00ff00"));
        assert_eq!(normalize_color("#fff"), None);
        assert_eq!(normalize_color("blue"), None);
    }
}
