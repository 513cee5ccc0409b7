//! Upstream field decoding.
//!
//! Upstream represents every field as a string and signals missing/denied
//! fields with an `Error <code>` sentinel instead of an HTTP-style status.
//! Mirrors `parse_tql_field` in the original client: numeric fields round to
//! two decimals or fall back to zero, strings fall back to empty, and the
//! sentinel is translated to a human-readable reason for logging.

use serde_json::Value;

fn error_reason(code: &str) -> &'static str {
    match code {
        "0" => "Field Not Found",
        "2" => "Field No Value",
        "3" => "Field Not Permissioned",
        "17" => "No Record Exists",
        "256" => "Field Reset",
        _ => "Unknown Field Error",
    }
}

/// `Some(reason)` if `raw` is an `Error <code>` sentinel, `None` otherwise.
/// Matches case-insensitively (`data.lower().startswith('error ')` in the
/// original client): upstream has been observed sending both `Error 17` and
/// `error 17`.
pub fn sentinel_reason(raw: &str) -> Option<&'static str> {
    if raw.len() < 6 || !raw.as_bytes()[..6].eq_ignore_ascii_case(b"error ") {
        return None;
    }
    Some(error_reason(raw[6..].trim()))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parses a field expected to hold a float, rounding to two decimals.
/// Returns `0.0` for a sentinel or an unparseable value.
pub fn parse_float(value: &Value) -> f64 {
    let raw = as_text(value);
    if sentinel_reason(&raw).is_some() {
        return 0.0;
    }
    raw.trim()
        .parse::<f64>()
        .map(|v| (v * 100.0).round() / 100.0)
        .unwrap_or(0.0)
}

/// Parses a field expected to hold an integer. Returns `0` for a sentinel or
/// an unparseable value.
pub fn parse_int(value: &Value) -> i64 {
    let raw = as_text(value);
    if sentinel_reason(&raw).is_some() {
        return 0;
    }
    raw.trim().parse::<i64>().unwrap_or(0)
}

/// Parses a field expected to hold a string. Returns an empty string for a
/// sentinel.
pub fn parse_string(value: &Value) -> String {
    let raw = as_text(value);
    if sentinel_reason(&raw).is_some() {
        return String::new();
    }
    raw
}
