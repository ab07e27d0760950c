//! Scrubbing for values that leave the sandbox.
//!
//! Error messages are stripped of stack frames and host locations before the
//! host sees them. Log values are clamped so a hostile deployment cannot hand
//! the host sink an unbounded structure.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Maximum nesting depth delivered to a log sink.
pub const MAX_LOG_DEPTH: usize = 8;

/// Longest string delivered to a log sink, in bytes.
pub const MAX_LOG_STRING: usize = 16 * 1024;

/// Longest error message surfaced to the host, in bytes.
pub const MAX_ERROR_MESSAGE: usize = 2048;

static STACK_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*at\s+.*$").unwrap());

static MODULE_LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:file|ext|deployment|node):/{0,3}[^\s'`)\]]+").unwrap()
});

// absolute paths of two or more segments; the leading boundary keeps URL paths intact
static UNIX_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(^|[\s'"`(=,\[])(/[\w.\-@+~]+){2,}"#).unwrap());

static WINDOWS_PATH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Z]:\\[\w.\\\-]+").unwrap());

/// Strips stack frames, module locations and host file paths from an error
/// message, and caps its length.
pub fn sanitize_error_message(message: &str) -> String {
    let mut msg = STACK_FRAME_RE.replace_all(message, "").into_owned();
    msg = MODULE_LOCATION_RE.replace_all(&msg, "[module]").into_owned();
    msg = WINDOWS_PATH_RE.replace_all(&msg, "[path]").into_owned();
    msg = UNIX_PATH_RE.replace_all(&msg, "${1}[path]").into_owned();

    let lines: Vec<&str> = msg.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()).collect();
    let joined = lines.join("\n");
    truncate(joined, MAX_ERROR_MESSAGE)
}

/// Clamps a log value to [`MAX_LOG_DEPTH`] and [`MAX_LOG_STRING`].
pub fn clamp_log_value(value: Value) -> Value {
    clamp_recursive(value, 0)
}

fn clamp_recursive(value: Value, depth: usize) -> Value {
    match value {
        Value::Object(_) if depth >= MAX_LOG_DEPTH => Value::String("[Object]".into()),
        Value::Array(_) if depth >= MAX_LOG_DEPTH => Value::String("[Array]".into()),
        Value::Object(map) => {
            let mut clamped = Map::new();
            for (key, val) in map {
                clamped.insert(key, clamp_recursive(val, depth + 1));
            }
            Value::Object(clamped)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(|v| clamp_recursive(v, depth + 1)).collect()),
        Value::String(s) => Value::String(truncate(s, MAX_LOG_STRING)),
        other => other,
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s.push_str("...");
    s
}
