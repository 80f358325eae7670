//! Payload sanitizer for user-supplied job metadata.
//!
//! Arbitrary nested input degrades to a bounded, persistable structure; the
//! sanitizer never rejects a request. Sanitizing already-sanitized data is a
//! no-op.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Ceiling applied to every string value.
pub const MAX_STRING_LEN: usize = 500;
/// Ceiling applied to every array.
pub const MAX_ARRAY_LEN: usize = 20;
/// Ceiling applied to every key after rewriting.
pub const MAX_KEY_LEN: usize = 60;
/// Hard cap on nesting; deeper objects and arrays are dropped.
pub const MAX_DEPTH: usize = 4;

fn spacing_run() -> &'static Regex {
    static SPACING_RUN: OnceLock<Regex> = OnceLock::new();
    SPACING_RUN.get_or_init(|| Regex::new(r"[ \t]+").expect("valid spacing regex"))
}

/// Reduces arbitrary JSON to a bounded map safe for persistence.
///
/// Non-object input yields an empty map. Values of unsupported types are
/// dropped rather than reported.
pub fn sanitize_payload(value: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    if let Value::Object(entries) = value {
        for (raw_key, raw_value) in entries {
            let key = match sanitize_key(raw_key) {
                Some(key) => key,
                None => continue,
            };
            if let Some(clean) = sanitize_value(raw_value, 1) {
                out.insert(key, clean);
            }
        }
    }
    out
}

fn sanitize_value(value: &Value, depth: usize) -> Option<Value> {
    match value {
        Value::String(raw) => Some(Value::String(sanitize_string(raw))),
        Value::Number(number) => Some(Value::Number(number.clone())),
        Value::Bool(flag) => Some(Value::Bool(*flag)),
        Value::Array(items) => {
            if depth >= MAX_DEPTH {
                return None;
            }
            let clean = items
                .iter()
                .filter_map(|item| sanitize_value(item, depth + 1))
                .take(MAX_ARRAY_LEN)
                .collect::<Vec<_>>();
            Some(Value::Array(clean))
        }
        Value::Object(entries) => {
            if depth >= MAX_DEPTH {
                return None;
            }
            let mut clean = Map::new();
            for (raw_key, raw_value) in entries {
                let key = match sanitize_key(raw_key) {
                    Some(key) => key,
                    None => continue,
                };
                if let Some(value) = sanitize_value(raw_value, depth + 1) {
                    clean.insert(key, value);
                }
            }
            Some(Value::Object(clean))
        }
        Value::Null => None,
    }
}

/// Strips control characters, collapses runs of spacing while keeping line
/// breaks, trims, and truncates to [`MAX_STRING_LEN`].
pub fn sanitize_string(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let stripped = normalized
        .chars()
        .filter(|ch| *ch == '\n' || *ch == '\t' || !ch.is_control())
        .collect::<String>();
    let collapsed = spacing_run().replace_all(&stripped, " ");
    let trimmed = collapsed.trim();
    truncate_chars(trimmed, MAX_STRING_LEN)
}

/// Rewrites a key to the safe charset (letters, digits, `.`, `-`, `_`),
/// capped at [`MAX_KEY_LEN`]. Keys that sanitize to empty are dropped.
pub fn sanitize_key(raw: &str) -> Option<String> {
    let clean = raw
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
        .take(MAX_KEY_LEN)
        .collect::<String>();
    if clean.is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn truncate_chars(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}
