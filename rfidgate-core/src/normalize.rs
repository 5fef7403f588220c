//! Input normalization
//!
//! Edge agents send loosely typed JSON: numbers as strings, EPCs with
//! separators, antenna ids out of range. Everything entering the pipeline goes
//! through these helpers first so that downstream code can rely on canonical
//! values.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const MAX_EPC_LEN: usize = 128;
pub const MAX_ANTENNA_ID: i64 = 31;
pub const MAX_COUNT: i64 = 1_000_000;
pub const MAX_EVENT_ID_LEN: usize = 80;
pub const MAX_DEVICE_LEN: usize = 64;
pub const MAX_WEIGHT: f64 = 1_000_000.0;
pub const MAX_RAW_KEY_LEN: usize = 120;
pub const MAX_CLAIM_KEY_LEN: usize = 180;
pub const MAX_ERROR_LEN: usize = 500;
pub const MAX_NOTE_LEN: usize = 500;

static AGENT_ID_INVALID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9._-]+").expect("Invalid agent id regex"));
static DASH_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").expect("Invalid dash regex"));

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Trim and truncate; `None` when nothing is left.
pub fn clean_text(raw: &str, max: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(truncate_chars(trimmed, max))
    }
}

// ============================================================================
// LENIENT JSON ACCESS
// ============================================================================

/// String form of a scalar JSON value.
pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Integer form of a JSON value. Floats truncate toward zero and numeric
/// strings are parsed.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok()
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

// ============================================================================
// TAG READS
// ============================================================================

/// Uppercase hex with every non-hex character removed, capped at 128 chars.
pub fn normalize_epc(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .take(MAX_EPC_LEN)
        .collect()
}

/// Trimmed note capped at 500 chars; `None` for a blank note.
pub fn normalize_note(raw: &str) -> Option<String> {
    clean_text(raw, MAX_NOTE_LEN)
}

/// EPC prefix for generated tags: hex only, even length, at most 20 chars.
pub fn normalize_epc_prefix(raw: &str) -> String {
    let mut prefix: String = normalize_epc(raw).chars().take(20).collect();
    if prefix.len() % 2 == 1 {
        prefix.pop();
    }
    prefix
}

/// Antenna ids outside 0..=31 collapse to 0 ("unknown").
pub fn normalize_antenna(raw: Option<&Value>) -> u8 {
    raw.and_then(value_as_i64)
        .map(antenna_from_i64)
        .unwrap_or(0)
}

pub fn antenna_from_i64(v: i64) -> u8 {
    if (0..=MAX_ANTENNA_ID).contains(&v) {
        v as u8
    } else {
        0
    }
}

/// Read counts are clamped to 1..=1_000_000; missing or invalid means 1.
pub fn normalize_count(raw: Option<&Value>) -> i64 {
    raw.and_then(value_as_i64)
        .map(|v| v.clamp(1, MAX_COUNT))
        .unwrap_or(1)
}

// ============================================================================
// IDENTIFIERS
// ============================================================================

pub fn normalize_event_id(raw: &str) -> Option<String> {
    clean_text(raw, MAX_EVENT_ID_LEN)
}

pub fn normalize_device_id(raw: &str) -> Option<String> {
    clean_text(raw, MAX_DEVICE_LEN)
}

pub fn normalize_batch_id(raw: &str) -> Option<String> {
    clean_text(raw, MAX_DEVICE_LEN)
}

/// Non-negative integer seq, anything else is treated as absent.
pub fn normalize_seq(raw: Option<&Value>) -> Option<i64> {
    raw.and_then(value_as_i64).filter(|v| *v >= 0)
}

/// Lowercase, `[a-z0-9._-]` only, single dashes, no leading or trailing
/// dash, at most 64 chars.
pub fn sanitize_agent_id(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    if lowered.is_empty() {
        return String::new();
    }
    let replaced = AGENT_ID_INVALID.replace_all(&lowered, "-");
    let collapsed = DASH_RUNS.replace_all(&replaced, "-");
    truncate_chars(collapsed.trim_matches('-'), MAX_DEVICE_LEN)
        .trim_end_matches('-')
        .to_string()
}

/// Key used for antenna rule lookup. Empty means the `"any"` tier.
pub fn normalize_device_key(raw: &str) -> String {
    let s = raw.trim().to_lowercase();
    if s.is_empty() {
        "any".to_string()
    } else {
        truncate_chars(&s, MAX_DEVICE_LEN)
    }
}

// ============================================================================
// SCALE READINGS
// ============================================================================

/// Weight within ±1_000_000, otherwise absent.
pub fn normalize_weight(raw: Option<&Value>) -> Option<f64> {
    raw.and_then(value_as_f64)
        .filter(|v| (-MAX_WEIGHT..=MAX_WEIGHT).contains(v))
}

pub fn normalize_unit(raw: &str) -> String {
    let s = raw.trim().to_lowercase();
    match s.as_str() {
        "" => "kg".to_string(),
        "kg" | "kgs" | "kilogram" | "kilograms" => "kg".to_string(),
        "g" | "gram" | "grams" => "g".to_string(),
        "lb" | "lbs" | "pound" | "pounds" => "lb".to_string(),
        "oz" | "ounce" | "ounces" => "oz".to_string(),
        other => truncate_chars(other, 8),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => parse_bool(s),
        _ => None,
    }
}

// ============================================================================
// IDEMPOTENCY KEYS
// ============================================================================

/// `"{kind}:{key}"` with the raw key capped at 120 chars and the whole key at
/// 180. `None` when the raw key is blank.
pub fn claim_key(kind: &str, raw_key: &str) -> Option<String> {
    let key = clean_text(raw_key, MAX_RAW_KEY_LEN)?;
    let kind = kind.trim();
    let kind = if kind.is_empty() { "unknown" } else { kind };
    Some(truncate_chars(&format!("{}:{}", kind, key), MAX_CLAIM_KEY_LEN))
}

// ============================================================================
// TESTS
// ============================================================================
