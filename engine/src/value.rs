//! Value-level helpers shared by the mapper, preparer and indexes.
//!
//! Both stores hand us loosely-typed JSON; these functions centralize the
//! coercion rules so every component applies the same ones.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Blank per the sync rules: null, empty/whitespace string, empty array or
/// empty object. Absent keys never reach this check.
#[must_use]
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false
    }
}

/// Parse a value as a finite number. String inputs are trimmed first;
/// non-finite results and unparseable strings yield `None`.
#[must_use]
pub fn parse_finite(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None
    };
    n.is_finite().then_some(n)
}

/// Parse a timestamp from the formats both stores emit: RFC 3339, the
/// Postgres `YYYY-MM-DD HH:MM:SS[.frac]` form (assumed UTC) and bare dates.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Reformat a parseable timestamp as a date-only `YYYY-MM-DD` string.
/// Unparseable inputs return `None` and are left untouched by callers.
#[must_use]
pub fn format_date_only(value: &Value) -> Option<String> {
    parse_timestamp(value).map(|dt| dt.format("%Y-%m-%d").to_string())
}

/// Extract a linked record id from the shapes the sheet side produces:
/// a plain id string, a `{ "id": … }` object, or a list of either (first
/// element wins).
#[must_use]
pub fn linked_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let id = normalize_record_id(s);
            (!id.is_empty()).then_some(id)
        }
        Value::Object(o) => linked_id(o.get("id")?),
        Value::Array(a) => linked_id(a.first()?),
        _ => None
    }
}

/// Extract every linked record id from a sheet multi-link value.
#[must_use]
pub fn linked_ids(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(linked_id).collect(),
        other => linked_id(other).into_iter().collect()
    }
}

#[must_use]
pub fn normalize_record_id(id: &str) -> String {
    id.trim().to_string()
}

/// Recursively merge `overlay` into `base`. Object values merge key-wise;
/// everything else is replaced. Used to combine the field-map file with
/// inline overrides.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone()
    }
}

/// Normalized comparison form: trimmed strings compare as their trimmed
/// text, arrays compare order-insensitively, objects compare key-sorted.
/// Two values with equal forms are considered unchanged by the preparer.
#[must_use]
pub fn comparison_key(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => format!("s:{}", s.trim()),
        Value::Array(items) => {
            let mut keys: Vec<String> = items.iter().map(comparison_key).collect();
            keys.sort();
            format!("a:[{}]", keys.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, comparison_key(v))).collect();
            let body: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            format!("o:{{{}}}", body.join(","))
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) => format!("n:{f}"),
            None => format!("n:{n}")
        },
        Value::Bool(b) => format!("b:{b}")
    }
}

/// Trimmed string view of a value, for secondary-key matching.
#[must_use]
pub fn as_trimmed_str(value: &Value) -> Option<String> {
    let s = value.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}
