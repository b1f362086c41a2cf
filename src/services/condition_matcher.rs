//! Dotted-path equality matching of listener conditions against event payloads.

use serde_json::{Map, Value};

/// Resolve `path` (`"a.b.c"`) inside `payload`, descending through objects only.
pub fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(payload, |current, segment| current.as_object()?.get(segment))
}

/// True when every condition's path resolves to a value strictly equal to
/// the expected one. Types are not coerced: `"1"` does not match `1`.
///
/// An empty condition set matches every payload.
pub fn matches_conditions(conditions: &Map<String, Value>, payload: &Value) -> bool {
    conditions
        .iter()
        .all(|(path, expected)| lookup_path(payload, path) == Some(expected))
}
