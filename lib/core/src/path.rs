//! Dotted path lookup into JSON values.
//!
//! Paths look like `user.profile.name` or `items.0.price`. A segment that
//! parses as an unsigned integer indexes into arrays; every other segment is
//! an object key. Lookups never allocate and never fail loudly: a path that
//! walks off the value yields `None`.

use serde_json::Value as JsonValue;

/// Resolves `path` against `root`.
///
/// The empty path resolves to `root` itself.
#[must_use]
pub fn lookup<'a>(root: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }

    path.split('.').try_fold(root, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index)),
        _ => None,
    })
}

/// Renders a JSON value the way it should appear when interpolated into text.
///
/// Strings are emitted without quotes; everything else uses its JSON form.
#[must_use]
pub fn to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}
