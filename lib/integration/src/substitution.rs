//! `${path}` placeholder substitution.
//!
//! Placeholders are resolved against a JSON scope with
//! [`copper_relay_core::path::lookup`]. Substitution walks strings, arrays
//! and objects recursively; object keys are left alone.
//!
//! A string consisting of exactly one placeholder is replaced by the
//! resolved value itself, so `"${order.total}"` can become the number `42`.
//! Placeholders embedded in longer text are interpolated as text. A
//! placeholder whose path does not resolve is kept verbatim.

use copper_relay_core::path::{lookup, to_text};
use regex::{Captures, Regex};
use serde_json::Value as JsonValue;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([^}\s]+)\s*\}").expect("placeholder pattern compiles")
});

/// Returns a copy of `value` with every resolvable placeholder substituted.
#[must_use]
pub fn substitute(value: &JsonValue, scope: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(text) => substitute_str(text, scope),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|item| substitute(item, scope)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), substitute(item, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(text: &str, scope: &JsonValue) -> JsonValue {
    let Some(first) = PLACEHOLDER.captures(text) else {
        return JsonValue::String(text.to_string());
    };
    if first.get(0).is_some_and(|m| m.range() == (0..text.len())) {
        return match lookup(scope, &first[1]) {
            Some(resolved) => resolved.clone(),
            None => JsonValue::String(text.to_string()),
        };
    }

    let replaced = PLACEHOLDER.replace_all(text, |captures: &Captures<'_>| {
        match lookup(scope, &captures[1]) {
            Some(resolved) => to_text(resolved),
            None => captures[0].to_string(),
        }
    });
    JsonValue::String(replaced.into_owned())
}
