//! Structured condition evaluator.
//!
//! Conditions are pure predicates over a JSON scope. Operands that are
//! strings starting with `$` are path lookups (`"$user.age"`); a leading
//! `$$` escapes a literal dollar sign. Every other operand is a literal.
//!
//! Evaluation borrows the scope immutably and has no side effects.

use crate::error::ConditionError;
use crate::expression::{Expression, compare, loose_eq};
use copper_relay_core::path::lookup;
use globset::Glob;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::borrow::Cow;
use std::cmp::Ordering;

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Substring, array element or object key.
    Contains,
    StartsWith,
    EndsWith,
    /// `left` is contained in `right`.
    In,
}

/// Logical combinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogicalOperator {
    /// All sub-conditions hold (vacuously true).
    And,
    /// At least one sub-condition holds.
    Or,
    /// Negates exactly one sub-condition.
    Not,
}

/// Presence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExistenceOperator {
    /// Resolves to a non-null value.
    Exists,
    NotExists,
    /// Missing, null, `""`, `[]` or `{}`.
    Empty,
    NotEmpty,
}

/// String pattern matchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatternOperator {
    Regex,
    Glob,
}

/// A boolean predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Compares two operands.
    Comparison {
        operator: ComparisonOperator,
        left: JsonValue,
        right: JsonValue,
    },
    /// Combines sub-conditions.
    Logical {
        operator: LogicalOperator,
        conditions: Vec<Condition>,
    },
    /// Checks whether an operand is present.
    Existence {
        operator: ExistenceOperator,
        operand: JsonValue,
    },
    /// Matches a string operand against a pattern.
    Pattern {
        operator: PatternOperator,
        value: JsonValue,
        pattern: String,
    },
    /// A restricted expression, see [`crate::expression`].
    Custom { expression: String },
}

impl Condition {
    /// Shorthand for a comparison.
    #[must_use]
    pub fn compare(
        left: impl Into<JsonValue>,
        operator: ComparisonOperator,
        right: impl Into<JsonValue>,
    ) -> Self {
        Self::Comparison {
            operator,
            left: left.into(),
            right: right.into(),
        }
    }

    /// Shorthand for a custom expression.
    #[must_use]
    pub fn expression(expression: impl Into<String>) -> Self {
        Self::Custom {
            expression: expression.into(),
        }
    }

    /// Evaluates the condition against `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern or expression is malformed, or a `not`
    /// does not wrap exactly one condition.
    pub fn evaluate(&self, scope: &JsonValue) -> Result<bool, ConditionError> {
        match self {
            Self::Comparison {
                operator,
                left,
                right,
            } => {
                let left = resolve(left, scope).unwrap_or(Cow::Owned(JsonValue::Null));
                let right = resolve(right, scope).unwrap_or(Cow::Owned(JsonValue::Null));
                Ok(compare_operands(*operator, &left, &right))
            }
            Self::Logical {
                operator,
                conditions,
            } => match operator {
                LogicalOperator::And => {
                    for condition in conditions {
                        if !condition.evaluate(scope)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                LogicalOperator::Or => {
                    for condition in conditions {
                        if condition.evaluate(scope)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                LogicalOperator::Not => match conditions.as_slice() {
                    [only] => Ok(!only.evaluate(scope)?),
                    other => Err(ConditionError::InvalidArity {
                        expected: 1,
                        found: other.len(),
                    }),
                },
            },
            Self::Existence { operator, operand } => {
                let value = resolve(operand, scope);
                let present = value.as_deref().is_some_and(|v| !v.is_null());
                let empty = value.as_deref().is_none_or(is_empty);
                Ok(match operator {
                    ExistenceOperator::Exists => present,
                    ExistenceOperator::NotExists => !present,
                    ExistenceOperator::Empty => empty,
                    ExistenceOperator::NotEmpty => !empty,
                })
            }
            Self::Pattern {
                operator,
                value,
                pattern,
            } => {
                let value = resolve(value, scope);
                let Some(JsonValue::String(text)) = value.as_deref() else {
                    // Still surface a malformed pattern even when there is
                    // nothing to match.
                    compile_pattern(*operator, pattern)?;
                    return Ok(false);
                };
                Ok(compile_pattern(*operator, pattern)?.is_match(text))
            }
            Self::Custom { expression } => Ok(Expression::parse(expression)?.evaluate_bool(scope)),
        }
    }

    /// Checks everything that can be checked without a scope.
    ///
    /// # Errors
    ///
    /// Returns the first malformed pattern, expression or `not` found.
    pub fn validate(&self) -> Result<(), ConditionError> {
        match self {
            Self::Comparison { .. } | Self::Existence { .. } => Ok(()),
            Self::Logical {
                operator,
                conditions,
            } => {
                if *operator == LogicalOperator::Not && conditions.len() != 1 {
                    return Err(ConditionError::InvalidArity {
                        expected: 1,
                        found: conditions.len(),
                    });
                }
                conditions.iter().try_for_each(Condition::validate)
            }
            Self::Pattern {
                operator, pattern, ..
            } => compile_pattern(*operator, pattern).map(|_| ()),
            Self::Custom { expression } => Expression::parse(expression)
                .map(|_| ())
                .map_err(ConditionError::from),
        }
    }
}

/// Resolves an operand: `$path` looks up `path`, `$$text` is the literal
/// `$text`, anything else is itself.
fn resolve<'a>(operand: &'a JsonValue, scope: &'a JsonValue) -> Option<Cow<'a, JsonValue>> {
    match operand {
        JsonValue::String(s) if s.starts_with("$$") => {
            Some(Cow::Owned(JsonValue::String(s[1..].to_string())))
        }
        JsonValue::String(s) if s.starts_with('$') => lookup(scope, &s[1..]).map(Cow::Borrowed),
        literal => Some(Cow::Borrowed(literal)),
    }
}

fn compare_operands(operator: ComparisonOperator, left: &JsonValue, right: &JsonValue) -> bool {
    let (left, right) = match operator {
        ComparisonOperator::Eq
        | ComparisonOperator::Neq
        | ComparisonOperator::Gt
        | ComparisonOperator::Gte
        | ComparisonOperator::Lt
        | ComparisonOperator::Lte => (coerce_numeric(left, right), coerce_numeric(right, left)),
        _ => (Cow::Borrowed(left), Cow::Borrowed(right)),
    };
    let (left, right) = (left.as_ref(), right.as_ref());
    match operator {
        ComparisonOperator::Eq => loose_eq(left, right),
        ComparisonOperator::Neq => !loose_eq(left, right),
        ComparisonOperator::Gt => compare(left, right) == Some(Ordering::Greater),
        ComparisonOperator::Gte => matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ComparisonOperator::Lt => compare(left, right) == Some(Ordering::Less),
        ComparisonOperator::Lte => {
            matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal))
        }
        ComparisonOperator::Contains => contains(left, right),
        ComparisonOperator::In => contains(right, left),
        ComparisonOperator::StartsWith => match (left, right) {
            (JsonValue::String(l), JsonValue::String(r)) => l.starts_with(r.as_str()),
            _ => false,
        },
        ComparisonOperator::EndsWith => match (left, right) {
            (JsonValue::String(l), JsonValue::String(r)) => l.ends_with(r.as_str()),
            _ => false,
        },
    }
}

/// Treats a numeric string as a number when the other side is numeric, so
/// `"42" gt 7` compares numerically.
fn coerce_numeric<'a>(value: &'a JsonValue, other: &JsonValue) -> Cow<'a, JsonValue> {
    if other.is_number()
        && let JsonValue::String(s) = value
        && let Ok(number) = s.trim().parse::<f64>()
        && let Some(number) = serde_json::Number::from_f64(number)
    {
        return Cow::Owned(JsonValue::Number(number));
    }
    Cow::Borrowed(value)
}

fn contains(haystack: &JsonValue, needle: &JsonValue) -> bool {
    match haystack {
        JsonValue::String(s) => match needle {
            JsonValue::String(n) => s.contains(n.as_str()),
            JsonValue::Number(n) => s.contains(&n.to_string()),
            _ => false,
        },
        JsonValue::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        JsonValue::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Bool(_) | JsonValue::Number(_) => false,
    }
}

enum Matcher {
    Regex(Regex),
    Glob(globset::GlobMatcher),
}

impl Matcher {
    fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(text),
            Self::Glob(glob) => glob.is_match(text),
        }
    }
}

fn compile_pattern(operator: PatternOperator, pattern: &str) -> Result<Matcher, ConditionError> {
    let invalid = |reason: String| ConditionError::InvalidPattern {
        pattern: pattern.to_string(),
        reason,
    };
    match operator {
        PatternOperator::Regex => Regex::new(pattern)
            .map(Matcher::Regex)
            .map_err(|e| invalid(e.to_string())),
        PatternOperator::Glob => Glob::new(pattern)
            .map(|glob| Matcher::Glob(glob.compile_matcher()))
            .map_err(|e| invalid(e.to_string())),
    }
}
