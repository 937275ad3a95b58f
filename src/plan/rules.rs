//! Row-count validation rules.
//!
//! The plan compiler emits `validate` and `if` nodes carrying these rules
//! to encode invariants like "exactly one row must come back". Failures
//! surface as user-facing validation errors with stable codes and the
//! context metadata the plan declared (model and relation names).

use serde::Deserialize;

use crate::value::Value;

/// A declarative invariant over an evaluated value.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DataRule {
    /// The value must contain exactly `count` rows.
    RowCountEq {
        /// Expected row count.
        count: i64,
    },
    /// The value must not contain exactly `count` rows.
    RowCountNeq {
        /// Forbidden row count.
        count: i64,
    },
    /// The value must be an affected-rows result equal to `count`.
    AffectedRowCountEq {
        /// Expected affected-row count.
        count: i64,
    },
    /// Always fails; marks a branch the compiler proved unreachable
    /// unless an upstream assumption was violated.
    Never,
}

impl DataRule {
    /// Stable code reported when this rule fails.
    pub fn code(&self) -> &'static str {
        match self {
            DataRule::RowCountEq { .. } => "IncorrectRowCount",
            DataRule::RowCountNeq { .. } => "ProhibitedRowCount",
            DataRule::AffectedRowCountEq { .. } => "IncorrectAffectedRows",
            DataRule::Never => "ViolatedPrecondition",
        }
    }

    /// Human-readable description of the failed expectation.
    pub fn describe_failure(&self, value: &Value) -> String {
        match self {
            DataRule::RowCountEq { count } => {
                format!("expected exactly {count} rows, got {}", row_count(value))
            }
            DataRule::RowCountNeq { count } => {
                format!("row count must not equal {count}")
            }
            DataRule::AffectedRowCountEq { count } => format!(
                "expected {count} affected rows, got {}",
                affected_row_count(value)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| value.type_name().to_owned())
            ),
            DataRule::Never => "reached a branch the plan declared unreachable".to_owned(),
        }
    }

    /// Whether `value` satisfies this rule.
    pub fn is_satisfied(&self, value: &Value) -> bool {
        match self {
            DataRule::RowCountEq { count } => row_count(value) == *count,
            DataRule::RowCountNeq { count } => row_count(value) != *count,
            DataRule::AffectedRowCountEq { count } => {
                affected_row_count(value) == Some(*count)
            }
            DataRule::Never => false,
        }
    }
}

/// Number of rows a value represents: list length, 0 for null, 1 for any
/// other single value.
fn row_count(value: &Value) -> i64 {
    match value {
        Value::Null => 0,
        Value::List(items) => items.len() as i64,
        _ => 1,
    }
}

/// Extracts an affected-row count from either a bare integer or the
/// `{count}` record produced by the data mapper.
fn affected_row_count(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Object(record) => match record.get("count") {
            Some(Value::Int(n)) => Some(*n),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_counts_cover_null_scalar_and_list() {
        let rule = DataRule::RowCountEq { count: 1 };
        assert!(!rule.is_satisfied(&Value::Null));
        assert!(rule.is_satisfied(&Value::Int(42)));
        assert!(rule.is_satisfied(&Value::List(vec![Value::Null])));
        assert!(!rule.is_satisfied(&Value::List(vec![])));
    }

    #[test]
    fn affected_rows_accepts_bare_and_wrapped_counts() {
        let rule = DataRule::AffectedRowCountEq { count: 3 };
        assert!(rule.is_satisfied(&Value::Int(3)));
        let wrapped = Value::Object(
            [("count".to_owned(), Value::Int(3))].into_iter().collect(),
        );
        assert!(rule.is_satisfied(&wrapped));
        assert!(!rule.is_satisfied(&Value::Text("3".into())));
    }

    #[test]
    fn never_always_fails() {
        assert!(!DataRule::Never.is_satisfied(&Value::Null));
    }
}
