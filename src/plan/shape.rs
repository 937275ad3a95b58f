//! Declarative result shapes.
//!
//! A [`ResultShape`] tells the data mapper how to reshape raw rows into
//! the typed structure the client expects: which columns feed which
//! fields, how to coerce each column, and where nested relations live.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Per-enum member table: raw database value to client-facing name.
pub type EnumTable = BTreeMap<String, BTreeMap<String, String>>;

/// Target shape for data mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ResultShape {
    /// Wraps a numeric row count into `{count}`.
    AffectedRows,
    /// A record with named, typed fields.
    Object {
        /// When set, the nested data lives under this key in the source
        /// row (relations serialized as a JSON column); when `None`, the
        /// source row itself is reshaped.
        serialized_name: Option<String>,
        /// Drop null elements before mapping an array source.
        #[serde(default)]
        skip_nulls: bool,
        /// Declared output fields.
        fields: BTreeMap<String, ResultShape>,
    },
    /// A single column coerced to a logical scalar type.
    Field {
        /// Column name in the source row.
        db_name: String,
        /// Declared logical type.
        field_type: FieldType,
    },
}

/// Declared logical type of a mapped column.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldType {
    /// Scalar kind of the column (or of each element for lists).
    #[serde(flatten)]
    pub kind: ScalarKind,
    /// Whether the column holds a single value or a list.
    #[serde(default)]
    pub arity: Arity,
}

/// Scalar kinds a column can be coerced to.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ScalarKind {
    /// Pass the value through untouched.
    Any,
    /// UTF-8 string.
    String,
    /// 64-bit integer within double-precision-safe range.
    Int,
    /// 64-bit integer without the safe-range restriction.
    BigInt,
    /// Double-precision float.
    Float,
    /// Boolean, accepting common numeric/textual/binary encodings.
    Boolean,
    /// Arbitrary-precision numeric kept as text.
    Decimal,
    /// Timezone-qualified timestamp.
    DateTime,
    /// Calendar date, normalized to a timezone-qualified form.
    Date,
    /// Time of day, anchored to the Unix epoch date.
    Time,
    /// JSON document kept as text.
    Json,
    /// Structured value serialized to a JSON string.
    Object,
    /// Binary column.
    Bytes,
    /// Enum column validated against a member table.
    Enum {
        /// Name of the enum table to validate against.
        name: String,
    },
    /// A database type this engine cannot read.
    Unsupported,
}

impl ScalarKind {
    /// Name used in mapping diagnostics.
    pub fn expected_name(&self) -> &'static str {
        match self {
            ScalarKind::Any => "any value",
            ScalarKind::String => "a string",
            ScalarKind::Int => "an integer",
            ScalarKind::BigInt => "a bigint",
            ScalarKind::Float => "a float",
            ScalarKind::Boolean => "a boolean",
            ScalarKind::Decimal => "a decimal",
            ScalarKind::DateTime => "a datetime",
            ScalarKind::Date => "a date",
            ScalarKind::Time => "a time",
            ScalarKind::Json => "a json value",
            ScalarKind::Object => "an object",
            ScalarKind::Bytes => "a byte array",
            ScalarKind::Enum { .. } => "an enum value",
            ScalarKind::Unsupported => "an unsupported value",
        }
    }
}

/// Whether a field holds one value or a list of values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Arity {
    /// Single value.
    #[default]
    Scalar,
    /// List of values; null maps to an empty list.
    List,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_shape_decodes_with_flattened_kind() {
        let shape: ResultShape = serde_json::from_str(
            r#"{
                "type": "field",
                "dbName": "role",
                "fieldType": {"type": "enum", "name": "Role", "arity": "scalar"}
            }"#,
        )
        .unwrap();
        match shape {
            ResultShape::Field { db_name, field_type } => {
                assert_eq!(db_name, "role");
                assert!(matches!(field_type.kind, ScalarKind::Enum { ref name } if name == "Role"));
                assert_eq!(field_type.arity, Arity::Scalar);
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn arity_defaults_to_scalar() {
        let field_type: FieldType = serde_json::from_str(r#"{"type": "int"}"#).unwrap();
        assert_eq!(field_type.arity, Arity::Scalar);
    }
}
