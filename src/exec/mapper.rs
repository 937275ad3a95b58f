//! Data mapping: reshaping raw driver rows into typed results.
//!
//! Drivers hand back loosely typed values (SQLite has no boolean, MySQL
//! serializes joined relations as JSON text, and so on). The mapper walks
//! the declared [`ResultShape`] alongside the raw value and coerces each
//! column to its logical type, failing loudly on anything that does not
//! conform.

use std::collections::BTreeMap;

use crate::error::{MapperError, Result};
use crate::plan::{Arity, EnumTable, FieldType, ResultShape, ScalarKind};
use crate::value::Value;

/// Largest integer a double-precision float represents exactly. Int
/// columns beyond it must be declared BigInt to avoid silent precision
/// loss on the JSON boundary.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Reshapes `value` according to the declared result shape.
pub(crate) fn map_result(value: Value, shape: &ResultShape, enums: &EnumTable) -> Result<Value> {
    match shape {
        ResultShape::AffectedRows => match value {
            Value::Int(count) => Ok(Value::Object(BTreeMap::from([(
                "count".to_owned(),
                Value::Int(count),
            )]))),
            other => Err(MapperError::UnexpectedShape {
                expected: "an affected-rows count",
                got: other.type_name(),
            }
            .into()),
        },
        ResultShape::Object {
            serialized_name,
            skip_nulls,
            fields,
        } => map_object(value, serialized_name.as_deref(), *skip_nulls, fields, enums),
        ResultShape::Field {
            db_name,
            field_type,
        } => match value {
            Value::Object(mut record) => {
                let raw = record
                    .remove(db_name)
                    .ok_or_else(|| MapperError::MissingField {
                        field: db_name.clone(),
                    })?;
                map_field(raw, db_name, field_type, enums)
            }
            other => Err(MapperError::UnexpectedShape {
                expected: "a record",
                got: other.type_name(),
            }
            .into()),
        },
    }
}

fn map_object(
    value: Value,
    serialized_name: Option<&str>,
    skip_nulls: bool,
    fields: &BTreeMap<String, ResultShape>,
    enums: &EnumTable,
) -> Result<Value> {
    // A serialized name redirects mapping to a nested column, typically a
    // relation the database aggregated into a JSON document.
    let value = match serialized_name {
        Some(name) => match value {
            Value::Object(mut record) => {
                record.remove(name).ok_or_else(|| MapperError::MissingField {
                    field: name.to_owned(),
                })?
            }
            other => {
                return Err(MapperError::UnexpectedShape {
                    expected: "a record",
                    got: other.type_name(),
                }
                .into())
            }
        },
        None => value,
    };
    let value = decode_json_source(value)?;

    match value {
        Value::Null => Ok(Value::Null),
        Value::List(items) => {
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                if skip_nulls && matches!(item, Value::Null) {
                    continue;
                }
                mapped.push(map_object(item, None, skip_nulls, fields, enums)?);
            }
            Ok(Value::List(mapped))
        }
        Value::Object(record) => {
            let source = Value::Object(record);
            let mut mapped = BTreeMap::new();
            for (name, field_shape) in fields {
                mapped.insert(name.clone(), map_result(source.clone(), field_shape, enums)?);
            }
            Ok(Value::Object(mapped))
        }
        other => Err(MapperError::UnexpectedShape {
            expected: "a record or list of records",
            got: other.type_name(),
        }
        .into()),
    }
}

/// Relations serialized by the database arrive as JSON text; decode them
/// before structural dispatch.
fn decode_json_source(value: Value) -> Result<Value> {
    match value {
        Value::Text(text) => {
            let raw: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                MapperError::InvalidJson {
                    cause: e.to_string(),
                }
            })?;
            Value::from_json(raw)
                .map_err(|e| MapperError::InvalidJson {
                    cause: e.to_string(),
                }
                .into())
        }
        other => Ok(other),
    }
}

fn map_field(
    raw: Value,
    column: &str,
    field_type: &FieldType,
    enums: &EnumTable,
) -> Result<Value> {
    match field_type.arity {
        Arity::Scalar => coerce_scalar(raw, column, &field_type.kind, enums),
        Arity::List => match raw {
            // Unselected list columns come back null; the client contract
            // is an empty list.
            Value::Null => Ok(Value::List(Vec::new())),
            Value::List(items) => items
                .into_iter()
                .map(|item| coerce_scalar(item, column, &field_type.kind, enums))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            other => Err(type_mismatch(column, "a list", &other)),
        },
    }
}

fn type_mismatch(column: &str, expected: &'static str, raw: &Value) -> crate::error::EngineError {
    MapperError::TypeMismatch {
        column: column.to_owned(),
        expected,
        got: raw.type_name(),
        value: raw.to_string(),
    }
    .into()
}

fn coerce_scalar(
    raw: Value,
    column: &str,
    kind: &ScalarKind,
    enums: &EnumTable,
) -> Result<Value> {
    if matches!(raw, Value::Null) && !matches!(kind, ScalarKind::Unsupported) {
        return Ok(Value::Null);
    }
    let expected = kind.expected_name();
    match kind {
        ScalarKind::Any => Ok(raw),
        ScalarKind::String => match raw {
            Value::Text(s) => Ok(Value::Text(s)),
            other => Err(type_mismatch(column, expected, &other)),
        },
        ScalarKind::Int => coerce_int(raw, column, expected),
        ScalarKind::BigInt => match raw {
            Value::Int(i) | Value::BigInt(i) => Ok(Value::BigInt(i)),
            Value::Float(f) if f.fract() == 0.0 => Ok(Value::BigInt(f as i64)),
            Value::Text(s) => match s.parse::<i64>() {
                Ok(i) => Ok(Value::BigInt(i)),
                Err(_) => Err(type_mismatch(column, expected, &Value::Text(s))),
            },
            other => Err(type_mismatch(column, expected, &other)),
        },
        ScalarKind::Float => match raw {
            Value::Float(f) => Ok(Value::Float(f)),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::Text(s) => match s.parse::<f64>() {
                Ok(f) => Ok(Value::Float(f)),
                Err(_) => Err(type_mismatch(column, expected, &Value::Text(s))),
            },
            other => Err(type_mismatch(column, expected, &other)),
        },
        ScalarKind::Boolean => coerce_boolean(raw, column, expected),
        ScalarKind::Decimal => match raw {
            Value::Decimal(s) => Ok(Value::Decimal(s)),
            Value::Text(s) => Ok(Value::Decimal(s)),
            Value::Int(i) => Ok(Value::Decimal(i.to_string())),
            Value::Float(f) => Ok(Value::Decimal(f.to_string())),
            other => Err(type_mismatch(column, expected, &other)),
        },
        ScalarKind::DateTime | ScalarKind::Date => match raw {
            Value::DateTime(s) | Value::Text(s) => Ok(Value::DateTime(ensure_timezone(&s))),
            other => Err(type_mismatch(column, expected, &other)),
        },
        ScalarKind::Time => match raw {
            // Bare times are anchored to the epoch date so they survive as
            // full timestamps on the JSON boundary.
            Value::Text(s) | Value::DateTime(s) => {
                let anchored = if s.contains('T') || s.contains('-') {
                    s
                } else {
                    format!("1970-01-01T{s}")
                };
                Ok(Value::DateTime(ensure_timezone(&anchored)))
            }
            other => Err(type_mismatch(column, expected, &other)),
        },
        ScalarKind::Json => match raw {
            Value::Json(s) | Value::Text(s) => Ok(Value::Json(s)),
            other => Ok(Value::Json(other.to_string())),
        },
        ScalarKind::Object => match raw {
            Value::Json(s) | Value::Text(s) => Ok(Value::Json(s)),
            other @ (Value::Object(_) | Value::List(_)) => Ok(Value::Json(other.to_string())),
            other => Err(type_mismatch(column, expected, &other)),
        },
        ScalarKind::Bytes => coerce_bytes(raw, column, expected),
        ScalarKind::Enum { name } => {
            let members = enums.get(name).ok_or_else(|| MapperError::UnknownEnum {
                name: name.clone(),
            })?;
            let raw_text = match raw {
                Value::Text(s) => s,
                other => return Err(type_mismatch(column, expected, &other)),
            };
            match members.get(&raw_text) {
                Some(mapped) => Ok(Value::Text(mapped.clone())),
                None => Err(MapperError::UnknownEnumValue {
                    name: name.clone(),
                    value: raw_text,
                }
                .into()),
            }
        }
        ScalarKind::Unsupported => Err(MapperError::UnsupportedColumn {
            column: column.to_owned(),
        }
        .into()),
    }
}

fn coerce_int(raw: Value, column: &str, expected: &'static str) -> Result<Value> {
    let check_range = |i: i64, original: &Value| {
        if i.abs() > MAX_SAFE_INTEGER {
            Err(MapperError::TypeMismatch {
                column: column.to_owned(),
                expected: "an integer within the double-precision-safe range \
                           (declare the field as BigInt to read it)",
                got: original.type_name(),
                value: original.to_string(),
            }
            .into())
        } else {
            Ok(Value::Int(i))
        }
    };
    match raw {
        Value::Int(i) => check_range(i, &Value::Int(i)),
        Value::BigInt(i) => check_range(i, &Value::BigInt(i)),
        // Drivers report integer columns as floats on some backends;
        // fractional parts are truncated, matching database semantics.
        Value::Float(f) => check_range(f.trunc() as i64, &Value::Float(f)),
        Value::Text(s) => match s.parse::<i64>() {
            Ok(i) => check_range(i, &Value::Text(s)),
            // Numeric strings with a fractional part truncate like floats.
            Err(_) => match s.parse::<f64>() {
                Ok(f) if f.is_finite() => check_range(f.trunc() as i64, &Value::Text(s)),
                _ => Err(type_mismatch(column, expected, &Value::Text(s))),
            },
        },
        other => Err(type_mismatch(column, expected, &other)),
    }
}

fn coerce_boolean(raw: Value, column: &str, expected: &'static str) -> Result<Value> {
    match raw {
        Value::Bool(b) => Ok(Value::Bool(b)),
        Value::Int(i) => match i {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            _ => Err(type_mismatch(column, expected, &Value::Int(i))),
        },
        Value::Text(s) => match s.as_str() {
            "true" | "TRUE" | "1" => Ok(Value::Bool(true)),
            "false" | "FALSE" | "0" => Ok(Value::Bool(false)),
            _ => Err(type_mismatch(column, expected, &Value::Text(s))),
        },
        // Bit columns arrive as blobs on some drivers; any nonzero byte
        // means true.
        Value::Bytes(bytes) => Ok(Value::Bool(bytes.iter().any(|b| *b != 0))),
        other => Err(type_mismatch(column, expected, &other)),
    }
}

fn coerce_bytes(raw: Value, column: &str, expected: &'static str) -> Result<Value> {
    match raw {
        Value::Bytes(bytes) => Ok(Value::Bytes(bytes)),
        // Postgres bytea text representation.
        Value::Text(s) if s.starts_with("\\x") => {
            match hex::decode(&s[2..]) {
                Ok(bytes) => Ok(Value::Bytes(bytes)),
                Err(_) => Err(type_mismatch(column, expected, &Value::Text(s))),
            }
        }
        Value::Text(s) => Ok(Value::Bytes(s.into_bytes())),
        // Some drivers hand blobs back as integer arrays.
        Value::List(items) => {
            let mut bytes = Vec::with_capacity(items.len());
            for item in &items {
                match item {
                    Value::Int(i) if (0..=255).contains(i) => bytes.push(*i as u8),
                    _ => {
                        return Err(type_mismatch(column, expected, &Value::List(items.clone())))
                    }
                }
            }
            Ok(Value::Bytes(bytes))
        }
        other => Err(type_mismatch(column, expected, &other)),
    }
}

/// Appends or normalizes a timezone designator on an ISO 8601 timestamp.
///
/// Timestamps without any designator get a `Z` suffix. Short numeric
/// offsets are widened to the `+HH:MM` form. A trailing `-DD` that is
/// actually part of the date (as in `2023-10-01`) must not be mistaken
/// for an offset, hence the digit-run check before the sign.
fn ensure_timezone(timestamp: &str) -> String {
    if timestamp.ends_with('Z') || timestamp.ends_with('z') {
        return timestamp.to_owned();
    }
    let bytes = timestamp.as_bytes();
    if let Some(sign_pos) = timestamp.rfind(['+', '-']) {
        let suffix = &timestamp[sign_pos + 1..];
        let is_offset = !suffix.is_empty()
            && suffix.len() <= 5
            && suffix.chars().all(|c| c.is_ascii_digit() || c == ':')
            && !is_date_component(bytes, sign_pos);
        if is_offset {
            return match suffix.len() {
                // +HH
                2 => format!("{timestamp}:00"),
                // +HHMM
                4 => format!(
                    "{}{}:{}",
                    &timestamp[..sign_pos + 1],
                    &suffix[..2],
                    &suffix[2..]
                ),
                // +HH:MM or +H:MM, already well formed enough
                _ => timestamp.to_owned(),
            };
        }
    }
    format!("{timestamp}Z")
}

/// A `-` at `sign_pos` belongs to the date when it is preceded by the
/// `YYYY` or `YYYY-MM` digit runs and no time component follows.
fn is_date_component(bytes: &[u8], sign_pos: usize) -> bool {
    if bytes[sign_pos] != b'-' {
        return false;
    }
    // Inside "YYYY-MM-DD..." the dashes sit at offsets 4 and 7.
    (sign_pos == 4 || sign_pos == 7) && bytes.iter().take(sign_pos).all(u8::is_ascii_digit)
        || !bytes[..sign_pos].contains(&b'T') && !bytes[..sign_pos].contains(&b' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(db_name: &str, kind: ScalarKind) -> ResultShape {
        ResultShape::Field {
            db_name: db_name.to_owned(),
            field_type: FieldType {
                kind,
                arity: Arity::Scalar,
            },
        }
    }

    fn record(pairs: &[(&str, Value)]) -> Value {
        Value::Object(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn affected_rows_wraps_into_count_record() {
        let mapped = map_result(Value::Int(3), &ResultShape::AffectedRows, &EnumTable::new())
            .unwrap();
        assert_eq!(mapped, record(&[("count", Value::Int(3))]));
    }

    #[test]
    fn object_maps_each_declared_field() {
        let shape = ResultShape::Object {
            serialized_name: None,
            skip_nulls: false,
            fields: BTreeMap::from([
                ("id".to_owned(), field("id", ScalarKind::Int)),
                ("name".to_owned(), field("name", ScalarKind::String)),
            ]),
        };
        let raw = record(&[
            ("id", Value::Text("7".into())),
            ("name", Value::Text("Alice".into())),
            ("ignored", Value::Bool(true)),
        ]);
        let mapped = map_result(raw, &shape, &EnumTable::new()).unwrap();
        assert_eq!(
            mapped,
            record(&[("id", Value::Int(7)), ("name", Value::Text("Alice".into()))])
        );
    }

    #[test]
    fn missing_declared_field_is_rejected() {
        let shape = ResultShape::Object {
            serialized_name: None,
            skip_nulls: false,
            fields: BTreeMap::from([("id".to_owned(), field("id", ScalarKind::Int))]),
        };
        let err = map_result(record(&[]), &shape, &EnumTable::new()).unwrap_err();
        assert_eq!(err.code(), "DataMappingFailed");
    }

    #[test]
    fn serialized_relation_decodes_from_json_text() {
        let shape = ResultShape::Object {
            serialized_name: Some("posts".to_owned()),
            skip_nulls: false,
            fields: BTreeMap::from([("title".to_owned(), field("title", ScalarKind::String))]),
        };
        let raw = record(&[(
            "posts",
            Value::Text(r#"[{"title": "hello"}, {"title": "world"}]"#.into()),
        )]);
        let mapped = map_result(raw, &shape, &EnumTable::new()).unwrap();
        assert_eq!(
            mapped,
            Value::List(vec![
                record(&[("title", Value::Text("hello".into()))]),
                record(&[("title", Value::Text("world".into()))]),
            ])
        );
    }

    #[test]
    fn skip_nulls_drops_null_elements() {
        let shape = ResultShape::Object {
            serialized_name: None,
            skip_nulls: true,
            fields: BTreeMap::from([("id".to_owned(), field("id", ScalarKind::Int))]),
        };
        let raw = Value::List(vec![
            Value::Null,
            record(&[("id", Value::Int(1))]),
            Value::Null,
        ]);
        let mapped = map_result(raw, &shape, &EnumTable::new()).unwrap();
        assert_eq!(mapped, Value::List(vec![record(&[("id", Value::Int(1))])]));
    }

    #[test]
    fn int_truncates_floats_and_bounds_magnitude() {
        let enums = EnumTable::new();
        let shape = field("n", ScalarKind::Int);
        let ok = map_result(record(&[("n", Value::Float(3.9))]), &shape, &enums).unwrap();
        assert_eq!(ok, Value::Int(3));

        let err =
            map_result(record(&[("n", Value::Int(1 << 54))]), &shape, &enums).unwrap_err();
        assert!(err.to_string().contains("BigInt"));
    }

    #[test]
    fn int_truncates_fractional_strings() {
        let enums = EnumTable::new();
        let shape = field("n", ScalarKind::Int);
        let ok = map_result(record(&[("n", Value::Text("3.7".into()))]), &shape, &enums)
            .unwrap();
        assert_eq!(ok, Value::Int(3));

        let err = map_result(record(&[("n", Value::Text("1e300".into()))]), &shape, &enums)
            .unwrap_err();
        assert!(err.to_string().contains("BigInt"));

        assert!(map_result(record(&[("n", Value::Text("abc".into()))]), &shape, &enums)
            .is_err());
    }

    #[test]
    fn boolean_accepts_common_driver_encodings() {
        let enums = EnumTable::new();
        let shape = field("b", ScalarKind::Boolean);
        for raw in [
            Value::Int(1),
            Value::Text("true".into()),
            Value::Text("TRUE".into()),
            Value::Bytes(vec![1]),
        ] {
            assert_eq!(
                map_result(record(&[("b", raw)]), &shape, &enums).unwrap(),
                Value::Bool(true)
            );
        }
        assert_eq!(
            map_result(record(&[("b", Value::Int(0))]), &shape, &enums).unwrap(),
            Value::Bool(false)
        );
        assert!(map_result(record(&[("b", Value::Int(2))]), &shape, &enums).is_err());
    }

    #[test]
    fn boolean_scans_multi_byte_blobs_for_nonzero() {
        let enums = EnumTable::new();
        let shape = field("b", ScalarKind::Boolean);
        assert_eq!(
            map_result(record(&[("b", Value::Bytes(vec![0, 0, 1, 0]))]), &shape, &enums)
                .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            map_result(record(&[("b", Value::Bytes(vec![0, 0, 0]))]), &shape, &enums)
                .unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn datetime_normalizes_timezone_designators() {
        assert_eq!(ensure_timezone("2023-10-01T12:00:00"), "2023-10-01T12:00:00Z");
        assert_eq!(ensure_timezone("2023-10-01T12:00:00Z"), "2023-10-01T12:00:00Z");
        assert_eq!(
            ensure_timezone("2023-10-01T12:00:00+02"),
            "2023-10-01T12:00:00+02:00"
        );
        assert_eq!(
            ensure_timezone("2023-10-01T12:00:00+0230"),
            "2023-10-01T12:00:00+02:30"
        );
        assert_eq!(
            ensure_timezone("2023-10-01T12:00:00+02:30"),
            "2023-10-01T12:00:00+02:30"
        );
        // A bare date's trailing -DD is not an offset.
        assert_eq!(ensure_timezone("2023-10-01"), "2023-10-01Z");
    }

    #[test]
    fn time_anchors_to_epoch_date() {
        let mapped = map_result(
            record(&[("t", Value::Text("12:30:00".into()))]),
            &field("t", ScalarKind::Time),
            &EnumTable::new(),
        )
        .unwrap();
        assert_eq!(mapped, Value::DateTime("1970-01-01T12:30:00Z".into()));
    }

    #[test]
    fn bytes_accepts_hex_text_and_int_arrays() {
        let enums = EnumTable::new();
        let shape = field("b", ScalarKind::Bytes);
        assert_eq!(
            map_result(record(&[("b", Value::Text("\\x0102ff".into()))]), &shape, &enums)
                .unwrap(),
            Value::Bytes(vec![1, 2, 255])
        );
        assert_eq!(
            map_result(
                record(&[("b", Value::List(vec![Value::Int(7), Value::Int(8)]))]),
                &shape,
                &enums
            )
            .unwrap(),
            Value::Bytes(vec![7, 8])
        );
    }

    #[test]
    fn enum_members_translate_and_unknowns_fail() {
        let enums: EnumTable = BTreeMap::from([(
            "Role".to_owned(),
            BTreeMap::from([("admin".to_owned(), "Admin".to_owned())]),
        )]);
        let shape = field("role", ScalarKind::Enum { name: "Role".into() });
        assert_eq!(
            map_result(record(&[("role", Value::Text("admin".into()))]), &shape, &enums)
                .unwrap(),
            Value::Text("Admin".into())
        );
        let err =
            map_result(record(&[("role", Value::Text("guest".into()))]), &shape, &enums)
                .unwrap_err();
        assert!(err.to_string().contains("guest"));
    }

    #[test]
    fn null_scalars_stay_null_and_null_lists_become_empty() {
        let enums = EnumTable::new();
        assert_eq!(
            map_result(
                record(&[("n", Value::Null)]),
                &field("n", ScalarKind::Int),
                &enums
            )
            .unwrap(),
            Value::Null
        );
        let list_shape = ResultShape::Field {
            db_name: "tags".into(),
            field_type: FieldType {
                kind: ScalarKind::String,
                arity: Arity::List,
            },
        };
        assert_eq!(
            map_result(record(&[("tags", Value::Null)]), &list_shape, &enums).unwrap(),
            Value::List(vec![])
        );
    }

    #[test]
    fn unsupported_columns_cannot_be_read() {
        let err = map_result(
            record(&[("geo", Value::Null)]),
            &field("geo", ScalarKind::Unsupported),
            &EnumTable::new(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "DataMappingFailed");
    }
}
