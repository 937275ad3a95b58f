//! In-memory record post-processing.
//!
//! Some query shapes cannot push distinct, cursor pagination, or ordering
//! reversal into SQL (notably when they apply per parent group of a
//! joined relation). The plan then emits a `process` node and this module
//! applies those operations to the fetched records, grouped by the
//! declared linking fields.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{EngineError, MapperError, Result};
use crate::value::Value;

/// Post-fetch operations applied by a `process` node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOperations {
    /// Keep only the first record per distinct key, in encounter order.
    #[serde(default)]
    pub distinct: Option<Vec<String>>,
    /// Cursor- and offset-based pagination.
    #[serde(default)]
    pub pagination: Option<Pagination>,
    /// Reverse the record order (undoes the inverted ORDER BY emitted for
    /// backward pagination).
    #[serde(default)]
    pub reverse: bool,
    /// When set, operations apply independently to each group of records
    /// sharing these field values.
    #[serde(default)]
    pub linking_fields: Option<Vec<String>>,
    /// Operations applied to nested relation fields of each record.
    #[serde(default)]
    pub nested: BTreeMap<String, ProcessOperations>,
}

/// Cursor/offset pagination parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// Start at the record whose fields equal these values exactly. When
    /// no record matches, the result is empty.
    #[serde(default)]
    pub cursor: Option<BTreeMap<String, Value>>,
    /// Records to drop after cursor positioning.
    #[serde(default)]
    pub skip: Option<usize>,
    /// Maximum records to keep after skipping.
    #[serde(default)]
    pub take: Option<usize>,
}

impl ProcessOperations {
    fn is_identity(&self) -> bool {
        self.distinct.is_none()
            && self.pagination.is_none()
            && !self.reverse
            && self.nested.is_empty()
    }
}

/// Applies post-fetch operations to a record list.
pub(crate) fn process_records(value: Value, operations: &ProcessOperations) -> Result<Value> {
    let value = decode_json_records(value)?;
    let records = match value {
        Value::Null => return Ok(Value::Null),
        Value::List(records) => records,
        single => {
            // A unique-parent result processes as a one-element group.
            let processed = process_records(Value::List(vec![single]), operations)?;
            return match processed {
                Value::List(mut items) if items.len() == 1 => Ok(items.remove(0)),
                Value::List(_) => Ok(Value::Null),
                other => Ok(other),
            };
        }
    };

    let processed = match &operations.linking_fields {
        None => apply_operations(records, operations)?,
        Some(fields) => {
            // BTreeMap keeps groups in ascending key order, making the
            // regrouped output deterministic.
            let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            for record in records {
                let key = match &record {
                    Value::Object(map) => record_key_of(map, fields),
                    other => {
                        return Err(MapperError::UnexpectedShape {
                            expected: "a record",
                            got: other.type_name(),
                        }
                        .into())
                    }
                };
                groups.entry(key).or_default().push(record);
            }
            let mut out = Vec::new();
            for (_, group) in groups {
                out.extend(apply_operations(group, operations)?);
            }
            out
        }
    };

    Ok(Value::List(processed))
}

fn apply_operations(
    mut records: Vec<Value>,
    operations: &ProcessOperations,
) -> Result<Vec<Value>> {
    if let Some(fields) = &operations.distinct {
        records = distinct_records(records, fields)?;
    }
    if let Some(pagination) = &operations.pagination {
        records = paginate(records, pagination)?;
    }
    if operations.reverse {
        records.reverse();
    }
    if !operations.nested.is_empty() {
        records = records
            .into_iter()
            .map(|record| process_nested(record, &operations.nested))
            .collect::<Result<Vec<_>>>()?;
    }
    Ok(records)
}

fn process_nested(
    record: Value,
    nested: &BTreeMap<String, ProcessOperations>,
) -> Result<Value> {
    let Value::Object(mut map) = record else {
        return Err(MapperError::UnexpectedShape {
            expected: "a record",
            got: record.type_name(),
        }
        .into());
    };
    for (field, operations) in nested {
        if operations.is_identity() && operations.linking_fields.is_none() {
            continue;
        }
        let inner = map.remove(field).unwrap_or(Value::Null);
        map.insert(field.clone(), process_records(inner, operations)?);
    }
    Ok(Value::Object(map))
}

fn distinct_records(records: Vec<Value>, fields: &[String]) -> Result<Vec<Value>> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let key = match &record {
            Value::Object(map) => record_key_of(map, fields),
            other => {
                return Err(MapperError::UnexpectedShape {
                    expected: "a record",
                    got: other.type_name(),
                }
                .into())
            }
        };
        if seen.insert(key) {
            out.push(record);
        }
    }
    Ok(out)
}

fn paginate(records: Vec<Value>, pagination: &Pagination) -> Result<Vec<Value>> {
    let mut records = match &pagination.cursor {
        None => records,
        Some(cursor) => {
            // Fail closed: an unmatched cursor yields no records rather
            // than the whole set.
            let start = records.iter().position(|record| match record {
                Value::Object(map) => cursor
                    .iter()
                    .all(|(field, expected)| map.get(field) == Some(expected)),
                _ => false,
            });
            match start {
                Some(start) => records.into_iter().skip(start).collect(),
                None => Vec::new(),
            }
        }
    };
    if let Some(skip) = pagination.skip {
        records = records.into_iter().skip(skip).collect();
    }
    if let Some(take) = pagination.take {
        records.truncate(take);
    }
    Ok(records)
}

/// Relation columns aggregated into JSON text are decoded before
/// processing, same as in the data mapper.
fn decode_json_records(value: Value) -> Result<Value> {
    match value {
        Value::Text(text) => {
            let raw: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| MapperError::InvalidJson {
                    cause: e.to_string(),
                })?;
            Value::from_json(raw).map_err(|e| {
                EngineError::from(MapperError::InvalidJson {
                    cause: e.to_string(),
                })
            })
        }
        other => Ok(other),
    }
}

/// Canonical key of a record over the named fields: the JSON rendering of
/// the selected values, with missing fields reading as null. Shared by
/// grouping, distinct, and set difference so their key semantics agree.
pub(crate) fn record_key_of(record: &BTreeMap<String, Value>, fields: &[String]) -> String {
    let selected: Vec<&Value> = fields
        .iter()
        .map(|field| record.get(field).unwrap_or(&Value::Null))
        .collect();
    match serde_json::to_string(&selected) {
        Ok(key) => key,
        Err(_) => format!("{selected:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Value)]) -> Value {
        Value::Object(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        )
    }

    fn ids(value: &Value) -> Vec<i64> {
        match value {
            Value::List(items) => items
                .iter()
                .map(|item| match item {
                    Value::Object(map) => match map.get("id") {
                        Some(Value::Int(i)) => *i,
                        other => panic!("bad id: {other:?}"),
                    },
                    other => panic!("not a record: {other:?}"),
                })
                .collect(),
            other => panic!("not a list: {other:?}"),
        }
    }

    fn numbered(range: std::ops::Range<i64>) -> Value {
        Value::List(range.map(|i| record(&[("id", Value::Int(i))])).collect())
    }

    #[test]
    fn distinct_keeps_first_occurrence() {
        let records = Value::List(vec![
            record(&[("id", Value::Int(1)), ("g", Value::Int(1))]),
            record(&[("id", Value::Int(2)), ("g", Value::Int(1))]),
            record(&[("id", Value::Int(3)), ("g", Value::Int(2))]),
        ]);
        let operations = ProcessOperations {
            distinct: Some(vec!["g".to_owned()]),
            ..ProcessOperations::default()
        };
        let out = process_records(records, &operations).unwrap();
        assert_eq!(ids(&out), vec![1, 3]);
    }

    #[test]
    fn cursor_positions_then_skip_take_slice() {
        let operations = ProcessOperations {
            pagination: Some(Pagination {
                cursor: Some(BTreeMap::from([("id".to_owned(), Value::Int(3))])),
                skip: Some(1),
                take: Some(2),
            }),
            ..ProcessOperations::default()
        };
        let out = process_records(numbered(1..8), &operations).unwrap();
        assert_eq!(ids(&out), vec![4, 5]);
    }

    #[test]
    fn unmatched_cursor_yields_no_records() {
        let operations = ProcessOperations {
            pagination: Some(Pagination {
                cursor: Some(BTreeMap::from([("id".to_owned(), Value::Int(99))])),
                skip: None,
                take: None,
            }),
            ..ProcessOperations::default()
        };
        let out = process_records(numbered(1..4), &operations).unwrap();
        assert_eq!(ids(&out), Vec::<i64>::new());
    }

    #[test]
    fn linking_fields_apply_take_per_group() {
        let records = Value::List(vec![
            record(&[("id", Value::Int(1)), ("owner", Value::Int(10))]),
            record(&[("id", Value::Int(2)), ("owner", Value::Int(10))]),
            record(&[("id", Value::Int(3)), ("owner", Value::Int(20))]),
            record(&[("id", Value::Int(4)), ("owner", Value::Int(20))]),
        ]);
        let operations = ProcessOperations {
            pagination: Some(Pagination {
                cursor: None,
                skip: None,
                take: Some(1),
            }),
            linking_fields: Some(vec!["owner".to_owned()]),
            ..ProcessOperations::default()
        };
        let out = process_records(records, &operations).unwrap();
        assert_eq!(ids(&out), vec![1, 3]);
    }

    #[test]
    fn reverse_runs_after_pagination() {
        let operations = ProcessOperations {
            pagination: Some(Pagination {
                cursor: None,
                skip: None,
                take: Some(3),
            }),
            reverse: true,
            ..ProcessOperations::default()
        };
        let out = process_records(numbered(1..10), &operations).unwrap();
        assert_eq!(ids(&out), vec![3, 2, 1]);
    }

    #[test]
    fn nested_operations_recurse_into_relation_fields() {
        let records = Value::List(vec![record(&[
            ("id", Value::Int(1)),
            ("posts", numbered(1..5)),
        ])]);
        let mut nested = BTreeMap::new();
        nested.insert(
            "posts".to_owned(),
            ProcessOperations {
                pagination: Some(Pagination {
                    cursor: None,
                    skip: None,
                    take: Some(2),
                }),
                ..ProcessOperations::default()
            },
        );
        let operations = ProcessOperations {
            nested,
            ..ProcessOperations::default()
        };
        let out = process_records(records, &operations).unwrap();
        match &out {
            Value::List(items) => match &items[0] {
                Value::Object(map) => assert_eq!(ids(&map["posts"]), vec![1, 2]),
                other => panic!("not a record: {other:?}"),
            },
            other => panic!("not a list: {other:?}"),
        }
    }

    #[test]
    fn json_text_sources_are_decoded_first() {
        let operations = ProcessOperations {
            reverse: true,
            ..ProcessOperations::default()
        };
        let out =
            process_records(Value::Text(r#"[{"id": 1}, {"id": 2}]"#.into()), &operations)
                .unwrap();
        assert_eq!(ids(&out), vec![2, 1]);
    }

    #[test]
    fn missing_key_fields_read_as_null() {
        let a = match record(&[("x", Value::Int(1))]) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(record_key_of(&a, &["y".to_owned()]), "[null]");
    }
}
