//! Plan-level literal expressions.
//!
//! A [`PlanExpr`] is JSON data enriched with `$type`-tagged wrapper
//! objects for values that need deferred or lossless evaluation:
//! placeholders resolved against the scope chain, generator calls
//! resolved against the per-execution snapshot, base64 bytes, and
//! decimal-string big integers.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// A literal expression embedded in the plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanExpr {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// String literal.
    Text(String),
    /// List of expressions, possibly containing wrappers.
    List(Vec<PlanExpr>),
    /// Record of expressions, possibly containing wrappers.
    Object(BTreeMap<String, PlanExpr>),
    /// Named reference resolved against the scope chain at evaluation.
    Placeholder {
        /// Name looked up through the scope chain.
        name: String,
    },
    /// Call to a named generator, evaluated lazily per execution.
    Generator {
        /// Registered generator name.
        name: String,
        /// Arguments, themselves plan expressions.
        args: Vec<PlanExpr>,
    },
    /// Binary payload carried as base64 text.
    Bytes(String),
    /// 64-bit integer carried as a decimal string to survive JSON.
    BigInt(String),
}

impl PlanExpr {
    fn from_json(raw: serde_json::Value) -> Result<PlanExpr, String> {
        match raw {
            serde_json::Value::Null => Ok(PlanExpr::Null),
            serde_json::Value::Bool(b) => Ok(PlanExpr::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(PlanExpr::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(PlanExpr::Float(f))
                } else {
                    Err(format!("unrepresentable number {n}"))
                }
            }
            serde_json::Value::String(s) => Ok(PlanExpr::Text(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(PlanExpr::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(PlanExpr::List),
            serde_json::Value::Object(map) => PlanExpr::from_json_object(map),
        }
    }

    fn from_json_object(
        map: serde_json::Map<String, serde_json::Value>,
    ) -> Result<PlanExpr, String> {
        if map.len() == 2 && map.contains_key("$type") && map.contains_key("value") {
            let tag = map["$type"].as_str().unwrap_or_default().to_owned();
            let payload = map["value"].clone();
            return PlanExpr::from_wrapper(&tag, payload);
        }
        let mut object = BTreeMap::new();
        for (key, value) in map {
            object.insert(key, PlanExpr::from_json(value)?);
        }
        Ok(PlanExpr::Object(object))
    }

    fn from_wrapper(tag: &str, payload: serde_json::Value) -> Result<PlanExpr, String> {
        match tag {
            "placeholder" => {
                let name = payload
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or("placeholder wrapper requires a 'name' field")?;
                Ok(PlanExpr::Placeholder {
                    name: name.to_owned(),
                })
            }
            "generatorCall" => {
                let name = payload
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or("generatorCall wrapper requires a 'name' field")?
                    .to_owned();
                let args = match payload.get("args") {
                    None => Vec::new(),
                    Some(serde_json::Value::Array(items)) => items
                        .iter()
                        .cloned()
                        .map(PlanExpr::from_json)
                        .collect::<Result<Vec<_>, _>>()?,
                    Some(other) => {
                        return Err(format!("generatorCall args must be a list, got {other}"))
                    }
                };
                Ok(PlanExpr::Generator { name, args })
            }
            "bytes" => match payload {
                serde_json::Value::String(s) => Ok(PlanExpr::Bytes(s)),
                other => Err(format!("bytes wrapper must hold a string, got {other}")),
            },
            "bigint" => match payload {
                serde_json::Value::String(s) => Ok(PlanExpr::BigInt(s)),
                serde_json::Value::Number(n) => Ok(PlanExpr::BigInt(n.to_string())),
                other => Err(format!(
                    "bigint wrapper must hold a string or number, got {other}"
                )),
            },
            other => Err(format!("unknown plan value wrapper '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for PlanExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        PlanExpr::from_json(raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_decodes_structurally() {
        let expr: PlanExpr = serde_json::from_str(r#"{"a": [1, true, null]}"#).unwrap();
        assert_eq!(
            expr,
            PlanExpr::Object(BTreeMap::from([(
                "a".to_owned(),
                PlanExpr::List(vec![PlanExpr::Int(1), PlanExpr::Bool(true), PlanExpr::Null])
            )]))
        );
    }

    #[test]
    fn wrappers_decode_by_tag() {
        let expr: PlanExpr = serde_json::from_str(
            r#"{"$type": "generatorCall", "value": {"name": "uuid", "args": [4]}}"#,
        )
        .unwrap();
        assert_eq!(
            expr,
            PlanExpr::Generator {
                name: "uuid".to_owned(),
                args: vec![PlanExpr::Int(4)],
            }
        );

        let expr: PlanExpr =
            serde_json::from_str(r#"{"$type": "placeholder", "value": {"name": "userId"}}"#)
                .unwrap();
        assert_eq!(
            expr,
            PlanExpr::Placeholder {
                name: "userId".to_owned()
            }
        );
    }

    #[test]
    fn unknown_wrapper_tag_is_rejected() {
        let result: Result<PlanExpr, _> =
            serde_json::from_str(r#"{"$type": "mystery", "value": 1}"#);
        assert!(result.is_err());
    }
}
