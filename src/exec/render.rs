//! SQL template rendering.
//!
//! Turns a plan-level query description into one or more concrete
//! [`SqlStatement`]s. Raw queries pass through after parameter evaluation.
//! Templates are expanded fragment by fragment with dialect-appropriate
//! placeholders, and chunkable templates are split into multiple
//! statements when the flattened parameter count exceeds the driver's
//! bind limit.

use base64::Engine as _;

use crate::driver::SqlStatement;
use crate::error::{PlanError, RenderError, Result};
use crate::plan::{DbQuery, Fragment, PlaceholderFormat, PlanExpr};
use crate::value::Value;

use super::generators::GeneratorSnapshot;
use super::scope::Scope;

/// Evaluates a plan expression to a concrete runtime value.
///
/// Placeholders resolve against the scope chain and generator calls
/// against the per-execution snapshot, both recursively through lists
/// and records.
pub(crate) fn evaluate_expr(
    expr: &PlanExpr,
    scope: &Scope<'_>,
    generators: &GeneratorSnapshot,
) -> Result<Value> {
    match expr {
        PlanExpr::Null => Ok(Value::Null),
        PlanExpr::Bool(b) => Ok(Value::Bool(*b)),
        PlanExpr::Int(i) => Ok(Value::Int(*i)),
        PlanExpr::Float(f) => Ok(Value::Float(*f)),
        PlanExpr::Text(s) => Ok(Value::Text(s.clone())),
        PlanExpr::List(items) => items
            .iter()
            .map(|item| evaluate_expr(item, scope, generators))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        PlanExpr::Object(map) => {
            let mut record = std::collections::BTreeMap::new();
            for (key, value) in map {
                record.insert(key.clone(), evaluate_expr(value, scope, generators)?);
            }
            Ok(Value::Object(record))
        }
        PlanExpr::Placeholder { name } => match scope.lookup(name) {
            Some(value) => Ok(value.clone()),
            None => Err(PlanError::UnboundPlaceholder { name: name.clone() }.into()),
        },
        PlanExpr::Generator { name, args } => {
            let args = args
                .iter()
                .map(|arg| evaluate_expr(arg, scope, generators))
                .collect::<Result<Vec<_>>>()?;
            generators.generate(name, &args)
        }
        PlanExpr::Bytes(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Value::Bytes)
            .map_err(|e| PlanError::InvalidLiteral(format!("invalid base64 bytes: {e}")).into()),
        PlanExpr::BigInt(digits) => digits
            .parse::<i64>()
            .map(Value::BigInt)
            .map_err(|e| PlanError::InvalidLiteral(format!("invalid bigint '{digits}': {e}")).into()),
    }
}

/// Renders a query description into executable statements.
///
/// Returns exactly one statement unless the query is a chunkable template
/// whose flattened parameter count exceeds `max_bind_values`.
pub(crate) fn render_query(
    query: &DbQuery,
    scope: &Scope<'_>,
    generators: &GeneratorSnapshot,
    max_bind_values: Option<usize>,
) -> Result<Vec<SqlStatement>> {
    match query {
        DbQuery::RawSql { sql, params } => {
            let args = params
                .iter()
                .map(|p| evaluate_expr(p, scope, generators))
                .collect::<Result<Vec<_>>>()?;
            Ok(vec![SqlStatement::new(sql.clone(), args)])
        }
        DbQuery::TemplateSql {
            fragments,
            placeholder_format,
            params,
            chunkable,
        } => {
            let args = params
                .iter()
                .map(|p| evaluate_expr(p, scope, generators))
                .collect::<Result<Vec<_>>>()?;
            let paired = pair_fragments(fragments, args)?;

            let chunks = match (chunkable, max_bind_values) {
                (true, Some(limit)) => chunk_fragments(paired, limit),
                _ => vec![paired],
            };

            chunks
                .into_iter()
                .map(|chunk| {
                    let statement = render_chunk(&chunk, placeholder_format);
                    if let Some(limit) = max_bind_values {
                        if statement.args.len() > limit {
                            return Err(RenderError::ParameterLimitExceeded {
                                limit,
                                count: statement.args.len(),
                            }
                            .into());
                        }
                    }
                    Ok(statement)
                })
                .collect()
        }
    }
}

/// A template fragment paired with its evaluated parameter, ready for
/// chunking and emission.
#[derive(Debug, Clone)]
enum PairedFragment<'a> {
    Chunk(&'a str),
    Parameter(Value),
    Tuple(Vec<Value>),
    TupleList {
        tuples: Vec<Vec<Value>>,
        item_prefix: &'a str,
        item_separator: &'a str,
        item_suffix: &'a str,
        group_separator: &'a str,
    },
}

impl PairedFragment<'_> {
    /// Flattened bind-parameter count this fragment contributes.
    fn param_count(&self) -> usize {
        match self {
            PairedFragment::Chunk(_) => 0,
            PairedFragment::Parameter(_) => 1,
            PairedFragment::Tuple(items) => items.len(),
            PairedFragment::TupleList { tuples, .. } => tuples.iter().map(Vec::len).sum(),
        }
    }
}

/// Pairs each parameter-consuming fragment with the next evaluated
/// parameter, in order.
fn pair_fragments<'a>(
    fragments: &'a [Fragment],
    args: Vec<Value>,
) -> Result<Vec<PairedFragment<'a>>> {
    let supplied = args.len();
    let mut params = args.into_iter();
    let mut take = || {
        params
            .next()
            .ok_or(PlanError::FragmentParamMismatch { supplied })
    };

    let mut paired = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        paired.push(match fragment {
            Fragment::StringChunk { chunk } => PairedFragment::Chunk(chunk),
            Fragment::Parameter => PairedFragment::Parameter(take()?),
            Fragment::ParameterTuple => {
                // Non-list parameters are coerced to singleton tuples so
                // `IN (...)` templates accept scalar bindings.
                let items = match take()? {
                    Value::List(items) => items,
                    other => vec![other],
                };
                PairedFragment::Tuple(items)
            }
            Fragment::ParameterTupleList {
                item_prefix,
                item_separator,
                item_suffix,
                group_separator,
            } => {
                let tuples = match take()? {
                    Value::List(groups) if groups.is_empty() => {
                        return Err(PlanError::EmptyTupleList.into())
                    }
                    Value::List(groups) => groups
                        .into_iter()
                        .map(|group| match group {
                            Value::List(items) => Ok(items),
                            other => Err(PlanError::TupleListExpected {
                                got: other.type_name(),
                            }),
                        })
                        .collect::<std::result::Result<Vec<_>, _>>()?,
                    other => {
                        return Err(PlanError::TupleListExpected {
                            got: other.type_name(),
                        }
                        .into())
                    }
                };
                PairedFragment::TupleList {
                    tuples,
                    item_prefix,
                    item_separator,
                    item_suffix,
                    group_separator,
                }
            }
        });
    }
    Ok(paired)
}

/// Splits an oversized template into chunks along its heaviest fragment.
///
/// Only the single fragment contributing the most parameters is split,
/// and only when splitting it can bring every chunk under the limit.
/// Anything else is returned whole; the per-statement limit check catches
/// what chunking cannot fix.
fn chunk_fragments(paired: Vec<PairedFragment<'_>>, limit: usize) -> Vec<Vec<PairedFragment<'_>>> {
    let total: usize = paired.iter().map(PairedFragment::param_count).sum();
    if total <= limit {
        return vec![paired];
    }

    let Some((split_at, heaviest)) = paired
        .iter()
        .enumerate()
        .max_by_key(|(_, f)| f.param_count())
        .map(|(i, f)| (i, f.param_count()))
    else {
        return vec![paired];
    };

    // Parameters outside the heaviest fragment appear in every chunk, so
    // the per-chunk budget is what remains of the limit after them.
    let rest = total - heaviest;
    if rest >= limit {
        return vec![paired];
    }
    let budget = limit - rest;

    let pieces: Vec<PairedFragment<'_>> = match &paired[split_at] {
        PairedFragment::Tuple(items) => items
            .chunks(budget)
            .map(|chunk| PairedFragment::Tuple(chunk.to_vec()))
            .collect(),
        PairedFragment::TupleList {
            tuples,
            item_prefix,
            item_separator,
            item_suffix,
            group_separator,
        } => {
            // Whole tuples only; a single tuple larger than the budget
            // becomes its own over-limit chunk and fails the final check.
            let mut groups: Vec<Vec<Vec<Value>>> = Vec::new();
            let mut current: Vec<Vec<Value>> = Vec::new();
            let mut current_len = 0usize;
            for tuple in tuples {
                if !current.is_empty() && current_len + tuple.len() > budget {
                    groups.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current_len += tuple.len();
                current.push(tuple.clone());
            }
            if !current.is_empty() {
                groups.push(current);
            }
            groups
                .into_iter()
                .map(|tuples| PairedFragment::TupleList {
                    tuples,
                    item_prefix: *item_prefix,
                    item_separator: *item_separator,
                    item_suffix: *item_suffix,
                    group_separator: *group_separator,
                })
                .collect()
        }
        _ => return vec![paired],
    };

    pieces
        .into_iter()
        .map(|piece| {
            let mut chunk = paired.clone();
            chunk[split_at] = piece;
            chunk
        })
        .collect()
}

/// Emits one chunk as a statement, numbering placeholders sequentially in
/// emission order starting at 1.
fn render_chunk(chunk: &[PairedFragment<'_>], format: &PlaceholderFormat) -> SqlStatement {
    let mut sql = String::new();
    let mut args = Vec::new();
    let placeholder = |sql: &mut String, args: &mut Vec<Value>, value: &Value| {
        args.push(value.clone());
        sql.push_str(&format.prefix);
        if format.has_numbering {
            sql.push_str(&args.len().to_string());
        }
    };

    for fragment in chunk {
        match fragment {
            PairedFragment::Chunk(text) => sql.push_str(text),
            PairedFragment::Parameter(value) => placeholder(&mut sql, &mut args, value),
            PairedFragment::Tuple(items) => {
                if items.is_empty() {
                    // An empty IN-list must stay valid SQL and match no
                    // row; `IN (NULL)` does exactly that.
                    sql.push_str("(NULL)");
                } else {
                    sql.push('(');
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            sql.push(',');
                        }
                        placeholder(&mut sql, &mut args, item);
                    }
                    sql.push(')');
                }
            }
            PairedFragment::TupleList {
                tuples,
                item_prefix,
                item_separator,
                item_suffix,
                group_separator,
            } => {
                for (g, tuple) in tuples.iter().enumerate() {
                    if g > 0 {
                        sql.push_str(group_separator);
                    }
                    sql.push_str(item_prefix);
                    for (i, item) in tuple.iter().enumerate() {
                        if i > 0 {
                            sql.push_str(item_separator);
                        }
                        placeholder(&mut sql, &mut args, item);
                    }
                    sql.push_str(item_suffix);
                }
            }
        }
    }

    SqlStatement::new(sql, args)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use crate::exec::generators::GeneratorRegistry;

    use super::*;

    fn render(query: &DbQuery, limit: Option<usize>) -> Result<Vec<SqlStatement>> {
        let scope = Scope::root(BTreeMap::new());
        let snapshot = GeneratorRegistry::default().snapshot();
        render_query(query, &scope, &snapshot, limit)
    }

    fn numbered() -> PlaceholderFormat {
        PlaceholderFormat {
            prefix: "$".into(),
            has_numbering: true,
        }
    }

    fn in_query(ids: Vec<PlanExpr>) -> DbQuery {
        DbQuery::TemplateSql {
            fragments: vec![
                Fragment::StringChunk {
                    chunk: "SELECT * FROM users WHERE id IN ".into(),
                },
                Fragment::ParameterTuple,
            ],
            placeholder_format: numbered(),
            params: vec![PlanExpr::List(ids)],
            chunkable: true,
        }
    }

    #[test]
    fn tuple_expands_with_sequential_numbering() {
        let query = in_query(vec![PlanExpr::Int(1), PlanExpr::Int(2), PlanExpr::Int(3)]);
        let statements = render(&query, None).unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            "SELECT * FROM users WHERE id IN ($1,$2,$3)"
        );
        assert_eq!(
            statements[0].args,
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }

    #[test]
    fn empty_tuple_renders_null() {
        let statements = render(&in_query(vec![]), None).unwrap();
        assert_eq!(statements[0].sql, "SELECT * FROM users WHERE id IN (NULL)");
        assert!(statements[0].args.is_empty());
    }

    #[test]
    fn scalar_parameter_coerces_to_singleton_tuple() {
        let query = DbQuery::TemplateSql {
            fragments: vec![
                Fragment::StringChunk {
                    chunk: "SELECT * FROM users WHERE id IN ".into(),
                },
                Fragment::ParameterTuple,
            ],
            placeholder_format: numbered(),
            params: vec![PlanExpr::Int(5)],
            chunkable: true,
        };
        let statements = render(&query, None).unwrap();
        assert_eq!(statements[0].sql, "SELECT * FROM users WHERE id IN ($1)");
    }

    #[test]
    fn oversized_tuple_splits_with_numbering_restarting_per_chunk() {
        let query = in_query((1..=10).map(PlanExpr::Int).collect());
        let statements = render(&query, Some(4)).unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(
            statements[0].sql,
            "SELECT * FROM users WHERE id IN ($1,$2,$3,$4)"
        );
        assert_eq!(
            statements[2].sql,
            "SELECT * FROM users WHERE id IN ($1,$2)"
        );
        assert_eq!(statements[2].args, vec![Value::Int(9), Value::Int(10)]);
    }

    #[test]
    fn tuple_list_renders_decorated_groups() {
        let query = DbQuery::TemplateSql {
            fragments: vec![
                Fragment::StringChunk {
                    chunk: "INSERT INTO t (a, b) VALUES ".into(),
                },
                Fragment::ParameterTupleList {
                    item_prefix: "(".into(),
                    item_separator: ", ".into(),
                    item_suffix: ")".into(),
                    group_separator: ", ".into(),
                },
            ],
            placeholder_format: numbered(),
            params: vec![PlanExpr::List(vec![
                PlanExpr::List(vec![PlanExpr::Int(1), PlanExpr::Int(2)]),
                PlanExpr::List(vec![PlanExpr::Int(3), PlanExpr::Int(4)]),
            ])],
            chunkable: false,
        };
        let statements = render(&query, None).unwrap();
        assert_eq!(
            statements[0].sql,
            "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn tuple_list_splits_on_whole_tuples() {
        let groups = (0..6)
            .map(|i| PlanExpr::List(vec![PlanExpr::Int(i * 2), PlanExpr::Int(i * 2 + 1)]))
            .collect();
        let query = DbQuery::TemplateSql {
            fragments: vec![
                Fragment::StringChunk {
                    chunk: "INSERT INTO t (a, b) VALUES ".into(),
                },
                Fragment::ParameterTupleList {
                    item_prefix: "(".into(),
                    item_separator: ", ".into(),
                    item_suffix: ")".into(),
                    group_separator: ", ".into(),
                },
            ],
            placeholder_format: numbered(),
            params: vec![PlanExpr::List(groups)],
            chunkable: true,
        };
        // 12 params, budget 5, tuples of 2 -> chunks of 2+2 params each.
        let statements = render(&query, Some(5)).unwrap();
        assert_eq!(statements.len(), 3);
        for statement in &statements {
            assert_eq!(statement.args.len(), 4);
            assert_eq!(statement.sql, "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4)");
        }
    }

    #[test]
    fn unsplittable_overflow_is_rejected() {
        let query = DbQuery::TemplateSql {
            fragments: vec![Fragment::Parameter, Fragment::Parameter, Fragment::Parameter],
            placeholder_format: numbered(),
            params: vec![PlanExpr::Int(1), PlanExpr::Int(2), PlanExpr::Int(3)],
            chunkable: true,
        };
        let err = render(&query, Some(2)).unwrap_err();
        assert_eq!(err.code(), "ParameterLimitExceeded");
    }

    #[test]
    fn non_chunkable_template_stays_whole_under_limit() {
        let query = in_query((1..=3).map(PlanExpr::Int).collect());
        let DbQuery::TemplateSql { fragments, placeholder_format, params, .. } = query else {
            unreachable!()
        };
        let query = DbQuery::TemplateSql {
            fragments,
            placeholder_format,
            params,
            chunkable: false,
        };
        let statements = render(&query, Some(10)).unwrap();
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn raw_sql_passes_through_with_evaluated_params() {
        let mut bindings = BTreeMap::new();
        bindings.insert("userId".to_owned(), Value::Int(7));
        let scope = Scope::root(bindings);
        let snapshot = GeneratorRegistry::default().snapshot();
        let query = DbQuery::RawSql {
            sql: "SELECT * FROM users WHERE id = $1".into(),
            params: vec![PlanExpr::Placeholder {
                name: "userId".into(),
            }],
        };
        let statements = render_query(&query, &scope, &snapshot, None).unwrap();
        assert_eq!(statements[0].sql, "SELECT * FROM users WHERE id = $1");
        assert_eq!(statements[0].args, vec![Value::Int(7)]);
    }

    #[test]
    fn missing_parameter_is_a_plan_error() {
        let query = DbQuery::TemplateSql {
            fragments: vec![Fragment::Parameter, Fragment::Parameter],
            placeholder_format: numbered(),
            params: vec![PlanExpr::Int(1)],
            chunkable: false,
        };
        let err = render(&query, None).unwrap_err();
        assert_eq!(err.code(), "MalformedQueryPlan");
    }

    proptest! {
        // Chunking must preserve every parameter, in order.
        #[test]
        fn chunking_preserves_parameters(
            ids in proptest::collection::vec(-1000i64..1000, 1..80),
            limit in 1usize..20,
        ) {
            let query = in_query(ids.iter().copied().map(PlanExpr::Int).collect());
            match render(&query, Some(limit)) {
                Ok(statements) => {
                    let flattened: Vec<Value> = statements
                        .into_iter()
                        .flat_map(|s| s.args)
                        .collect();
                    let expected: Vec<Value> =
                        ids.iter().copied().map(Value::Int).collect();
                    prop_assert_eq!(flattened, expected);
                }
                Err(err) => prop_assert_eq!(err.code(), "ParameterLimitExceeded"),
            }
        }
    }
}
