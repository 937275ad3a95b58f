//! Declarative SQL query descriptions.
//!
//! A plan's `query`/`execute` nodes carry either a fully rendered SQL
//! string with positional parameters, or a template: an ordered fragment
//! list whose parameter-consuming fragments are paired positionally with
//! the supplied parameter expressions at render time.

use serde::Deserialize;

use super::expr::PlanExpr;

/// SQL query description carried by `query` and `execute` nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DbQuery {
    /// A raw SQL string with positional parameters, passed through as-is.
    RawSql {
        /// SQL text containing dialect-native placeholders.
        sql: String,
        /// Positional parameter expressions.
        params: Vec<PlanExpr>,
    },
    /// A fragment template expanded at render time.
    TemplateSql {
        /// Ordered fragments; parameter-consuming fragments pair
        /// positionally with `params`.
        fragments: Vec<Fragment>,
        /// How placeholders are spelled in the target dialect.
        placeholder_format: PlaceholderFormat,
        /// Positional parameter expressions.
        params: Vec<PlanExpr>,
        /// Whether the renderer may split this query into multiple
        /// statements to respect the driver's placeholder limit.
        chunkable: bool,
    },
}

/// One piece of a SQL template.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Fragment {
    /// Literal SQL text.
    StringChunk {
        /// The text, emitted verbatim.
        chunk: String,
    },
    /// A single placeholder consuming one parameter.
    Parameter,
    /// A parenthesized tuple consuming one (possibly singleton-coerced)
    /// list parameter; empty lists render as literal `NULL`.
    ParameterTuple,
    /// A separator-joined sequence of decorated tuples, consuming one
    /// list-of-lists parameter. Used for multi-row `INSERT ... VALUES`
    /// and `UNION ALL`-style batched lookups.
    ParameterTupleList {
        /// Text emitted before each tuple.
        item_prefix: String,
        /// Separator between the elements of one tuple.
        item_separator: String,
        /// Text emitted after each tuple.
        item_suffix: String,
        /// Separator between consecutive tuples.
        group_separator: String,
    },
}

/// How the target dialect spells bind placeholders.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceholderFormat {
    /// Placeholder prefix symbol (`$`, `?`, `@p`, ...).
    pub prefix: String,
    /// Whether placeholders carry a 1-based sequence number.
    pub has_numbering: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_query_decodes() {
        let query: DbQuery = serde_json::from_str(
            r#"{
                "type": "templateSql",
                "fragments": [
                    {"type": "stringChunk", "chunk": "SELECT * FROM t WHERE id IN "},
                    {"type": "parameterTuple"}
                ],
                "placeholderFormat": {"prefix": "$", "hasNumbering": true},
                "params": [[1, 2]],
                "chunkable": true
            }"#,
        )
        .unwrap();
        match query {
            DbQuery::TemplateSql {
                fragments,
                chunkable,
                ..
            } => {
                assert_eq!(fragments.len(), 2);
                assert!(chunkable);
            }
            other => panic!("unexpected query: {other:?}"),
        }
    }

    #[test]
    fn unknown_fragment_tag_is_rejected() {
        let result: Result<Fragment, _> = serde_json::from_str(r#"{"type": "comment"}"#);
        assert!(result.is_err());
    }
}
