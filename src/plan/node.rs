//! The plan node tree.
//!
//! A closed algebra of roughly twenty node kinds produced by the external
//! query compiler. The `args` payload of each node is fully determined by
//! its tag; matching is exhaustive so a new upstream node kind fails this
//! build instead of being silently skipped.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::expr::PlanExpr;
use super::query::DbQuery;
use super::rules::DataRule;
use super::shape::{EnumTable, ResultShape};
use crate::exec::process::ProcessOperations;

/// One node of the compiled query plan.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "args", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum PlanNode {
    /// A literal expression.
    Value(PlanExpr),
    /// Reads a binding from the scope chain.
    Get {
        /// Name to resolve.
        name: String,
    },
    /// Introduces a child scope, binds expressions sequentially (later
    /// bindings may reference earlier ones), then evaluates the body.
    Let {
        /// Bindings evaluated in order within the new scope.
        bindings: Vec<Binding>,
        /// Body evaluated in the extended scope.
        expr: Box<PlanNode>,
    },
    /// Evaluates children in order; the result is the last child's.
    Seq(Vec<PlanNode>),
    /// Scans a name list in order and returns the first binding that is
    /// neither null nor an empty list, else an empty list.
    GetFirstNonEmpty {
        /// Candidate binding names, in priority order.
        names: Vec<String>,
    },
    /// Flattens each child into a list and concatenates.
    Concat(Vec<PlanNode>),
    /// Folds numeric children with addition.
    Sum(Vec<PlanNode>),
    /// Renders and runs a read query, producing a record list.
    Query(DbQuery),
    /// Renders and runs a write query, producing an affected-row count.
    Execute(DbQuery),
    /// Reverses a list result in place.
    Reverse(Box<PlanNode>),
    /// Asserts the child yields at most one element; unwraps it.
    Unique(Box<PlanNode>),
    /// Asserts the child result is non-empty.
    Required(Box<PlanNode>),
    /// Projects a named field out of each record.
    MapField {
        /// Node producing the record or record list.
        records: Box<PlanNode>,
        /// Field to project.
        field: String,
    },
    /// Attaches child record sets to parent records by equi-join keys.
    Join {
        /// Node producing the parent records.
        parent: Box<PlanNode>,
        /// Independent child sub-plans with their join conditions.
        children: Vec<JoinChild>,
    },
    /// Wraps the sub-plan in a database transaction.
    Transaction(Box<PlanNode>),
    /// Reshapes the sub-plan's result via the data mapper.
    DataMap {
        /// Node producing the raw result.
        expr: Box<PlanNode>,
        /// Declared target shape.
        structure: ResultShape,
        /// Enum member tables referenced by the shape.
        enums: EnumTable,
    },
    /// Asserts declared rules hold for the sub-plan's result.
    Validate {
        /// Node producing the value under validation.
        expr: Box<PlanNode>,
        /// Rules that must all hold.
        rules: Vec<DataRule>,
        /// Structured context (model/relation names) attached to
        /// rule-failure errors.
        #[serde(default)]
        context: BTreeMap<String, serde_json::Value>,
    },
    /// Branches on whether a rule holds for a value.
    If {
        /// Node producing the value the rule is checked against.
        value: Box<PlanNode>,
        /// Branch condition.
        rule: DataRule,
        /// Evaluated when the rule holds.
        then: Box<PlanNode>,
        /// Evaluated when the rule does not hold.
        #[serde(rename = "else")]
        otherwise: Box<PlanNode>,
    },
    /// Set subtraction: elements of `from` whose key is absent in `to`.
    Diff {
        /// Left operand.
        from: Box<PlanNode>,
        /// Right operand.
        to: Box<PlanNode>,
        /// Fields forming the comparison key; empty keys by whole record.
        #[serde(default)]
        fields: Vec<String>,
    },
    /// In-memory pagination/distinct/reversal over fetched records.
    Process {
        /// Node producing the records.
        expr: Box<PlanNode>,
        /// Operations to apply.
        operations: ProcessOperations,
    },
    /// Constructs a fresh record from field initializers.
    InitializeRecord {
        /// Evaluated first; supplies the last-insert-id side channel.
        expr: Box<PlanNode>,
        /// Field initializers keyed by output field name.
        fields: BTreeMap<String, FieldInitializer>,
    },
    /// Updates a record's fields with arithmetic/set operations.
    MapRecord {
        /// Node producing the record (null becomes an empty record).
        expr: Box<PlanNode>,
        /// Field operations keyed by field name.
        fields: BTreeMap<String, FieldOperation>,
    },
    /// Produces no value.
    Unit,
}

/// A named binding inside a `let` node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    /// Name introduced into the child scope.
    pub name: String,
    /// Expression evaluated in the child scope.
    pub expr: PlanNode,
}

/// One child of a `join` node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChild {
    /// Sub-plan producing the child records.
    pub child: PlanNode,
    /// Equi-join key pairs as `[parentField, childField]`.
    pub on: Vec<(String, String)>,
    /// Parent field the matched child records are attached under.
    pub parent_field: String,
    /// Attach a single record (null when unmatched) instead of a list.
    pub is_relation_unique: bool,
}

/// How a field of an `initializeRecord` node gets its value.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldInitializer {
    /// A literal expression.
    Value(PlanExpr),
    /// The last-insert-id reported by a previously evaluated query.
    LastInsertId,
}

/// How a field of a `mapRecord` node is updated.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldOperation {
    /// Replace the field.
    Set(PlanExpr),
    /// Add the operand to the current value.
    Add(PlanExpr),
    /// Subtract the operand from the current value.
    Subtract(PlanExpr),
    /// Multiply the current value by the operand.
    Multiply(PlanExpr),
    /// Divide the current value by the operand; division by zero yields
    /// null, mirroring database null-propagation semantics.
    Divide(PlanExpr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_tree_decodes() {
        let plan: PlanNode = serde_json::from_str(
            r#"{
                "type": "let",
                "args": {
                    "bindings": [{"name": "x", "expr": {"type": "value", "args": 1}}],
                    "expr": {"type": "get", "args": {"name": "x"}}
                }
            }"#,
        )
        .unwrap();
        match plan {
            PlanNode::Let { bindings, expr } => {
                assert_eq!(bindings.len(), 1);
                assert!(matches!(*expr, PlanNode::Get { ref name } if name == "x"));
            }
            other => panic!("unexpected node: {other:?}"),
        }
    }

    #[test]
    fn unknown_node_tag_is_rejected() {
        let result: Result<PlanNode, _> =
            serde_json::from_str(r#"{"type": "teleport", "args": null}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unit_decodes_without_args() {
        let plan: PlanNode = serde_json::from_str(r#"{"type": "unit"}"#).unwrap();
        assert!(matches!(plan, PlanNode::Unit));
    }
}
