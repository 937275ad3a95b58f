//! Query-plan evaluation.
//!
//! The [`Interpreter`] walks a [`PlanNode`] tree depth first against a
//! driver connection, threading a scope chain of name bindings and a
//! last-insert-id side channel through the evaluation. Rendering,
//! mapping, and post-processing live in the submodules; this module owns
//! the node dispatch and the transactional control flow.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info_span};

use crate::config::{EngineConfig, TransactionOptions};
use crate::driver::{
    with_query_event, DriverError, DriverTransaction, Queryable, QueryObserver, ResultSet,
    SqlStatement,
};
use crate::error::{EngineError, Result};
use crate::plan::{
    DbQuery, FieldInitializer, FieldOperation, JoinChild, PlanNode,
};
use crate::txn::TransactionManager;
use crate::value::Value;

/// Value generators resolved against a per-execution snapshot.
pub mod generators;
/// Data mapping from raw rows to typed results.
mod mapper;
/// In-memory record post-processing.
pub mod process;
/// SQL template rendering and expression evaluation.
mod render;
/// Lexical scopes.
mod scope;

pub use generators::{GeneratorRegistry, ValueGenerator};
pub use process::{Pagination, ProcessOperations};

use generators::GeneratorSnapshot;
use render::{evaluate_expr, render_query};
use scope::Scope;

/// Fallback start timeout for plan-internal transactions.
const INTERNAL_TX_MAX_WAIT: Duration = Duration::from_secs(2);
/// Fallback execution timeout for plan-internal transactions.
const INTERNAL_TX_TIMEOUT: Duration = Duration::from_secs(5);

/// A value threaded with the last-insert-id side channel.
struct Evaluated {
    value: Value,
    last_insert_id: Option<String>,
}

impl Evaluated {
    fn plain(value: Value) -> Self {
        Evaluated {
            value,
            last_insert_id: None,
        }
    }
}

/// Executes compiled query plans against a driver connection.
pub struct Interpreter {
    config: EngineConfig,
    generators: GeneratorRegistry,
    placeholders: BTreeMap<String, Value>,
    transactions: Option<Arc<TransactionManager>>,
    on_query: Option<QueryObserver>,
}

impl Interpreter {
    /// Creates an interpreter with no placeholders, no custom generators,
    /// and no transaction manager.
    pub fn new(config: EngineConfig) -> Self {
        Interpreter {
            config,
            generators: GeneratorRegistry::default(),
            placeholders: BTreeMap::new(),
            transactions: None,
            on_query: None,
        }
    }

    /// Seeds the root scope with caller-supplied placeholder values.
    pub fn with_placeholders(mut self, placeholders: BTreeMap<String, Value>) -> Self {
        self.placeholders = placeholders;
        self
    }

    /// Registers a custom value generator.
    pub fn register_generator(
        &mut self,
        name: impl Into<String>,
        generator: Arc<dyn ValueGenerator>,
    ) {
        self.generators.register(name, generator);
    }

    /// Enables `transaction` nodes by attaching a transaction manager.
    /// Plans containing such nodes fall back to running on the supplied
    /// connection when no manager is attached.
    pub fn with_transaction_manager(mut self, manager: Arc<TransactionManager>) -> Self {
        self.transactions = Some(manager);
        self
    }

    /// Attaches an observer notified after every executed statement.
    pub fn with_query_observer(mut self, observer: QueryObserver) -> Self {
        self.on_query = Some(observer);
        self
    }

    /// Evaluates a plan against a connection and returns its result.
    ///
    /// Generator state is snapshotted once per call, so every `now` in
    /// the plan observes the same instant.
    pub fn run(&self, plan: &PlanNode, conn: &dyn Queryable) -> Result<Value> {
        let span = info_span!("plan_execution");
        let _guard = span.enter();
        let snapshot = self.generators.snapshot();
        let scope = Scope::root(self.placeholders.clone());
        self.eval(plan, &scope, conn, &snapshot).map(|e| e.value)
    }

    fn eval(
        &self,
        node: &PlanNode,
        scope: &Scope<'_>,
        conn: &dyn Queryable,
        generators: &GeneratorSnapshot,
    ) -> Result<Evaluated> {
        match node {
            PlanNode::Value(expr) => {
                evaluate_expr(expr, scope, generators).map(Evaluated::plain)
            }
            PlanNode::Get { name } => match scope.lookup(name) {
                Some(value) => Ok(Evaluated::plain(value.clone())),
                None => Err(EngineError::Internal(format!(
                    "binding '{name}' is not in scope"
                ))),
            },
            PlanNode::Let { bindings, expr } => {
                let mut child = scope.child();
                let mut last_insert_id = None;
                for binding in bindings {
                    let bound = self.eval(&binding.expr, &child, conn, generators)?;
                    last_insert_id = bound.last_insert_id.or(last_insert_id);
                    child.bind(binding.name.clone(), bound.value);
                }
                let body = self.eval(expr, &child, conn, generators)?;
                Ok(Evaluated {
                    value: body.value,
                    last_insert_id: body.last_insert_id.or(last_insert_id),
                })
            }
            PlanNode::Seq(nodes) => {
                let mut result = Evaluated::plain(Value::Null);
                for node in nodes {
                    let step = self.eval(node, scope, conn, generators)?;
                    result = Evaluated {
                        value: step.value,
                        last_insert_id: step.last_insert_id.or(result.last_insert_id),
                    };
                }
                Ok(result)
            }
            PlanNode::GetFirstNonEmpty { names } => {
                for name in names {
                    if let Some(value) = scope.lookup(name) {
                        if !value.is_empty_like() {
                            return Ok(Evaluated::plain(value.clone()));
                        }
                    }
                }
                Ok(Evaluated::plain(Value::List(Vec::new())))
            }
            PlanNode::Concat(nodes) => {
                let mut items = Vec::new();
                let mut last_insert_id = None;
                for node in nodes {
                    let step = self.eval(node, scope, conn, generators)?;
                    last_insert_id = step.last_insert_id.or(last_insert_id);
                    match step.value {
                        Value::List(chunk) => items.extend(chunk),
                        other => items.push(other),
                    }
                }
                Ok(Evaluated {
                    value: Value::List(items),
                    last_insert_id,
                })
            }
            PlanNode::Sum(nodes) => {
                let mut total = Value::Int(0);
                for node in nodes {
                    let step = self.eval(node, scope, conn, generators)?;
                    total = numeric_add(&total, &step.value)?;
                }
                Ok(Evaluated::plain(total))
            }
            PlanNode::Query(query) => self.run_read(query, scope, conn, generators),
            PlanNode::Execute(query) => self.run_write(query, scope, conn, generators),
            PlanNode::Reverse(inner) => {
                let mut result = self.eval(inner, scope, conn, generators)?;
                if let Value::List(items) = &mut result.value {
                    items.reverse();
                }
                Ok(result)
            }
            PlanNode::Unique(inner) => {
                let result = self.eval(inner, scope, conn, generators)?;
                let value = match result.value {
                    Value::List(mut items) => match items.len() {
                        0 => Value::Null,
                        1 => items.remove(0),
                        n => {
                            return Err(EngineError::Internal(format!(
                                "expected at most one record, got {n}"
                            )))
                        }
                    },
                    other => other,
                };
                Ok(Evaluated {
                    value,
                    last_insert_id: result.last_insert_id,
                })
            }
            PlanNode::Required(inner) => {
                let result = self.eval(inner, scope, conn, generators)?;
                if result.value.is_empty_like() {
                    return Err(EngineError::Validation {
                        code: "RequiredValueNotFound",
                        message: "a required value is missing".to_owned(),
                        meta: BTreeMap::new(),
                    });
                }
                Ok(result)
            }
            PlanNode::MapField { records, field } => {
                let result = self.eval(records, scope, conn, generators)?;
                let value = map_field(result.value, field)?;
                Ok(Evaluated {
                    value,
                    last_insert_id: result.last_insert_id,
                })
            }
            PlanNode::Join { parent, children } => {
                let result = self.eval(parent, scope, conn, generators)?;
                let value = self.join(result.value, children, scope, conn, generators)?;
                Ok(Evaluated {
                    value,
                    last_insert_id: result.last_insert_id,
                })
            }
            PlanNode::Transaction(inner) => {
                self.run_in_transaction(inner, scope, conn, generators)
            }
            PlanNode::DataMap {
                expr,
                structure,
                enums,
            } => {
                let result = self.eval(expr, scope, conn, generators)?;
                let value = mapper::map_result(result.value, structure, enums)?;
                Ok(Evaluated {
                    value,
                    last_insert_id: result.last_insert_id,
                })
            }
            PlanNode::Validate {
                expr,
                rules,
                context,
            } => {
                let result = self.eval(expr, scope, conn, generators)?;
                for rule in rules {
                    if !rule.is_satisfied(&result.value) {
                        return Err(EngineError::Validation {
                            code: rule.code(),
                            message: rule.describe_failure(&result.value),
                            meta: context.clone(),
                        });
                    }
                }
                Ok(result)
            }
            PlanNode::If {
                value,
                rule,
                then,
                otherwise,
            } => {
                let checked = self.eval(value, scope, conn, generators)?;
                if rule.is_satisfied(&checked.value) {
                    self.eval(then, scope, conn, generators)
                } else {
                    self.eval(otherwise, scope, conn, generators)
                }
            }
            PlanNode::Diff { from, to, fields } => {
                let from = self.eval(from, scope, conn, generators)?;
                let to = self.eval(to, scope, conn, generators)?;
                let value = diff_records(from.value, to.value, fields)?;
                Ok(Evaluated {
                    value,
                    last_insert_id: from.last_insert_id,
                })
            }
            PlanNode::Process { expr, operations } => {
                let result = self.eval(expr, scope, conn, generators)?;
                let value = process::process_records(result.value, operations)?;
                Ok(Evaluated {
                    value,
                    last_insert_id: result.last_insert_id,
                })
            }
            PlanNode::InitializeRecord { expr, fields } => {
                let result = self.eval(expr, scope, conn, generators)?;
                let mut record = BTreeMap::new();
                for (name, initializer) in fields {
                    let value = match initializer {
                        FieldInitializer::Value(expr) => {
                            evaluate_expr(expr, scope, generators)?
                        }
                        FieldInitializer::LastInsertId => result
                            .last_insert_id
                            .clone()
                            .map(Value::Text)
                            .unwrap_or(Value::Null),
                    };
                    record.insert(name.clone(), value);
                }
                Ok(Evaluated {
                    value: Value::Object(record),
                    last_insert_id: result.last_insert_id,
                })
            }
            PlanNode::MapRecord { expr, fields } => {
                let result = self.eval(expr, scope, conn, generators)?;
                let mut record = match result.value {
                    Value::Null => BTreeMap::new(),
                    Value::Object(record) => record,
                    other => {
                        return Err(EngineError::Internal(format!(
                            "mapRecord expects a record, got {}",
                            other.type_name()
                        )))
                    }
                };
                for (name, operation) in fields {
                    let current = record.get(name).cloned().unwrap_or(Value::Null);
                    let updated = apply_field_operation(
                        &current,
                        operation,
                        scope,
                        generators,
                    )?;
                    record.insert(name.clone(), updated);
                }
                Ok(Evaluated {
                    value: Value::Object(record),
                    last_insert_id: result.last_insert_id,
                })
            }
            PlanNode::Unit => Ok(Evaluated::plain(Value::Null)),
        }
    }

    fn run_read(
        &self,
        query: &DbQuery,
        scope: &Scope<'_>,
        conn: &dyn Queryable,
        generators: &GeneratorSnapshot,
    ) -> Result<Evaluated> {
        let raw = matches!(query, DbQuery::RawSql { .. });
        let statements = render_query(
            query,
            scope,
            generators,
            self.config.effective_max_bind_values(),
        )?;
        let mut records = Vec::new();
        let mut last_insert_id = None;
        for statement in &statements {
            let set = self.execute_statement(statement, conn, raw, |c, s| c.query_raw(s))?;
            last_insert_id = set.last_insert_id.clone().or(last_insert_id);
            if let Value::List(rows) = set.into_records() {
                records.extend(rows);
            }
        }
        Ok(Evaluated {
            value: Value::List(records),
            last_insert_id,
        })
    }

    fn run_write(
        &self,
        query: &DbQuery,
        scope: &Scope<'_>,
        conn: &dyn Queryable,
        generators: &GeneratorSnapshot,
    ) -> Result<Evaluated> {
        let raw = matches!(query, DbQuery::RawSql { .. });
        let statements = render_query(
            query,
            scope,
            generators,
            self.config.effective_max_bind_values(),
        )?;
        let mut affected: u64 = 0;
        for statement in &statements {
            affected += self.execute_statement(statement, conn, raw, |c, s| c.execute_raw(s))?;
        }
        Ok(Evaluated::plain(Value::Int(affected as i64)))
    }

    fn execute_statement<T>(
        &self,
        statement: &SqlStatement,
        conn: &dyn Queryable,
        raw: bool,
        run: impl Fn(&dyn Queryable, &SqlStatement) -> std::result::Result<T, DriverError>,
    ) -> Result<T> {
        with_query_event(statement, self.on_query.as_ref(), || run(conn, statement))
            .map_err(|err| EngineError::from_driver(err, raw))
    }

    fn join(
        &self,
        parent: Value,
        children: &[JoinChild],
        scope: &Scope<'_>,
        conn: &dyn Queryable,
        generators: &GeneratorSnapshot,
    ) -> Result<Value> {
        // A unique parent joins as a one-element list and is unwrapped at
        // the end.
        let (mut parents, single) = match parent {
            Value::Null => return Ok(Value::Null),
            Value::List(items) => (items, false),
            other => (vec![other], true),
        };

        for join in children {
            let child_records = match self.eval(&join.child, scope, conn, generators)?.value {
                Value::Null => Vec::new(),
                Value::List(items) => items,
                other => vec![other],
            };
            attach_children(&mut parents, join, child_records)?;
        }

        if single {
            Ok(parents.remove(0))
        } else {
            Ok(Value::List(parents))
        }
    }

    fn run_in_transaction(
        &self,
        inner: &PlanNode,
        scope: &Scope<'_>,
        conn: &dyn Queryable,
        generators: &GeneratorSnapshot,
    ) -> Result<Evaluated> {
        let Some(manager) = &self.transactions else {
            debug!("no transaction manager attached, running plan on the caller's connection");
            return self.eval(inner, scope, conn, generators);
        };

        let defaults = self.config.transaction_defaults;
        let id = manager.start_internal_transaction(TransactionOptions {
            max_wait: defaults.max_wait.or(Some(INTERNAL_TX_MAX_WAIT)),
            timeout: defaults.timeout.or(Some(INTERNAL_TX_TIMEOUT)),
            isolation_level: defaults.isolation_level,
        })?;
        let tx = TxConnection(manager.get_transaction(id, "plan evaluation")?);

        match self.eval(inner, scope, &tx, generators) {
            Ok(result) => {
                manager.commit_transaction(id)?;
                Ok(result)
            }
            Err(err) => {
                if let Err(rollback_err) = manager.rollback_transaction(id) {
                    debug!(tx = %id, error = %rollback_err, "rollback after plan failure failed");
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("config", &self.config)
            .field("generators", &self.generators)
            .field("placeholders", &self.placeholders.keys().collect::<Vec<_>>())
            .field("transactions", &self.transactions.is_some())
            .finish()
    }
}

/// Delegating wrapper so a transaction handle can stand in for a plain
/// connection during plan evaluation.
struct TxConnection(Arc<dyn DriverTransaction>);

impl Queryable for TxConnection {
    fn query_raw(&self, statement: &SqlStatement) -> std::result::Result<ResultSet, DriverError> {
        self.0.query_raw(statement)
    }

    fn execute_raw(&self, statement: &SqlStatement) -> std::result::Result<u64, DriverError> {
        self.0.execute_raw(statement)
    }
}

fn map_field(value: Value, field: &str) -> Result<Value> {
    let extract = |record: Value| -> Result<Value> {
        match record {
            Value::Object(mut map) => Ok(map.remove(field).unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => Err(EngineError::Internal(format!(
                "mapField expects records, got {}",
                other.type_name()
            ))),
        }
    };
    match value {
        Value::List(items) => items
            .into_iter()
            .map(extract)
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        other => extract(other),
    }
}

fn attach_children(
    parents: &mut [Value],
    join: &JoinChild,
    child_records: Vec<Value>,
) -> Result<()> {
    for parent in parents.iter_mut() {
        let Value::Object(parent_record) = parent else {
            return Err(EngineError::Internal(format!(
                "join expects parent records, got {}",
                parent.type_name()
            )));
        };
        let mut matches = Vec::new();
        for child in &child_records {
            let Value::Object(child_record) = child else {
                return Err(EngineError::Internal(format!(
                    "join expects child records, got {}",
                    child.type_name()
                )));
            };
            let is_match = join.on.iter().all(|(parent_field, child_field)| {
                parent_record.get(parent_field) == child_record.get(child_field)
            });
            if is_match {
                matches.push(child.clone());
                if join.is_relation_unique {
                    break;
                }
            }
        }
        let attached = if join.is_relation_unique {
            matches.into_iter().next().unwrap_or(Value::Null)
        } else {
            Value::List(matches)
        };
        parent_record.insert(join.parent_field.clone(), attached);
    }
    Ok(())
}

fn diff_records(from: Value, to: Value, fields: &[String]) -> Result<Value> {
    let as_list = |value: Value| match value {
        Value::Null => Vec::new(),
        Value::List(items) => items,
        other => vec![other],
    };
    let key_of = |record: &Value| -> Result<String> {
        match record {
            Value::Object(map) if !fields.is_empty() => {
                Ok(process::record_key_of(map, fields))
            }
            other => serde_json::to_string(other)
                .map_err(|e| EngineError::Internal(format!("diff key serialization: {e}"))),
        }
    };

    let to_keys = as_list(to)
        .iter()
        .map(key_of)
        .collect::<Result<std::collections::HashSet<_>>>()?;
    let mut kept = Vec::new();
    for record in as_list(from) {
        if !to_keys.contains(&key_of(&record)?) {
            kept.push(record);
        }
    }
    Ok(Value::List(kept))
}

fn apply_field_operation(
    current: &Value,
    operation: &FieldOperation,
    scope: &Scope<'_>,
    generators: &GeneratorSnapshot,
) -> Result<Value> {
    match operation {
        FieldOperation::Set(expr) => evaluate_expr(expr, scope, generators),
        FieldOperation::Add(expr)
        | FieldOperation::Subtract(expr)
        | FieldOperation::Multiply(expr)
        | FieldOperation::Divide(expr) => {
            // Arithmetic over a null column propagates null, matching how
            // the database itself would evaluate the update.
            if matches!(current, Value::Null) {
                return Ok(Value::Null);
            }
            let operand = evaluate_expr(expr, scope, generators)?;
            match operation {
                FieldOperation::Add(_) => numeric_add(current, &operand),
                FieldOperation::Subtract(_) => {
                    numeric_binop(current, &operand, i64::checked_sub, |a, b| a - b)
                }
                FieldOperation::Multiply(_) => {
                    numeric_binop(current, &operand, i64::checked_mul, |a, b| a * b)
                }
                FieldOperation::Divide(_) => {
                    let (a, b) = (as_f64(current)?, as_f64(&operand)?);
                    if b == 0.0 {
                        Ok(Value::Null)
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
                FieldOperation::Set(_) => unreachable!("handled above"),
            }
        }
    }
}

fn numeric_add(a: &Value, b: &Value) -> Result<Value> {
    numeric_binop(a, b, i64::checked_add, |a, b| a + b)
}

/// Integer-preserving arithmetic: integer operands stay integers (BigInt
/// when either side is one), anything involving a float goes to f64.
fn numeric_binop(
    a: &Value,
    b: &Value,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => int_op(*x, *y)
            .map(Value::Int)
            .ok_or_else(|| EngineError::Internal("integer overflow".to_owned())),
        (Value::BigInt(x), Value::Int(y) | Value::BigInt(y))
        | (Value::Int(x), Value::BigInt(y)) => int_op(*x, *y)
            .map(Value::BigInt)
            .ok_or_else(|| EngineError::Internal("integer overflow".to_owned())),
        _ => Ok(Value::Float(float_op(as_f64(a)?, as_f64(b)?))),
    }
}

fn as_f64(value: &Value) -> Result<f64> {
    match value {
        Value::Int(i) | Value::BigInt(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(EngineError::Internal(format!(
            "expected a number, got {}",
            other.type_name()
        ))),
    }
}
