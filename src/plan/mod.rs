//! The compiled query-plan algebra.
//!
//! Plans arrive from an external query compiler as a stable, versioned
//! JSON format. Every type in this module is a closed tagged union:
//! unrecognized tags are a deserialization error, never silently ignored,
//! so version skew between compiler and engine fails loudly.

/// Plan-level literal expressions: scalars, placeholders, generator calls.
pub mod expr;

/// The plan node tree interpreted by the evaluator.
pub mod node;

/// Declarative SQL query descriptions (raw and templated).
pub mod query;

/// Validation rules over row counts.
pub mod rules;

/// Declarative result shapes consumed by the data mapper.
pub mod shape;

pub use expr::PlanExpr;
pub use node::{Binding, FieldInitializer, FieldOperation, JoinChild, PlanNode};
pub use query::{DbQuery, Fragment, PlaceholderFormat};
pub use rules::DataRule;
pub use shape::{Arity, EnumTable, FieldType, ResultShape, ScalarKind};
