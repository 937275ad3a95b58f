//! Vesper: a query-plan execution core for database clients.
//!
//! A client-side query compiler produces plans as JSON trees; this crate
//! deserializes them, renders their SQL templates against a driver
//! adapter, reshapes the raw rows into typed results, and manages
//! interactive transaction lifecycles with start and execution timeouts.

#![warn(missing_docs)]

pub mod config;
pub mod driver;
pub mod error;
pub mod exec;
pub mod plan;
pub mod txn;
pub mod value;

pub use config::{EngineConfig, IsolationLevel, Provider, TransactionOptions};
pub use driver::{
    DriverAdapter, DriverError, DriverErrorKind, DriverTransaction, QueryEvent, QueryObserver,
    Queryable, ResultSet, SqlStatement,
};
pub use error::{EngineError, Result};
pub use exec::{GeneratorRegistry, Interpreter, ValueGenerator};
pub use plan::PlanNode;
pub use txn::{TransactionError, TransactionManager};
pub use value::Value;
