//! Driver adapter boundary: the abstract interfaces a database driver must
//! implement for the engine to execute rendered SQL, plus the statement and
//! result-set types that cross it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::info_span;

use crate::config::IsolationLevel;
use crate::value::Value;

/// Wire-level classification of a bind argument, derived purely from the
/// runtime shape of the value so drivers can bind without re-inspecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Textual value.
    Text,
    /// Integer or floating point value.
    Numeric,
    /// Boolean value.
    Boolean,
    /// Array value.
    Array,
    /// Binary value.
    Bytes,
    /// Anything the classification does not cover (nulls, records).
    Unknown,
}

impl ArgType {
    fn classify(value: &Value) -> ArgType {
        match value {
            Value::Text(_) | Value::DateTime(_) | Value::Json(_) | Value::Decimal(_) => {
                ArgType::Text
            }
            Value::Int(_) | Value::Float(_) | Value::BigInt(_) => ArgType::Numeric,
            Value::Bool(_) => ArgType::Boolean,
            Value::List(_) => ArgType::Array,
            Value::Bytes(_) => ArgType::Bytes,
            Value::Null | Value::Object(_) => ArgType::Unknown,
        }
    }
}

/// A single parameterized SQL statement ready to be sent to a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    /// SQL text with dialect-appropriate placeholders.
    pub sql: String,
    /// Positional bind arguments.
    pub args: Vec<Value>,
    /// Per-argument wire-type tags, parallel to `args`.
    pub arg_types: Vec<ArgType>,
}

impl SqlStatement {
    /// Builds a statement, classifying each argument's wire type.
    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> Self {
        let arg_types = args.iter().map(ArgType::classify).collect();
        Self {
            sql: sql.into(),
            args,
            arg_types,
        }
    }
}

/// Tabular result of a read query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Column names in projection order.
    pub column_names: Vec<String>,
    /// Driver-reported column type names, parallel to `column_names`.
    /// Informational; result shaping relies on declared types instead.
    pub column_types: Vec<String>,
    /// Row values, each parallel to `column_names`.
    pub rows: Vec<Vec<Value>>,
    /// Identifier of the last inserted row, when the driver reports one.
    pub last_insert_id: Option<String>,
}

impl ResultSet {
    /// Reshapes the tabular result into a list of records keyed by column
    /// name, the form the interpreter operates on.
    pub fn into_records(self) -> Value {
        let columns = self.column_names;
        let records = self
            .rows
            .into_iter()
            .map(|row| {
                let record = columns.iter().cloned().zip(row).collect();
                Value::Object(record)
            })
            .collect();
        Value::List(records)
    }
}

/// Read/write SQL sink implemented by driver adapters.
pub trait Queryable: Send + Sync {
    /// Executes a read statement and returns the full result set.
    fn query_raw(&self, statement: &SqlStatement) -> Result<ResultSet, DriverError>;

    /// Executes a write statement and returns the affected row count.
    fn execute_raw(&self, statement: &SqlStatement) -> Result<u64, DriverError>;
}

/// A driver-level transaction handle.
pub trait DriverTransaction: Queryable + std::fmt::Debug {
    /// Commits the transaction at the driver level.
    fn commit(&self) -> Result<(), DriverError>;

    /// Rolls the transaction back at the driver level.
    fn rollback(&self) -> Result<(), DriverError>;

    /// Whether the driver manages transaction boundaries implicitly, in
    /// which case the manager must not issue explicit COMMIT/ROLLBACK
    /// statements ("phantom queries").
    fn uses_phantom_queries(&self) -> bool {
        false
    }
}

/// Connection factory for driver-level transactions.
pub trait DriverAdapter: Send + Sync {
    /// Begins a driver-level transaction, optionally at a specific
    /// isolation level. May block while a connection is acquired.
    fn start_transaction(
        &self,
        isolation_level: Option<IsolationLevel>,
    ) -> Result<Box<dyn DriverTransaction>, DriverError>;
}

/// Closed set of database failure kinds reported by drivers.
///
/// The engine translates mapped kinds into its user-facing taxonomy;
/// `Other` passes through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The server rejected the supplied credentials.
    AuthenticationFailed {
        /// User the connection attempted to authenticate as.
        user: String,
    },
    /// The target database does not exist.
    DatabaseDoesNotExist {
        /// Database name.
        database: String,
    },
    /// The authenticated user may not access the target database.
    DatabaseAccessDenied {
        /// Database name.
        database: String,
    },
    /// The database host could not be reached.
    DatabaseNotReachable {
        /// Host name or address.
        host: Option<String>,
        /// TCP port.
        port: Option<u16>,
    },
    /// A unique constraint rejected the write.
    UniqueConstraintViolation {
        /// Constraint or index name, when the driver reports it.
        constraint: Option<String>,
    },
    /// A NOT NULL constraint rejected the write.
    NullConstraintViolation {
        /// Constraint or column name, when the driver reports it.
        constraint: Option<String>,
    },
    /// A foreign key constraint rejected the write.
    ForeignKeyConstraintViolation {
        /// Constraint name, when the driver reports it.
        constraint: Option<String>,
    },
    /// The referenced table does not exist.
    TableDoesNotExist {
        /// Table name.
        table: Option<String>,
    },
    /// The referenced column does not exist.
    ColumnNotFound {
        /// Column name.
        column: Option<String>,
    },
    /// A value was out of range for its column type.
    ValueOutOfRange {
        /// Driver-supplied detail.
        cause: String,
    },
    /// The database closed the connection or the socket timed out.
    SocketTimeout,
    /// The connection pool is exhausted.
    TooManyConnections {
        /// Driver-supplied detail.
        cause: String,
    },
    /// The driver rejected the requested isolation level.
    InvalidIsolationLevel {
        /// The rejected level.
        level: String,
    },
    /// The underlying transaction was already closed by the driver.
    TransactionAlreadyClosed {
        /// Driver-supplied detail.
        cause: String,
    },
    /// Any failure without a dedicated mapping. Surfaced unchanged.
    Other {
        /// Driver- or database-native error code, when available.
        code: Option<String>,
    },
}

/// Error raised by a driver adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    /// Failure classification.
    pub kind: DriverErrorKind,
    /// Driver-supplied message.
    pub message: String,
}

impl DriverError {
    /// Builds a driver error from a kind and message.
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Observation of one executed statement, delivered to the optional
/// `on_query` hook for logging and telemetry.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    /// Wall-clock time the statement was issued.
    pub timestamp: SystemTime,
    /// SQL text.
    pub sql: String,
    /// Positional bind arguments.
    pub params: Vec<Value>,
    /// Time spent in the driver.
    pub duration: Duration,
}

/// Shared handle to a query observer callback.
pub type QueryObserver = Arc<dyn Fn(&QueryEvent) + Send + Sync>;

/// Runs a driver call inside a query span, timing it and notifying the
/// observer on completion. Correctness does not depend on the observer.
pub(crate) fn with_query_event<T>(
    statement: &SqlStatement,
    observer: Option<&QueryObserver>,
    execute: impl FnOnce() -> Result<T, DriverError>,
) -> Result<T, DriverError> {
    let span = info_span!("db_query", db.statement = %statement.sql);
    let _guard = span.enter();

    let timestamp = SystemTime::now();
    let started = Instant::now();
    let result = execute();

    if let Some(observer) = observer {
        observer(&QueryEvent {
            timestamp,
            sql: statement.sql.clone(),
            params: statement.args.clone(),
            duration: started.elapsed(),
        });
    }
    result
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverErrorKind::AuthenticationFailed { .. } => "AuthenticationFailed",
            DriverErrorKind::DatabaseDoesNotExist { .. } => "DatabaseDoesNotExist",
            DriverErrorKind::DatabaseAccessDenied { .. } => "DatabaseAccessDenied",
            DriverErrorKind::DatabaseNotReachable { .. } => "DatabaseNotReachable",
            DriverErrorKind::UniqueConstraintViolation { .. } => "UniqueConstraintViolation",
            DriverErrorKind::NullConstraintViolation { .. } => "NullConstraintViolation",
            DriverErrorKind::ForeignKeyConstraintViolation { .. } => {
                "ForeignKeyConstraintViolation"
            }
            DriverErrorKind::TableDoesNotExist { .. } => "TableDoesNotExist",
            DriverErrorKind::ColumnNotFound { .. } => "ColumnNotFound",
            DriverErrorKind::ValueOutOfRange { .. } => "ValueOutOfRange",
            DriverErrorKind::SocketTimeout => "SocketTimeout",
            DriverErrorKind::TooManyConnections { .. } => "TooManyConnections",
            DriverErrorKind::InvalidIsolationLevel { .. } => "InvalidIsolationLevel",
            DriverErrorKind::TransactionAlreadyClosed { .. } => "TransactionAlreadyClosed",
            DriverErrorKind::Other { .. } => "DriverError",
        })
    }
}
