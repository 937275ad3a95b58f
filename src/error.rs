//! User-facing error taxonomy.
//!
//! Every fallible engine operation returns [`EngineError`]. Each variant
//! carries a stable machine-readable code (see [`EngineError::code`]) and
//! structured metadata so callers can react programmatically instead of
//! parsing message strings.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::driver::{DriverError, DriverErrorKind};
use crate::txn::TransactionError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error produced by the query-plan execution core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The plan tree violated its structural contract. Indicates version
    /// skew between the plan compiler and this engine, never user input.
    #[error("malformed query plan: {0}")]
    Plan(#[from] PlanError),

    /// SQL template rendering failed.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Raw row data could not be reshaped into the declared result type.
    #[error(transparent)]
    Mapper(#[from] MapperError),

    /// A plan-declared validation rule failed.
    #[error("{message}")]
    Validation {
        /// Stable rule-failure code.
        code: &'static str,
        /// Human-readable description.
        message: String,
        /// Structured context declared by the plan (model/relation names).
        meta: BTreeMap<String, serde_json::Value>,
    },

    /// A mapped database failure.
    #[error("{message}")]
    Database {
        /// Stable failure code derived from the driver error kind.
        code: &'static str,
        /// Driver-supplied message.
        message: String,
        /// Structured detail (constraint, table, column names).
        meta: BTreeMap<String, serde_json::Value>,
    },

    /// A failure raised while executing a raw SQL node, carrying the
    /// driver's own classification instead of the mapped taxonomy.
    #[error("raw query failed: {message}")]
    RawQuery {
        /// Driver-native or kind-derived code.
        code: String,
        /// Driver-supplied message.
        message: String,
    },

    /// A driver failure without a dedicated mapping, surfaced unchanged.
    #[error(transparent)]
    Driver(DriverError),

    /// Transaction lifecycle failure.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// An invariant the plan compiler guarantees was broken at runtime.
    /// Not a user-facing condition; indicates a bug upstream.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns the stable machine-readable code for this error.
    pub fn code(&self) -> &str {
        match self {
            EngineError::Plan(_) => "MalformedQueryPlan",
            EngineError::Render(err) => err.code(),
            EngineError::Mapper(_) => "DataMappingFailed",
            EngineError::Validation { code, .. } => code,
            EngineError::Database { code, .. } => code,
            EngineError::RawQuery { .. } => "RawQueryFailed",
            EngineError::Driver(_) => "DriverError",
            EngineError::Transaction(err) => err.code(),
            EngineError::Internal(_) => "InternalError",
        }
    }

    /// Translates a driver failure into the user-facing taxonomy.
    ///
    /// Kinds with an explicit mapping become [`EngineError::Database`]
    /// with structured metadata; everything else passes through unchanged
    /// as [`EngineError::Driver`]. Failures from raw SQL nodes instead
    /// surface as [`EngineError::RawQuery`] carrying the driver's own
    /// classification.
    pub fn from_driver(err: DriverError, raw: bool) -> EngineError {
        if raw {
            let code = match &err.kind {
                DriverErrorKind::Other { code: Some(code) } => code.clone(),
                kind => kind.to_string(),
            };
            return EngineError::RawQuery {
                code,
                message: err.message,
            };
        }

        let mut meta = BTreeMap::new();
        let code = match &err.kind {
            DriverErrorKind::AuthenticationFailed { user } => {
                meta.insert("user".into(), user.as_str().into());
                "AuthenticationFailed"
            }
            DriverErrorKind::DatabaseDoesNotExist { database } => {
                meta.insert("database".into(), database.as_str().into());
                "DatabaseDoesNotExist"
            }
            DriverErrorKind::DatabaseAccessDenied { database } => {
                meta.insert("database".into(), database.as_str().into());
                "DatabaseAccessDenied"
            }
            DriverErrorKind::DatabaseNotReachable { host, port } => {
                if let Some(host) = host {
                    meta.insert("host".into(), host.as_str().into());
                }
                if let Some(port) = port {
                    meta.insert("port".into(), (*port).into());
                }
                "DatabaseNotReachable"
            }
            DriverErrorKind::UniqueConstraintViolation { constraint } => {
                if let Some(constraint) = constraint {
                    meta.insert("constraint".into(), constraint.as_str().into());
                }
                "UniqueConstraintViolation"
            }
            DriverErrorKind::NullConstraintViolation { constraint } => {
                if let Some(constraint) = constraint {
                    meta.insert("constraint".into(), constraint.as_str().into());
                }
                "NullConstraintViolation"
            }
            DriverErrorKind::ForeignKeyConstraintViolation { constraint } => {
                if let Some(constraint) = constraint {
                    meta.insert("constraint".into(), constraint.as_str().into());
                }
                "ForeignKeyConstraintViolation"
            }
            DriverErrorKind::TableDoesNotExist { table } => {
                if let Some(table) = table {
                    meta.insert("table".into(), table.as_str().into());
                }
                "TableDoesNotExist"
            }
            DriverErrorKind::ColumnNotFound { column } => {
                if let Some(column) = column {
                    meta.insert("column".into(), column.as_str().into());
                }
                "ColumnNotFound"
            }
            DriverErrorKind::ValueOutOfRange { cause } => {
                meta.insert("cause".into(), cause.as_str().into());
                "ValueOutOfRange"
            }
            DriverErrorKind::SocketTimeout => "SocketTimeout",
            DriverErrorKind::TooManyConnections { cause } => {
                meta.insert("cause".into(), cause.as_str().into());
                "TooManyConnections"
            }
            DriverErrorKind::InvalidIsolationLevel { level } => {
                meta.insert("level".into(), level.as_str().into());
                "InvalidIsolationLevel"
            }
            DriverErrorKind::TransactionAlreadyClosed { cause } => {
                meta.insert("cause".into(), cause.as_str().into());
                "TransactionAlreadyClosed"
            }
            DriverErrorKind::Other { .. } => return EngineError::Driver(err),
        };

        EngineError::Database {
            code,
            message: err.message,
            meta,
        }
    }
}

/// Structural violations of the plan contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// A template's fragments consume more parameters than were supplied.
    #[error("fragments attempt to read over {supplied} parameters")]
    FragmentParamMismatch {
        /// Number of parameters supplied by the plan.
        supplied: usize,
    },
    /// A tuple-list fragment received something other than a list of lists.
    #[error("tuple list expected, got {got}")]
    TupleListExpected {
        /// Runtime type of the offending value.
        got: &'static str,
    },
    /// A tuple-list fragment received an empty list.
    #[error("tuple list cannot be empty")]
    EmptyTupleList,
    /// A placeholder referenced a name absent from the scope chain.
    #[error("missing value for query variable '{name}'")]
    UnboundPlaceholder {
        /// The unresolved name.
        name: String,
    },
    /// A generator call referenced an unregistered generator.
    #[error("unknown generator '{name}'")]
    UnknownGenerator {
        /// The unresolved generator name.
        name: String,
    },
    /// A plan-level literal could not be decoded.
    #[error("invalid plan literal: {0}")]
    InvalidLiteral(String),
}

/// SQL template rendering failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// The flattened parameter count exceeds the driver's placeholder
    /// limit even after chunking.
    #[error("query exceeds the {limit} bind parameters supported by the database (got {count})")]
    ParameterLimitExceeded {
        /// Driver placeholder limit.
        limit: usize,
        /// Flattened parameter count of the offending statement.
        count: usize,
    },
}

impl RenderError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RenderError::ParameterLimitExceeded { .. } => "ParameterLimitExceeded",
        }
    }
}

/// Data mapping failures: the raw row did not conform to the declared
/// result shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapperError {
    /// A declared field was absent from the source row.
    #[error("missing data field '{field}'")]
    MissingField {
        /// The declared column name.
        field: String,
    },
    /// A value could not be coerced to the declared scalar kind.
    #[error("expected {expected} in column '{column}', got {got}: {value}")]
    TypeMismatch {
        /// The declared column name.
        column: String,
        /// The declared scalar kind.
        expected: &'static str,
        /// Runtime type of the raw value.
        got: &'static str,
        /// Rendering of the raw value for diagnostics.
        value: String,
    },
    /// An enum table referenced by the plan does not exist.
    #[error("unknown enum '{name}'")]
    UnknownEnum {
        /// The enum name.
        name: String,
    },
    /// A raw value was not a member of its declared enum.
    #[error("value '{value}' not found in enum '{name}'")]
    UnknownEnumValue {
        /// The enum name.
        name: String,
        /// The offending raw value.
        value: String,
    },
    /// A nested relation arrived as a string that is not valid JSON.
    #[error("expected an array or object, got a string that is not valid JSON: {cause}")]
    InvalidJson {
        /// Parser diagnostic.
        cause: String,
    },
    /// The raw value had a shape no mapping rule covers.
    #[error("expected {expected}, got {got}")]
    UnexpectedShape {
        /// What the result shape demanded.
        expected: &'static str,
        /// Runtime type of the raw value.
        got: &'static str,
    },
    /// The column's declared type is not readable through this engine.
    #[error("column '{column}' has an unsupported type and cannot be read")]
    UnsupportedColumn {
        /// The declared column name.
        column: String,
    },
}
