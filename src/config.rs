//! Engine configuration: target database flavor, placeholder limits, and
//! default transaction timeouts.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// Database flavor the rendered SQL is destined for.
///
/// The engine itself is dialect-agnostic; the provider only determines the
/// bind-parameter limit used when chunking oversized statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// PostgreSQL wire protocol.
    #[serde(alias = "postgresql")]
    Postgres,
    /// CockroachDB (PostgreSQL-compatible).
    Cockroachdb,
    /// MySQL and compatible forks.
    Mysql,
    /// SQLite.
    Sqlite,
    /// Microsoft SQL Server.
    Sqlserver,
}

impl Provider {
    /// Maximum number of bind parameters a single statement may carry.
    pub fn max_bind_values(self) -> usize {
        match self {
            Provider::Postgres | Provider::Cockroachdb => 32766,
            Provider::Mysql => 65535,
            Provider::Sqlite => 999,
            Provider::Sqlserver => 2098,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::Postgres => "postgres",
            Provider::Cockroachdb => "cockroachdb",
            Provider::Mysql => "mysql",
            Provider::Sqlite => "sqlite",
            Provider::Sqlserver => "sqlserver",
        };
        f.write_str(name)
    }
}

/// Transaction isolation level requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// READ UNCOMMITTED.
    ReadUncommitted,
    /// READ COMMITTED.
    ReadCommitted,
    /// REPEATABLE READ.
    RepeatableRead,
    /// SERIALIZABLE.
    Serializable,
    /// SNAPSHOT. Only exists on databases this engine cannot reach;
    /// always rejected during option validation.
    Snapshot,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::Snapshot => "SNAPSHOT",
        };
        f.write_str(name)
    }
}

/// Per-transaction options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// How long `start_transaction` may wait for the driver to hand out a
    /// transaction handle before giving up.
    pub max_wait: Option<Duration>,
    /// How long the transaction may run after a successful start before it
    /// is timed out and rolled back.
    pub timeout: Option<Duration>,
    /// Requested isolation level, if any.
    pub isolation_level: Option<IsolationLevel>,
}

/// Engine-level configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Target database flavor, used to derive the bind-parameter limit.
    pub provider: Option<Provider>,
    /// Explicit bind-parameter limit. Takes precedence over the
    /// provider-derived default when set.
    pub max_bind_values: Option<usize>,
    /// Default options applied by `start_transaction` when the caller
    /// supplies none.
    pub transaction_defaults: TransactionOptions,
}

impl EngineConfig {
    /// Effective bind-parameter limit for statement chunking, if any.
    pub fn effective_max_bind_values(&self) -> Option<usize> {
        self.max_bind_values
            .or_else(|| self.provider.map(Provider::max_bind_values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_limit_overrides_provider_table() {
        let config = EngineConfig {
            provider: Some(Provider::Sqlite),
            max_bind_values: Some(5),
            ..EngineConfig::default()
        };
        assert_eq!(config.effective_max_bind_values(), Some(5));
    }

    #[test]
    fn provider_aliases_parse() {
        let provider: Provider = serde_json::from_str("\"postgresql\"").unwrap();
        assert_eq!(provider, Provider::Postgres);
        assert_eq!(provider.max_bind_values(), 32766);
    }
}
