//! Interactive transaction lifecycle management.
//!
//! Transactions started through [`TransactionManager`] are tracked in a
//! registry keyed by UUID. Each carries two clocks: a start timeout
//! bounding how long the driver may take to hand out a transaction
//! handle, and an execution timeout bounding how long the transaction may
//! stay open afterwards. Expired transactions are rolled back either on
//! first access past the deadline or by a background reaper thread,
//! whichever comes first.
//!
//! Closing is a two-phase affair: the slot is first marked as closing
//! while COMMIT/ROLLBACK runs without the registry lock held, then
//! removed and remembered in a bounded ring of recently closed
//! transactions so late callers get a precise error instead of a bare
//! "not found".

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{IsolationLevel, TransactionOptions};
use crate::driver::{
    with_query_event, DriverAdapter, DriverError, DriverTransaction, QueryObserver, SqlStatement,
};
use crate::error::Result;

/// How many recently closed transactions are remembered for diagnostics.
const MAX_CLOSED_TRANSACTIONS: usize = 100;

/// How often the reaper thread sweeps for expired transactions.
const REAPER_INTERVAL: Duration = Duration::from_millis(100);

/// Transaction lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// The transaction id is not and was never known to this manager.
    #[error("transaction not found: {id}")]
    NotFound {
        /// The unknown id.
        id: Uuid,
    },
    /// The transaction was already committed.
    #[error("transaction {id} was already committed")]
    AlreadyCommitted {
        /// The closed transaction's id.
        id: Uuid,
    },
    /// The transaction was already rolled back.
    #[error("transaction {id} was already rolled back")]
    AlreadyRolledBack {
        /// The closed transaction's id.
        id: Uuid,
    },
    /// The transaction exceeded its execution timeout and was rolled
    /// back.
    #[error(
        "transaction {id} timed out: allotted {timeout:?}, was open for {elapsed:?}"
    )]
    ExecutionTimeout {
        /// The expired transaction's id.
        id: Uuid,
        /// The configured execution timeout.
        timeout: Duration,
        /// How long the transaction had been open when it was reaped.
        elapsed: Duration,
    },
    /// The driver did not hand out a transaction handle within the start
    /// timeout.
    #[error("transaction could not be started within {max_wait:?}")]
    StartTimeout {
        /// The configured start timeout.
        max_wait: Duration,
    },
    /// The requested isolation level is not supported here.
    #[error("isolation level {level} is not supported")]
    UnsupportedIsolationLevel {
        /// The rejected level.
        level: String,
    },
    /// Transaction options were incomplete after applying defaults.
    #[error("transaction options are missing {missing}")]
    MissingOption {
        /// Name of the absent option.
        missing: &'static str,
    },
}

impl TransactionError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TransactionError::NotFound { .. } => "TransactionNotFound",
            TransactionError::AlreadyCommitted { .. } => "TransactionAlreadyCommitted",
            TransactionError::AlreadyRolledBack { .. } => "TransactionAlreadyRolledBack",
            TransactionError::ExecutionTimeout { .. } => "TransactionTimedOut",
            TransactionError::StartTimeout { .. } => "TransactionStartTimeout",
            TransactionError::UnsupportedIsolationLevel { .. } => "UnsupportedIsolationLevel",
            TransactionError::MissingOption { .. } => "InvalidTransactionOptions",
        }
    }
}

/// Why a transaction left the active table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Committed,
    RolledBack,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Running,
    Closing(CloseReason),
}

struct TxSlot {
    status: TxStatus,
    started_at: Instant,
    timeout: Duration,
    deadline: Instant,
    handle: Arc<dyn DriverTransaction>,
}

struct ClosedTx {
    reason: CloseReason,
    timeout: Duration,
    open_for: Duration,
}

#[derive(Default)]
struct TxTable {
    active: HashMap<Uuid, TxSlot>,
    closed: VecDeque<(Uuid, ClosedTx)>,
}

impl TxTable {
    fn remember_closed(&mut self, id: Uuid, closed: ClosedTx) {
        if self.closed.len() >= MAX_CLOSED_TRANSACTIONS {
            self.closed.pop_front();
        }
        self.closed.push_back((id, closed));
    }

    fn closed_error(&self, id: Uuid) -> TransactionError {
        for (closed_id, closed) in self.closed.iter().rev() {
            if *closed_id == id {
                return match closed.reason {
                    CloseReason::Committed => TransactionError::AlreadyCommitted { id },
                    CloseReason::RolledBack => TransactionError::AlreadyRolledBack { id },
                    CloseReason::TimedOut => TransactionError::ExecutionTimeout {
                        id,
                        timeout: closed.timeout,
                        elapsed: closed.open_for,
                    },
                };
            }
        }
        TransactionError::NotFound { id }
    }
}

struct Inner {
    adapter: Arc<dyn DriverAdapter>,
    defaults: TransactionOptions,
    observer: Option<QueryObserver>,
    table: Mutex<TxTable>,
    closing_done: Condvar,
}

/// Registry and lifecycle driver for interactive transactions.
pub struct TransactionManager {
    inner: Arc<Inner>,
}

impl TransactionManager {
    /// Creates a manager over a driver adapter and spawns its reaper
    /// thread. The reaper holds only a weak reference and exits once the
    /// manager is dropped.
    pub fn new(
        adapter: Arc<dyn DriverAdapter>,
        defaults: TransactionOptions,
        observer: Option<QueryObserver>,
    ) -> Self {
        let inner = Arc::new(Inner {
            adapter,
            defaults,
            observer,
            table: Mutex::new(TxTable::default()),
            closing_done: Condvar::new(),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name("tx-reaper".to_owned())
            .spawn(move || reaper_loop(weak))
            .ok();

        TransactionManager { inner }
    }

    /// Starts a transaction and registers it under a fresh UUID.
    ///
    /// Caller-supplied options override the configured defaults field by
    /// field. The driver gets at most `max_wait` to hand out a handle; a
    /// handle that arrives after the deadline is rolled back in the
    /// background rather than leaked.
    pub fn start_transaction(&self, options: TransactionOptions) -> Result<Uuid> {
        let max_wait = options
            .max_wait
            .or(self.inner.defaults.max_wait)
            .ok_or(TransactionError::MissingOption {
                missing: "maxWait",
            })?;
        let timeout = options
            .timeout
            .or(self.inner.defaults.timeout)
            .ok_or(TransactionError::MissingOption { missing: "timeout" })?;
        let isolation_level = options
            .isolation_level
            .or(self.inner.defaults.isolation_level);
        if isolation_level == Some(IsolationLevel::Snapshot) {
            return Err(TransactionError::UnsupportedIsolationLevel {
                level: IsolationLevel::Snapshot.to_string(),
            }
            .into());
        }

        let handle = self.start_with_deadline(isolation_level, max_wait)?;

        let id = Uuid::new_v4();
        let now = Instant::now();
        let slot = TxSlot {
            status: TxStatus::Running,
            started_at: now,
            timeout,
            deadline: now + timeout,
            handle: Arc::from(handle),
        };
        self.inner.table.lock().active.insert(id, slot);
        debug!(tx = %id, ?timeout, "transaction started");
        Ok(id)
    }

    /// Starts a transaction on behalf of a plan's `transaction` node.
    /// Identical lifecycle to [`Self::start_transaction`]; kept separate
    /// so interactive and plan-internal transactions are distinguishable
    /// in logs.
    pub fn start_internal_transaction(&self, options: TransactionOptions) -> Result<Uuid> {
        let id = self.start_transaction(options)?;
        debug!(tx = %id, "transaction is plan-internal");
        Ok(id)
    }

    /// Races the driver's transaction start against `max_wait` on a
    /// separate thread. A start that completes after the race was lost is
    /// rolled back on that thread.
    fn start_with_deadline(
        &self,
        isolation_level: Option<IsolationLevel>,
        max_wait: Duration,
    ) -> Result<Box<dyn DriverTransaction>> {
        let (sender, receiver) =
            mpsc::channel::<std::result::Result<Box<dyn DriverTransaction>, DriverError>>();
        let adapter = Arc::clone(&self.inner.adapter);
        std::thread::Builder::new()
            .name("tx-start".to_owned())
            .spawn(move || {
                let started = adapter.start_transaction(isolation_level);
                if let Err(mpsc::SendError(returned)) = sender.send(started) {
                    // The waiter gave up; do not leak the connection.
                    if let Ok(handle) = returned {
                        if let Err(err) = handle.rollback() {
                            debug!(error = %err, "rollback of orphaned transaction failed");
                        }
                    }
                }
            })
            .map_err(|e| {
                crate::error::EngineError::Internal(format!("failed to spawn start thread: {e}"))
            })?;

        match receiver.recv_timeout(max_wait) {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(err)) => Err(crate::error::EngineError::from_driver(err, false)),
            Err(_) => {
                warn!(?max_wait, "transaction start timed out");
                Err(TransactionError::StartTimeout { max_wait }.into())
            }
        }
    }

    /// Returns the driver handle for an active transaction. `operation`
    /// names the caller's intent for log correlation.
    ///
    /// Waits out an in-flight close, then reports the precise closed
    /// state. A transaction found past its deadline is rolled back here
    /// and reported as timed out.
    pub fn get_transaction(
        &self,
        id: Uuid,
        operation: &str,
    ) -> Result<Arc<dyn DriverTransaction>> {
        debug!(tx = %id, operation, "resolving transaction handle");
        let mut table = self.inner.table.lock();
        loop {
            match table.active.get(&id) {
                None => return Err(table.closed_error(id).into()),
                Some(slot) => match slot.status {
                    TxStatus::Closing(_) => {
                        self.inner.closing_done.wait(&mut table);
                    }
                    TxStatus::Running => {
                        if Instant::now() >= slot.deadline {
                            drop(table);
                            // The rollback is best effort; the caller must
                            // see the timeout either way.
                            if let Err(close_err) = self.close(id, CloseReason::TimedOut) {
                                warn!(tx = %id, error = %close_err, "rollback of timed-out transaction failed");
                            }
                            let table = self.inner.table.lock();
                            return Err(table.closed_error(id).into());
                        }
                        return Ok(Arc::clone(&slot.handle));
                    }
                },
            }
        }
    }

    /// Commits an active transaction.
    pub fn commit_transaction(&self, id: Uuid) -> Result<()> {
        self.expect_active(id, "commit")?;
        self.close(id, CloseReason::Committed)
    }

    /// Rolls back an active transaction.
    pub fn rollback_transaction(&self, id: Uuid) -> Result<()> {
        self.expect_active(id, "rollback")?;
        self.close(id, CloseReason::RolledBack)
    }

    /// Rolls back every active transaction. Used on shutdown and when the
    /// owning session disconnects.
    pub fn cancel_all_transactions(&self) {
        let ids: Vec<Uuid> = self.inner.table.lock().active.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.close(id, CloseReason::RolledBack) {
                warn!(tx = %id, error = %err, "cancel rollback failed");
            }
        }
    }

    /// Number of currently active transactions.
    pub fn active_count(&self) -> usize {
        self.inner.table.lock().active.len()
    }

    fn expect_active(&self, id: Uuid, operation: &str) -> Result<()> {
        // Validates liveness and enforces the deadline before closing.
        self.get_transaction(id, operation).map(drop)
    }

    /// Runs the close sequence for `id` with the registry lock released
    /// around driver calls. The final status is recorded as requested
    /// even when the driver reports a failure, so retries surface
    /// "already closed" instead of re-running COMMIT on a dead handle.
    fn close(&self, id: Uuid, reason: CloseReason) -> Result<()> {
        let (handle, started_at, timeout) = {
            let mut table = self.inner.table.lock();
            loop {
                match table.active.get_mut(&id) {
                    None => return Err(table.closed_error(id).into()),
                    Some(slot) => match slot.status {
                        TxStatus::Closing(_) => {
                            self.inner.closing_done.wait(&mut table);
                        }
                        TxStatus::Running => {
                            slot.status = TxStatus::Closing(reason);
                            break (Arc::clone(&slot.handle), slot.started_at, slot.timeout);
                        }
                    },
                }
            }
        };

        let outcome = match reason {
            CloseReason::Committed => commit_handle(&handle, self.inner.observer.as_ref()),
            CloseReason::RolledBack | CloseReason::TimedOut => {
                rollback_handle(&handle, self.inner.observer.as_ref())
            }
        };

        {
            let mut table = self.inner.table.lock();
            table.active.remove(&id);
            table.remember_closed(
                id,
                ClosedTx {
                    reason,
                    timeout,
                    open_for: started_at.elapsed(),
                },
            );
        }
        self.inner.closing_done.notify_all();

        match &outcome {
            Ok(()) => debug!(tx = %id, ?reason, "transaction closed"),
            Err(err) => warn!(tx = %id, ?reason, error = %err, "transaction close failed"),
        }
        outcome.map_err(|err| crate::error::EngineError::from_driver(err, false))
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.inner.table.lock();
        f.debug_struct("TransactionManager")
            .field("active", &table.active.len())
            .field("closed", &table.closed.len())
            .finish()
    }
}

/// Commit sequence: drivers that manage boundaries themselves commit
/// natively under a synthetic query event; everyone else gets an explicit
/// COMMIT statement first. A failed explicit COMMIT triggers a rollback
/// attempt, and the commit failure is the one reported.
fn commit_handle(
    handle: &Arc<dyn DriverTransaction>,
    observer: Option<&QueryObserver>,
) -> std::result::Result<(), DriverError> {
    if handle.uses_phantom_queries() {
        let phantom = SqlStatement::new("-- implicit COMMIT via driver", Vec::new());
        return with_query_event(&phantom, observer, || handle.commit());
    }

    let statement = SqlStatement::new("COMMIT", Vec::new());
    match with_query_event(&statement, observer, || handle.execute_raw(&statement)) {
        Ok(_) => handle.commit(),
        Err(commit_err) => {
            if let Err(rollback_err) = handle.rollback() {
                debug!(error = %rollback_err, "rollback after failed commit also failed");
            }
            Err(commit_err)
        }
    }
}

/// Rollback sequence, mirroring [`commit_handle`]. The explicit ROLLBACK
/// statement is always followed by the native rollback so drivers release
/// their connection state.
fn rollback_handle(
    handle: &Arc<dyn DriverTransaction>,
    observer: Option<&QueryObserver>,
) -> std::result::Result<(), DriverError> {
    if handle.uses_phantom_queries() {
        let phantom = SqlStatement::new("-- implicit ROLLBACK via driver", Vec::new());
        return with_query_event(&phantom, observer, || handle.rollback());
    }

    let statement = SqlStatement::new("ROLLBACK", Vec::new());
    let explicit = with_query_event(&statement, observer, || handle.execute_raw(&statement));
    let native = handle.rollback();
    explicit.map(drop).and(native)
}

/// Periodically rolls back transactions past their deadline. Holds only a
/// weak reference so dropping the last manager handle stops the thread.
fn reaper_loop(inner: Weak<Inner>) {
    loop {
        std::thread::sleep(REAPER_INTERVAL);
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = TransactionManager { inner };
        let expired: Vec<Uuid> = {
            let table = manager.inner.table.lock();
            let now = Instant::now();
            table
                .active
                .iter()
                .filter(|(_, slot)| {
                    slot.status == TxStatus::Running && now >= slot.deadline
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in expired {
            debug!(tx = %id, "reaping expired transaction");
            if let Err(err) = manager.close(id, CloseReason::TimedOut) {
                debug!(tx = %id, error = %err, "reaper close failed");
            }
        }
    }
}
