//! The simulated storage-node side of the command interface the coordinator
//! is written against. The coordinator, recovery engine and harness never
//! see this module directly: they talk to [`crate::gateway::NodeGateway`],
//! which is generic over [`NodeBackend`].

pub mod lock;
pub mod memory;

pub use lock::{LockMode, RowLockManager, TxnId};
pub use memory::InMemoryNode;

use thiserror::Error;

use crate::model::Row;

/// The three statement shapes a storage node accepts. Unlike the narrow
/// external `Exec(node, sql, params, isolation)` interface, these carry the
/// fully-resolved row so the in-memory engine doesn't need its own SQL
/// dialect ("sql, params" still shows up in the
/// [`crate::replication_log::LogEntry`] audit trail, rendered from the
/// operation itself).
#[derive(Debug, Clone)]
pub enum Operation {
    Insert(Row),
    Update { id: String, new: Row },
    Delete { id: String },
}

impl Operation {
    pub fn record_id(&self) -> &str {
        match self {
            Operation::Insert(row) => &row.id,
            Operation::Update { id, .. } => id,
            Operation::Delete { id } => id,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Operation::Insert(_) => "INSERT",
            Operation::Update { .. } => "UPDATE",
            Operation::Delete { .. } => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub rows_affected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Online,
    Offline,
}

/// Errors a storage node's command interface can raise: a refused
/// connection, a duplicate key, or an engine-level conflict. `NotFound` is
/// deliberately absent here (a missing row on UPDATE/DELETE affects zero
/// rows rather than erroring, matching ordinary SQL semantics; resolving
/// "does this row exist anywhere" is the Write Coordinator's job, done by
/// reading before writing).
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("node unavailable")]
    NodeUnavailable,
    #[error("constraint violation: duplicate key {0}")]
    ConstraintViolation(String),
    #[error("deadlock detected")]
    Deadlock,
    #[error("lock wait timeout")]
    LockTimeout,
    #[error("backend error: {0}")]
    Other(String),
}

/// A swappable storage engine behind one logical node. The in-memory
/// implementation below is the only one this crate ships, but nothing in
/// the coordinator, recovery engine or harness names it directly.
pub trait NodeBackend: Send + Sync {
    fn execute(
        &self,
        op: &Operation,
        isolation: crate::model::IsolationLevel,
    ) -> Result<ExecOutcome, BackendError>;

    fn read(
        &self,
        id: &str,
        isolation: crate::model::IsolationLevel,
    ) -> Result<Option<Row>, BackendError>;

    fn begin(&self, isolation: crate::model::IsolationLevel) -> Box<dyn BackendSession>;

    fn health(&self) -> HealthStatus;

    fn set_online(&self, online: bool);

    fn row_count(&self) -> usize;
}

/// A long-lived transaction against one node, used only by the Concurrency
/// Harness (the Write Coordinator always goes through the single-statement
/// `NodeBackend::execute`/`read` calls, which commit implicitly).
pub trait BackendSession: Send {
    fn execute(&mut self, op: &Operation) -> Result<ExecOutcome, BackendError>;
    fn read(&mut self, id: &str) -> Result<Option<Row>, BackendError>;
    /// `SELECT ... FOR UPDATE`: takes an exclusive row lock before reading.
    fn read_for_update(&mut self, id: &str) -> Result<Option<Row>, BackendError>;
    fn commit(self: Box<Self>) -> Result<(), BackendError>;
    fn rollback(self: Box<Self>);
}
