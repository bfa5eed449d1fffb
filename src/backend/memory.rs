//! In-memory storage node: a row table guarded by [`RowLockManager`] plus a
//! version chain per row that gives `READ COMMITTED`, `REPEATABLE READ` and
//! `SERIALIZABLE` sessions genuinely different visibility, instead of three
//! isolation levels that all behave identically over a single shared map.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::backend::lock::{LockMode, RowLockManager, TxnId};
use crate::backend::{BackendError, BackendSession, ExecOutcome, HealthStatus, NodeBackend, Operation};
use crate::error::CoordError;
use crate::model::{IsolationLevel, Row};

const LOCK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
struct RowVersion {
    data: Option<Row>,
    written_by: TxnId,
    commit_ts: Option<u64>,
}

struct NodeInner {
    rows: RwLock<HashMap<String, Vec<RowVersion>>>,
    lock_mgr: RowLockManager,
    commit_counter: AtomicU64,
    next_txn_id: AtomicU64,
    online: AtomicBool,
}

impl NodeInner {
    fn visible(&self, id: &str, txn: TxnId, isolation: IsolationLevel, snapshot_ts: u64) -> Option<Row> {
        let rows = self.rows.read();
        let chain = rows.get(id)?;
        for version in chain.iter().rev() {
            let own_write = version.written_by == txn;
            let committed_visible = match version.commit_ts {
                Some(ts) => match isolation {
                    IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => true,
                    IsolationLevel::RepeatableRead | IsolationLevel::Serializable => ts <= snapshot_ts,
                },
                None => false,
            };
            if own_write || committed_visible || isolation == IsolationLevel::ReadUncommitted {
                return version.data.clone();
            }
        }
        None
    }

    fn active_row(&self, id: &str, txn: TxnId) -> Option<Row> {
        // Read-your-own-writes, latest committed otherwise. Used by
        // write-path checks (duplicate key, affected-row counting) which
        // always operate against the freshest state, regardless of the
        // caller's isolation level.
        self.visible(id, txn, IsolationLevel::ReadCommitted, u64::MAX)
    }

    fn next_txn(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct InMemoryNode {
    inner: Arc<NodeInner>,
}

impl InMemoryNode {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NodeInner {
                rows: RwLock::new(HashMap::new()),
                lock_mgr: RowLockManager::new(LOCK_TIMEOUT),
                commit_counter: AtomicU64::new(0),
                next_txn_id: AtomicU64::new(1),
                online: AtomicBool::new(true),
            }),
        }
    }

    fn session(&self, isolation: IsolationLevel) -> InMemorySession {
        let txn_id = self.inner.next_txn();
        let snapshot_ts = self.inner.commit_counter.load(Ordering::SeqCst);
        InMemorySession {
            node: self.inner.clone(),
            txn_id,
            isolation,
            snapshot_ts,
            locked_rows: HashSet::new(),
            open: true,
        }
    }
}

impl Default for InMemoryNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBackend for InMemoryNode {
    fn execute(&self, op: &Operation, isolation: IsolationLevel) -> Result<ExecOutcome, BackendError> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(BackendError::NodeUnavailable);
        }
        let mut session = self.session(isolation);
        let outcome = session.execute(op)?;
        Box::new(session).commit()?;
        Ok(outcome)
    }

    fn read(&self, id: &str, isolation: IsolationLevel) -> Result<Option<Row>, BackendError> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(BackendError::NodeUnavailable);
        }
        let mut session = self.session(isolation);
        session.read(id)
    }

    fn begin(&self, isolation: IsolationLevel) -> Box<dyn BackendSession> {
        Box::new(self.session(isolation))
    }

    fn health(&self) -> HealthStatus {
        if self.inner.online.load(Ordering::SeqCst) {
            HealthStatus::Online
        } else {
            HealthStatus::Offline
        }
    }

    fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    fn row_count(&self) -> usize {
        let rows = self.inner.rows.read();
        rows.values()
            .filter(|chain| {
                chain
                    .iter()
                    .rev()
                    .find(|v| v.commit_ts.is_some())
                    .map(|v| v.data.is_some())
                    .unwrap_or(false)
            })
            .count()
    }
}

struct InMemorySession {
    node: Arc<NodeInner>,
    txn_id: TxnId,
    isolation: IsolationLevel,
    snapshot_ts: u64,
    locked_rows: HashSet<String>,
    open: bool,
}

impl InMemorySession {
    fn lock_exclusive(&mut self, id: &str) -> Result<(), BackendError> {
        if self.locked_rows.contains(id) {
            return Ok(());
        }
        self.node
            .lock_mgr
            .acquire(self.txn_id, id, LockMode::Exclusive)
            .map_err(map_lock_err)?;
        self.locked_rows.insert(id.to_string());
        Ok(())
    }

    fn append(&self, id: &str, data: Option<Row>) {
        let mut rows = self.node.rows.write();
        rows.entry(id.to_string()).or_default().push(RowVersion {
            data,
            written_by: self.txn_id,
            commit_ts: None,
        });
    }
}

impl BackendSession for InMemorySession {
    fn execute(&mut self, op: &Operation) -> Result<ExecOutcome, BackendError> {
        let id = op.record_id().to_string();
        self.lock_exclusive(&id)?;

        match op {
            Operation::Insert(row) => {
                if self.node.active_row(&id, self.txn_id).is_some() {
                    return Err(BackendError::ConstraintViolation(id));
                }
                self.append(&id, Some(row.clone()));
                Ok(ExecOutcome { rows_affected: 1 })
            }
            Operation::Update { new, .. } => {
                if self.node.active_row(&id, self.txn_id).is_none() {
                    return Ok(ExecOutcome { rows_affected: 0 });
                }
                self.append(&id, Some(new.clone()));
                Ok(ExecOutcome { rows_affected: 1 })
            }
            Operation::Delete { .. } => {
                if self.node.active_row(&id, self.txn_id).is_none() {
                    return Ok(ExecOutcome { rows_affected: 0 });
                }
                self.append(&id, None);
                Ok(ExecOutcome { rows_affected: 1 })
            }
        }
    }

    fn read(&mut self, id: &str) -> Result<Option<Row>, BackendError> {
        Ok(self.node.visible(id, self.txn_id, self.isolation, self.snapshot_ts))
    }

    fn read_for_update(&mut self, id: &str) -> Result<Option<Row>, BackendError> {
        self.lock_exclusive(id)?;
        Ok(self.node.active_row(id, self.txn_id))
    }

    fn commit(mut self: Box<Self>) -> Result<(), BackendError> {
        let ts = self.node.commit_counter.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut rows = self.node.rows.write();
            for id in &self.locked_rows {
                if let Some(chain) = rows.get_mut(id) {
                    for version in chain.iter_mut() {
                        if version.written_by == self.txn_id && version.commit_ts.is_none() {
                            version.commit_ts = Some(ts);
                        }
                    }
                }
            }
        }
        self.node.lock_mgr.release_all(self.txn_id);
        self.open = false;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) {
        {
            let mut rows = self.node.rows.write();
            for id in &self.locked_rows {
                if let Some(chain) = rows.get_mut(id) {
                    chain.retain(|v| !(v.written_by == self.txn_id && v.commit_ts.is_none()));
                }
            }
        }
        self.node.lock_mgr.release_all(self.txn_id);
        self.open = false;
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if self.open {
            self.node.lock_mgr.release_all(self.txn_id);
        }
    }
}

fn map_lock_err(err: CoordError) -> BackendError {
    match err {
        CoordError::Deadlock => BackendError::Deadlock,
        CoordError::LockTimeout => BackendError::LockTimeout,
        other => BackendError::Other(other.to_string()),
    }
}
