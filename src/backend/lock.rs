// Row-granularity lock manager for the simulated storage nodes.
//
// Each simulated node holds a single table, so there's no database/table/
// page/row hierarchy to track intent locks across: row-only locking is
// enough. The condvar-based wait queue and the wait-for graph for deadlock
// detection are what the W/W concurrency scenario depends on to report real
// deadlocks rather than canned ones.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::CoordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

pub type TxnId = u64;

struct RowLockState {
    granted: HashMap<TxnId, LockMode>,
}

impl RowLockState {
    fn new() -> Self {
        Self {
            granted: HashMap::new(),
        }
    }

    fn compatible(&self, mode: LockMode, requester: TxnId) -> bool {
        self.granted
            .iter()
            .filter(|(&holder, _)| holder != requester)
            .all(|(_, held_mode)| mode.compatible_with(held_mode))
    }
}

struct RowLock {
    state: Mutex<RowLockState>,
    condvar: Condvar,
}

impl RowLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(RowLockState::new()),
            condvar: Condvar::new(),
        }
    }
}

/// Tracks, for each blocked transaction, the set of transactions it is
/// waiting on (used to detect deadlock cycles without relying on a
/// storage-engine-reported signal).
struct WaitForGraph {
    edges: HashMap<TxnId, HashSet<TxnId>>,
}

impl WaitForGraph {
    fn new() -> Self {
        Self {
            edges: HashMap::new(),
        }
    }

    fn add_wait(&mut self, waiter: TxnId, holders: HashSet<TxnId>) {
        self.edges.insert(waiter, holders);
    }

    fn remove_wait(&mut self, waiter: TxnId) {
        self.edges.remove(&waiter);
    }

    /// True if `start` participates in a cycle, i.e. waits (transitively)
    /// on a transaction that is itself (transitively) waiting on `start`.
    fn has_cycle_through(&self, start: TxnId) -> bool {
        let mut stack = vec![start];
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            if let Some(next) = self.edges.get(&node) {
                for &n in next {
                    if n == start {
                        return true;
                    }
                    if visited.insert(n) {
                        stack.push(n);
                    }
                }
            }
        }
        false
    }
}

/// Row-granularity shared/exclusive lock manager with wait-for-graph
/// deadlock detection, backing the simulated storage nodes' `FOR UPDATE`
/// semantics.
pub struct RowLockManager {
    rows: Mutex<HashMap<String, Arc<RowLock>>>,
    wait_for: Mutex<WaitForGraph>,
    lock_timeout: Duration,
}

impl RowLockManager {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            wait_for: Mutex::new(WaitForGraph::new()),
            lock_timeout,
        }
    }

    fn entry(&self, row_id: &str) -> Arc<RowLock> {
        self.rows
            .lock()
            .entry(row_id.to_string())
            .or_insert_with(|| Arc::new(RowLock::new()))
            .clone()
    }

    /// Acquires a lock on `row_id` for `txn_id`, blocking until granted,
    /// the lock-wait timeout elapses (`CoordError::LockTimeout`), or a
    /// deadlock cycle is detected (`CoordError::Deadlock`).
    pub fn acquire(&self, txn_id: TxnId, row_id: &str, mode: LockMode) -> Result<(), CoordError> {
        let entry = self.entry(row_id);
        let deadline = Instant::now() + self.lock_timeout;
        let mut state = entry.state.lock();

        if let Some(held) = state.granted.get(&txn_id) {
            if *held == mode || *held == LockMode::Exclusive {
                return Ok(());
            }
        }

        loop {
            if state.compatible(mode, txn_id) {
                state.granted.insert(txn_id, mode);
                self.wait_for.lock().remove_wait(txn_id);
                return Ok(());
            }

            let holders: HashSet<TxnId> = state
                .granted
                .keys()
                .filter(|&&h| h != txn_id)
                .copied()
                .collect();
            {
                let mut graph = self.wait_for.lock();
                graph.add_wait(txn_id, holders);
                if graph.has_cycle_through(txn_id) {
                    graph.remove_wait(txn_id);
                    return Err(CoordError::Deadlock);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.wait_for.lock().remove_wait(txn_id);
                return Err(CoordError::LockTimeout);
            }
            let timed_out = entry.condvar.wait_for(&mut state, remaining).timed_out();
            if timed_out && !state.compatible(mode, txn_id) {
                self.wait_for.lock().remove_wait(txn_id);
                return Err(CoordError::LockTimeout);
            }
        }
    }

    pub fn release(&self, txn_id: TxnId, row_id: &str) {
        let entry = self.entry(row_id);
        let mut state = entry.state.lock();
        state.granted.remove(&txn_id);
        self.wait_for.lock().remove_wait(txn_id);
        entry.condvar.notify_all();
    }

    /// Releases every lock `txn_id` holds, across all rows. Called on
    /// session commit/rollback.
    pub fn release_all(&self, txn_id: TxnId) {
        let rows: Vec<_> = self.rows.lock().values().cloned().collect();
        for entry in rows {
            let mut state = entry.state.lock();
            if state.granted.remove(&txn_id).is_some() {
                entry.condvar.notify_all();
            }
        }
        self.wait_for.lock().remove_wait(txn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[test]
    fn shared_locks_do_not_conflict() {
        let mgr = RowLockManager::new(Duration::from_millis(200));
        mgr.acquire(1, "tt1", LockMode::Shared).unwrap();
        mgr.acquire(2, "tt1", LockMode::Shared).unwrap();
    }

    #[test]
    fn exclusive_lock_blocks_until_released() {
        let mgr = StdArc::new(RowLockManager::new(Duration::from_secs(2)));
        mgr.acquire(1, "tt1", LockMode::Exclusive).unwrap();

        let mgr2 = mgr.clone();
        let handle = thread::spawn(move || {
            mgr2.acquire(2, "tt1", LockMode::Exclusive).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        mgr.release(1, "tt1");
        handle.join().unwrap();
    }

    #[test]
    fn lock_wait_times_out() {
        let mgr = RowLockManager::new(Duration::from_millis(100));
        mgr.acquire(1, "tt1", LockMode::Exclusive).unwrap();
        let err = mgr.acquire(2, "tt1", LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, CoordError::LockTimeout));
    }

    #[test]
    fn cross_row_deadlock_is_detected() {
        let mgr = StdArc::new(RowLockManager::new(Duration::from_secs(5)));
        mgr.acquire(1, "tt1", LockMode::Exclusive).unwrap();
        mgr.acquire(2, "tt2", LockMode::Exclusive).unwrap();

        let mgr2 = mgr.clone();
        let handle = thread::spawn(move || mgr2.acquire(2, "tt1", LockMode::Exclusive));

        // Give txn 2 a chance to register its wait on tt1 before txn 1
        // tries to wait on tt2, completing the cycle.
        thread::sleep(Duration::from_millis(50));
        let result = mgr.acquire(1, "tt2", LockMode::Exclusive);
        assert!(matches!(result, Err(CoordError::Deadlock)));

        mgr.release(1, "tt1");
        let _ = handle.join();
    }
}
