//! The Recovery Engine: a background reconciler thread draining each
//! node's replication log, plus a synchronous manual `recover_node` entry
//! point and a `pending_summary` status query.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::CoordError;
use crate::gateway::NodeGateway;
use crate::model::NodeId;
use crate::replication_log::{LogStatus, ReplicationLog};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoverOutcome {
    pub recovered: u32,
    pub failed: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub status: &'static str,
    pub pending_count: usize,
    pub failed_count: usize,
    pub pending_by_target: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub nodes: HashMap<String, NodeSummary>,
    pub total_pending: usize,
}

pub struct RecoveryEngine {
    gateway: Arc<NodeGateway>,
    logs: HashMap<NodeId, Arc<ReplicationLog>>,
    config: Config,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryEngine {
    pub fn new(gateway: Arc<NodeGateway>, logs: HashMap<NodeId, Arc<ReplicationLog>>, config: Config) -> Self {
        Self {
            gateway,
            logs,
            config,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Starts the background reconciler. A second call while already
    /// running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let engine = self.clone();
        *worker = Some(thread::spawn(move || engine.run_loop()));
        info!("recovery engine started");
    }

    fn run_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            for node in NodeId::ALL {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.drain_source(node, None);
            }
            self.sleep_cooperatively(self.config.retry_interval);
        }
    }

    fn sleep_cooperatively(&self, total: Duration) {
        let step = Duration::from_millis(50);
        let mut elapsed = Duration::ZERO;
        while elapsed < total && self.running.load(Ordering::SeqCst) {
            let remaining = total - elapsed;
            thread::sleep(step.min(remaining));
            elapsed += step;
        }
    }

    /// Requests the worker to exit and waits up to 5s for it to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let start = std::time::Instant::now();
            while !handle.is_finished() && start.elapsed() < Duration::from_secs(5) {
                thread::sleep(Duration::from_millis(20));
            }
            let _ = handle.join();
        }
        info!("recovery engine stopped");
    }

    fn log_for(&self, node: NodeId) -> &Arc<ReplicationLog> {
        self.logs
            .get(&node)
            .unwrap_or_else(|| panic!("no replication log configured for node {node}"))
    }

    /// Replays every eligible pending entry for `source`, optionally
    /// restricted to entries targeting `only_target`. Returns
    /// `(recovered, failed)`.
    fn drain_source(&self, source: NodeId, only_target: Option<NodeId>) -> (u32, u32) {
        let log = self.log_for(source);
        let entries = match only_target {
            Some(target) => log.list_pending_targeting(target),
            None => log.list_pending(),
        };

        let (mut recovered, mut failed) = (0, 0);
        for entry in entries {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match self.gateway.health(entry.target_node) {
                Ok(report) if report.online => {}
                _ => continue,
            }

            let op = entry.to_operation();
            match self.gateway.exec(entry.target_node, &op, self.config.default_isolation) {
                Ok(outcome) => {
                    let note = if outcome.rows_affected == 0 {
                        Some("replay affected zero rows, treated as idempotent success".to_string())
                    } else {
                        None
                    };
                    log.mark(entry.txn_id, LogStatus::Success, note);
                    info!(txn_id = %entry.txn_id, target = %entry.target_node, "replication entry replayed");
                    recovered += 1;
                }
                Err(CoordError::ConstraintViolation(_)) => {
                    log.mark(
                        entry.txn_id,
                        LogStatus::Success,
                        Some("duplicate key on replay, treated as idempotent success".to_string()),
                    );
                    recovered += 1;
                }
                Err(err) => {
                    log.bump_retry(entry.txn_id);
                    if entry.retry_count + 1 >= entry.max_retries {
                        log.mark(entry.txn_id, LogStatus::Failed, Some(err.to_string()));
                        error!(txn_id = %entry.txn_id, error = %err, "replication entry exhausted retries");
                        failed += 1;
                    } else {
                        warn!(txn_id = %entry.txn_id, error = %err, "replication entry replay failed, will retry");
                    }
                }
            }
        }
        (recovered, failed)
    }

    /// Replays every pending entry targeting `node` from every other
    /// source, ignoring the reconciler's interval. Refuses if `node` is
    /// still offline.
    pub fn recover_node(&self, node: NodeId) -> RecoverOutcome {
        match self.gateway.health(node) {
            Ok(report) if report.online => {}
            _ => {
                return RecoverOutcome {
                    recovered: 0,
                    failed: 0,
                    message: format!("{node} is offline, recovery skipped"),
                }
            }
        }

        let (mut recovered, mut failed) = (0, 0);
        for source in NodeId::ALL {
            if source == node {
                continue;
            }
            let (r, f) = self.drain_source(source, Some(node));
            recovered += r;
            failed += f;
        }
        RecoverOutcome {
            recovered,
            failed,
            message: format!("recovered {recovered}, failed {failed} entries targeting {node}"),
        }
    }

    pub fn pending_summary(&self) -> PendingSummary {
        let mut nodes = HashMap::new();
        let mut total_pending = 0;
        for node in NodeId::ALL {
            let log = self.log_for(node);
            let status = match self.gateway.health(node) {
                Ok(report) if report.online => "online",
                Ok(_) => "offline",
                Err(_) => "error",
            };
            let pending = log.list_pending();
            let pending_count = pending.len();
            total_pending += pending_count;
            let mut pending_by_target = HashMap::new();
            for entry in &pending {
                *pending_by_target.entry(entry.target_node.to_string()).or_insert(0) += 1;
            }
            nodes.insert(
                node.to_string(),
                NodeSummary {
                    status,
                    pending_count,
                    failed_count: log.failed_count(),
                    pending_by_target,
                },
            );
        }
        PendingSummary { nodes, total_pending }
    }
}

impl Drop for RecoveryEngine {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryNode, NodeBackend, Operation};
    use crate::model::{IsolationLevel, Row};
    use std::sync::Arc;

    fn setup() -> (Arc<NodeGateway>, HashMap<NodeId, Arc<ReplicationLog>>, Config) {
        let config = Config::default();
        let mut backends: HashMap<NodeId, Arc<dyn NodeBackend>> = HashMap::new();
        for id in NodeId::ALL {
            backends.insert(id, Arc::new(InMemoryNode::new()) as Arc<dyn NodeBackend>);
        }
        let gateway = Arc::new(NodeGateway::new(backends, &config).unwrap());
        let mut logs = HashMap::new();
        for id in NodeId::ALL {
            logs.insert(id, Arc::new(ReplicationLog::new()));
        }
        (gateway, logs, config)
    }

    #[test]
    fn manual_recovery_drains_two_sources() {
        let (gateway, logs, config) = setup();
        let row = Row::new("tt1", "movie", "A", 2020, 90, "X");
        gateway
            .exec(NodeId::FragA, &Operation::Insert(row.clone()), IsolationLevel::ReadCommitted)
            .unwrap();
        gateway
            .exec(NodeId::FragB, &Operation::Insert(row.clone()), IsolationLevel::ReadCommitted)
            .unwrap();
        logs[&NodeId::FragA].append(NodeId::FragA, NodeId::Central, &Operation::Insert(row.clone()), config.max_retries);
        logs[&NodeId::FragB].append(NodeId::FragB, NodeId::Central, &Operation::Insert(row), config.max_retries);

        let engine = RecoveryEngine::new(gateway.clone(), logs, config);
        let outcome = engine.recover_node(NodeId::Central);
        assert_eq!(outcome.recovered, 2);
        assert_eq!(outcome.failed, 0);

        let second = engine.recover_node(NodeId::Central);
        assert_eq!(second.recovered, 0);
    }

    #[test]
    fn recover_node_refuses_while_offline() {
        let (gateway, logs, config) = setup();
        gateway.set_online(NodeId::Central, false).unwrap();
        let engine = RecoveryEngine::new(gateway, logs, config);
        let outcome = engine.recover_node(NodeId::Central);
        assert_eq!(outcome.recovered, 0);
        assert!(outcome.message.contains("offline"));
    }

    #[test]
    fn start_stop_is_idempotent_and_bounded() {
        let (gateway, logs, mut config) = setup();
        config.retry_interval = Duration::from_millis(50);
        let engine = Arc::new(RecoveryEngine::new(gateway, logs, config));
        engine.start();
        engine.start();
        let started = std::time::Instant::now();
        engine.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
