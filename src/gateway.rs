//! The Node Gateway: a uniform command interface over the three logical
//! storage nodes. Everything above this layer (the Write Coordinator, the
//! Recovery Engine, the Concurrency Harness) reaches a node only through
//! here, never through [`crate::backend`] directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use crate::backend::{BackendError, BackendSession, ExecOutcome, HealthStatus, NodeBackend, Operation};
use crate::config::Config;
use crate::error::CoordError;
use crate::model::{IsolationLevel, NodeId, Row};

fn classify(node: NodeId, err: BackendError) -> CoordError {
    match err {
        BackendError::NodeUnavailable => CoordError::NodeUnavailable(node.to_string()),
        BackendError::ConstraintViolation(id) => CoordError::ConstraintViolation(id),
        BackendError::Deadlock => CoordError::Deadlock,
        BackendError::LockTimeout => CoordError::LockTimeout,
        BackendError::Other(msg) => CoordError::Internal(msg),
    }
}

/// Reported by [`NodeGateway::health`]; used by recovery and the demo's
/// status output.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub online: bool,
    pub healthy: bool,
    pub row_count: Option<usize>,
}

/// A long-lived transaction against one node, used only by the Concurrency
/// Harness (the Write Coordinator always uses [`NodeGateway::exec`] /
/// [`NodeGateway::query`], which commit a single statement implicitly).
pub struct Session {
    node: NodeId,
    inner: Box<dyn BackendSession>,
}

impl Session {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn exec(&mut self, op: &Operation) -> Result<ExecOutcome, CoordError> {
        self.inner.execute(op).map_err(|e| classify(self.node, e))
    }

    pub fn query(&mut self, id: &str) -> Result<Option<Row>, CoordError> {
        self.inner.read(id).map_err(|e| classify(self.node, e))
    }

    pub fn query_for_update(&mut self, id: &str) -> Result<Option<Row>, CoordError> {
        self.inner.read_for_update(id).map_err(|e| classify(self.node, e))
    }

    pub fn commit(self) -> Result<(), CoordError> {
        let node = self.node;
        self.inner.commit().map_err(|e| classify(node, e))
    }

    pub fn rollback(self) {
        self.inner.rollback();
    }
}

pub struct NodeGateway {
    nodes: HashMap<NodeId, Arc<dyn NodeBackend>>,
}

impl NodeGateway {
    /// Probes every node up to `config.startup_retries` times, sleeping
    /// `config.startup_delay` between attempts, before surfacing a fatal
    /// error for any node that never comes up.
    pub fn new(nodes: HashMap<NodeId, Arc<dyn NodeBackend>>, config: &Config) -> Result<Self, CoordError> {
        for (node_id, backend) in &nodes {
            let mut attempts = 0;
            loop {
                if backend.health() == HealthStatus::Online {
                    break;
                }
                attempts += 1;
                if attempts >= config.startup_retries {
                    error!(node = %node_id, attempts, "node failed to come online at startup");
                    return Err(CoordError::NodeUnavailable(node_id.to_string()));
                }
                warn!(node = %node_id, attempt = attempts, "node offline at startup, retrying");
                thread::sleep(config.startup_delay);
            }
        }
        info!(nodes = nodes.len(), "node gateway ready");
        Ok(Self { nodes })
    }

    fn backend(&self, node: NodeId) -> Result<&Arc<dyn NodeBackend>, CoordError> {
        self.nodes
            .get(&node)
            .ok_or_else(|| CoordError::InvalidConfig(format!("unknown node {node}")))
    }

    pub fn exec(&self, node: NodeId, op: &Operation, isolation: IsolationLevel) -> Result<ExecOutcome, CoordError> {
        self.backend(node)?.execute(op, isolation).map_err(|e| classify(node, e))
    }

    pub fn query(&self, node: NodeId, id: &str, isolation: IsolationLevel) -> Result<Option<Row>, CoordError> {
        self.backend(node)?.read(id, isolation).map_err(|e| classify(node, e))
    }

    pub fn begin(&self, node: NodeId, isolation: IsolationLevel) -> Result<Session, CoordError> {
        let inner = self.backend(node)?.begin(isolation);
        Ok(Session { node, inner })
    }

    pub fn health(&self, node: NodeId) -> Result<HealthReport, CoordError> {
        let backend = self.backend(node)?;
        let online = backend.health() == HealthStatus::Online;
        Ok(HealthReport {
            online,
            healthy: online,
            row_count: online.then(|| backend.row_count()),
        })
    }

    pub fn set_online(&self, node: NodeId, online: bool) -> Result<(), CoordError> {
        self.backend(node)?.set_online(online);
        if online {
            info!(%node, "node brought online");
        } else {
            warn!(%node, "node taken offline");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryNode;

    fn gateway() -> NodeGateway {
        let mut nodes: HashMap<NodeId, Arc<dyn NodeBackend>> = HashMap::new();
        for id in NodeId::ALL {
            nodes.insert(id, Arc::new(InMemoryNode::new()));
        }
        NodeGateway::new(nodes, &Config::default()).unwrap()
    }

    #[test]
    fn exec_and_query_round_trip() {
        let gw = gateway();
        let row = Row::new("tt1", "movie", "A", 2020, 90, "X");
        gw.exec(NodeId::FragA, &Operation::Insert(row), IsolationLevel::ReadCommitted)
            .unwrap();
        let got = gw.query(NodeId::FragA, "tt1", IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(got.unwrap().id, "tt1");
    }

    #[test]
    fn offline_node_reports_unhealthy() {
        let gw = gateway();
        gw.set_online(NodeId::Central, false).unwrap();
        let report = gw.health(NodeId::Central).unwrap();
        assert!(!report.online);
        let err = gw
            .exec(
                NodeId::Central,
                &Operation::Insert(Row::new("tt1", "movie", "A", 2020, 90, "X")),
                IsolationLevel::ReadCommitted,
            )
            .unwrap_err();
        assert!(matches!(err, CoordError::NodeUnavailable(_)));
    }

    #[test]
    fn session_is_visible_only_after_commit() {
        let gw = gateway();
        let mut session = gw.begin(NodeId::FragA, IsolationLevel::ReadCommitted).unwrap();
        session
            .exec(&Operation::Insert(Row::new("tt1", "movie", "A", 2020, 90, "X")))
            .unwrap();
        assert!(gw.query(NodeId::FragA, "tt1", IsolationLevel::ReadCommitted).unwrap().is_none());
        session.commit().unwrap();
        assert!(gw.query(NodeId::FragA, "tt1", IsolationLevel::ReadCommitted).unwrap().is_some());
    }
}
