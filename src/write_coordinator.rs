//! The Write Coordinator: primary selection, fallback-on-failure, peer
//! replication and log writes for insert/update/delete, per the unified
//! write-through-with-asymmetric-fallback policy.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::Operation;
use crate::config::Config;
use crate::error::{CoordError, Result};
use crate::gateway::NodeGateway;
use crate::model::{fragment_for, NodeId, Row, UpdateFields};
use crate::replication_log::ReplicationLog;

/// Returned by `insert_title`/`update_title`/`delete_title`.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub success: bool,
    pub primary_node: Option<NodeId>,
    pub replicated_to: Option<NodeId>,
    pub pending_replication: Option<NodeId>,
    pub txn_id: Option<Uuid>,
    pub message: String,
}

impl WriteOutcome {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            primary_node: None,
            replicated_to: None,
            pending_replication: None,
            txn_id: None,
            message: message.into(),
        }
    }
}

pub struct WriteCoordinator {
    gateway: Arc<NodeGateway>,
    logs: HashMap<NodeId, Arc<ReplicationLog>>,
    config: Config,
}

impl WriteCoordinator {
    pub fn new(gateway: Arc<NodeGateway>, logs: HashMap<NodeId, Arc<ReplicationLog>>, config: Config) -> Self {
        Self { gateway, logs, config }
    }

    fn log_for(&self, node: NodeId) -> &Arc<ReplicationLog> {
        self.logs
            .get(&node)
            .unwrap_or_else(|| panic!("no replication log configured for node {node}"))
    }

    /// Reads the row from whichever of the three nodes is reachable,
    /// central preferred, to resolve the `kind` an update/delete needs for
    /// routing. `Ok(None)` means the row doesn't exist anywhere reachable.
    fn resolve_existing(&self, id: &str) -> Result<Option<Row>> {
        let order = [NodeId::Central, NodeId::FragA, NodeId::FragB];
        let mut any_reachable = false;
        for node in order {
            match self.gateway.query(node, id, self.config.default_isolation) {
                Ok(Some(row)) => return Ok(Some(row)),
                Ok(None) => any_reachable = true,
                Err(CoordError::NodeUnavailable(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        if any_reachable {
            Ok(None)
        } else {
            Err(CoordError::AllNodesUnavailable)
        }
    }

    /// The shared primary-then-peer write policy behind insert/update/delete.
    fn apply(&self, kind: &str, op_for: impl Fn(NodeId) -> Operation) -> WriteOutcome {
        let primary = fragment_for(kind, &self.config);
        let peer = NodeId::Central;

        match self.gateway.exec(primary, &op_for(primary), self.config.default_isolation) {
            Ok(_) => {
                info!(%primary, "write committed on primary");
                match self.gateway.exec(peer, &op_for(peer), self.config.default_isolation) {
                    Ok(_) => {
                        info!(%primary, %peer, "write replicated to peer");
                        let txn_id = self
                            .log_for(primary)
                            .append(primary, peer, &op_for(primary), self.config.max_retries);
                        self.log_for(primary).mark(txn_id, crate::replication_log::LogStatus::Success, None);
                        WriteOutcome {
                            success: true,
                            primary_node: Some(primary),
                            replicated_to: Some(peer),
                            pending_replication: None,
                            txn_id: Some(txn_id),
                            message: "write committed on both nodes".to_string(),
                        }
                    }
                    Err(err) => {
                        warn!(%primary, %peer, error = %err, "peer replication failed, recording pending entry");
                        let txn_id = self
                            .log_for(primary)
                            .append(primary, peer, &op_for(primary), self.config.max_retries);
                        WriteOutcome {
                            success: true,
                            primary_node: Some(primary),
                            replicated_to: None,
                            pending_replication: Some(peer),
                            txn_id: Some(txn_id),
                            message: format!("committed on {primary}, pending replication to {peer}"),
                        }
                    }
                }
            }
            Err(primary_err) => {
                warn!(%primary, error = %primary_err, "primary unavailable, falling back to peer");
                match self.gateway.exec(peer, &op_for(peer), self.config.default_isolation) {
                    Ok(_) => {
                        let txn_id = self
                            .log_for(peer)
                            .append(peer, primary, &op_for(peer), self.config.max_retries);
                        WriteOutcome {
                            success: true,
                            primary_node: Some(peer),
                            replicated_to: None,
                            pending_replication: Some(primary),
                            txn_id: Some(txn_id),
                            message: format!("primary {primary} unavailable, committed on fallback {peer}, pending replication"),
                        }
                    }
                    Err(peer_err) => {
                        error!(%primary, %peer, "all nodes unavailable for write");
                        let _ = peer_err;
                        WriteOutcome::failure("all nodes unavailable")
                    }
                }
            }
        }
    }

    pub fn insert_title(&self, row: Row) -> WriteOutcome {
        let kind = row.kind.clone();
        self.apply(&kind, move |_node| Operation::Insert(row.clone()))
    }

    pub fn update_title(&self, id: &str, fields: UpdateFields) -> WriteOutcome {
        let existing = match self.resolve_existing(id) {
            Ok(Some(row)) => row,
            Ok(None) => return WriteOutcome::failure(format!("not_found: {id}")),
            Err(err) => return WriteOutcome::failure(err.to_string()),
        };
        let mut updated = existing.clone();
        if let Err(err) = updated.apply(&fields) {
            return WriteOutcome::failure(err.to_string());
        }
        let kind = existing.kind.clone();
        self.apply(&kind, move |_node| Operation::Update {
            id: id.to_string(),
            new: updated.clone(),
        })
    }

    pub fn delete_title(&self, id: &str) -> WriteOutcome {
        let existing = match self.resolve_existing(id) {
            Ok(Some(row)) => row,
            Ok(None) => return WriteOutcome::failure(format!("not_found: {id}")),
            Err(err) => return WriteOutcome::failure(err.to_string()),
        };
        let kind = existing.kind.clone();
        self.apply(&kind, move |_node| Operation::Delete { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryNode, NodeBackend};
    use crate::model::IsolationLevel;
    use std::sync::Arc;

    fn coordinator() -> (WriteCoordinator, Arc<NodeGateway>, HashMap<NodeId, Arc<dyn NodeBackend>>) {
        let config = Config::default();
        let mut backends: HashMap<NodeId, Arc<dyn NodeBackend>> = HashMap::new();
        for id in NodeId::ALL {
            backends.insert(id, Arc::new(InMemoryNode::new()) as Arc<dyn NodeBackend>);
        }
        let gateway = Arc::new(NodeGateway::new(backends.clone(), &config).unwrap());
        let mut logs = HashMap::new();
        for id in NodeId::ALL {
            logs.insert(id, Arc::new(ReplicationLog::new()));
        }
        (WriteCoordinator::new(gateway.clone(), logs, config), gateway, backends)
    }

    #[test]
    fn happy_insert_replicates_to_both_nodes() {
        let (coord, gateway, _) = coordinator();
        let row = Row::new("tt1", "movie", "A", 2020, 90, "X");
        let outcome = coord.insert_title(row);
        assert!(outcome.success);
        assert_eq!(outcome.primary_node, Some(NodeId::FragA));
        assert_eq!(outcome.replicated_to, Some(NodeId::Central));
        assert!(gateway
            .query(NodeId::FragA, "tt1", IsolationLevel::ReadCommitted)
            .unwrap()
            .is_some());
        assert!(gateway
            .query(NodeId::Central, "tt1", IsolationLevel::ReadCommitted)
            .unwrap()
            .is_some());
    }

    #[test]
    fn fallback_insert_when_fragment_down() {
        let (coord, gateway, _) = coordinator();
        gateway.set_online(NodeId::FragA, false).unwrap();
        let row = Row::new("tt2", "movie", "B", 2021, 80, "Y");
        let outcome = coord.insert_title(row);
        assert!(outcome.success);
        assert_eq!(outcome.primary_node, Some(NodeId::Central));
        assert_eq!(outcome.pending_replication, Some(NodeId::FragA));
    }

    #[test]
    fn insert_fails_cleanly_when_all_nodes_down() {
        let (coord, gateway, _) = coordinator();
        gateway.set_online(NodeId::FragA, false).unwrap();
        gateway.set_online(NodeId::Central, false).unwrap();
        let row = Row::new("tt3", "movie", "C", 2019, 100, "Z");
        let outcome = coord.insert_title(row);
        assert!(!outcome.success);
    }

    #[test]
    fn update_of_missing_row_is_not_found() {
        let (coord, _, _) = coordinator();
        let outcome = coord.update_title("ghost", UpdateFields::default());
        assert!(!outcome.success);
        assert!(outcome.message.contains("not_found"));
    }

    #[test]
    fn update_rejecting_kind_change_surfaces_invalid_operation() {
        let (coord, _, _) = coordinator();
        coord.insert_title(Row::new("tt1", "movie", "A", 2020, 90, "X"));
        let outcome = coord.update_title(
            "tt1",
            UpdateFields {
                kind: Some("series".to_string()),
                ..Default::default()
            },
        );
        assert!(!outcome.success);
    }
}
