//! Multi-component scenarios spanning the write coordinator, the
//! replication log and the recovery engine, matching the literal
//! end-to-end scenarios used to validate this crate's behaviour.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fragcoord::backend::{InMemoryNode, NodeBackend};
use fragcoord::gateway::NodeGateway;
use fragcoord::model::{IsolationLevel, NodeId, Row, UpdateFields};
use fragcoord::recovery::RecoveryEngine;
use fragcoord::replication_log::{LogStatus, ReplicationLog};
use fragcoord::write_coordinator::WriteCoordinator;
use fragcoord::Config;

struct Harness {
    gateway: Arc<NodeGateway>,
    coordinator: WriteCoordinator,
    recovery: RecoveryEngine,
    logs: HashMap<NodeId, Arc<ReplicationLog>>,
}

fn build() -> Harness {
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
    let coordinator = WriteCoordinator::new(gateway.clone(), logs.clone(), config.clone());
    let recovery = RecoveryEngine::new(gateway.clone(), logs.clone(), config);
    Harness {
        gateway,
        coordinator,
        recovery,
        logs,
    }
}

#[test]
fn happy_insert_lands_on_fragment_and_central() {
    let h = build();
    let outcome = h.coordinator.insert_title(Row::new("tt1", "movie", "A", 2020, 90, "X"));
    assert!(outcome.success);
    assert_eq!(outcome.primary_node, Some(NodeId::FragA));
    assert_eq!(outcome.replicated_to, Some(NodeId::Central));

    let log_entries = h.logs[&NodeId::FragA].all();
    assert_eq!(log_entries.len(), 1);
    assert_eq!(log_entries[0].status, LogStatus::Success);
    assert_eq!(log_entries[0].target_node, NodeId::Central);
}

#[test]
fn fallback_insert_then_reconciler_drains_once_fragment_returns() {
    let h = build();
    h.gateway.set_online(NodeId::FragA, false).unwrap();

    let outcome = h.coordinator.insert_title(Row::new("tt2", "movie", "B", 2021, 80, "Y"));
    assert!(outcome.success);
    assert_eq!(outcome.primary_node, Some(NodeId::Central));
    assert_eq!(outcome.pending_replication, Some(NodeId::FragA));
    assert!(h
        .gateway
        .query(NodeId::FragA, "tt2", IsolationLevel::ReadCommitted)
        .is_err());

    h.gateway.set_online(NodeId::FragA, true).unwrap();
    let result = h.recovery.recover_node(NodeId::FragA);
    assert_eq!(result.recovered, 1);
    assert_eq!(result.failed, 0);

    let row = h
        .gateway
        .query(NodeId::FragA, "tt2", IsolationLevel::ReadCommitted)
        .unwrap();
    assert!(row.is_some());
}

#[test]
fn peer_failure_on_update_converges_after_central_returns() {
    let h = build();
    h.coordinator.insert_title(Row::new("tt1", "movie", "A", 2020, 90, "X"));
    h.gateway.set_online(NodeId::Central, false).unwrap();

    let outcome = h.coordinator.update_title(
        "tt1",
        UpdateFields {
            runtime: Some(95),
            ..Default::default()
        },
    );
    assert!(outcome.success);
    assert_eq!(outcome.primary_node, Some(NodeId::FragA));
    assert_eq!(outcome.pending_replication, Some(NodeId::Central));

    h.gateway.set_online(NodeId::Central, true).unwrap();
    let result = h.recovery.recover_node(NodeId::Central);
    assert_eq!(result.recovered, 1);

    let central_row = h
        .gateway
        .query(NodeId::Central, "tt1", IsolationLevel::ReadCommitted)
        .unwrap()
        .unwrap();
    assert_eq!(central_row.runtime, 95);
}

#[test]
fn manual_recovery_against_two_sources_reports_idempotent_second_call() {
    let h = build();
    h.gateway.set_online(NodeId::FragB, false).unwrap();
    h.coordinator.insert_title(Row::new("tt3", "movie", "C", 2019, 100, "Z"));
    h.gateway.set_online(NodeId::FragB, true).unwrap();

    h.gateway.set_online(NodeId::Central, false).unwrap();
    h.coordinator.insert_title(Row::new("tt4", "series", "D", 2018, 45, "W"));
    h.gateway.set_online(NodeId::Central, true).unwrap();

    let result = h.recovery.recover_node(NodeId::Central);
    assert_eq!(result.recovered, 1);

    let second = h.recovery.recover_node(NodeId::Central);
    assert_eq!(second.recovered, 0);
    assert_eq!(second.failed, 0);
}

#[test]
fn write_during_total_outage_fails_cleanly_without_logging() {
    let h = build();
    h.gateway.set_online(NodeId::FragA, false).unwrap();
    h.gateway.set_online(NodeId::Central, false).unwrap();

    let outcome = h.coordinator.insert_title(Row::new("tt5", "movie", "E", 2022, 70, "V"));
    assert!(!outcome.success);
    assert!(h.logs[&NodeId::FragA].all().is_empty());
    assert!(h.logs[&NodeId::Central].all().is_empty());
}

#[test]
fn recover_node_while_offline_is_a_no_op() {
    let h = build();
    h.gateway.set_online(NodeId::Central, false).unwrap();
    h.coordinator.insert_title(Row::new("tt1", "movie", "A", 2020, 90, "X"));

    let result = h.recovery.recover_node(NodeId::Central);
    assert_eq!(result.recovered, 0);
    assert_eq!(result.failed, 0);

    let still_pending = h.logs[&NodeId::FragA].list_pending();
    assert_eq!(still_pending.len(), 1);
}

#[test]
fn background_reconciler_drains_within_one_cycle() {
    let mut config = Config::default();
    config.retry_interval = Duration::from_millis(100);
    let mut backends: HashMap<NodeId, Arc<dyn NodeBackend>> = HashMap::new();
    for id in NodeId::ALL {
        backends.insert(id, Arc::new(InMemoryNode::new()) as Arc<dyn NodeBackend>);
    }
    let gateway = Arc::new(NodeGateway::new(backends, &config).unwrap());
    let mut logs = HashMap::new();
    for id in NodeId::ALL {
        logs.insert(id, Arc::new(ReplicationLog::new()));
    }
    let coordinator = WriteCoordinator::new(gateway.clone(), logs.clone(), config.clone());
    let recovery = Arc::new(RecoveryEngine::new(gateway.clone(), logs.clone(), config.clone()));

    gateway.set_online(NodeId::FragA, false).unwrap();
    coordinator.insert_title(Row::new("tt6", "movie", "F", 2023, 60, "U"));
    gateway.set_online(NodeId::FragA, true).unwrap();

    recovery.start();
    std::thread::sleep(config.retry_interval * 3);
    recovery.stop();

    let row = gateway.query(NodeId::FragA, "tt6", IsolationLevel::ReadCommitted).unwrap();
    assert!(row.is_some());
}
