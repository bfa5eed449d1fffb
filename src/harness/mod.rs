//! The Concurrency Harness: synchronised multi-thread scenarios against the
//! raw Node Gateway (bypassing the Write Coordinator entirely) that observe
//! and classify the underlying engine's isolation anomalies.
//!
//! Timing thresholds are derived from the scenarios' own scripted sleeps
//! (150ms for writer hold time, 500ms for the R/W writer hold time) rather
//! than hard-coded independently, per the design note this harness follows.

use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::warn;

use crate::backend::Operation;
use crate::config::Config;
use crate::error::CoordError;
use crate::gateway::NodeGateway;
use crate::model::{fragment_for, IsolationLevel, NodeId, Row};

const WW_HOLD: Duration = Duration::from_millis(150);
const RW_HOLD: Duration = Duration::from_millis(500);
const RW_READ_GAP: Duration = Duration::from_millis(100);
const RR_THINK_TIME: Duration = Duration::from_millis(50);
// Derived from RW_HOLD (500ms): stable only relative to that scripted sleep.
const BLOCKED_RW: Duration = Duration::from_millis(300);
const READ_DURING_WRITE: Duration = Duration::from_millis(400);
// Derived from WW_HOLD (150ms).
const BLOCKED_WW: Duration = Duration::from_millis(200);
const DEFAULT_ROW_ID: &str = "tt1";

#[derive(Debug, Clone, Serialize)]
pub struct ActorEvent {
    pub actor: String,
    pub offset_ms: u64,
    pub description: String,
}

fn timeline_recorder(start: Instant) -> (Arc<Mutex<Vec<ActorEvent>>>, impl Fn(&str, &str) + Clone) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let record = move |actor: &str, description: &str| {
        sink.lock().unwrap().push(ActorEvent {
            actor: actor.to_string(),
            offset_ms: start.elapsed().as_millis() as u64,
            description: description.to_string(),
        });
    };
    (events, record)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReaderOutcome {
    pub actor: String,
    pub node: NodeId,
    pub first_read: Option<Row>,
    pub second_read: Option<Row>,
    pub repeatable: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConcurrentReadsReport {
    pub row_id: String,
    pub isolation: IsolationLevel,
    pub readers: Vec<ReaderOutcome>,
    pub all_reads_succeeded: bool,
    pub data_consistent_across_nodes: bool,
    pub blocking_observed: bool,
    pub timeline: Vec<ActorEvent>,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadWriteReaderOutcome {
    pub actor: String,
    pub node: NodeId,
    pub first_read: Option<Row>,
    pub second_read: Option<Row>,
    pub read_during_write: bool,
    pub saw_uncommitted_write: bool,
    pub dirty_read_detected: bool,
    pub non_repeatable_read: bool,
    pub blocked: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadWriteConflictReport {
    pub row_id: String,
    pub isolation: IsolationLevel,
    pub readers: Vec<ReadWriteReaderOutcome>,
    pub dirty_reads: usize,
    pub non_repeatable_reads: usize,
    pub blocked_count: usize,
    pub final_snapshot: Vec<(NodeId, Option<Row>)>,
    pub timeline: Vec<ActorEvent>,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriterOutcome {
    pub actor: String,
    pub node: NodeId,
    pub new_value: i64,
    pub succeeded: bool,
    pub deadlock: bool,
    pub blocked: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConcurrentWritesReport {
    pub row_id: String,
    pub isolation: IsolationLevel,
    pub writers: Vec<WriterOutcome>,
    pub successful_writes: usize,
    pub failed_writes: usize,
    pub deadlocks_detected: usize,
    pub blocking_occurred: bool,
    pub final_snapshot: Vec<(NodeId, Option<Row>)>,
    pub timeline: Vec<ActorEvent>,
    pub explanation: String,
}

pub struct ConcurrencyHarness {
    gateway: Arc<NodeGateway>,
    config: Config,
}

impl ConcurrencyHarness {
    pub fn new(gateway: Arc<NodeGateway>, config: Config) -> Self {
        Self { gateway, config }
    }

    /// The fragment holding `row_id`, resolved by reading it back; falls
    /// back to the configured primary kind's fragment if the row can't be
    /// found (the scenario will simply observe `None` reads in that case).
    fn resolve_nodes(&self, row_id: &str) -> (NodeId, NodeId) {
        let central = NodeId::Central;
        let fragment = match self.gateway.query(central, row_id, self.config.default_isolation) {
            Ok(Some(row)) => fragment_for(&row.kind, &self.config),
            _ => fragment_for(&self.config.primary_kind, &self.config),
        };
        (central, fragment)
    }

    fn explain(isolation: IsolationLevel, anomalies: &[&str]) -> String {
        if anomalies.is_empty() {
            format!("under {isolation:?}, no anomalies were observed in this run")
        } else {
            format!("under {isolation:?}, observed: {}", anomalies.join(", "))
        }
    }

    /// Scenario R/R: three concurrent readers of the same row.
    pub fn test_concurrent_reads(&self, row_id: Option<String>, isolation: Option<IsolationLevel>) -> ConcurrentReadsReport {
        let row_id = row_id.unwrap_or_else(|| DEFAULT_ROW_ID.to_string());
        let isolation = isolation.unwrap_or(self.config.default_isolation);
        let (central, fragment) = self.resolve_nodes(&row_id);
        let nodes = [central, fragment, central];

        let barrier = Arc::new(Barrier::new(nodes.len()));
        let start = Instant::now();
        let (events, record) = timeline_recorder(start);
        let (tx, rx) = mpsc::channel();

        let mut handles = Vec::new();
        for (idx, node) in nodes.into_iter().enumerate() {
            let gateway = self.gateway.clone();
            let barrier = barrier.clone();
            let row_id = row_id.clone();
            let tx = tx.clone();
            let record = record.clone();
            handles.push(thread::spawn(move || {
                let actor = format!("reader-{idx}");
                barrier.wait();
                let began = Instant::now();
                let outcome = (|| -> Result<(Option<Row>, Option<Row>), CoordError> {
                    let mut session = gateway.begin(node, isolation)?;
                    record(&actor, "opened transaction");
                    let first = session.query(&row_id)?;
                    thread::sleep(RR_THINK_TIME);
                    let second = session.query(&row_id)?;
                    session.commit()?;
                    record(&actor, "committed");
                    Ok((first, second))
                })();
                let duration_ms = began.elapsed().as_millis() as u64;
                let result = match outcome {
                    Ok((first, second)) => ReaderOutcome {
                        actor,
                        node,
                        repeatable: first == second,
                        first_read: first,
                        second_read: second,
                        duration_ms,
                        error: None,
                    },
                    Err(err) => ReaderOutcome {
                        actor,
                        node,
                        first_read: None,
                        second_read: None,
                        repeatable: false,
                        duration_ms,
                        error: Some(err.to_string()),
                    },
                };
                let _ = tx.send(result);
            }));
        }
        drop(tx);
        for handle in handles {
            let _ = handle.join();
        }
        let mut readers: Vec<_> = rx.into_iter().collect();
        readers.sort_by(|a, b| a.actor.cmp(&b.actor));

        let all_reads_succeeded = readers.iter().all(|r| r.error.is_none());
        let data_consistent_across_nodes = readers
            .iter()
            .all(|r| r.first_read == readers[0].first_read);
        let blocking_observed = readers.iter().any(|r| r.duration_ms > 1000);

        let mut anomalies = Vec::new();
        if !all_reads_succeeded {
            anomalies.push("read failure");
        }
        if !data_consistent_across_nodes {
            anomalies.push("cross-node inconsistency");
        }
        if blocking_observed {
            anomalies.push("blocking");
        }
        if readers.iter().any(|r| !r.repeatable) {
            anomalies.push("non-repeatable read");
        }

        let timeline = events.lock().unwrap().clone();
        ConcurrentReadsReport {
            row_id,
            isolation,
            explanation: Self::explain(isolation, &anomalies),
            timeline,
            readers,
            all_reads_succeeded,
            data_consistent_across_nodes,
            blocking_observed,
        }
    }

    /// Scenario R/W: two writers update the same field concurrently with
    /// two readers observing it.
    pub fn test_read_write_conflict(
        &self,
        row_id: Option<String>,
        new_value: Option<i64>,
        isolation: Option<IsolationLevel>,
    ) -> ReadWriteConflictReport {
        let row_id = row_id.unwrap_or_else(|| DEFAULT_ROW_ID.to_string());
        let isolation = isolation.unwrap_or(self.config.default_isolation);
        let (central, fragment) = self.resolve_nodes(&row_id);
        let target_value = new_value.unwrap_or_else(|| rand::rng().random_range(1..10_000));

        let pre_test_value = self
            .gateway
            .query(central, &row_id, isolation)
            .ok()
            .flatten()
            .map(|r| r.runtime);

        let participants = 4; // 2 writers + 2 readers
        let barrier = Arc::new(Barrier::new(participants));
        let start = Instant::now();
        let (events, record) = timeline_recorder(start);

        let writer_nodes = [central, fragment];
        let mut writer_handles = Vec::new();
        for node in writer_nodes {
            let gateway = self.gateway.clone();
            let barrier = barrier.clone();
            let row_id = row_id.clone();
            let record = record.clone();
            writer_handles.push(thread::spawn(move || {
                let actor = format!("writer-{node}");
                barrier.wait();
                record(&actor, "barrier released");
                let result = (|| -> Result<(), CoordError> {
                    let mut session = gateway.begin(node, isolation)?;
                    let mut row = session.query(&row_id)?.ok_or_else(|| {
                        CoordError::NotFound(row_id.clone())
                    })?;
                    row.runtime = target_value;
                    session.exec(&Operation::Update { id: row_id.clone(), new: row })?;
                    thread::sleep(RW_HOLD);
                    session.commit()?;
                    Ok(())
                })();
                record(&actor, "finished");
                if let Err(err) = result {
                    warn!(%actor, error = %err, "writer failed in R/W scenario");
                }
            }));
        }

        let reader_nodes = [central, fragment];
        let (tx, rx) = mpsc::channel();
        let mut reader_handles = Vec::new();
        for (idx, node) in reader_nodes.into_iter().enumerate() {
            let gateway = self.gateway.clone();
            let barrier = barrier.clone();
            let row_id = row_id.clone();
            let tx = tx.clone();
            let record = record.clone();
            reader_handles.push(thread::spawn(move || {
                let actor = format!("reader-{idx}");
                thread::sleep(Duration::from_millis(10 * idx as u64));
                barrier.wait();
                let began = Instant::now();
                record(&actor, "opened transaction");
                let mut first_read_offset = Duration::ZERO;
                let outcome = (|| -> Result<(Option<Row>, Option<Row>), CoordError> {
                    let mut session = gateway.begin(node, isolation)?;
                    let first = session.query(&row_id)?;
                    first_read_offset = began.elapsed();
                    thread::sleep(RW_READ_GAP);
                    let second = session.query(&row_id)?;
                    session.commit()?;
                    Ok((first, second))
                })();
                let duration = began.elapsed();
                let read_during_write = first_read_offset < READ_DURING_WRITE;
                let (first, second) = outcome.unwrap_or((None, None));
                let saw_uncommitted_write = first
                    .as_ref()
                    .map(|r| r.runtime == target_value && Some(r.runtime) != pre_test_value)
                    .unwrap_or(false);
                let dirty_read_detected = saw_uncommitted_write && read_during_write;
                let non_repeatable_read = first != second;
                let blocked = duration > BLOCKED_RW;
                let _ = tx.send(ReadWriteReaderOutcome {
                    actor,
                    node,
                    first_read: first,
                    second_read: second,
                    read_during_write,
                    saw_uncommitted_write,
                    dirty_read_detected,
                    non_repeatable_read,
                    blocked,
                    duration_ms: duration.as_millis() as u64,
                });
            }));
        }
        drop(tx);
        for handle in writer_handles.into_iter().chain(reader_handles) {
            let _ = handle.join();
        }

        let mut readers: Vec<_> = rx.into_iter().collect();
        readers.sort_by(|a, b| a.actor.cmp(&b.actor));

        let dirty_reads = readers.iter().filter(|r| r.dirty_read_detected).count();
        let non_repeatable_reads = readers.iter().filter(|r| r.non_repeatable_read).count();
        let blocked_count = readers.iter().filter(|r| r.blocked).count();

        let final_snapshot = vec![
            (central, self.gateway.query(central, &row_id, isolation).ok().flatten()),
            (fragment, self.gateway.query(fragment, &row_id, isolation).ok().flatten()),
        ];

        let mut anomalies = Vec::new();
        if dirty_reads > 0 {
            anomalies.push("dirty read");
        }
        if non_repeatable_reads > 0 {
            anomalies.push("non-repeatable read");
        }
        if blocked_count > 0 {
            anomalies.push("blocking");
        }

        let timeline = events.lock().unwrap().clone();
        ReadWriteConflictReport {
            row_id,
            isolation,
            explanation: Self::explain(isolation, &anomalies),
            timeline,
            readers,
            dirty_reads,
            non_repeatable_reads,
            blocked_count,
            final_snapshot,
        }
    }

    /// Scenario W/W: three writers (one central, two on the fragment)
    /// contend for the same row via `FOR UPDATE`.
    pub fn test_concurrent_writes(
        &self,
        updates: Option<Vec<i64>>,
        isolation: Option<IsolationLevel>,
    ) -> ConcurrentWritesReport {
        let row_id = DEFAULT_ROW_ID.to_string();
        let isolation = isolation.unwrap_or(self.config.default_isolation);
        let (central, fragment) = self.resolve_nodes(&row_id);
        let nodes = [central, fragment, fragment];
        let mut rng = rand::rng();
        let values: Vec<i64> = updates.unwrap_or_else(|| (0..3).map(|_| rng.random_range(1..10_000)).collect());

        let barrier = Arc::new(Barrier::new(nodes.len()));
        let start = Instant::now();
        let (events, record) = timeline_recorder(start);
        let (tx, rx) = mpsc::channel();

        let mut handles = Vec::new();
        for (idx, node) in nodes.into_iter().enumerate() {
            let gateway = self.gateway.clone();
            let barrier = barrier.clone();
            let row_id = row_id.clone();
            let tx = tx.clone();
            let record = record.clone();
            let new_value = values[idx % values.len()];
            handles.push(thread::spawn(move || {
                let actor = format!("writer-{idx}-{node}");
                barrier.wait();
                let began = Instant::now();
                record(&actor, "barrier released, acquiring row lock");
                let result = (|| -> Result<(), CoordError> {
                    let mut session = gateway.begin(node, isolation)?;
                    let mut row = session
                        .query_for_update(&row_id)?
                        .ok_or_else(|| CoordError::NotFound(row_id.clone()))?;
                    record(&actor, "lock acquired");
                    thread::sleep(WW_HOLD);
                    row.runtime = new_value;
                    session.exec(&Operation::Update { id: row_id.clone(), new: row })?;
                    session.commit()?;
                    Ok(())
                })();
                let duration_ms = began.elapsed().as_millis() as u64;
                let outcome = match result {
                    Ok(()) => WriterOutcome {
                        actor,
                        node,
                        new_value,
                        succeeded: true,
                        deadlock: false,
                        blocked: duration_ms > BLOCKED_WW.as_millis() as u64,
                        duration_ms,
                        error: None,
                    },
                    Err(err) => WriterOutcome {
                        actor,
                        node,
                        new_value,
                        succeeded: false,
                        deadlock: matches!(err, CoordError::Deadlock),
                        blocked: duration_ms > BLOCKED_WW.as_millis() as u64,
                        duration_ms,
                        error: Some(err.to_string()),
                    },
                };
                let _ = tx.send(outcome);
            }));
        }
        drop(tx);
        for handle in handles {
            let _ = handle.join();
        }
        let mut writers: Vec<_> = rx.into_iter().collect();
        writers.sort_by(|a, b| a.actor.cmp(&b.actor));

        let successful_writes = writers.iter().filter(|w| w.succeeded).count();
        let failed_writes = writers.iter().filter(|w| !w.succeeded).count();
        let deadlocks_detected = writers.iter().filter(|w| w.deadlock).count();
        let blocking_occurred = writers.iter().any(|w| w.blocked);

        let final_snapshot = vec![
            (central, self.gateway.query(central, &row_id, isolation).ok().flatten()),
            (fragment, self.gateway.query(fragment, &row_id, isolation).ok().flatten()),
        ];

        let mut anomalies = Vec::new();
        if deadlocks_detected > 0 {
            anomalies.push("deadlock");
        }
        if blocking_occurred {
            anomalies.push("lock-wait blocking");
        }
        if failed_writes > 0 && deadlocks_detected == 0 {
            anomalies.push("write failure");
        }

        let timeline = events.lock().unwrap().clone();
        ConcurrentWritesReport {
            row_id,
            isolation,
            explanation: Self::explain(isolation, &anomalies),
            timeline,
            writers,
            successful_writes,
            failed_writes,
            deadlocks_detected,
            blocking_occurred,
            final_snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryNode, NodeBackend};
    use crate::write_coordinator::WriteCoordinator;
    use std::collections::HashMap;

    fn harness_with_seed_row() -> ConcurrencyHarness {
        let config = Config::default();
        let mut backends: HashMap<NodeId, Arc<dyn NodeBackend>> = HashMap::new();
        for id in NodeId::ALL {
            backends.insert(id, Arc::new(InMemoryNode::new()) as Arc<dyn NodeBackend>);
        }
        let gateway = Arc::new(NodeGateway::new(backends, &config).unwrap());
        let mut logs = HashMap::new();
        for id in NodeId::ALL {
            logs.insert(id, Arc::new(crate::replication_log::ReplicationLog::new()));
        }
        let coordinator = WriteCoordinator::new(gateway.clone(), logs, config.clone());
        coordinator.insert_title(Row::new("tt1", "movie", "A", 2020, 90, "X"));
        ConcurrencyHarness::new(gateway, config)
    }

    #[test]
    fn concurrent_reads_are_consistent_and_repeatable() {
        let harness = harness_with_seed_row();
        let report = harness.test_concurrent_reads(None, Some(IsolationLevel::RepeatableRead));
        assert!(report.all_reads_succeeded);
        assert!(report.data_consistent_across_nodes);
        assert!(!report.blocking_observed);
        assert!(report.readers.iter().all(|r| r.repeatable));
    }

    #[test]
    fn read_write_conflict_reports_a_consistent_final_value() {
        let harness = harness_with_seed_row();
        let report = harness.test_read_write_conflict(None, Some(777), Some(IsolationLevel::ReadCommitted));
        assert_eq!(report.readers.len(), 2);
        assert!(report
            .final_snapshot
            .iter()
            .all(|(_, row)| row.as_ref().map(|r| r.runtime) == Some(777)));
    }

    #[test]
    fn concurrent_writes_converge_on_one_value() {
        let harness = harness_with_seed_row();
        let report = harness.test_concurrent_writes(None, Some(IsolationLevel::ReadCommitted));
        assert!(report.successful_writes >= 1);
        let values: Vec<_> = report
            .writers
            .iter()
            .filter(|w| w.succeeded)
            .map(|w| w.new_value)
            .collect();
        let snapshots: Vec<_> = report
            .final_snapshot
            .iter()
            .filter_map(|(_, row)| row.as_ref().map(|r| r.runtime))
            .collect();
        for snapshot in snapshots {
            assert!(values.contains(&snapshot));
        }
    }
}
