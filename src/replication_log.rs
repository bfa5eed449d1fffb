//! Per-node durable replication log: an append-only record (from the Write
//! Coordinator's perspective) of writes one node owes another. Physically
//! this would live inside each storage node alongside its data; here it's
//! one `ReplicationLog` per logical node, held by the process alongside the
//! corresponding [`crate::backend::NodeBackend`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::Operation;
use crate::model::{NodeId, ParamValue, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

/// A replication log entry, stored on the node that performed the
/// successful write (`source_node`), describing the same write still owed
/// to `target_node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub txn_id: Uuid,
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub op: OpKind,
    pub record_id: String,
    pub sql: String,
    pub params: Vec<ParamValue>,
    pub status: LogStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LogEntry {
    /// Reconstructs the node command this entry describes, for replay.
    pub fn to_operation(&self) -> Operation {
        match self.op {
            OpKind::Insert => Operation::Insert(row_from_params(&self.record_id, &self.params)),
            OpKind::Update => Operation::Update {
                id: self.record_id.clone(),
                new: row_from_params(&self.record_id, &self.params),
            },
            OpKind::Delete => Operation::Delete {
                id: self.record_id.clone(),
            },
        }
    }
}

fn param_str(params: &[ParamValue], idx: usize) -> String {
    match params.get(idx) {
        Some(ParamValue::Str(s)) => s.clone(),
        _ => String::new(),
    }
}

fn param_int(params: &[ParamValue], idx: usize) -> i64 {
    match params.get(idx) {
        Some(ParamValue::Int(i)) => *i,
        _ => 0,
    }
}

fn row_from_params(id: &str, params: &[ParamValue]) -> Row {
    Row {
        id: id.to_string(),
        kind: param_str(params, 0),
        title: param_str(params, 1),
        year: param_int(params, 2),
        runtime: param_int(params, 3),
        genres: param_str(params, 4),
        last_updated: Utc::now(),
    }
}

/// Renders a row into the self-describing scalar sequence the log persists
/// as `params`, avoiding a language-specific serialisation format.
pub fn row_to_params(row: &Row) -> Vec<ParamValue> {
    vec![
        ParamValue::Str(row.kind.clone()),
        ParamValue::Str(row.title.clone()),
        ParamValue::Int(row.year),
        ParamValue::Int(row.runtime),
        ParamValue::Str(row.genres.clone()),
        ParamValue::Timestamp(row.last_updated),
    ]
}

/// A human-readable (but never parsed) description of the replayed
/// statement, kept purely for the audit trail (the actual replay uses
/// [`LogEntry::to_operation`]).
pub fn describe(op: &Operation) -> String {
    match op {
        Operation::Insert(row) => format!("INSERT INTO titles (id, ...) VALUES ('{}', ...)", row.id),
        Operation::Update { id, .. } => format!("UPDATE titles SET ... WHERE id = '{id}'"),
        Operation::Delete { id } => format!("DELETE FROM titles WHERE id = '{id}'"),
    }
}

/// Builds the params sequence a replication entry should carry for a given
/// operation. Delete carries no payload beyond the id already recorded on
/// the entry itself.
pub fn params_for(op: &Operation) -> Vec<ParamValue> {
    match op {
        Operation::Insert(row) => row_to_params(row),
        Operation::Update { new, .. } => row_to_params(new),
        Operation::Delete { .. } => Vec::new(),
    }
}

pub fn op_kind(op: &Operation) -> OpKind {
    match op {
        Operation::Insert(_) => OpKind::Insert,
        Operation::Update { .. } => OpKind::Update,
        Operation::Delete { .. } => OpKind::Delete,
    }
}

/// Per-node durable queue of pending replications. `append` is the only
/// operation the Write Coordinator calls; everything else is the Recovery
/// Engine's. The background reconciler and the coordinator's foreground
/// writes land on this concurrently, so entries are kept in a sharded map
/// rather than a single lock around a `HashMap`.
pub struct ReplicationLog {
    entries: DashMap<Uuid, LogEntry>,
}

impl ReplicationLog {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn append(
        &self,
        source_node: NodeId,
        target_node: NodeId,
        op: &Operation,
        max_retries: u32,
    ) -> Uuid {
        let now = Utc::now();
        let entry = LogEntry {
            txn_id: Uuid::new_v4(),
            source_node,
            target_node,
            op: op_kind(op),
            record_id: op.record_id().to_string(),
            sql: describe(op),
            params: params_for(op),
            status: LogStatus::Pending,
            retry_count: 0,
            max_retries,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let txn_id = entry.txn_id;
        self.entries.insert(txn_id, entry);
        txn_id
    }

    /// Entries still eligible for automatic retry, oldest first.
    pub fn list_pending(&self) -> Vec<LogEntry> {
        let mut pending: Vec<LogEntry> = self
            .entries
            .iter()
            .filter(|e| e.status == LogStatus::Pending && e.retry_count < e.max_retries)
            .map(|e| e.clone())
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending
    }

    pub fn list_pending_targeting(&self, target: NodeId) -> Vec<LogEntry> {
        self.list_pending()
            .into_iter()
            .filter(|e| e.target_node == target)
            .collect()
    }

    pub fn bump_retry(&self, txn_id: Uuid) {
        if let Some(mut entry) = self.entries.get_mut(&txn_id) {
            entry.retry_count += 1;
            entry.updated_at = Utc::now();
        }
    }

    pub fn mark(&self, txn_id: Uuid, status: LogStatus, error: Option<String>) {
        if let Some(mut entry) = self.entries.get_mut(&txn_id) {
            entry.status = status;
            entry.last_error = error;
            entry.updated_at = Utc::now();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.list_pending().len()
    }

    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status == LogStatus::Failed).count()
    }

    pub fn all(&self) -> Vec<LogEntry> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    /// Renders every entry as pretty-printed JSON, for operators inspecting
    /// the audit trail outside of `tracing` output.
    pub fn export_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(&self.all())?)
    }
}

impl Default for ReplicationLog {
    fn default() -> Self {
        Self::new()
    }
}
