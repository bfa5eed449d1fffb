use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// One of the three logical storage nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeId {
    Central,
    FragA,
    FragB,
}

impl NodeId {
    pub const ALL: [NodeId; 3] = [NodeId::Central, NodeId::FragA, NodeId::FragB];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::Central => "central",
            NodeId::FragA => "fragA",
            NodeId::FragB => "fragB",
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session-scoped isolation level, consumed unchanged by the simulated
/// storage backend and by the concurrency harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

/// A self-describing scalar, used both as a row's payload fields (when
/// read back generically) and as a replication log entry's replay
/// parameters. Avoids committing to a language-specific serialisation for
/// the log's `params` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Null,
}

/// A media title row. `kind` is immutable for a given `id` and determines
/// which fragment node must hold the row (see [`fragment_for`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub year: i64,
    pub runtime: i64,
    pub genres: String,
    pub last_updated: DateTime<Utc>,
}

impl Row {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        title: impl Into<String>,
        year: i64,
        runtime: i64,
        genres: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            title: title.into(),
            year,
            runtime,
            genres: genres.into(),
            last_updated: Utc::now(),
        }
    }

    /// Applies a partial update, refusing any change to `kind`. A title's
    /// fragment placement is derived from `kind`, so changing it in place
    /// would silently orphan the row on the wrong node.
    pub fn apply(&mut self, fields: &UpdateFields) -> Result<(), crate::error::CoordError> {
        if let Some(kind) = &fields.kind {
            if kind != &self.kind {
                return Err(crate::error::CoordError::InvalidOperation(
                    "kind is immutable for an existing row".to_string(),
                ));
            }
        }
        if let Some(title) = &fields.title {
            self.title = title.clone();
        }
        if let Some(year) = fields.year {
            self.year = year;
        }
        if let Some(runtime) = fields.runtime {
            self.runtime = runtime;
        }
        if let Some(genres) = &fields.genres {
            self.genres = genres.clone();
        }
        self.last_updated = Utc::now();
        Ok(())
    }
}

/// A partial update to a row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFields {
    pub kind: Option<String>,
    pub title: Option<String>,
    pub year: Option<i64>,
    pub runtime: Option<i64>,
    pub genres: Option<String>,
}

/// Which fragment a row of the given `kind` must live on, per the
/// placement invariant `F(primary-kind) = fragA`, `F(other-kind) = fragB`.
pub fn fragment_for(kind: &str, config: &Config) -> NodeId {
    if kind == config.primary_kind {
        NodeId::FragA
    } else {
        NodeId::FragB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_routes_primary_kind_to_frag_a() {
        let cfg = Config::default();
        assert_eq!(fragment_for("movie", &cfg), NodeId::FragA);
        assert_eq!(fragment_for("series", &cfg), NodeId::FragB);
    }

    #[test]
    fn apply_rejects_kind_change() {
        let mut row = Row::new("tt1", "movie", "A", 2020, 90, "X");
        let fields = UpdateFields {
            kind: Some("series".to_string()),
            ..Default::default()
        };
        assert!(row.apply(&fields).is_err());
        assert_eq!(row.kind, "movie");
    }

    #[test]
    fn apply_updates_payload_fields() {
        let mut row = Row::new("tt1", "movie", "A", 2020, 90, "X");
        let fields = UpdateFields {
            runtime: Some(95),
            ..Default::default()
        };
        row.apply(&fields).unwrap();
        assert_eq!(row.runtime, 95);
        assert_eq!(row.title, "A");
    }
}
