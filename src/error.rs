use thiserror::Error;

/// Crate-wide error type.
///
/// Variants map directly onto the error kinds enumerated in the write-path
/// and recovery-engine error tables: a node that refused a connection, a
/// constraint violated on insert, an update/delete of a row that exists
/// nowhere reachable, an engine-reported lock conflict, and the hard
/// failure when both a row's primary and its peer are unavailable.
#[derive(Error, Debug, Clone)]
pub enum CoordError {
    #[error("node {0} is unavailable")]
    NodeUnavailable(String),

    #[error("all nodes unavailable for this write")]
    AllNodesUnavailable,

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("deadlock detected")]
    Deadlock,

    #[error("lock wait timeout")]
    LockTimeout,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;

impl From<serde_json::Error> for CoordError {
    fn from(e: serde_json::Error) -> Self {
        CoordError::Serialization(e.to_string())
    }
}
