use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::IsolationLevel;

/// Every tunable enumerated in the external-interfaces section: reconciler
/// cadence, the replication log's hard retry ceiling, node-connect
/// timing, and the session isolation level writes use when the caller
/// doesn't specify one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How often the background reconciler visits each source node's log.
    pub retry_interval: Duration,
    /// Hard ceiling on automatic replay attempts before an entry is `FAILED`.
    pub max_retries: u32,
    /// Per-node connect timeout used by the gateway's startup probe.
    pub connect_timeout: Duration,
    /// Number of startup connection attempts before the gateway gives up.
    pub startup_retries: u32,
    /// Delay between startup connection attempts.
    pub startup_delay: Duration,
    /// Isolation level used when a caller doesn't specify one.
    pub default_isolation: IsolationLevel,
    /// The `kind` value that routes a row to fragment A; every other value
    /// routes to fragment B. Kind is otherwise an opaque string.
    pub primary_kind: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
            max_retries: 5,
            connect_timeout: Duration::from_secs(5),
            startup_retries: 30,
            startup_delay: Duration::from_secs(2),
            default_isolation: IsolationLevel::ReadCommitted,
            primary_kind: "movie".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries == 0 {
            return Err("max_retries must be greater than 0".to_string());
        }
        if self.retry_interval.is_zero() {
            return Err("retry_interval must be greater than 0".to_string());
        }
        if self.primary_kind.is_empty() {
            return Err("primary_kind must not be empty".to_string());
        }
        Ok(())
    }
}
