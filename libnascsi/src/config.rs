//! Driver-wide controller configuration.
//!
//! Environment variables (all optional):
//! - `NASCSI_PLUGIN_NAME`: plugin name reported by the identity service.
//!   Defaults to [`DEFAULT_PLUGIN_NAME`].
//! - `NASCSI_REPLICATION_TIMEOUT_SECS`: ceiling for detached snapshot and
//!   detached clone replication.  Defaults to 30 minutes.
//! - `NASCSI_SNAPSHOT_PARENT_DATASET`: root dataset for detached snapshots
//!   when a request does not name one.

use std::time::Duration;

use crate::error::CsiError;

pub const DEFAULT_PLUGIN_NAME: &str = "nas.csi.rk8s.io";

/// Default replication ceiling: large zvols take a while to send/receive.
pub const DEFAULT_REPLICATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Capacity used when a request asks for 0 bytes.
pub const DEFAULT_CAPACITY_BYTES: u64 = 1 << 30;

/// Block size of every zvol created for NVMe-oF volumes.
pub const ZVOL_BLOCK_SIZE: &str = "16K";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub plugin_name: String,
    pub replication_timeout: Duration,
    pub snapshot_parent_dataset: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            plugin_name: DEFAULT_PLUGIN_NAME.to_owned(),
            replication_timeout: DEFAULT_REPLICATION_TIMEOUT,
            snapshot_parent_dataset: None,
        }
    }
}

impl ControllerConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, CsiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CsiError> {
        let mut config = Self::default();
        if let Some(name) = lookup("NASCSI_PLUGIN_NAME").filter(|v| !v.is_empty()) {
            config.plugin_name = name;
        }
        if let Some(secs) = lookup("NASCSI_REPLICATION_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|e| {
                CsiError::InvalidArgument(format!("NASCSI_REPLICATION_TIMEOUT_SECS {secs:?}: {e}"))
            })?;
            config.replication_timeout = Duration::from_secs(secs);
        }
        config.snapshot_parent_dataset = lookup("NASCSI_SNAPSHOT_PARENT_DATASET")
            .map(|v| v.trim().trim_matches('/').to_owned())
            .filter(|v| !v.is_empty());
        Ok(config)
    }

    pub fn with_snapshot_parent_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.snapshot_parent_dataset = Some(dataset.into());
        self
    }

    pub fn with_replication_timeout(mut self, timeout: Duration) -> Self {
        self.replication_timeout = timeout;
        self
    }
}
