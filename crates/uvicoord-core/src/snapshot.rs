use serde::{Deserialize, Serialize};

use crate::catalog::AppConfig;
use crate::instance::InstanceRecord;

/// On-disk format of `registry.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Increases with every snapshot taken; consumers can drop out-of-order deliveries.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
}

/// Called after every mutation, outside any registry lock. Errors are only logged.
pub trait SnapshotSink: Send + Sync + 'static {
    fn registry_changed(&self, snapshot: RegistrySnapshot) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub apps: usize,
    pub instances: usize,
    pub dropped: usize,
    /// Restored instances found dead by the follow-up sweep.
    pub reclaimed: usize,
}
