use std::time::Duration;

use crate::strategy::PortRange;

pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(500);

/// Engine settings fixed for the lifetime of a [`crate::Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Pool shared by every app using [`crate::PortStrategy::Any`].
    pub any_range: PortRange,
    /// Upper bound on a single liveness probe.
    pub liveness_timeout: Duration,
    /// Skip candidates that fail a loopback bind.
    pub probe_bind: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            any_range: PortRange::default(),
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            probe_bind: false,
        }
    }
}
