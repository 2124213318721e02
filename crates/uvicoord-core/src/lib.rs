//! Port allocation and instance registry for locally run ASGI apps.
//!
//! Apps are registered in a [`Catalog`] with a [`PortStrategy`]. The [`Registry`] hands
//! out ports to instances, keeps them unique across all apps, and reclaims the ports of
//! instances whose process has died.

pub mod catalog;
pub mod config;
pub mod error;
pub mod instance;
pub mod liveness;
pub mod port_probe;
pub mod registry;
pub mod snapshot;
pub mod strategy;
mod sweeper;

pub use catalog::{AppConfig, Catalog, DEFAULT_COMMAND};
pub use config::EngineConfig;
pub use error::{AllocationError, CatalogError, RegistryError, StrategyError};
pub use instance::{InstanceRecord, StartRequest};
pub use liveness::{LivenessChecker, ProcLiveness};
pub use registry::{Registry, RegistryStatus};
pub use snapshot::{RegistrySnapshot, RestoreReport, SnapshotSink};
pub use strategy::{PortRange, PortStrategy, allocate};
