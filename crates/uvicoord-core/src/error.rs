use std::path::PathBuf;

/// Failure of the pure port evaluator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("port {0} is not available")]
    PortUnavailable(u16),
    #[error("no eligible port left")]
    StrategyExhausted,
}

/// A strategy descriptor that is internally inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrategyError {
    #[error("range low {low} is greater than high {high}")]
    InvertedRange { low: u16, high: u16 },
    #[error("port list is empty")]
    EmptyList,
    #[error("port {0} appears more than once in the list")]
    DuplicatePort(u16),
    #[error("step must be at least 1")]
    ZeroStep,
    #[error("count must be at least 1")]
    ZeroCount,
    #[error("stepped ports overflow: {start} + {step} * ({count} - 1) > 65535")]
    SteppedOverflow { start: u16, step: u16, count: u16 },
    #[error("port {0} is below the minimum of {min}", min = crate::strategy::MIN_PORT)]
    PortBelowMinimum(u16),
    #[error("invalid port range: {0}")]
    Unparsable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("app not found: {0}")]
    AppNotFound(String),
    #[error("app already registered: {0}")]
    DuplicateApp(String),
    #[error("invalid app name: {0:?}")]
    InvalidAppName(String),
    #[error("invalid strategy: {0}")]
    InvalidStrategy(#[from] StrategyError),
    #[error("app path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),
    #[error("app {name} still has {count} live instance(s)")]
    AppHasLiveInstances { name: String, count: usize },
}

impl CatalogError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AppNotFound(_) => "app_not_found",
            Self::DuplicateApp(_) => "duplicate_app",
            Self::InvalidAppName(_) => "invalid_app_name",
            Self::InvalidStrategy(_) => "invalid_strategy",
            Self::PathNotFound(_) => "path_not_found",
            Self::AppHasLiveInstances { .. } => "app_has_live_instances",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("app not found: {0}")]
    AppNotFound(String),
    #[error("port {port} is not available for app {app}")]
    PortUnavailable { app: String, port: u16 },
    #[error("no free port left for app {0}")]
    StrategyExhausted(String),
    #[error("instance {instance_id} of app {app} not found")]
    InstanceNotFound { app: String, instance_id: String },
    #[error("instance {instance_id} of app {app} is already live")]
    InstanceIdInUse { app: String, instance_id: String },
    #[error("invalid instance id: {0:?}")]
    InvalidInstanceId(String),
}

impl RegistryError {
    pub(crate) fn allocation(app: &str, err: AllocationError) -> Self {
        match err {
            AllocationError::PortUnavailable(port) => Self::PortUnavailable {
                app: app.to_string(),
                port,
            },
            AllocationError::StrategyExhausted => Self::StrategyExhausted(app.to_string()),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::AppNotFound(_) => "app_not_found",
            Self::PortUnavailable { .. } => "port_unavailable",
            Self::StrategyExhausted(_) => "strategy_exhausted",
            Self::InstanceNotFound { .. } => "instance_not_found",
            Self::InstanceIdInUse { .. } => "instance_id_in_use",
            Self::InvalidInstanceId(_) => "invalid_instance_id",
        }
    }
}
