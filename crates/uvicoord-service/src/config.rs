use std::{net::SocketAddr, path::PathBuf, time::Duration};

use uvicoord_core::{EngineConfig, PortRange};

const DEFAULT_LISTEN: &str = "127.0.0.1:9000";
const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 500;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_bool(raw: Option<&str>, default_value: bool) -> bool {
    match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default_value,
    }
}

fn env_bool(name: &str, default_value: bool) -> bool {
    parse_bool(std::env::var(name).ok().as_deref(), default_value)
}

pub(crate) fn liveness_timeout(raw: Option<u64>) -> Duration {
    Duration::from_millis(
        raw.map(|v| v.clamp(50, 10_000))
            .unwrap_or(DEFAULT_LIVENESS_TIMEOUT_MS),
    )
}

/// `None` disables the periodic sweep.
pub(crate) fn sweep_interval(raw: Option<u64>) -> Option<Duration> {
    match raw {
        Some(0) => None,
        Some(v) => Some(Duration::from_millis(v.clamp(1_000, 3_600_000))),
        None => Some(Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS)),
    }
}

pub(crate) fn port_range(raw: Option<&str>) -> PortRange {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v.parse().unwrap_or_else(|err| {
            tracing::warn!(value = v, error = %err, "invalid default port range; using 8100-8199");
            PortRange::default()
        }),
        None => PortRange::default(),
    }
}

pub(crate) fn absolute(raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p;
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(p)
}

/// Directory for daily-rolled service logs; stdout when unset.
pub fn log_dir_from_env() -> Option<PathBuf> {
    std::env::var("UVICOORD_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| absolute(v.trim()))
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen: SocketAddr,
    pub data_root: PathBuf,
    pub engine: EngineConfig,
    pub sweep_interval: Option<Duration>,
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_raw =
            std::env::var("UVICOORD_LISTEN").unwrap_or_else(|_| DEFAULT_LISTEN.to_string());
        let listen: SocketAddr = listen_raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid UVICOORD_LISTEN {listen_raw:?}: {e}"))?;

        let data_root = absolute(
            &std::env::var("UVICOORD_DATA_ROOT").unwrap_or_else(|_| "./data".to_string()),
        );

        let engine = EngineConfig {
            any_range: port_range(std::env::var("UVICOORD_DEFAULT_PORT_RANGE").ok().as_deref()),
            liveness_timeout: liveness_timeout(env_u64("UVICOORD_LIVENESS_TIMEOUT_MS")),
            probe_bind: env_bool("UVICOORD_PROBE_PORTS", true),
        };

        Ok(Self {
            listen,
            data_root,
            engine,
            sweep_interval: sweep_interval(env_u64("UVICOORD_SWEEP_INTERVAL_MS")),
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_root.join("registry.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }
}
