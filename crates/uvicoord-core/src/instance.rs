use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

const MAX_INSTANCE_ID_LEN: usize = 64;
const GENERATED_ID_LEN: usize = 8;

/// One live instance of an app, bound to exactly one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub app_name: String,
    pub instance_id: String,
    pub port: u16,
    pub pid: u32,
    /// Process start time in clock ticks, when the host exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_marker: Option<u64>,
    pub started_at: DateTime<Utc>,
}

/// Parameters of a `start` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Process that owns the instance.
    pub pid: u32,
}

impl StartRequest {
    pub fn new(pid: u32) -> Self {
        Self {
            instance_id: None,
            port: None,
            pid,
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// Trims and checks a caller-supplied instance id.
///
/// Ids end up in log file names, so only `[A-Za-z0-9._-]` is accepted.
pub fn normalize_instance_id(id: &str) -> Result<String, RegistryError> {
    let id = id.trim();
    if id.is_empty() || id.len() > MAX_INSTANCE_ID_LEN {
        return Err(RegistryError::InvalidInstanceId(id.to_string()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(RegistryError::InvalidInstanceId(id.to_string()));
    }
    Ok(id.to_string())
}

/// Random short id, regenerated until `taken` rejects none.
pub fn generate_instance_id(taken: impl Fn(&str) -> bool) -> String {
    loop {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(GENERATED_ID_LEN);
        if !taken(&id) {
            return id;
        }
    }
}
