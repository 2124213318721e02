use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use uvicoord_core::{CatalogError, RegistryError};

use crate::launcher::LaunchError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Error returned by every handler, rendered as `{code, message, hint?}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
                hint: None,
            },
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.body.hint = Some(truncate_utf8(&hint.into(), MAX_HINT_BYTES));
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_request", message)
    }

    pub fn code(&self) -> &str {
        &self.body.code
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "app_not_found" | "instance_not_found" => StatusCode::NOT_FOUND,
        "duplicate_app" | "app_has_live_instances" | "instance_id_in_use" => StatusCode::CONFLICT,
        "strategy_exhausted" | "port_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let out = Self::new(status_for(err.code()), err.code(), err.to_string());
        match err {
            RegistryError::StrategyExhausted(_) => {
                out.with_hint("Release an instance or widen the app's port strategy.")
            }
            RegistryError::PortUnavailable { .. } => {
                out.with_hint("Omit the port to let the registry pick one.")
            }
            _ => out,
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        let out = Self::new(status_for(err.code()), err.code(), err.to_string());
        match err {
            CatalogError::AppHasLiveInstances { .. } => {
                out.with_hint("Stop the instances first, or retry with ?cascade=true.")
            }
            CatalogError::PathNotFound(_) => out.with_hint("Register the app with an existing directory."),
            _ => out,
        }
    }
}

impl From<LaunchError> for ApiError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::Registry(err) => err.into(),
            LaunchError::Spawn(err) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "spawn_failed",
                format!("{err:#}"),
            )
            .with_hint("Check the app's command and working directory."),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = self.code(), message = %self.body.message, "request failed");
        }
        (self.status, Json(self.body)).into_response()
    }
}
