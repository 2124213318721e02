use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use uvicoord_core::{AppConfig, InstanceRecord, PortStrategy, RegistryError, StartRequest};

use crate::error::ApiError;
use crate::launcher::{Launched, RunRequest};
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/apps", get(list_apps).post(register_app))
        .route("/apps/:name", get(get_app).delete(unregister_app))
        .route("/apps/:name/strategy", put(update_strategy))
        .route("/apps/:name/instances", post(start_instance))
        .route("/apps/:name/run", post(run_app))
        .route("/apps/:name/instances/:id", delete(release_instance))
        .route("/apps/:name/instances/:id/pid", put(attach_pid))
        .route("/port/allocate", post(allocate_port))
        .route("/port/release", post(release_port))
        .route("/instances", get(list_instances))
        .route("/instances/cleanup", post(cleanup_instances))
        .route("/instances/:app", get(list_app_instances))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    apps_registered: usize,
    active_instances: usize,
    claimed_ports: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.registry.status();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        apps_registered: status.apps_registered,
        active_instances: status.active_instances,
        claimed_ports: state.registry.claimed_ports(),
    })
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    listen: String,
    data_root: String,
    snapshot_path: String,
    any_range: String,
    liveness_timeout_ms: u64,
    probe_ports: bool,
    sweep_interval_ms: Option<u64>,
}

// Fixed for the life of the process; there is no reload.
async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let cfg = &state.config;
    Json(ConfigResponse {
        listen: cfg.listen.to_string(),
        data_root: cfg.data_root.display().to_string(),
        snapshot_path: cfg.snapshot_path().display().to_string(),
        any_range: cfg.engine.any_range.to_string(),
        liveness_timeout_ms: u64::try_from(cfg.engine.liveness_timeout.as_millis()).unwrap_or(u64::MAX),
        probe_ports: cfg.engine.probe_bind,
        sweep_interval_ms: cfg
            .sweep_interval
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
    })
}

const LIST_PORTS_PREVIEW: usize = 10;

#[derive(Debug, Serialize)]
pub struct AppView {
    #[serde(flatten)]
    app: AppConfig,
    capacity: usize,
    available_ports: Vec<u16>,
}

fn app_view(state: &AppState, app: AppConfig) -> AppView {
    let any = state.registry.config().any_range;
    AppView {
        capacity: app.strategy.capacity(any),
        available_ports: app.strategy.valid_ports(any),
        app,
    }
}

/// Listing shows only the first few ports; `GET /apps/{name}` has them all.
async fn list_apps(State(state): State<AppState>) -> Json<Vec<AppView>> {
    let apps = state.registry.list_apps();
    Json(
        apps.into_iter()
            .map(|a| {
                let mut view = app_view(&state, a);
                view.available_ports.truncate(LIST_PORTS_PREVIEW);
                view
            })
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
pub struct RegisterAppRequest {
    #[serde(flatten)]
    app: AppConfig,
    #[serde(default)]
    replace: bool,
}

async fn register_app(
    State(state): State<AppState>,
    Json(req): Json<RegisterAppRequest>,
) -> ApiResult<(StatusCode, Json<AppView>)> {
    let app = state.registry.register_app(req.app, req.replace).await?;
    Ok((StatusCode::CREATED, Json(app_view(&state, app))))
}

async fn get_app(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<AppView>> {
    let app = state
        .registry
        .get_app(&name)
        .ok_or(RegistryError::AppNotFound(name))?;
    Ok(Json(app_view(&state, app)))
}

#[derive(Debug, Default, Deserialize)]
pub struct CascadeQuery {
    #[serde(default)]
    cascade: bool,
}

#[derive(Debug, Serialize)]
pub struct UnregisterResponse {
    name: String,
    released: Vec<InstanceRecord>,
}

async fn unregister_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<CascadeQuery>,
) -> ApiResult<Json<UnregisterResponse>> {
    let released = state.registry.unregister_app(&name, q.cascade).await?;
    Ok(Json(UnregisterResponse { name, released }))
}

async fn update_strategy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(strategy): Json<PortStrategy>,
) -> ApiResult<Json<AppView>> {
    let app = state.registry.update_strategy(&name, strategy).await?;
    Ok(Json(app_view(&state, app)))
}

async fn start_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<StartRequest>,
) -> ApiResult<(StatusCode, Json<InstanceRecord>)> {
    let record = state.registry.start(&name, req).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn run_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<RunRequest>,
) -> ApiResult<(StatusCode, Json<Launched>)> {
    let launched = state.launcher.run(&name, req).await?;
    Ok((StatusCode::CREATED, Json(launched)))
}

async fn release_instance(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<Json<InstanceRecord>> {
    Ok(Json(state.registry.release(&name, &id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AttachPidRequest {
    pid: u32,
}

async fn attach_pid(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Json(req): Json<AttachPidRequest>,
) -> ApiResult<Json<InstanceRecord>> {
    Ok(Json(state.registry.attach_pid(&name, &id, req.pid).await?))
}

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    app_name: String,
    #[serde(flatten)]
    start: StartRequest,
}

async fn allocate_port(
    State(state): State<AppState>,
    Json(req): Json<AllocateRequest>,
) -> ApiResult<(StatusCode, Json<InstanceRecord>)> {
    let record = state.registry.start(&req.app_name, req.start).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    app_name: String,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    pid: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    released: usize,
}

/// Releases by instance id, or every instance owned by a pid.
async fn release_port(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<Json<ReleaseResponse>> {
    let released = match (req.instance_id, req.pid) {
        (Some(id), _) => match state.registry.release(&req.app_name, &id).await {
            Ok(_) => 1,
            Err(RegistryError::InstanceNotFound { .. }) => 0,
            Err(err) => return Err(err.into()),
        },
        (None, Some(pid)) => state.registry.release_by_pid(&req.app_name, pid).await?.len(),
        (None, None) => {
            return Err(ApiError::invalid_request(
                "either instance_id or pid is required",
            ));
        }
    };
    Ok(Json(ReleaseResponse { released }))
}

#[derive(Debug, Default, Deserialize)]
pub struct AppQuery {
    #[serde(default)]
    app: Option<String>,
}

async fn list_instances(
    State(state): State<AppState>,
    Query(q): Query<AppQuery>,
) -> Json<Vec<InstanceRecord>> {
    Json(state.registry.list_instances(q.app.as_deref()))
}

async fn list_app_instances(
    State(state): State<AppState>,
    Path(app): Path<String>,
) -> ApiResult<Json<Vec<InstanceRecord>>> {
    if state.registry.get_app(&app).is_none() {
        return Err(RegistryError::AppNotFound(app).into());
    }
    Ok(Json(state.registry.list_instances(Some(&app))))
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    cleaned: usize,
    instances: Vec<InstanceRecord>,
}

async fn cleanup_instances(
    State(state): State<AppState>,
    Query(q): Query<AppQuery>,
) -> Json<CleanupResponse> {
    let instances = state.registry.sweep(q.app.as_deref()).await;
    Json(CleanupResponse {
        cleaned: instances.len(),
        instances,
    })
}
