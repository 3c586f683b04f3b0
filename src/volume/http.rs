//! HTTP API for a storage node
//!
//! - `PUT /:vid/:needle`, `DELETE /:vid/:needle`: writes (whitelisted)
//! - `GET /:vid/:needle`: reads
//! - `POST /admin/assign_volume`: master push of a volume to provision
//! - `GET /status`, `GET /metrics`, `GET /health`

use crate::common::metrics::METRICS;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::whitelist::whitelist_middleware;
use crate::common::{Result, Whitelist};
use crate::coordinator::heartbeat::{CreateVolume, VolumeSummary};
use crate::coordinator::topology::VolumeId;
use crate::volume::agent::NodeAgent;
use crate::volume::store::NeedleId;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Largest needle accepted in one PUT
pub const MAX_NEEDLE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct VolumeState {
    pub agent: Arc<NodeAgent>,
    pub whitelist: Arc<Whitelist>,
}

pub fn create_router(state: VolumeState, idle_timeout: Duration) -> Router {
    let writes = Router::new()
        .route("/:vid/:needle", axum::routing::put(put_needle).delete(delete_needle))
        .route("/admin/assign_volume", post(assign_volume))
        .route_layer(middleware::from_fn_with_state(
            state.whitelist.clone(),
            whitelist_middleware,
        ))
        .layer(DefaultBodyLimit::max(MAX_NEEDLE_SIZE));

    Router::new()
        .route("/:vid/:needle", get(get_needle))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .merge(writes)
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(idle_timeout))
        .with_state(state)
}

async fn put_needle(
    State(state): State<VolumeState>,
    Path((vid, needle)): Path<(VolumeId, NeedleId)>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    state.agent.store().write(vid, needle, &body)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "vid": vid, "needle": needle, "size": body.len() })),
    ))
}

async fn get_needle(
    State(state): State<VolumeState>,
    Path((vid, needle)): Path<(VolumeId, NeedleId)>,
) -> Result<Vec<u8>> {
    state.agent.store().read(vid, needle)
}

async fn delete_needle(
    State(state): State<VolumeState>,
    Path((vid, needle)): Path<(VolumeId, NeedleId)>,
) -> Result<StatusCode> {
    if state.agent.store().delete(vid, needle)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn assign_volume(
    State(state): State<VolumeState>,
    Json(req): Json<CreateVolume>,
) -> Result<impl IntoResponse> {
    let created = state.agent.create_volume(&req)?;
    Ok(Json(json!({ "vid": req.vid, "created": created })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeStatus {
    pub address: String,
    pub public_url: String,
    pub data_center: String,
    pub rack: String,
    pub leader: Option<String>,
    pub max_volume_counts: Vec<u32>,
    pub free_slots: u32,
    pub volumes: Vec<VolumeSummary>,
}

async fn status(State(state): State<VolumeState>) -> Json<NodeStatus> {
    let agent = &state.agent;
    let config = agent.config();
    Json(NodeStatus {
        address: config.address.clone(),
        public_url: config.public_url(),
        data_center: config.data_center.clone(),
        rack: config.rack.clone(),
        leader: agent.leader(),
        max_volume_counts: agent.store().max_volume_counts(),
        free_slots: agent.store().free_slots(),
        volumes: agent.store().volume_summaries(),
    })
}

async fn metrics(State(state): State<VolumeState>) -> impl IntoResponse {
    let mut out = METRICS.to_prometheus();
    out += &format!(
        "miniblob_volume_free_slots {}\n",
        state.agent.store().free_slots()
    );
    (StatusCode::OK, out)
}

async fn health(State(state): State<VolumeState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "leader": state.agent.leader(),
        "volumes": state.agent.store().volume_count(),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}
