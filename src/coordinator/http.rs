//! HTTP API for the master
//!
//! - `POST /heartbeat`: storage node reports (leader only, others redirect)
//! - `POST /vol/assign`: volume allocation (leader only, whitelisted)
//! - `POST /raft/vote`, `POST /raft/append`: consensus RPCs between masters
//! - `GET /cluster/status`, `GET /dir/status`, `GET /dir/lookup`
//! - `GET /vol/garbage`, `GET /vol/degraded`
//! - `GET /metrics`, `GET /health`

use crate::common::metrics::METRICS;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::whitelist::whitelist_middleware;
use crate::common::{Error, Result, Whitelist};
use crate::coordinator::allocation::{AllocationService, AssignRequest, AssignResponse};
use crate::coordinator::command::CommandProposer;
use crate::coordinator::heartbeat::{Heartbeat, HeartbeatResponse, HeartbeatService};
use crate::coordinator::raft_node::{
    AppendRequest, AppendResponse, RaftNode, RaftStatus, VoteRequest, VoteResponse,
};
use crate::coordinator::topology::{
    DegradedVolume, GarbageVolume, NodeLocation, TopologyStatus, TopologyStore, VolumeId,
};
use crate::coordinator::volume_client::VolumeClient;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct MasterState {
    pub topology: Arc<TopologyStore>,
    pub raft: Arc<RaftNode>,
    pub heartbeats: Arc<HeartbeatService>,
    pub allocation: Arc<AllocationService>,
    pub whitelist: Arc<Whitelist>,
}

impl MasterState {
    pub fn new(
        topology: Arc<TopologyStore>,
        raft: Arc<RaftNode>,
        whitelist: Whitelist,
        volume_client: VolumeClient,
    ) -> Self {
        let proposer = CommandProposer::new(raft.clone());
        Self {
            heartbeats: Arc::new(HeartbeatService::new(topology.clone(), proposer.clone())),
            allocation: Arc::new(AllocationService::new(
                topology.clone(),
                proposer,
                volume_client,
            )),
            topology,
            raft,
            whitelist: Arc::new(whitelist),
        }
    }
}

pub fn create_router(state: MasterState, idle_timeout: Duration) -> Router {
    let writes = Router::new()
        .route("/vol/assign", post(assign))
        .route_layer(middleware::from_fn_with_state(
            state.whitelist.clone(),
            whitelist_middleware,
        ));

    Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/raft/vote", post(raft_vote))
        .route("/raft/append", post(raft_append))
        .route("/cluster/status", get(cluster_status))
        .route("/dir/status", get(dir_status))
        .route("/dir/lookup", get(dir_lookup))
        .route("/vol/garbage", get(garbage))
        .route("/vol/degraded", get(degraded))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .merge(writes)
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(idle_timeout))
        .with_state(state)
}

async fn heartbeat(
    State(state): State<MasterState>,
    Json(hb): Json<Heartbeat>,
) -> Json<HeartbeatResponse> {
    Json(state.heartbeats.handle(hb))
}

async fn assign(
    State(state): State<MasterState>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<AssignResponse>> {
    Ok(Json(state.allocation.assign(req).await?))
}

async fn raft_vote(
    State(state): State<MasterState>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<VoteResponse>> {
    Ok(Json(state.raft.handle_request_vote(req)?))
}

async fn raft_append(
    State(state): State<MasterState>,
    Json(req): Json<AppendRequest>,
) -> Result<Json<AppendResponse>> {
    Ok(Json(state.raft.handle_append_entries(req)?))
}

async fn cluster_status(State(state): State<MasterState>) -> Json<RaftStatus> {
    Json(state.raft.status())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirStatus {
    pub leader: Option<String>,
    pub topology: TopologyStatus,
}

async fn dir_status(State(state): State<MasterState>) -> Json<DirStatus> {
    let topology = state.topology.read().status(Instant::now());
    Json(DirStatus {
        leader: state.raft.current_leader(),
        topology,
    })
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    #[serde(rename = "volumeId")]
    volume_id: VolumeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LookupResponse {
    #[serde(rename = "volumeId")]
    pub volume_id: VolumeId,
    pub locations: Vec<NodeLocation>,
}

/// Served from the local replicated copy, on any master
async fn dir_lookup(
    State(state): State<MasterState>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<LookupResponse>> {
    let locations = state
        .topology
        .read()
        .lookup(query.volume_id)
        .ok_or(Error::VolumeNotFound(query.volume_id))?;
    Ok(Json(LookupResponse {
        volume_id: query.volume_id,
        locations,
    }))
}

/// Usage numbers only exist in the leader's capacity cache
async fn garbage(State(state): State<MasterState>) -> Result<Json<Vec<GarbageVolume>>> {
    state.raft.ensure_leader()?;
    Ok(Json(state.topology.read().garbage_volumes()))
}

async fn degraded(State(state): State<MasterState>) -> Json<Vec<DegradedVolume>> {
    Json(state.topology.read().degraded_volumes())
}

async fn metrics(State(state): State<MasterState>) -> impl IntoResponse {
    let mut out = METRICS.to_prometheus();
    let topo = state.topology.read();
    out += &format!("miniblob_volumes_total {}\n", topo.volumes().count());
    out += &format!("miniblob_data_nodes_total {}\n", topo.nodes().count());
    out += &format!(
        "miniblob_volumes_degraded {}\n",
        topo.degraded_volumes().len()
    );
    (StatusCode::OK, out)
}

async fn health(State(state): State<MasterState>) -> impl IntoResponse {
    let status = state.raft.status();
    Json(json!({
        "status": "healthy",
        "role": status.role,
        "is_leader": status.role == crate::coordinator::raft_node::RaftRole::Leader,
        "leader": status.leader,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}
