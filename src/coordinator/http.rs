//! HTTP coordination API
//!
//! Every response carries the `{ code, msg, data }` envelope. A request that
//! reaches a standby coordinator answers HTTP 200 with code
//! [`CODE_NOT_LEAD_COORDINATOR`](crate::common::error::CODE_NOT_LEAD_COORDINATOR)
//! and the current leader (when known) in `data.leader`, so callers retry
//! against the real leader instead of failing.

use crate::common::error::{CODE_INFRASTRUCTURE_FAILURE, CODE_SUCCESS, CODE_VALIDATION_FAILURE};
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result};
use crate::coordinator::leadership::LocalElection;
use crate::coordinator::model::{Node, Partition, RebalancePlan, ReplicaSetId, SegmentRange};
use crate::coordinator::service::{CoordinatorService, ReplicaSetDescriptor};
use axum::{
    body::{to_bytes, Bytes},
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{header::CONTENT_TYPE, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

#[derive(Clone)]
pub struct CoordState {
    pub service: Arc<CoordinatorService>,
    /// Election state pushed by the external elector
    pub election: Arc<LocalElection>,
}

/// Response envelope shared by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct CoordinatorResponse<T = serde_json::Value> {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Error side of a handler
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let data = match &err {
            Error::NotLeader { leader } => Some(json!({ "leader": leader })),
            Error::InvalidAssignment { violation, .. } => serde_json::to_value(violation).ok(),
            Error::InvalidPlan { violations } => Some(json!({ "violations": violations })),
            Error::ReplicaSetInUse { cubes, .. } => Some(json!({ "cubes": cubes })),
            _ => None,
        };
        let body = CoordinatorResponse {
            code: err.response_code(),
            msg: Some(err.to_string()),
            data,
        };
        (err.to_http_status(), axum::Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult {
    let body = CoordinatorResponse {
        code: CODE_SUCCESS,
        msg: None,
        data: Some(data),
    };
    Ok((StatusCode::OK, axum::Json(body)).into_response())
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| Error::InvalidRequest(format!("bad request body: {}", e)))
}

fn parse_node(raw: &str) -> Result<Node> {
    raw.parse()
}

fn parse_replica_set_id(raw: &str) -> Result<ReplicaSetId> {
    raw.parse()
        .map_err(|_| Error::InvalidRequest(format!("invalid replica set id: {}", raw)))
}

/// Wrap plain-text rejections (body limit, unknown routes) in the envelope
async fn envelope_rejections(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    let status = response.status();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if status.is_success() || is_json {
        return response;
    }

    let text = to_bytes(response.into_body(), 64 * 1024)
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
        .unwrap_or_default();
    let msg = if text.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        text
    };
    let code = if status.is_server_error() {
        CODE_INFRASTRUCTURE_FAILURE
    } else {
        CODE_VALIDATION_FAILURE
    };
    let body = CoordinatorResponse::<()> {
        code,
        msg: Some(msg),
        data: None,
    };
    (status, axum::Json(body)).into_response()
}

pub fn create_router(state: CoordState, max_body_bytes: usize) -> Router {
    Router::new()
        // Health and reads
        .route("/health", get(health))
        .route("/topology", get(topology))
        .route("/replica_sets", get(list_replica_sets).post(create_replica_set))
        .route(
            "/replica_sets/:id",
            get(get_replica_set).delete(delete_replica_set),
        )
        .route(
            "/replica_sets/:id/nodes/:node",
            put(add_node).delete(remove_node),
        )
        .route("/replica_sets/:id/leader", put(change_leader))
        // Cubes
        .route(
            "/cubes/:cube/assignment",
            get(get_assignment)
                .post(assign_cube)
                .put(reassign_cube)
                .delete(unassign_cube),
        )
        .route("/cubes/:cube/pause", post(pause_cube))
        .route("/cubes/:cube/resume", post(resume_cube))
        // Rebalance
        .route("/rebalance/recommend", get(recommend_rebalance))
        .route("/rebalance/apply", post(apply_rebalance))
        // Segment builds
        .route("/segments/remote_store_complete", post(remote_store_complete))
        .route("/segments/pending", get(pending_segments))
        // Node registration
        .route("/nodes", post(register_node))
        .route("/nodes/:node", axum::routing::delete(unregister_node))
        // Admin
        .route("/admin/leadership", put(set_leadership))
        .fallback(unknown_route)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(request_tracing_middleware))
                .layer(axum::middleware::from_fn(envelope_rejections))
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(max_body_bytes)),
        )
        .with_state(state)
}

async fn unknown_route(uri: Uri) -> ApiError {
    ApiError(Error::NotFound(format!("route {}", uri.path())))
}

async fn health(State(state): State<CoordState>) -> ApiResult {
    ok(state.service.status())
}

async fn topology(State(state): State<CoordState>) -> ApiResult {
    let snapshot = state.service.snapshot();
    ok(snapshot.as_ref())
}

async fn list_replica_sets(State(state): State<CoordState>) -> ApiResult {
    ok(state.service.replica_sets())
}

async fn get_replica_set(
    State(state): State<CoordState>,
    Path(id): Path<String>,
) -> ApiResult {
    ok(state.service.replica_set(parse_replica_set_id(&id)?)?)
}

async fn create_replica_set(State(state): State<CoordState>, body: Bytes) -> ApiResult {
    let descriptor: ReplicaSetDescriptor = if body.is_empty() {
        ReplicaSetDescriptor::default()
    } else {
        parse_body(&body)?
    };
    ok(state.service.create_replica_set(descriptor).await?)
}

async fn delete_replica_set(
    State(state): State<CoordState>,
    Path(id): Path<String>,
) -> ApiResult {
    let id = parse_replica_set_id(&id)?;
    ok(state.service.delete_replica_set(id).await?)
}

async fn add_node(
    State(state): State<CoordState>,
    Path((id, node)): Path<(String, String)>,
) -> ApiResult {
    let id = parse_replica_set_id(&id)?;
    let node = parse_node(&node)?;
    ok(state.service.add_node(id, node).await?)
}

async fn remove_node(
    State(state): State<CoordState>,
    Path((id, node)): Path<(String, String)>,
) -> ApiResult {
    let id = parse_replica_set_id(&id)?;
    let node = parse_node(&node)?;
    ok(state.service.remove_node(id, node).await?)
}

#[derive(Debug, Deserialize)]
struct ChangeLeaderRequest {
    node: Node,
}

async fn change_leader(
    State(state): State<CoordState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    let id = parse_replica_set_id(&id)?;
    let req: ChangeLeaderRequest = parse_body(&body)?;
    ok(state.service.change_leader(id, req.node).await?)
}

async fn get_assignment(State(state): State<CoordState>, Path(cube): Path<String>) -> ApiResult {
    ok(state.service.assignment(&cube)?)
}

async fn assign_cube(State(state): State<CoordState>, Path(cube): Path<String>) -> ApiResult {
    ok(state.service.assign_cube(&cube).await?)
}

async fn unassign_cube(State(state): State<CoordState>, Path(cube): Path<String>) -> ApiResult {
    ok(state.service.unassign_cube(&cube).await?)
}

#[derive(Debug, Deserialize)]
struct ReassignRequest {
    replica_sets: BTreeMap<ReplicaSetId, Vec<Partition>>,
}

async fn reassign_cube(
    State(state): State<CoordState>,
    Path(cube): Path<String>,
    body: Bytes,
) -> ApiResult {
    let req: ReassignRequest = parse_body(&body)?;
    ok(state.service.reassign_cube(&cube, req.replica_sets).await?)
}

async fn pause_cube(State(state): State<CoordState>, Path(cube): Path<String>) -> ApiResult {
    ok(state.service.pause(&cube).await?)
}

async fn resume_cube(State(state): State<CoordState>, Path(cube): Path<String>) -> ApiResult {
    ok(state.service.resume(&cube).await?)
}

async fn recommend_rebalance(State(state): State<CoordState>) -> ApiResult {
    ok(state.service.recommend_rebalance()?)
}

async fn apply_rebalance(State(state): State<CoordState>, body: Bytes) -> ApiResult {
    let plan: RebalancePlan = parse_body(&body)?;
    let applied = state.service.apply_rebalance(&plan).await?;
    ok(json!({
        "cubes": applied.cubes,
        "moved": applied.moved,
        "version": applied.after.version,
    }))
}

#[derive(Debug, Deserialize)]
struct RemoteStoreCompleteRequest {
    cube: String,
    segment_start: i64,
    segment_end: i64,
    node: Node,
}

async fn remote_store_complete(State(state): State<CoordState>, body: Bytes) -> ApiResult {
    let req: RemoteStoreCompleteRequest = parse_body(&body)?;
    let range = SegmentRange::new(req.segment_start, req.segment_end)?;
    let job = state
        .service
        .remote_store_complete(&req.cube, range, &req.node)
        .await?;
    ok(json!({
        "build_submitted": job.is_some(),
        "job_id": job.map(|j| j.0),
    }))
}

async fn pending_segments(State(state): State<CoordState>) -> ApiResult {
    ok(state.service.pending_builds())
}

#[derive(Debug, Deserialize)]
struct RegisterNodeRequest {
    node: Node,
}

async fn register_node(State(state): State<CoordState>, body: Bytes) -> ApiResult {
    let req: RegisterNodeRequest = parse_body(&body)?;
    let snapshot = state.service.register_node(req.node.clone()).await?;
    ok(json!({ "node": req.node, "version": snapshot.version }))
}

async fn unregister_node(State(state): State<CoordState>, Path(node): Path<String>) -> ApiResult {
    let node = parse_node(&node)?;
    let replica_set = state.service.unregister_node(node.clone()).await?;
    ok(json!({ "node": node, "replica_set": replica_set }))
}

#[derive(Debug, Deserialize)]
struct LeadershipRequest {
    is_leader: bool,
    #[serde(default)]
    leader: Option<String>,
}

/// Leadership pushed in by the external elector
async fn set_leadership(State(state): State<CoordState>, body: Bytes) -> ApiResult {
    let req: LeadershipRequest = parse_body(&body)?;
    state.election.set(req.is_leader, req.leader);
    ok(state.service.status())
}
