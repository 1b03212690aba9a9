//! HTTP API for the master
//!
//! - `/dir/*`, `/vol/*`, `/heartbeat`: assignment, lookup and growth
//! - `/raft/*`: bincode-encoded Raft RPCs between masters
//! - `/ec/*`: EC conversion, rebuild and cancellation
//! - `/ops/*`: verify and repair
//! - `/cluster/status`, `/dir/status`: status of this master

use crate::common::raft::{AppendRequest, SnapshotRequest, VoteRequest};
use crate::common::{
    AssignRequest, Assignment, Error, Heartbeat, HeartbeatResponse, Result, VolumeId,
};
use crate::ec::{EcJobReport, RebuildReport};
use crate::master::cluster::{ClusterStatus, DirectoryStatus, Master};
use crate::ops::{
    repair_cluster, vacuum_cluster, verify_cluster, RepairReport, VacuumReport, VerifyReport,
};
use axum::{
    body::Bytes,
    error_handling::HandleErrorLayer,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    BoxError, Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Volume servers verified in parallel by `/ops/verify`
const VERIFY_CONCURRENCY: usize = 8;

/// Deadline for control plane requests; EC and ops jobs run unbounded
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct MasterState {
    pub master: Arc<Master>,
}

pub fn create_router(state: MasterState) -> Router {
    let control = Router::new()
        .route("/healthz", axum::routing::get(healthz))
        .route("/cluster/status", axum::routing::get(cluster_status))
        .route("/dir/status", axum::routing::get(directory_status))
        // Data plane
        .route("/dir/assign", axum::routing::post(assign))
        .route("/dir/lookup", axum::routing::get(lookup))
        .route("/heartbeat", axum::routing::post(heartbeat))
        .route("/vol/grow", axum::routing::post(grow))
        // Raft
        .route("/raft/vote", axum::routing::post(raft_vote))
        .route("/raft/append", axum::routing::post(raft_append))
        .route("/raft/snapshot", axum::routing::post(raft_snapshot));

    with_timeout(control, REQUEST_TIMEOUT)
        .route("/vol/vacuum", axum::routing::post(vacuum))
        // Erasure coding
        .route("/ec/encode/:vid", axum::routing::post(ec_encode))
        .route("/ec/rebuild/:vid", axum::routing::post(ec_rebuild))
        .route("/ec/cancel/:vid", axum::routing::post(ec_cancel))
        // Ops
        .route("/ops/verify", axum::routing::post(ops_verify))
        .route("/ops/repair", axum::routing::post(ops_repair))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bound every route already on `router`; an expired request answers 408.
pub fn with_timeout<S>(router: Router<S>, timeout: Duration) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(
        ServiceBuilder::new()
            .layer(HandleErrorLayer::new(timeout_error))
            .layer(TimeoutLayer::new(timeout)),
    )
}

async fn timeout_error(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        Error::Timeout("request deadline exceeded".into()).into_response()
    } else {
        Error::Internal(err.to_string()).into_response()
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn cluster_status(State(state): State<MasterState>) -> Json<ClusterStatus> {
    Json(state.master.cluster_status())
}

async fn directory_status(State(state): State<MasterState>) -> Json<DirectoryStatus> {
    Json(state.master.directory_status())
}

// === Data plane ===

async fn assign(
    State(state): State<MasterState>,
    body: Option<Json<AssignRequest>>,
) -> Result<Json<Assignment>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.master.assign(&req).await?))
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    volume_id: String,
}

async fn lookup(
    State(state): State<MasterState>,
    Query(query): Query<LookupQuery>,
) -> Result<impl IntoResponse> {
    // Accept a bare volume id or a whole file id
    let raw = query.volume_id.split(',').next().unwrap_or_default();
    let vid: VolumeId = raw
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid volume id: {}", query.volume_id)))?;
    Ok(Json(state.master.lookup(vid)?))
}

async fn heartbeat(
    State(state): State<MasterState>,
    Json(hb): Json<Heartbeat>,
) -> Result<Json<HeartbeatResponse>> {
    Ok(Json(state.master.ingest_heartbeat(&hb).await?))
}

#[derive(Debug, Deserialize)]
struct GrowQuery {
    #[serde(default = "default_grow_count")]
    count: usize,
    #[serde(default)]
    replication: Option<String>,
}

fn default_grow_count() -> usize {
    1
}

async fn grow(
    State(state): State<MasterState>,
    Query(query): Query<GrowQuery>,
) -> Result<Json<Vec<VolumeId>>> {
    let grown = state
        .master
        .grow(query.count, query.replication.as_deref())
        .await?;
    Ok(Json(grown))
}

#[derive(Debug, Deserialize)]
struct VacuumQuery {
    #[serde(default)]
    threshold: Option<f64>,
}

async fn vacuum(
    State(state): State<MasterState>,
    Query(query): Query<VacuumQuery>,
) -> Result<Json<VacuumReport>> {
    Ok(Json(vacuum_cluster(&state.master, query.threshold).await?))
}

// === Raft ===

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(body)?)
}

fn encode<T: Serialize>(value: &T) -> Result<impl IntoResponse> {
    let bytes = bincode::serialize(value)?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

async fn raft_vote(State(state): State<MasterState>, body: Bytes) -> Result<impl IntoResponse> {
    let req: VoteRequest = decode(&body)?;
    encode(&state.master.raft().handle_vote(req)?)
}

async fn raft_append(State(state): State<MasterState>, body: Bytes) -> Result<impl IntoResponse> {
    let req: AppendRequest = decode(&body)?;
    encode(&state.master.raft().handle_append(req)?)
}

async fn raft_snapshot(State(state): State<MasterState>, body: Bytes) -> Result<impl IntoResponse> {
    let req: SnapshotRequest = decode(&body)?;
    encode(&state.master.raft().handle_snapshot(req)?)
}

// === Erasure coding ===

async fn ec_encode(
    State(state): State<MasterState>,
    Path(vid): Path<VolumeId>,
) -> Result<Json<EcJobReport>> {
    state.master.ensure_leader()?;
    Ok(Json(state.master.ec_jobs().encode_volume(vid).await?))
}

async fn ec_rebuild(
    State(state): State<MasterState>,
    Path(vid): Path<VolumeId>,
) -> Result<Json<RebuildReport>> {
    state.master.ensure_leader()?;
    Ok(Json(state.master.rebuilder().rebuild_volume(vid).await?))
}

async fn ec_cancel(
    State(state): State<MasterState>,
    Path(vid): Path<VolumeId>,
) -> Result<impl IntoResponse> {
    state.master.ensure_leader()?;
    if !state.master.ec_jobs().cancel(vid) {
        return Err(Error::NotFound(format!("no EC job for volume {}", vid)));
    }
    Ok(Json(json!({ "volume_id": vid, "cancelled": true })))
}

// === Ops ===

async fn ops_verify(State(state): State<MasterState>) -> Result<Json<VerifyReport>> {
    Ok(Json(verify_cluster(&state.master, VERIFY_CONCURRENCY).await?))
}

#[derive(Debug, Deserialize)]
struct RepairQuery {
    #[serde(default)]
    dry_run: bool,
}

async fn ops_repair(
    State(state): State<MasterState>,
    Query(query): Query<RepairQuery>,
) -> Result<Json<RepairReport>> {
    Ok(Json(repair_cluster(&state.master, query.dry_run).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_slow_request_times_out() {
        let router = with_timeout(
            Router::new()
                .route("/fast", axum::routing::get(|| async { "ok" }))
                .route(
                    "/slow",
                    axum::routing::get(|| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        "late"
                    }),
                ),
            Duration::from_millis(50),
        );

        let fast = Request::builder().uri("/fast").body(Body::empty()).unwrap();
        let response = router.clone().oneshot(fast).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let slow = Request::builder().uri("/slow").body(Body::empty()).unwrap();
        let response = router.oneshot(slow).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
