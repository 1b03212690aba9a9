//! HTTP API of a volume server
//!
//! Public data path:
//! - `POST /<fid>` stores a needle and forwards it to the other replicas
//! - `GET /<fid>` reads a needle, reconstructing from EC shards when needed
//! - `DELETE /<fid>` tombstones a needle on every replica or shard holder
//!
//! `?type=replicate` marks a request forwarded by a peer; it is applied
//! locally and never forwarded again. Everything under `/admin` is driven
//! by the master.

use crate::client::{MasterClient, SizeResponse, VolumeClient};
use crate::common::{
    EcCopyRequest, EcRebuildRequest, EcVolumeInfo, Error, FileId, Heartbeat, Result, ShardAck,
    ShardId, ShardIdsRequest, VolumeId, VolumeVerifyReport,
};
use crate::ec::layout::{ecx_file_name, shard_file_name, vif_file_name};
use crate::ec::ShardReader;
use crate::master::placement::ReplicaPlacement;
use crate::volume::store::Store;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json, Router,
};
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct VolumeState {
    pub store: Arc<Store>,
    pub client: VolumeClient,
    /// None when the server runs without a master (tests)
    pub master: Option<Arc<MasterClient>>,
    pub shard_reader: Arc<dyn ShardReader>,
}

pub fn create_router(state: VolumeState, max_body_mb: usize) -> Router {
    Router::new()
        .route("/status", axum::routing::get(status))
        .route("/healthz", axum::routing::get(healthz))
        // Volume admin
        .route("/admin/verify", axum::routing::get(verify_all))
        .route(
            "/admin/volume/:vid",
            axum::routing::delete(delete_volume),
        )
        .route(
            "/admin/volume/:vid/allocate",
            axum::routing::post(allocate_volume),
        )
        .route(
            "/admin/volume/:vid/readonly",
            axum::routing::post(mark_readonly),
        )
        .route(
            "/admin/volume/:vid/writable",
            axum::routing::post(mark_writable),
        )
        .route("/admin/volume/:vid/dat", axum::routing::get(fetch_volume))
        .route("/admin/volume/:vid/copy", axum::routing::post(copy_volume))
        .route(
            "/admin/volume/:vid/vacuum",
            axum::routing::post(vacuum_volume),
        )
        // Erasure coding
        .route(
            "/admin/ec/:vid/generate",
            axum::routing::post(generate_ec_shards),
        )
        .route(
            "/admin/ec/:vid/file/:name",
            axum::routing::get(fetch_ec_file),
        )
        .route(
            "/admin/ec/:vid/shard/:sid",
            axum::routing::get(read_shard),
        )
        .route("/admin/ec/:vid/copy", axum::routing::post(copy_ec_shards))
        .route(
            "/admin/ec/:vid/delete",
            axum::routing::post(delete_ec_shards),
        )
        .route(
            "/admin/ec/:vid/staging",
            axum::routing::delete(drop_ec_staging),
        )
        .route(
            "/admin/ec/:vid/rebuild",
            axum::routing::post(rebuild_ec_shards),
        )
        // Needles
        .route("/:fid", axum::routing::post(upload_needle))
        .route("/:fid", axum::routing::get(read_needle))
        .route("/:fid", axum::routing::delete(delete_needle))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_mb * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run blocking disk work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}

#[derive(Debug, Default, Deserialize)]
struct WriteQuery {
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl WriteQuery {
    fn is_replicate(&self) -> bool {
        self.kind.as_deref() == Some("replicate")
    }
}

async fn status(State(state): State<VolumeState>) -> Json<Heartbeat> {
    Json(state.store.status())
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// === Needles ===

async fn upload_needle(
    State(state): State<VolumeState>,
    Path(fid): Path<String>,
    Query(query): Query<WriteQuery>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let fid: FileId = fid.parse()?;
    if !state.store.has_volume(fid.volume_id) && state.store.ec_volume(fid.volume_id).is_some() {
        return Err(Error::ReadOnly(fid.volume_id));
    }
    let replication = state.store.get_volume(fid.volume_id)?.replication();

    let data = body.to_vec();
    let store = state.store.clone();
    let local = data.clone();
    let result = blocking(move || store.write_needle(&fid, local)).await?;

    if !query.is_replicate() && replication.copy_count() > 1 {
        let peers = replica_peers(&state, fid.volume_id, replication).await?;
        let writes = peers
            .iter()
            .map(|peer| state.client.upload_replica(peer, &fid, data.clone()));
        for (peer, res) in peers.iter().zip(join_all(writes).await) {
            if let Err(e) = res {
                tracing::warn!("Replica write of {} to {} failed: {}", fid, peer, e);
                return Err(e);
            }
        }
    }

    Ok((StatusCode::CREATED, Json(result)))
}

/// Other servers holding `vid`; all of them must exist for a replicated write.
async fn replica_peers(
    state: &VolumeState,
    vid: VolumeId,
    replication: ReplicaPlacement,
) -> Result<Vec<String>> {
    let needed = replication.copy_count() - 1;
    let master = state.master.as_ref().ok_or(Error::InsufficientReplicas {
        needed: replication.copy_count(),
        available: 1,
    })?;
    let mut peers = other_holders(master.lookup_cached(vid).await?.locations, state.store.url());
    if peers.len() < needed {
        master.invalidate(vid);
        peers = other_holders(master.lookup(vid).await?.locations, state.store.url());
    }
    if peers.len() < needed {
        return Err(Error::InsufficientReplicas {
            needed: replication.copy_count(),
            available: peers.len() + 1,
        });
    }
    Ok(peers)
}

fn other_holders(locations: Vec<crate::common::Location>, self_url: &str) -> Vec<String> {
    let mut urls: Vec<String> = locations
        .into_iter()
        .map(|l| l.url)
        .filter(|url| url != self_url)
        .collect();
    urls.sort();
    urls.dedup();
    urls
}

async fn read_needle(
    State(state): State<VolumeState>,
    Path(fid): Path<String>,
) -> Result<impl IntoResponse> {
    let fid: FileId = fid.parse()?;
    let needle = if state.store.has_volume(fid.volume_id) {
        let store = state.store.clone();
        blocking(move || store.read_needle(&fid)).await?
    } else {
        let ec = state
            .store
            .ec_volume(fid.volume_id)
            .ok_or_else(|| Error::NotFound(format!("volume {}", fid.volume_id)))?;
        ec.read_needle(fid.key, fid.cookie, state.shard_reader.as_ref())
            .await?
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::ETAG, format!("\"{}\"", needle.etag())),
        ],
        needle.data,
    ))
}

async fn delete_needle(
    State(state): State<VolumeState>,
    Path(fid): Path<String>,
    Query(query): Query<WriteQuery>,
) -> Result<impl IntoResponse> {
    let fid: FileId = fid.parse()?;
    let vid = fid.volume_id;
    let replication = state.store.get_volume(vid).ok().map(|v| v.replication());
    let is_ec = replication.is_none() && state.store.ec_volume(vid).is_some();

    let store = state.store.clone();
    let size = blocking(move || store.delete_needle(&fid)).await?;

    if !query.is_replicate() {
        let peers = match (replication, &state.master) {
            (Some(rp), _) if rp.copy_count() > 1 => replica_peers(&state, vid, rp).await?,
            // Every shard holder journals the delete
            (None, Some(master)) if is_ec => {
                let lookup = master.lookup(vid).await?;
                other_holders(
                    lookup
                        .ec_shards
                        .into_iter()
                        .flat_map(|s| s.locations)
                        .collect(),
                    state.store.url(),
                )
            }
            _ => Vec::new(),
        };
        let deletes = peers.iter().map(|peer| state.client.delete(peer, &fid, true));
        for (peer, res) in peers.iter().zip(join_all(deletes).await) {
            match res {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!("Replica delete of {} on {} failed: {}", fid, peer, e);
                    return Err(e);
                }
            }
        }
    }

    Ok(Json(json!({ "size": size })))
}

// === Volume admin ===

#[derive(Debug, Deserialize)]
struct AllocateQuery {
    #[serde(default)]
    replication: Option<String>,
}

async fn allocate_volume(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
    Query(query): Query<AllocateQuery>,
) -> Result<impl IntoResponse> {
    let replication = ReplicaPlacement::parse(query.replication.as_deref().unwrap_or("000"))?;
    let store = state.store.clone();
    blocking(move || store.allocate_volume(vid, replication)).await?;
    tracing::info!("Allocated volume {} ({})", vid, replication);
    Ok(Json(json!({ "volume_id": vid })))
}

async fn mark_readonly(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
) -> Result<Json<SizeResponse>> {
    let store = state.store.clone();
    let size = blocking(move || store.mark_readonly(vid)).await?;
    Ok(Json(SizeResponse { size }))
}

async fn mark_writable(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
) -> Result<impl IntoResponse> {
    let store = state.store.clone();
    blocking(move || store.mark_writable(vid)).await?;
    Ok(Json(json!({ "volume_id": vid })))
}

async fn delete_volume(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
) -> Result<impl IntoResponse> {
    let store = state.store.clone();
    blocking(move || store.delete_volume(vid)).await?;
    tracing::info!("Deleted volume {}", vid);
    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_volume(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
) -> Result<impl IntoResponse> {
    let store = state.store.clone();
    let bytes = blocking(move || store.read_volume_file(vid)).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

#[derive(Debug, Deserialize)]
struct CopyQuery {
    source: String,
}

async fn copy_volume(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
    Query(query): Query<CopyQuery>,
) -> Result<impl IntoResponse> {
    let dat = state.client.fetch_volume(&query.source, vid).await?;
    let size = dat.len() as u64;
    let store = state.store.clone();
    blocking(move || store.install_volume(vid, &dat)).await?;
    tracing::info!("Copied volume {} from {}", vid, query.source);
    Ok(Json(SizeResponse { size }))
}

async fn vacuum_volume(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
) -> Result<Json<SizeResponse>> {
    let store = state.store.clone();
    let size = blocking(move || store.compact_volume(vid)).await?;
    Ok(Json(SizeResponse { size }))
}

async fn verify_all(State(state): State<VolumeState>) -> Result<Json<Vec<VolumeVerifyReport>>> {
    let store = state.store.clone();
    Ok(Json(blocking(move || store.verify_all()).await?))
}

// === Erasure coding ===

#[derive(Debug, Deserialize)]
struct GenerateQuery {
    data: usize,
    parity: usize,
}

async fn generate_ec_shards(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
    Query(query): Query<GenerateQuery>,
) -> Result<Json<EcVolumeInfo>> {
    let store = state.store.clone();
    let info = blocking(move || store.generate_ec_shards(vid, query.data, query.parity)).await?;
    tracing::info!(
        "Generated {}+{} shards for volume {} ({} bytes each)",
        info.data_shards,
        info.parity_shards,
        vid,
        info.shard_size
    );
    Ok(Json(info))
}

async fn fetch_ec_file(
    State(state): State<VolumeState>,
    Path((vid, name)): Path<(VolumeId, String)>,
) -> Result<impl IntoResponse> {
    let store = state.store.clone();
    let bytes = blocking(move || store.read_ec_file(vid, &name)).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    offset: u64,
    size: u64,
}

async fn read_shard(
    State(state): State<VolumeState>,
    Path((vid, sid)): Path<(VolumeId, ShardId)>,
    Query(query): Query<RangeQuery>,
) -> Result<impl IntoResponse> {
    let store = state.store.clone();
    let bytes = blocking(move || store.read_shard_range(vid, sid, query.offset, query.size)).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

async fn fetch_files(
    client: &VolumeClient,
    source: &str,
    vid: VolumeId,
    names: Vec<String>,
) -> Result<Vec<(String, Vec<u8>)>> {
    let fetches = names.iter().map(|name| client.fetch_ec_file(source, vid, name));
    names
        .iter()
        .cloned()
        .zip(join_all(fetches).await)
        .map(|(name, res)| res.map(|bytes| (name, bytes)))
        .collect()
}

/// Pull shards (and optionally the index) of `vid` from a peer and mount them.
async fn copy_ec_shards(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
    Json(req): Json<EcCopyRequest>,
) -> Result<Json<Vec<ShardAck>>> {
    let mut names = Vec::new();
    if req.include_index {
        names.push(ecx_file_name(vid));
        names.push(vif_file_name(vid));
    }
    names.extend(req.shard_ids.iter().map(|sid| shard_file_name(vid, *sid)));

    let files = fetch_files(&state.client, &req.source, vid, names).await?;
    let store = state.store.clone();
    let acks = blocking(move || store.install_ec_files(vid, files)).await?;
    tracing::info!(
        "Installed shards {:?} of volume {} from {}",
        req.shard_ids,
        vid,
        req.source
    );
    Ok(Json(acks))
}

async fn delete_ec_shards(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
    Json(req): Json<ShardIdsRequest>,
) -> Result<impl IntoResponse> {
    let store = state.store.clone();
    let shard_ids = req.shard_ids.clone();
    blocking(move || store.delete_ec_shards(vid, &shard_ids)).await?;
    tracing::info!("Deleted shards {:?} of volume {}", req.shard_ids, vid);
    Ok(Json(json!({ "volume_id": vid })))
}

async fn drop_ec_staging(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
) -> Result<impl IntoResponse> {
    let store = state.store.clone();
    blocking(move || store.drop_ec_staging(vid)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stage enough surviving shards, then recompute the missing ones in staging.
async fn rebuild_ec_shards(
    State(state): State<VolumeState>,
    Path(vid): Path<VolumeId>,
    Json(req): Json<EcRebuildRequest>,
) -> Result<Json<Vec<ShardAck>>> {
    let mut index = None;
    for (_, source) in &req.sources {
        let names = vec![ecx_file_name(vid), vif_file_name(vid)];
        match fetch_files(&state.client, source, vid, names).await {
            Ok(files) => {
                index = Some(files);
                break;
            }
            Err(e) => tracing::warn!("No index of volume {} from {}: {}", vid, source, e),
        }
    }
    let index = index.ok_or_else(|| Error::NotFound(format!("index of volume {}", vid)))?;
    let info: EcVolumeInfo = index
        .iter()
        .find(|(name, _)| *name == vif_file_name(vid))
        .map(|(_, bytes)| serde_json::from_slice(bytes))
        .transpose()?
        .ok_or_else(|| Error::NotFound(format!("volume info of {}", vid)))?;

    let mut staged = index;
    let mut fetched = 0;
    for (sid, source) in &req.sources {
        if fetched == info.data_shards {
            break;
        }
        let name = shard_file_name(vid, *sid);
        match state.client.fetch_ec_file(source, vid, &name).await {
            Ok(bytes) => {
                staged.push((name, bytes));
                fetched += 1;
            }
            Err(e) => tracing::warn!("Shard {} of volume {} from {}: {}", sid, vid, source, e),
        }
    }
    if fetched < info.data_shards {
        return Err(Error::InsufficientShards {
            needed: info.data_shards,
            available: fetched,
        });
    }

    let store = state.store.clone();
    let missing = req.missing.clone();
    let acks = blocking(move || {
        store.stage_ec_files(vid, staged)?;
        store.rebuild_staged_shards(vid, &missing)
    })
    .await?;
    tracing::info!("Rebuilt shards {:?} of volume {}", req.missing, vid);
    Ok(Json(acks))
}
