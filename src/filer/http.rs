//! HTTP API of the filer
//!
//! - `GET /<path>`: file content (honours `Range`), or a JSON listing for
//!   directories and `?list`
//! - `PUT /<path>`: write a file; `?op=append` appends, `?offset=N` writes
//!   in place, `?op=mkdir` creates a directory
//! - `DELETE /<path>`: remove, `?recursive=true` for non-empty directories
//! - `POST /__rename?from=..&to=..`: move an entry and its subtree

use crate::common::{Error, Result};
use crate::filer::entry::Entry;
use crate::filer::filer::{Filer, FilerStatus, WriteMode};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const DEFAULT_LIST_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct FilerState {
    pub filer: Arc<Filer>,
}

pub fn create_router(state: FilerState, max_body_mb: usize) -> Router {
    Router::new()
        .route("/__healthz", axum::routing::get(healthz))
        .route("/__status", axum::routing::get(status))
        .route("/__rename", axum::routing::post(rename))
        .route("/", axum::routing::get(get_root))
        .route(
            "/*path",
            axum::routing::get(get_path)
                .put(put_path)
                .delete(delete_path),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_mb * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn status(State(state): State<FilerState>) -> Json<FilerStatus> {
    Json(state.filer.status())
}

#[derive(Debug, Serialize)]
struct ListedEntry {
    name: String,
    path: String,
    is_directory: bool,
    size: u64,
    chunks: usize,
    modified_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime: Option<String>,
}

impl From<Entry> for ListedEntry {
    fn from(entry: Entry) -> Self {
        Self {
            name: entry.name().to_string(),
            size: entry.size(),
            chunks: entry.chunks.len(),
            is_directory: entry.is_directory,
            modified_at: entry.modified_at,
            mime: entry.mime,
            path: entry.path,
        }
    }
}

#[derive(Debug, Serialize)]
struct Listing {
    path: String,
    entries: Vec<ListedEntry>,
    /// Pass as `start_after` to fetch the next page
    last_name: Option<String>,
    more: bool,
}

#[derive(Debug, Default, Deserialize)]
struct GetQuery {
    #[serde(default)]
    list: Option<String>,
    #[serde(default)]
    start_after: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn get_root(
    State(state): State<FilerState>,
    Query(query): Query<GetQuery>,
) -> Result<Response> {
    list(&state.filer, "/", &query)
}

async fn get_path(
    State(state): State<FilerState>,
    Path(path): Path<String>,
    Query(query): Query<GetQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let entry = state.filer.find_entry(&path)?;
    if query.list.is_some() || entry.is_directory {
        return list(&state.filer, &entry.path, &query);
    }

    let size = entry.size();
    let content_type = entry
        .mime
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, size));

    let (status, offset, len) = match range {
        None => (StatusCode::OK, 0, size),
        Some(Some((start, end))) => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        Some(None) => {
            return Ok((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", size))],
            )
                .into_response())
        }
    };
    let data = state.filer.read_file(&entry.path, offset, Some(len)).await?;

    let mut response = (status, data).into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&entry.modified_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if status == StatusCode::PARTIAL_CONTENT {
        let value = format!("bytes {}-{}/{}", offset, offset + len - 1, size);
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    Ok(response)
}

fn list(filer: &Filer, dir: &str, query: &GetQuery) -> Result<Response> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
    let start_after = query.start_after.as_deref().unwrap_or("");
    let mut entries = filer.list_directory(dir, start_after, limit + 1)?;
    let more = entries.len() > limit;
    entries.truncate(limit);
    let last_name = entries.last().map(|e| e.name().to_string());
    Ok(Json(Listing {
        path: dir.to_string(),
        entries: entries.into_iter().map(ListedEntry::from).collect(),
        last_name,
        more,
    })
    .into_response())
}

/// Single `bytes=` range as inclusive offsets; `None` when it cannot be
/// satisfied.
fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let ranges = value.trim().strip_prefix("bytes=")?;
    if ranges.contains(',') || size == 0 {
        return None;
    }
    let (start, end) = ranges.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());
    let last = size - 1;

    if start.is_empty() {
        // Suffix: the last N bytes
        let n: u64 = end.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((size.saturating_sub(n), last));
    }
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        last
    } else {
        end.parse::<u64>().ok()?.min(last)
    };
    (start <= end && start <= last).then_some((start, end))
}

#[derive(Debug, Default, Deserialize)]
struct PutQuery {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    offset: Option<u64>,
}

async fn put_path(
    State(state): State<FilerState>,
    Path(path): Path<String>,
    Query(query): Query<PutQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let mode = match (query.op.as_deref(), query.offset) {
        (Some("mkdir"), _) => {
            let entry = state.filer.mkdir(&path)?;
            return Ok((StatusCode::CREATED, Json(json!({ "path": entry.path, "size": 0 }))));
        }
        (Some("append"), _) => WriteMode::Append,
        (None, Some(offset)) => WriteMode::At(offset),
        (None, None) if path.ends_with('/') && body.is_empty() => {
            let entry = state.filer.mkdir(&path)?;
            return Ok((StatusCode::CREATED, Json(json!({ "path": entry.path, "size": 0 }))));
        }
        (None, None) => WriteMode::Overwrite,
        (Some(op), _) => return Err(Error::InvalidArgument(format!("unknown op: {}", op))),
    };
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| *v != "application/octet-stream")
        .map(str::to_string);

    let entry = state
        .filer
        .write_file(&path, body.to_vec(), mode, mime)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "path": entry.path, "size": entry.size() })),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    recursive: bool,
}

async fn delete_path(
    State(state): State<FilerState>,
    Path(path): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse> {
    let removed = state.filer.delete_entry(&path, query.recursive)?;
    Ok(Json(json!({ "path": path, "removed": removed })))
}

#[derive(Debug, Deserialize)]
struct RenameQuery {
    from: String,
    to: String,
}

async fn rename(
    State(state): State<FilerState>,
    Query(query): Query<RenameQuery>,
) -> Result<impl IntoResponse> {
    let entry = state.filer.rename(&query.from, &query.to)?;
    Ok(Json(ListedEntry::from(entry)))
}
