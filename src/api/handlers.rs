//! Control surface handlers: health, leadership, metadata, data, services

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::api::server::AppState;
use crate::api::cid;
use crate::common::Error;
use crate::leader::{LeaderCoordinates, Role};

/// File extension to MIME type, for the CID-addressed file endpoint
static CONTENT_TYPE_BY_EXT: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("png", "image/png"),
        ("webp", "image/webp"),
        ("gif", "image/gif"),
        ("mp4", "video/mp4"),
        ("mkv", "video/x-matroska"),
        ("avi", "video/x-msvideo"),
        ("webm", "video/webm"),
        ("mov", "video/quicktime"),
        ("ts", "video/mp2t"),
        ("m3u8", "application/vnd.apple.mpegurl"),
    ])
});

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Standard error body with the status text as the short code.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: message.into(),
        }),
    )
        .into_response()
}

fn storage_error(e: Error) -> Response {
    error_response(e.to_http_status(), e.to_string())
}

fn not_connected() -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "storage not connected")
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub role: Role,
    pub redis: bool,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<LeaderCoordinates>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub health: HealthResponse,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    pub version: String,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: u64,
    #[serde(rename = "fileCount")]
    pub file_count: usize,
}

async fn health_snapshot(state: &AppState) -> HealthResponse {
    let redis = state.storage.health().await;
    HealthResponse {
        status: if redis { "ok" } else { "degraded" }.to_string(),
        role: state.election.role(),
        redis,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        leader: state.election.leader_info(),
    }
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    Json(health_snapshot(&state).await).into_response()
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Response {
    let file_count = if state.storage.is_connected() {
        state.storage.count_files().await.unwrap_or(0)
    } else {
        0
    };

    Json(StatusResponse {
        health: health_snapshot(&state).await,
        service_name: state.config.service_name.clone(),
        version: state.config.service_version.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        file_count,
    })
    .into_response()
}

/// GET /leader
pub async fn leader(State(state): State<AppState>) -> Response {
    match state.election.leader_info() {
        Some(info) => Json(info).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "no leader available"),
    }
}

/// GET /role
pub async fn role(State(state): State<AppState>) -> Response {
    Json(json!({ "role": state.election.role() })).into_response()
}

// === Metadata ===

/// GET /meta
pub async fn list_meta(State(state): State<AppState>) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }
    match state.storage.all_hash_ids().await {
        Ok(hash_ids) => {
            let count = hash_ids.len();
            Json(json!({
                "hashIds": hash_ids,
                "count": count,
            }))
            .into_response()
        }
        Err(e) => storage_error(e),
    }
}

/// GET /meta/{hash}
pub async fn get_meta(State(state): State<AppState>, Path(hash_id): Path<String>) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }
    match state.storage.get_metadata_flat(&hash_id).await {
        Ok(Some(metadata)) => Json(json!({
            "hashId": hash_id,
            "metadata": metadata,
        }))
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "metadata not found"),
        Err(e) => storage_error(e),
    }
}

/// PUT /meta/{hash}
pub async fn put_meta(
    State(state): State<AppState>,
    Path(hash_id): Path<String>,
    body: Result<Json<HashMap<String, String>>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }
    let Ok(Json(metadata)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
    };

    match state.storage.set_metadata_flat(&hash_id, &metadata).await {
        Ok(()) => Json(json!({ "success": true, "hashId": hash_id })).into_response(),
        Err(e) => storage_error(e),
    }
}

/// PATCH /meta/{hash} — merge, never delete missing keys
pub async fn patch_meta(
    State(state): State<AppState>,
    Path(hash_id): Path<String>,
    body: Result<Json<HashMap<String, String>>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }
    let Ok(Json(metadata)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
    };

    match state.storage.merge_metadata_flat(&hash_id, &metadata).await {
        Ok(updated) => Json(json!({
            "success": true,
            "hashId": hash_id,
            "updated": updated,
        }))
        .into_response(),
        Err(e) => storage_error(e),
    }
}

/// DELETE /meta/{hash}
pub async fn delete_meta(State(state): State<AppState>, Path(hash_id): Path<String>) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }
    match state.storage.delete_metadata(&hash_id).await {
        Ok(deleted) => Json(json!({
            "success": true,
            "hashId": hash_id,
            "deleted": deleted,
        }))
        .into_response(),
        Err(e) => storage_error(e),
    }
}

/// POST /meta/{hash}/_add/{key} — add a value to a pipe-delimited set field
pub async fn add_to_set(
    State(state): State<AppState>,
    Path((hash_id, key)): Path<(String, String)>,
    value: String,
) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }
    if value.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "value is required");
    }

    match state.storage.add_to_set(&hash_id, &key, &value).await {
        Ok(added) => Json(json!({
            "success": true,
            "hashId": hash_id,
            "property": key,
            "added": added,
        }))
        .into_response(),
        Err(e) => storage_error(e),
    }
}

/// GET /meta/{hash}/{key} — plain-text single property
pub async fn get_property(
    State(state): State<AppState>,
    Path((hash_id, key)): Path<(String, String)>,
) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }
    match state.storage.get_property(&hash_id, &key).await {
        Ok(Some(value)) if !value.is_empty() => {
            ([(header::CONTENT_TYPE, "text/plain")], value).into_response()
        }
        Ok(_) => error_response(StatusCode::NOT_FOUND, "property not found"),
        Err(e) => storage_error(e),
    }
}

/// PUT /meta/{hash}/{key}
pub async fn put_property(
    State(state): State<AppState>,
    Path((hash_id, key)): Path<(String, String)>,
    value: String,
) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }
    match state.storage.set_property(&hash_id, &key, &value).await {
        Ok(()) => Json(json!({
            "success": true,
            "hashId": hash_id,
            "property": key,
        }))
        .into_response(),
        Err(e) => storage_error(e),
    }
}

/// DELETE /meta/{hash}/{key}
pub async fn delete_property(
    State(state): State<AppState>,
    Path((hash_id, key)): Path<(String, String)>,
) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }
    match state.storage.delete_property(&hash_id, &key).await {
        Ok(()) => Json(json!({
            "success": true,
            "hashId": hash_id,
            "property": key,
        }))
        .into_response(),
        Err(e) => storage_error(e),
    }
}

// === Data ===

/// GET /data/{hash}/path
pub async fn data_path(State(state): State<AppState>, Path(hash_id): Path<String>) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }
    let file_path = match state.storage.get_property(&hash_id, "filePath").await {
        Ok(Some(path)) if !path.is_empty() => path,
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "file path not found"),
        Err(e) => return storage_error(e),
    };

    let full_path = state.config.files_path.join(&file_path);
    Json(json!({
        "hashId": hash_id,
        "path": full_path.display().to_string(),
        "exists": full_path.exists(),
    }))
    .into_response()
}

/// HEAD /data/{hash}
pub async fn head_data(State(state): State<AppState>, Path(hash_id): Path<String>) -> StatusCode {
    if !state.storage.is_connected() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match state.storage.get_property(&hash_id, "filePath").await {
        Ok(Some(path)) if !path.is_empty() => {
            if state.config.files_path.join(&path).exists() {
                StatusCode::OK
            } else {
                StatusCode::NOT_FOUND
            }
        }
        Ok(_) => StatusCode::NOT_FOUND,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

// === Files by CID ===

/// GET /file/{cid} — serve the file whose poster/backdrop CID matches
pub async fn get_file_by_cid(
    State(state): State<AppState>,
    Path(cid_value): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.storage.is_connected() {
        return not_connected();
    }

    let rel_path = match state.storage.lookup_path_by_cid(&cid_value).await {
        Ok(Some(path)) => path,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "file not found for CID"),
        Err(e) => return storage_error(e),
    };

    let full_path = state.config.files_path.join(&rel_path);
    serve_file(&full_path, &headers).await
}

#[derive(Deserialize)]
pub struct CidRequest {
    pub path: String,
}

/// POST /file/cid — compute a content identifier for a path under the
/// files root
pub async fn compute_cid(
    State(state): State<AppState>,
    body: Result<Json<CidRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
    };
    if request.path.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "path is required");
    }

    let full_path = state.config.files_path.join(&request.path);

    // The request path must stay inside the files root
    let files_root = match std::fs::canonicalize(&state.config.files_path) {
        Ok(root) => root,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "files root not available"),
    };
    let resolved = match std::fs::canonicalize(&full_path) {
        Ok(resolved) => resolved,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "file not found"),
    };
    if !resolved.starts_with(&files_root) {
        return error_response(StatusCode::BAD_REQUEST, "path must be within files directory");
    }
    if resolved.is_dir() {
        return error_response(StatusCode::BAD_REQUEST, "path is a directory, not a file");
    }

    match cid::compute_file_cid(&resolved).await {
        Ok((cid, size)) => Json(json!({
            "cid": cid,
            "path": request.path,
            "size": size,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// === Services ===

/// GET /services
pub async fn list_services(State(state): State<AppState>) -> Response {
    match state.registry.discover_all() {
        Ok(services) => {
            let count = services.len();
            Json(json!({
                "services": services,
                "count": count,
            }))
            .into_response()
        }
        Err(e) => storage_error(e),
    }
}

/// GET /services/{name}
pub async fn get_service(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.registry.discover(&name) {
        Ok(Some(service)) => Json(service).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "service not found"),
        Err(e) => storage_error(e),
    }
}

// === File serving with single-range support ===

fn content_type_for(path: &std::path::Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .and_then(|ext| CONTENT_TYPE_BY_EXT.get(ext.as_str()).copied())
        .unwrap_or("application/octet-stream")
}

/// Parse `bytes=a-b` / `bytes=a-` / `bytes=-n` into an inclusive range.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    if total == 0 {
        return None;
    }

    if start.is_empty() {
        // Suffix form: the last n bytes
        let n: u64 = end.parse().ok()?;
        if n == 0 {
            return None;
        }
        let start = total.saturating_sub(n);
        return Some((start, total - 1));
    }

    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total - 1
    } else {
        end.parse().ok()?
    };
    let end = end.min(total - 1);
    if start > end {
        return None;
    }
    Some((start, end))
}

async fn serve_file(path: &std::path::Path, headers: &HeaderMap) -> Response {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => return error_response(StatusCode::NOT_FOUND, "file does not exist on disk"),
    };
    let total = meta.len();
    let content_type = content_type_for(path);

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| (v, parse_range(v, total)));

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to open file"),
    };

    match range {
        Some((_, Some((start, end)))) => {
            if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to seek file");
            }
            let len = end - start + 1;
            let stream = ReaderStream::new(file.take(len));
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::CONTENT_LENGTH, len.to_string()),
                    (
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, end, total),
                    ),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Some((_, None)) => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", total))],
        )
            .into_response(),
        None => {
            let stream = ReaderStream::new(file);
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::CONTENT_LENGTH, total.to_string()),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
        // End clamps to the file size
        assert_eq!(parse_range("bytes=900-2000", 1000), Some((900, 999)));
        assert_eq!(parse_range("bytes=5-2", 1000), None);
        // Start beyond the end of the file is unsatisfiable
        assert_eq!(parse_range("bytes=2000-3000", 1000), None);
        assert_eq!(parse_range("lines=0-5", 1000), None);
        assert_eq!(parse_range("bytes=0-10", 0), None);
    }

    #[test]
    fn test_content_type_lookup() {
        assert_eq!(
            content_type_for(std::path::Path::new("poster.JPG")),
            "image/jpeg"
        );
        assert_eq!(
            content_type_for(std::path::Path::new("movie.mkv")),
            "video/x-matroska"
        );
        assert_eq!(
            content_type_for(std::path::Path::new("unknown.bin")),
            "application/octet-stream"
        );
    }
}
