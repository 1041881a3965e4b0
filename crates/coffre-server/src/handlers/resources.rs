use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use coffre_core::storage::Store;
use coffre_protocol::{mac_from_hex_segment, parse_range_header, ByteRange, ResourceKind};
use coffre_types::Mac;

use crate::error::ServerError;
use crate::state::AppState;

/// GET / — the repository's wrapped configuration bytes.
pub async fn open_repository(State(state): State<AppState>) -> Result<Response, ServerError> {
    let store = state.store.clone();
    let bytes = run_blocking(move || store.open()).await?;
    Ok(octet_stream(bytes))
}

/// GET /resources/{resource} — JSON array of hex MACs.
pub async fn list_resource(
    State(state): State<AppState>,
    Path(resource): Path<String>,
) -> Result<Response, ServerError> {
    let kind = ResourceKind::from_path_segment(&resource)?;
    let store = state.store.clone();
    let macs = run_blocking(move || store.list(kind)).await?;
    let hexes: Vec<String> = macs.iter().map(Mac::to_hex).collect();
    Ok(Json(hexes).into_response())
}

/// GET /resources/{resource}/{mac} — blob bytes, optionally a byte range.
pub async fn get_resource(
    State(state): State<AppState>,
    Path((resource, mac)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let (kind, mac) = parse_target(&resource, &mac)?;
    let range = parse_optional_range(&headers)?;

    let store = state.store.clone();
    let data = run_blocking(move || store.get(kind, mac, range)).await?;
    Ok(octet_stream(data))
}

/// PUT /resources/{resource}/{mac} — write blob.
pub async fn put_resource(
    State(state): State<AppState>,
    Path((resource, mac)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let (kind, mac) = parse_target(&resource, &mac)?;
    let store = state.store.clone();
    run_blocking(move || store.put(kind, mac, &body)).await?;
    Ok(StatusCode::OK.into_response())
}

/// DELETE /resources/{resource}/{mac} — delete blob; 403 when read-only.
pub async fn delete_resource(
    State(state): State<AppState>,
    Path((resource, mac)): Path<(String, String)>,
) -> Result<Response, ServerError> {
    if state.no_delete {
        return Err(ServerError::Forbidden("not allowed to delete".into()));
    }
    let (kind, mac) = parse_target(&resource, &mac)?;
    let store = state.store.clone();
    run_blocking(move || store.delete(kind, mac)).await?;
    Ok(StatusCode::OK.into_response())
}

fn parse_target(resource: &str, mac: &str) -> Result<(ResourceKind, Mac), ServerError> {
    let kind = ResourceKind::from_path_segment(resource)?;
    let mac = mac_from_hex_segment(mac)?;
    Ok((kind, mac))
}

fn parse_optional_range(headers: &HeaderMap) -> Result<Option<ByteRange>, ServerError> {
    match headers.get(header::RANGE) {
        None => Ok(None),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| ServerError::BadRequest("Invalid range".into()))?;
            Ok(Some(parse_range_header(value)?))
        }
    }
}

fn octet_stream(data: Vec<u8>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response()
}

async fn run_blocking<T, F>(f: F) -> Result<T, ServerError>
where
    T: Send + 'static,
    F: FnOnce() -> coffre_types::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?
        .map_err(ServerError::from)
}
