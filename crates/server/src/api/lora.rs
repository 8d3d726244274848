//! Runtime adapter administration.
//!
//! Every response carries the registry epoch in `X-Adapter-Epoch` so clients
//! can tell when ids they hold were invalidated by a clear.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use slotserve_core::backend::InferenceBackend;
use slotserve_core::lora::{AdapterId, AdapterUpdate};

use super::error::ApiError;
use super::types::{ClearAdaptersResponse, LoadAdapterRequest, LoadAdapterResponse};
use super::{blocking, parse_json, require_json, AppState, ADAPTER_EPOCH_HEADER};

fn with_epoch(epoch: u64, body: impl IntoResponse) -> Response {
    let mut resp = body.into_response();
    resp.headers_mut().insert(
        HeaderName::from_static(ADAPTER_EPOCH_HEADER),
        HeaderValue::from(epoch),
    );
    resp
}

/// List loaded adapters.
///
/// GET /lora-adapters
pub async fn list_adapters<B: InferenceBackend>(
    State(state): State<AppState<B>>,
) -> Result<Response, ApiError> {
    let registry = state.registry;
    let listed = blocking(move || registry.list_versioned()).await?;
    Ok(with_epoch(listed.epoch, Json(listed.value)))
}

/// Set adapter scales atomically and echo the resulting table.
///
/// POST /lora-adapters with `[{"id": 0, "scale": 0.5}, ...]`
pub async fn apply_adapters<B: InferenceBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_json(&headers)?;
    let json: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid JSON body: {e}")))?;
    let updates = parse_updates(&json)?;

    let registry = state.registry;
    let applied = blocking(move || registry.apply_versioned(&updates)).await??;
    Ok(with_epoch(applied.epoch, Json(applied.value)))
}

/// Validate the shape of an apply body. Range checks on ids happen in the
/// registry, under its lock.
fn parse_updates(json: &Value) -> Result<Vec<AdapterUpdate>, ApiError> {
    let entries = json
        .as_array()
        .ok_or_else(|| ApiError::InvalidRequest("Request body must be an array".to_string()))?;

    entries
        .iter()
        .map(|entry| {
            let entry = entry.as_object().ok_or_else(|| {
                ApiError::InvalidRequest(
                    "Each entry must be an object with 'id' and 'scale' fields".to_string(),
                )
            })?;
            let (Some(id), Some(scale)) = (entry.get("id"), entry.get("scale")) else {
                return Err(ApiError::InvalidRequest(
                    "Each entry must have 'id' and 'scale' fields".to_string(),
                ));
            };
            let id = id
                .as_u64()
                .and_then(|id| AdapterId::try_from(id).ok())
                .ok_or_else(|| ApiError::InvalidRequest(format!("Invalid adapter id: {id}")))?;
            let scale = scale
                .as_f64()
                .ok_or_else(|| ApiError::InvalidRequest(format!("Invalid scale: {scale}")))?;
            Ok(AdapterUpdate {
                id,
                scale: scale as f32,
            })
        })
        .collect()
}

/// Load an adapter file and append it to the registry.
///
/// POST /lora-adapters/load with `{"path": "...", "scale": 1.0}`
pub async fn load_adapter<B: InferenceBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: LoadAdapterRequest = parse_json(&headers, &body)?;
    if !req.path.exists() {
        return Err(ApiError::NotFound(format!(
            "Adapter file not found: {}",
            req.path.display()
        )));
    }

    let registry = state.registry;
    let loaded = blocking(move || registry.load_versioned(&req.path, req.scale)).await??;
    Ok(with_epoch(
        loaded.epoch,
        Json(LoadAdapterResponse {
            adapter: loaded.value,
            total_adapters: loaded.total,
        }),
    ))
}

/// Free every adapter.
///
/// POST /lora-adapters/clear
pub async fn clear_adapters<B: InferenceBackend>(
    State(state): State<AppState<B>>,
) -> Result<Response, ApiError> {
    let registry = state.registry;
    let cleared = blocking(move || registry.clear_versioned()).await?;
    Ok(with_epoch(
        cleared.epoch,
        Json(ClearAdaptersResponse {
            cleared: cleared.value,
            epoch: cleared.epoch,
        }),
    ))
}
