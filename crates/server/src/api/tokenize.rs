use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use slotserve_core::backend::InferenceBackend;

use super::error::ApiError;
use super::types::{DetokenizeRequest, DetokenizeResponse, TokenizeRequest, TokenizeResponse};
use super::{blocking, parse_json, AppState};

/// Tokenize text into token ids.
///
/// POST /tokenize
pub async fn tokenize<B: InferenceBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TokenizeResponse>, ApiError> {
    let req: TokenizeRequest = parse_json(&headers, &body)?;
    let backend = state.backend;
    let tokens = blocking(move || backend.tokenize(&req.content, req.add_special))
        .await?
        .map_err(|e| ApiError::Internal(format!("tokenization failed: {e}")))?;
    Ok(Json(TokenizeResponse { tokens }))
}

/// Detokenize token ids back into text.
///
/// POST /detokenize
pub async fn detokenize<B: InferenceBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DetokenizeResponse>, ApiError> {
    let req: DetokenizeRequest = parse_json(&headers, &body)?;
    let backend = state.backend;
    let content = blocking(move || {
        req.tokens
            .iter()
            .map(|&token| backend.detokenize(token))
            .collect::<Result<String, _>>()
    })
    .await?
    .map_err(|e| ApiError::Internal(format!("detokenization failed: {e}")))?;
    Ok(Json(DetokenizeResponse { content }))
}
