use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{Extensions, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use slotserve_core::backend::{InferenceBackend, SamplingParams};
use slotserve_core::request::{CancelToken, GenerationParams, SessionRequest};
use slotserve_core::worker::SessionOutcome;
use tokio::sync::mpsc;

use super::error::ApiError;
use super::streaming::{completion_sse_stream, CancelOnDrop, ChannelSink, SessionEvent, EVENT_BUFFER};
use super::types::{CompletionRequest, CompletionResponse, PromptInput};
use super::{blocking, parse_json, AppState};

/// Tokenize the prompt and stop strings and build the session request.
fn prepare<B: InferenceBackend>(backend: &B, req: CompletionRequest) -> Result<SessionRequest, ApiError> {
    let prompt = match req.prompt {
        PromptInput::Text(text) => backend
            .tokenize(&text, true)
            .map_err(|e| ApiError::Internal(format!("tokenization failed: {e}")))?,
        PromptInput::Tokens(tokens) => tokens,
    };
    if prompt.is_empty() {
        return Err(ApiError::InvalidRequest("prompt is empty".to_string()));
    }

    let stop_sequences = req
        .stop
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| backend.tokenize(s, false))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::Internal(format!("tokenization failed: {e}")))?;

    let defaults = SamplingParams::default();
    let params = GenerationParams {
        max_tokens: req
            .n_predict
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(usize::MAX),
        stop_sequences,
        ignore_eos: req.ignore_eos,
        sampling: SamplingParams {
            temperature: req.temperature.unwrap_or(defaults.temperature),
            top_k: req.top_k.unwrap_or(defaults.top_k),
        },
    };
    Ok(SessionRequest::new(prompt, params))
}

/// Generate a completion, streamed as SSE when `stream` is set.
///
/// POST /completion
pub async fn create_completion<B: InferenceBackend>(
    State(state): State<AppState<B>>,
    extensions: Extensions,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: CompletionRequest = parse_json(&headers, &body)?;
    let stream = req.stream;

    let backend = Arc::clone(&state.backend);
    let mut request = blocking(move || prepare(backend.as_ref(), req)).await??;
    if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
        request = request.with_client(addr.ip());
    }

    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancelToken::new();
    {
        let session = state.session.clone();
        let cancel = cancel.clone();
        let mut sink = ChannelSink::new(Arc::clone(&state.backend), tx);
        state
            .workers
            .submit(move || session.run(&request, &cancel, &mut sink))?;
    }

    // Armed before waiting so a client that leaves while queued for a slot
    // cancels the session before its prefill.
    let guard = CancelOnDrop(cancel);

    // Failures before the first token (admission, slot, prefill) are
    // reported with a status code even when streaming.
    let first = match rx.recv().await {
        Some(SessionEvent::Finished(Err(e))) => return Err(e.into()),
        Some(event) => event,
        None => return Err(ended_without_result()),
    };
    if stream {
        return Ok(completion_sse_stream(first, rx, guard).into_response());
    }

    let _guard = guard;
    let mut content = String::new();
    let mut event = Some(first);
    loop {
        match event.take() {
            Some(SessionEvent::Token { piece, .. }) => content.push_str(&piece),
            Some(SessionEvent::Finished(result)) => {
                let outcome = result?;
                return Ok(Json(completion_response(content, outcome)).into_response());
            }
            None => return Err(ended_without_result()),
        }
        event = rx.recv().await;
    }
}

fn completion_response(content: String, outcome: SessionOutcome) -> CompletionResponse {
    CompletionResponse {
        content,
        tokens_predicted: outcome.generated.len(),
        tokens: outcome.generated,
        slot_id: outcome.slot_id,
        tokens_evaluated: outcome.prompt_tokens,
        tokens_cached: outcome.reused_tokens,
        stop_reason: outcome.finish_reason.as_str(),
    }
}

fn ended_without_result() -> ApiError {
    ApiError::Internal("session ended without a result".to_string())
}
