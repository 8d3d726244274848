pub mod completions;
pub mod error;
pub mod health;
pub mod lora;
pub mod streaming;
pub mod tokenize;
pub mod types;

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{header, HeaderMap};
use axum::routing::{get, post};
use axum::Router;
use serde::de::DeserializeOwned;
use slotserve_core::admission::Admission;
use slotserve_core::backend::InferenceBackend;
use slotserve_core::lora::AdapterRegistry;
use slotserve_core::slots::SlotPool;
use slotserve_core::worker::{ClientSession, WorkerPool};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use self::error::ApiError;

/// Response header carrying the adapter registry epoch. Adapter ids read
/// under one epoch are meaningless under another.
pub const ADAPTER_EPOCH_HEADER: &str = "x-adapter-epoch";

pub struct AppState<B: InferenceBackend> {
    pub backend: Arc<B>,
    pub pool: Arc<SlotPool<B>>,
    pub registry: Arc<AdapterRegistry<B>>,
    pub session: ClientSession<B>,
    pub workers: Arc<WorkerPool>,
}

impl<B: InferenceBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            pool: Arc::clone(&self.pool),
            registry: Arc::clone(&self.registry),
            session: self.session.clone(),
            workers: Arc::clone(&self.workers),
        }
    }
}

impl<B: InferenceBackend> AppState<B> {
    pub fn new(
        backend: Arc<B>,
        pool: Arc<SlotPool<B>>,
        registry: Arc<AdapterRegistry<B>>,
        admission: Arc<Admission>,
        workers: Arc<WorkerPool>,
    ) -> Self {
        let session = ClientSession::new(Arc::clone(&pool), admission);
        Self {
            backend,
            pool,
            registry,
            session,
            workers,
        }
    }
}

pub fn create_router<B: InferenceBackend>(state: AppState<B>) -> Router {
    Router::new()
        .route("/health", get(health::health::<B>))
        .route("/completion", post(completions::create_completion::<B>))
        .route("/tokenize", post(tokenize::tokenize::<B>))
        .route("/detokenize", post(tokenize::detokenize::<B>))
        .route(
            "/lora-adapters",
            get(lora::list_adapters::<B>).post(lora::apply_adapters::<B>),
        )
        .route("/lora-adapters/load", post(lora::load_adapter::<B>))
        .route("/lora-adapters/clear", post(lora::clear_adapters::<B>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Run `f` on the blocking pool. Registry and engine calls may wait on the
/// pool mutex or on native code, neither of which belongs on the runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))
}

/// Require a JSON content type.
pub(crate) fn require_json(headers: &HeaderMap) -> Result<(), ApiError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"));
    if is_json {
        Ok(())
    } else {
        Err(ApiError::InvalidRequest(
            "Content-Type must be application/json".to_string(),
        ))
    }
}

/// Decode a JSON body into `T`, reporting failures in the API error envelope.
pub(crate) fn parse_json<T: DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> Result<T, ApiError> {
    require_json(headers)?;
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidRequest(format!("invalid JSON body: {e}")))
}
