use axum::extract::State;
use axum::Json;
use slotserve_core::backend::InferenceBackend;

use super::error::ApiError;
use super::types::{HealthResponse, WorkerStats};
use super::{blocking, AppState};

/// Slot pool, worker and adapter status.
///
/// GET /health
pub async fn health<B: InferenceBackend>(
    State(state): State<AppState<B>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let workers = WorkerStats {
        workers: state.workers.workers(),
        busy: state.workers.busy(),
    };
    let (slots, adapters, adapter_epoch, shut_down) = blocking(move || {
        (
            state.pool.stats(),
            state.registry.len(),
            state.registry.epoch(),
            state.pool.is_shut_down(),
        )
    })
    .await?;

    let status = if shut_down {
        "shutting_down"
    } else if slots.idle == 0 {
        "no_slot_available"
    } else {
        "ok"
    };
    Ok(Json(HealthResponse {
        status,
        slots,
        workers,
        adapters,
        adapter_epoch,
    }))
}
