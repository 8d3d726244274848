use thiserror::Error;

use crate::backend::BackendError;

use super::SlotId;

/// Errors from a single slot's prefill/generate cycle.
#[derive(Error, Debug)]
pub enum SlotError {
    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("prompt of {len} tokens exceeds context size {capacity}")]
    PromptTooLong { len: usize, capacity: usize },

    #[error("slot {0} has no evaluated prompt to generate from")]
    NotPrefilled(SlotId),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors from the slot pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no slots could be created")]
    NoSlots,

    #[error("slot pool is shutting down")]
    ShuttingDown,

    #[error("failed to bind adapters on slot {slot}: {source}")]
    AdapterBind {
        slot: SlotId,
        #[source]
        source: BackendError,
    },
}
