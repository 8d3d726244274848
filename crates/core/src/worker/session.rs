//! One client request driven through admission, a slot and generation.

use std::sync::Arc;

use thiserror::Error;

use crate::admission::{Admission, AdmissionRejected};
use crate::backend::{BackendError, InferenceBackend, TokenId};
use crate::request::{CancelToken, FinishReason, SessionRequest};
use crate::slots::{PoolError, SlotError, SlotId, SlotPool};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    AdmissionRejected(#[from] AdmissionRejected),
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("prompt of {len} tokens exceeds context size {capacity}")]
    PromptTooLong { len: usize, capacity: usize },
    #[error("evaluation failed on slot {slot}: {source}")]
    Evaluation {
        slot: SlotId,
        #[source]
        source: BackendError,
    },
    #[error("failed to bind adapters on slot {slot}: {source}")]
    AdapterBind {
        slot: SlotId,
        #[source]
        source: BackendError,
    },
    #[error("server is shutting down")]
    ShuttingDown,
}

impl SessionError {
    /// Whether the client caused the failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::EmptyPrompt | Self::PromptTooLong { .. })
    }

    fn from_slot(slot: SlotId, e: SlotError) -> Self {
        match e {
            SlotError::EmptyPrompt | SlotError::NotPrefilled(_) => Self::EmptyPrompt,
            SlotError::PromptTooLong { len, capacity } => Self::PromptTooLong { len, capacity },
            SlotError::Backend(source) => Self::Evaluation { slot, source },
        }
    }
}

impl From<PoolError> for SessionError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::AdapterBind { slot, source } => Self::AdapterBind { slot, source },
            PoolError::NoSlots | PoolError::ShuttingDown => Self::ShuttingDown,
        }
    }
}

/// Summary of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub slot_id: SlotId,
    pub prompt_tokens: usize,
    /// Prompt tokens served from the slot's cache.
    pub reused_tokens: usize,
    pub generated: Vec<TokenId>,
    pub finish_reason: FinishReason,
}

/// Receives a session's output as it is produced.
pub trait SessionSink {
    /// Called for every generated token. Return `false` when the client is
    /// gone; generation stops before the next step.
    fn on_token(&mut self, token: TokenId) -> bool;

    /// Called exactly once when the session ends.
    fn on_finish(&mut self, result: Result<SessionOutcome, SessionError>);
}

/// Runs requests against a shared slot pool.
pub struct ClientSession<B: InferenceBackend> {
    pool: Arc<SlotPool<B>>,
    admission: Arc<Admission>,
}

impl<B: InferenceBackend> Clone for ClientSession<B> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            admission: Arc::clone(&self.admission),
        }
    }
}

impl<B: InferenceBackend> ClientSession<B> {
    pub fn new(pool: Arc<SlotPool<B>>, admission: Arc<Admission>) -> Self {
        Self { pool, admission }
    }

    pub fn pool(&self) -> &Arc<SlotPool<B>> {
        &self.pool
    }

    /// Execute `request` and report the result to `sink`.
    pub fn run<S: SessionSink>(&self, request: &SessionRequest, cancel: &CancelToken, sink: &mut S) {
        let result = self.execute(request, cancel, |token| sink.on_token(token));
        sink.on_finish(result);
    }

    /// Admission, slot acquisition, prefill and generation.
    ///
    /// The slot is released on every path, including errors.
    pub fn execute<F>(
        &self,
        request: &SessionRequest,
        cancel: &CancelToken,
        on_token: F,
    ) -> Result<SessionOutcome, SessionError>
    where
        F: FnMut(TokenId) -> bool,
    {
        self.admission.check(request.client).map_err(|e| {
            tracing::debug!(client = ?request.client, error = %e, "request rejected by admission");
            e
        })?;
        if request.prompt.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }

        let mut slot = self.pool.acquire(&request.prompt)?;
        let slot_id = slot.id();
        // The client may have left while waiting for the slot.
        if cancel.is_cancelled() {
            tracing::debug!(slot = slot_id, "session cancelled before prefill");
            return Ok(SessionOutcome {
                slot_id,
                prompt_tokens: request.prompt.len(),
                reused_tokens: 0,
                generated: Vec::new(),
                finish_reason: FinishReason::Cancelled,
            });
        }
        let prefill = slot
            .prefill(&request.prompt)
            .map_err(|e| SessionError::from_slot(slot_id, e))?;
        let generation = slot
            .generate(&request.params, cancel, on_token)
            .map_err(|e| SessionError::from_slot(slot_id, e))?;
        drop(slot);

        tracing::info!(
            slot = slot_id,
            prompt_tokens = request.prompt.len(),
            reused = prefill.reused,
            evaluated = prefill.evaluated,
            generated = generation.tokens.len(),
            finish_reason = generation.finish_reason.as_str(),
            "session complete"
        );
        Ok(SessionOutcome {
            slot_id,
            prompt_tokens: request.prompt.len(),
            reused_tokens: prefill.reused,
            generated: generation.tokens,
            finish_reason: generation.finish_reason,
        })
    }
}
