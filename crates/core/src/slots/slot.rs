//! A single execution context and its resident token cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{common_prefix_len, BackendError, InferenceBackend, TokenId};
use crate::lora::AdapterBinding;
use crate::request::{CancelToken, FinishReason, GenerationParams};

use super::error::SlotError;

pub type SlotId = usize;

/// State shared between a slot and its pool entry.
///
/// The pool keeps a reference even while the slot itself is checked out, so
/// adapter mutations can flag busy slots without touching their context.
#[derive(Debug, Default)]
pub(crate) struct SlotControl {
    dirty: AtomicBool,
}

impl SlotControl {
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

/// Outcome of a prefill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefillStats {
    /// Prompt tokens served from the resident cache.
    pub reused: usize,
    /// Prompt tokens evaluated by the engine.
    pub evaluated: usize,
}

/// Tokens produced by one generate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub tokens: Vec<TokenId>,
    pub finish_reason: FinishReason,
}

/// One native context plus the exact record of what its KV cache holds.
///
/// `cache_tokens` is only ever extended after the engine has evaluated the
/// token, so it mirrors the context at every point.
pub struct Slot<B: InferenceBackend> {
    id: SlotId,
    ctx: B::Context,
    cache_tokens: Vec<TokenId>,
    capacity: usize,
    batch_size: usize,
    control: Arc<SlotControl>,
    // Dropped after `ctx` so adapters outlive every context they are bound to.
    binding: Arc<AdapterBinding<B>>,
    backend: Arc<B>,
}

impl<B: InferenceBackend> Slot<B> {
    pub(crate) fn new(
        id: SlotId,
        backend: Arc<B>,
        ctx: B::Context,
        batch_size: usize,
        control: Arc<SlotControl>,
        binding: Arc<AdapterBinding<B>>,
    ) -> Self {
        let capacity = backend.context_size(&ctx);
        Self {
            id,
            ctx,
            cache_tokens: Vec::new(),
            capacity,
            batch_size: batch_size.max(1),
            control,
            binding,
            backend,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Context window in tokens.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cache_tokens(&self) -> &[TokenId] {
        &self.cache_tokens
    }

    pub fn is_dirty(&self) -> bool {
        self.control.is_dirty()
    }

    /// Force the next prefill to evaluate its whole prompt.
    ///
    /// Never interrupts a generation already in progress.
    pub fn mark_for_refresh(&self) {
        self.control.mark_dirty();
    }

    /// Generation of the adapter set currently bound to the context.
    pub fn bound_generation(&self) -> u64 {
        self.binding.generation()
    }

    /// Load `tokens` into the context, reusing the longest cached prefix.
    ///
    /// A dirty slot reuses nothing. On engine failure the slot is left dirty
    /// so the next user starts from scratch.
    pub fn prefill(&mut self, tokens: &[TokenId]) -> Result<PrefillStats, SlotError> {
        if tokens.is_empty() {
            return Err(SlotError::EmptyPrompt);
        }
        if tokens.len() > self.capacity {
            return Err(SlotError::PromptTooLong {
                len: tokens.len(),
                capacity: self.capacity,
            });
        }

        let dirty = self.control.take_dirty();
        let mut reused = if dirty {
            0
        } else {
            common_prefix_len(&self.cache_tokens, tokens)
        };
        // The prompt is a strict prefix of the cache: the last prompt token
        // has to be evaluated again so there are logits to sample from.
        if reused == tokens.len() && self.cache_tokens.len() > tokens.len() {
            reused -= 1;
        }

        if let Err(e) = self.load_from(tokens, reused, dirty) {
            self.control.mark_dirty();
            tracing::warn!(slot = self.id, error = %e, "prefill failed, slot marked dirty");
            return Err(e.into());
        }

        let stats = PrefillStats {
            reused,
            evaluated: tokens.len() - reused,
        };
        tracing::debug!(
            slot = self.id,
            reused = stats.reused,
            evaluated = stats.evaluated,
            was_dirty = dirty,
            "prefill complete"
        );
        Ok(stats)
    }

    fn load_from(
        &mut self,
        tokens: &[TokenId],
        keep: usize,
        dirty: bool,
    ) -> Result<(), BackendError> {
        if dirty || self.cache_tokens.len() > keep {
            self.backend.truncate(&mut self.ctx, keep)?;
            self.cache_tokens.truncate(keep);
        }
        for chunk in tokens[keep..].chunks(self.batch_size) {
            self.backend
                .evaluate(&mut self.ctx, chunk, self.cache_tokens.len())?;
            self.cache_tokens.extend_from_slice(chunk);
        }
        Ok(())
    }

    /// Autoregressive decode after a successful prefill.
    ///
    /// `on_token` receives each token before it is evaluated; returning
    /// `false` means the consumer is gone and generation stops. `cancel` is
    /// checked before every step. Either way the cache keeps everything
    /// evaluated so far.
    pub fn generate<F>(
        &mut self,
        params: &GenerationParams,
        cancel: &CancelToken,
        mut on_token: F,
    ) -> Result<Generation, SlotError>
    where
        F: FnMut(TokenId) -> bool,
    {
        if self.cache_tokens.is_empty() {
            return Err(SlotError::NotPrefilled(self.id));
        }

        let eos = self.backend.eos_token();
        let mut tokens = Vec::new();
        let finish_reason = loop {
            if cancel.is_cancelled() {
                break FinishReason::Cancelled;
            }
            if tokens.len() >= params.max_tokens {
                break FinishReason::Length;
            }
            if self.cache_tokens.len() >= self.capacity {
                break FinishReason::ContextFull;
            }

            let token = match self.backend.sample(&mut self.ctx, &params.sampling) {
                Ok(token) => token,
                Err(e) => return Err(self.fail(e)),
            };
            if token == eos && !params.ignore_eos {
                break FinishReason::Eos;
            }
            if !on_token(token) {
                break FinishReason::Cancelled;
            }

            let n_past = self.cache_tokens.len();
            if let Err(e) = self.backend.evaluate(&mut self.ctx, &[token], n_past) {
                return Err(self.fail(e));
            }
            self.cache_tokens.push(token);
            tokens.push(token);

            if params.hits_stop_sequence(&tokens) {
                break FinishReason::Stop;
            }
        };

        tracing::debug!(
            slot = self.id,
            generated = tokens.len(),
            cached = self.cache_tokens.len(),
            finish_reason = finish_reason.as_str(),
            "generation finished"
        );
        Ok(Generation {
            tokens,
            finish_reason,
        })
    }

    fn fail(&self, e: BackendError) -> SlotError {
        self.control.mark_dirty();
        tracing::warn!(slot = self.id, error = %e, "generation failed, slot marked dirty");
        SlotError::Backend(e)
    }

    /// Bind `binding` to the context, replacing whatever was bound before.
    pub(crate) fn rebind(&mut self, binding: &Arc<AdapterBinding<B>>) -> Result<(), BackendError> {
        let adapters = binding.pairs();
        self.backend.bind_adapters(&mut self.ctx, &adapters)?;
        self.binding = Arc::clone(binding);
        Ok(())
    }
}

impl<B: InferenceBackend> std::fmt::Debug for Slot<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("cached", &self.cache_tokens.len())
            .field("capacity", &self.capacity)
            .field("dirty", &self.control.is_dirty())
            .field("adapter_generation", &self.binding.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ContextParams;
    use crate::testing::MockBackend;

    fn make_slot(backend: &Arc<MockBackend>, n_ctx: usize, batch: usize) -> Slot<MockBackend> {
        let ctx = backend
            .create_context(&ContextParams {
                n_ctx,
                n_batch: batch,
                n_threads: None,
            })
            .unwrap();
        Slot::new(
            0,
            Arc::clone(backend),
            ctx,
            batch,
            Arc::new(SlotControl::default()),
            Arc::new(AdapterBinding::empty()),
        )
    }

    fn greedy(max_tokens: usize) -> GenerationParams {
        GenerationParams {
            max_tokens,
            sampling: crate::backend::SamplingParams::greedy(),
            ..Default::default()
        }
    }

    #[test]
    fn prefill_on_empty_cache_evaluates_everything() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        let stats = slot.prefill(&[1, 2, 3, 4]).unwrap();
        assert_eq!(stats, PrefillStats { reused: 0, evaluated: 4 });
        assert_eq!(slot.cache_tokens(), &[1, 2, 3, 4]);
        assert_eq!(backend.evaluated_tokens(), 4);
    }

    #[test]
    fn identical_prompt_evaluates_nothing() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1, 2, 3]).unwrap();
        let before = backend.evaluated_tokens();

        let stats = slot.prefill(&[1, 2, 3]).unwrap();
        assert_eq!(stats, PrefillStats { reused: 3, evaluated: 0 });
        assert_eq!(backend.evaluated_tokens(), before);
    }

    #[test]
    fn extended_prompt_evaluates_only_suffix() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1, 2, 3]).unwrap();
        let stats = slot.prefill(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(stats, PrefillStats { reused: 3, evaluated: 2 });
        assert_eq!(slot.cache_tokens(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn diverging_prompt_truncates_cache() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1, 2, 3, 4]).unwrap();
        let stats = slot.prefill(&[1, 2, 9]).unwrap();
        assert_eq!(stats, PrefillStats { reused: 2, evaluated: 1 });
        assert_eq!(slot.cache_tokens(), &[1, 2, 9]);
    }

    #[test]
    fn strict_prefix_reevaluates_last_token() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1, 2, 3, 4]).unwrap();
        let stats = slot.prefill(&[1, 2]).unwrap();
        assert_eq!(stats, PrefillStats { reused: 1, evaluated: 1 });
        assert_eq!(slot.cache_tokens(), &[1, 2]);
    }

    #[test]
    fn dirty_slot_evaluates_full_prompt() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1, 2, 3]).unwrap();
        slot.mark_for_refresh();
        assert!(slot.is_dirty());

        let stats = slot.prefill(&[1, 2, 3]).unwrap();
        assert_eq!(stats, PrefillStats { reused: 0, evaluated: 3 });
        assert!(!slot.is_dirty());
    }

    #[test]
    fn prefill_evaluates_in_batches() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 4);
        let prompt: Vec<TokenId> = (0..10).collect();
        slot.prefill(&prompt).unwrap();
        // 4 + 4 + 2
        assert_eq!(backend.evaluate_calls(), 3);
        assert_eq!(backend.evaluated_tokens(), 10);
    }

    #[test]
    fn oversized_prompt_is_rejected_without_mutation() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 4, 4);
        slot.prefill(&[1, 2]).unwrap();
        let err = slot.prefill(&[1, 2, 3, 4, 5]).unwrap_err();
        assert!(matches!(
            err,
            SlotError::PromptTooLong {
                len: 5,
                capacity: 4
            }
        ));
        assert_eq!(slot.cache_tokens(), &[1, 2]);
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 8, 4);
        assert!(matches!(slot.prefill(&[]), Err(SlotError::EmptyPrompt)));
    }

    #[test]
    fn failed_prefill_marks_slot_dirty() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1, 2, 3]).unwrap();
        backend.fail_next_evaluate();
        assert!(slot.prefill(&[1, 2, 3, 4]).is_err());
        assert!(slot.is_dirty());

        // Next prefill starts over from position zero.
        let stats = slot.prefill(&[1, 2, 3, 4]).unwrap();
        assert_eq!(stats.reused, 0);
        assert_eq!(slot.cache_tokens(), &[1, 2, 3, 4]);
    }

    #[test]
    fn generate_appends_to_cache() {
        let backend = Arc::new(MockBackend::new().with_output_token(7));
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1, 2]).unwrap();
        let generation = slot
            .generate(&greedy(3), &CancelToken::new(), |_| true)
            .unwrap();
        assert_eq!(generation.tokens, vec![7, 7, 7]);
        assert_eq!(generation.finish_reason, FinishReason::Length);
        assert_eq!(slot.cache_tokens(), &[1, 2, 7, 7, 7]);
    }

    #[test]
    fn generate_stops_on_eos_without_caching_it() {
        let backend = Arc::new(MockBackend::new().with_output_token(7).with_eos_after(2));
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1]).unwrap();
        let generation = slot
            .generate(&greedy(10), &CancelToken::new(), |_| true)
            .unwrap();
        assert_eq!(generation.tokens, vec![7, 7]);
        assert_eq!(generation.finish_reason, FinishReason::Eos);
        assert_eq!(slot.cache_tokens(), &[1, 7, 7]);
    }

    #[test]
    fn generate_stops_on_stop_sequence() {
        let backend = Arc::new(MockBackend::new().with_counting_output(10));
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1]).unwrap();
        let params = GenerationParams {
            stop_sequences: vec![vec![11, 12]],
            ..greedy(10)
        };
        let generation = slot.generate(&params, &CancelToken::new(), |_| true).unwrap();
        assert_eq!(generation.tokens, vec![10, 11, 12]);
        assert_eq!(generation.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn generate_stops_when_context_is_full() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 4, 4);
        slot.prefill(&[1, 2]).unwrap();
        let generation = slot
            .generate(&greedy(10), &CancelToken::new(), |_| true)
            .unwrap();
        assert_eq!(generation.tokens.len(), 2);
        assert_eq!(generation.finish_reason, FinishReason::ContextFull);
        assert_eq!(slot.cache_tokens().len(), 4);
    }

    #[test]
    fn cancellation_is_observed_within_one_step() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1]).unwrap();
        let cancel = CancelToken::new();
        let mut seen = 0;
        let generation = slot
            .generate(&greedy(100), &cancel, |_| {
                seen += 1;
                if seen == 3 {
                    cancel.cancel();
                }
                true
            })
            .unwrap();
        assert_eq!(generation.tokens.len(), 3);
        assert_eq!(generation.finish_reason, FinishReason::Cancelled);
        // Cache is a valid (shorter) prefix: prompt plus evaluated tokens.
        assert_eq!(slot.cache_tokens().len(), 4);
    }

    #[test]
    fn consumer_disconnect_does_not_cache_unsent_token() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1]).unwrap();
        let generation = slot
            .generate(&greedy(100), &CancelToken::new(), |_| false)
            .unwrap();
        assert!(generation.tokens.is_empty());
        assert_eq!(generation.finish_reason, FinishReason::Cancelled);
        assert_eq!(slot.cache_tokens(), &[1]);
    }

    #[test]
    fn generate_requires_prefill() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        let err = slot
            .generate(&greedy(1), &CancelToken::new(), |_| true)
            .unwrap_err();
        assert!(matches!(err, SlotError::NotPrefilled(0)));
    }

    #[test]
    fn failed_decode_marks_slot_dirty() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1, 2]).unwrap();
        backend.fail_next_evaluate();
        assert!(slot
            .generate(&greedy(5), &CancelToken::new(), |_| true)
            .is_err());
        assert!(slot.is_dirty());
        assert_eq!(slot.cache_tokens(), &[1, 2]);
    }

    #[test]
    fn mark_during_generation_affects_only_next_prefill() {
        let backend = Arc::new(MockBackend::new());
        let mut slot = make_slot(&backend, 64, 16);
        slot.prefill(&[1, 2]).unwrap();
        let control = Arc::clone(&slot.control);
        let generation = slot
            .generate(&greedy(4), &CancelToken::new(), |_| {
                control.mark_dirty();
                true
            })
            .unwrap();
        assert_eq!(generation.tokens.len(), 4);
        assert_eq!(generation.finish_reason, FinishReason::Length);

        let prompt = slot.cache_tokens().to_vec();
        let stats = slot.prefill(&prompt).unwrap();
        assert_eq!(stats.reused, 0);
    }
}
