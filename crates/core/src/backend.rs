//! Interface to the native inference engine.
//!
//! The slot scheduler never touches model weights directly. Everything it
//! needs from the engine (context creation, incremental evaluation, KV
//! truncation, sampling and LoRA binding) goes through [`InferenceBackend`].
//! Native resources are released by dropping the associated `Context` and
//! `Adapter` values.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Token id as produced by the engine's tokenizer.
pub type TokenId = u32;

/// Errors reported by the native engine.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("native library unavailable: {0}")]
    Library(String),
    #[error("failed to load model from {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },
    #[error("failed to create context: {0}")]
    ContextCreate(String),
    #[error("evaluation failed: {0}")]
    Evaluate(String),
    #[error("sampling failed: {0}")]
    Sample(String),
    #[error("failed to load adapter from {path}: {reason}")]
    AdapterLoad { path: PathBuf, reason: String },
    #[error("failed to bind adapters: {0}")]
    AdapterBind(String),
    #[error("tokenization failed: {0}")]
    Tokenize(String),
}

/// Parameters for loading the base model.
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Number of layers to offload to the GPU.
    pub gpu_layers: i32,
    /// GPU used for scratch and small tensors.
    pub main_gpu: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            gpu_layers: 0,
            main_gpu: 0,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Parameters for each slot's execution context.
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Context window in tokens (KV cache capacity).
    pub n_ctx: usize,
    /// Maximum number of tokens submitted per evaluation call.
    pub n_batch: usize,
    /// Worker threads used by the engine, `None` for the engine default.
    pub n_threads: Option<usize>,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
            n_threads: None,
        }
    }
}

/// Parameters for choosing the next token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// Softmax temperature; `<= 0` selects the argmax.
    pub temperature: f32,
    /// Restrict sampling to the `top_k` most likely tokens (0 disables).
    pub top_k: usize,
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
        }
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
        }
    }
}

/// A loaded model that can create contexts and adapters.
///
/// Implementations must be shareable across worker threads. A `Context` is
/// used by one thread at a time (exclusive ownership is guaranteed by the
/// slot pool), so it only needs to be `Send`.
pub trait InferenceBackend: Send + Sync + 'static {
    /// One execution context with its own key/value cache.
    type Context: Send + 'static;
    /// A loaded LoRA adapter. Shared between the registry and every context
    /// it is bound to.
    type Adapter: Send + Sync + 'static;

    /// Load the base model.
    fn load_model(path: &Path, params: &ModelParams) -> Result<Self, BackendError>
    where
        Self: Sized;

    /// Create a new execution context. May fail, e.g. when out of memory.
    fn create_context(&self, params: &ContextParams) -> Result<Self::Context, BackendError>;

    /// Capacity of the context's key/value cache in tokens.
    fn context_size(&self, ctx: &Self::Context) -> usize;

    /// Evaluate `tokens` at positions `n_past..n_past + tokens.len()`.
    fn evaluate(
        &self,
        ctx: &mut Self::Context,
        tokens: &[TokenId],
        n_past: usize,
    ) -> Result<(), BackendError>;

    /// Drop every cached position `>= keep`.
    fn truncate(&self, ctx: &mut Self::Context, keep: usize) -> Result<(), BackendError>;

    /// Pick the next token from the logits of the last evaluated position.
    fn sample(
        &self,
        ctx: &mut Self::Context,
        params: &SamplingParams,
    ) -> Result<TokenId, BackendError>;

    /// End-of-generation token.
    fn eos_token(&self) -> TokenId;

    /// Open LoRA weights for this model.
    fn load_adapter(&self, path: &Path) -> Result<Self::Adapter, BackendError>;

    /// Replace the context's active adapter set with `adapters`, in order.
    fn bind_adapters(
        &self,
        ctx: &mut Self::Context,
        adapters: &[(&Self::Adapter, f32)],
    ) -> Result<(), BackendError>;

    /// Tokenize `text`, prepending BOS when `add_bos` is set.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError>;

    /// Text of a single token.
    fn detokenize(&self, token: TokenId) -> Result<String, BackendError>;
}

/// Length of the longest common prefix of two token sequences.
pub fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
