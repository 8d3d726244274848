use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{SamplingParams, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Eos,
    Length,
    Stop,
    /// The slot's context window filled up.
    ContextFull,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eos => "eos",
            Self::Length => "length",
            Self::Stop => "stop",
            Self::ContextFull => "context_full",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Per-request decode settings.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: usize,
    /// Token sequences that end generation once produced.
    pub stop_sequences: Vec<Vec<TokenId>>,
    /// When true, the EOS token does not stop generation.
    pub ignore_eos: bool,
    pub sampling: SamplingParams,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 128,
            stop_sequences: Vec::new(),
            ignore_eos: false,
            sampling: SamplingParams::default(),
        }
    }
}

impl GenerationParams {
    /// Whether `generated` ends with one of the stop sequences.
    pub fn hits_stop_sequence(&self, generated: &[TokenId]) -> bool {
        self.stop_sequences
            .iter()
            .any(|stop| !stop.is_empty() && generated.ends_with(stop))
    }
}

/// One client request as seen by a worker.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub prompt: Vec<TokenId>,
    pub params: GenerationParams,
    /// Remote address, used for per-client admission.
    pub client: Option<IpAddr>,
}

impl SessionRequest {
    pub fn new(prompt: Vec<TokenId>, params: GenerationParams) -> Self {
        Self {
            prompt,
            params,
            client: None,
        }
    }

    pub fn with_client(mut self, client: IpAddr) -> Self {
        self.client = Some(client);
        self
    }
}

/// Cooperative cancellation flag, checked once per decode step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
