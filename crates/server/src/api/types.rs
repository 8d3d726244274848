use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use slotserve_core::backend::TokenId;
use slotserve_core::lora::AdapterInfo;
use slotserve_core::slots::{PoolStats, SlotId};

/// A prompt given either as text or as pre-tokenized ids.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Tokens(Vec<TokenId>),
}

/// POST /completion
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    pub prompt: PromptInput,
    /// Tokens to generate. Unset or negative runs until EOS or a full context.
    #[serde(default)]
    pub n_predict: Option<i64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub ignore_eos: bool,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub content: String,
    pub tokens: Vec<TokenId>,
    pub slot_id: SlotId,
    /// Prompt length in tokens.
    pub tokens_evaluated: usize,
    /// Prompt tokens served from the slot cache.
    pub tokens_cached: usize,
    pub tokens_predicted: usize,
    pub stop_reason: &'static str,
}

/// One SSE `data:` payload of a streamed completion.
#[derive(Debug, Serialize)]
pub struct CompletionChunk {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenId>,
    pub stop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_evaluated: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_cached: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_predicted: Option<usize>,
}

/// POST /lora-adapters/load
#[derive(Debug, Clone, Deserialize)]
pub struct LoadAdapterRequest {
    pub path: PathBuf,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Debug, Serialize)]
pub struct LoadAdapterResponse {
    #[serde(flatten)]
    pub adapter: AdapterInfo,
    pub total_adapters: usize,
}

#[derive(Debug, Serialize)]
pub struct ClearAdaptersResponse {
    pub cleared: usize,
    pub epoch: u64,
}

/// POST /tokenize
#[derive(Debug, Clone, Deserialize)]
pub struct TokenizeRequest {
    pub content: String,
    /// Prepend BOS.
    #[serde(default)]
    pub add_special: bool,
}

#[derive(Debug, Serialize)]
pub struct TokenizeResponse {
    pub tokens: Vec<TokenId>,
}

/// POST /detokenize
#[derive(Debug, Clone, Deserialize)]
pub struct DetokenizeRequest {
    pub tokens: Vec<TokenId>,
}

#[derive(Debug, Serialize)]
pub struct DetokenizeResponse {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct WorkerStats {
    pub workers: usize,
    pub busy: usize,
}

/// GET /health
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub slots: PoolStats,
    pub workers: WorkerStats,
    pub adapters: usize,
    pub adapter_epoch: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_accepts_text_or_tokens() {
        let text: CompletionRequest = serde_json::from_str(r#"{"prompt": "hello"}"#).unwrap();
        assert_eq!(text.prompt, PromptInput::Text("hello".to_string()));
        assert!(!text.stream);
        assert!(text.stop.is_empty());

        let tokens: CompletionRequest = serde_json::from_str(r#"{"prompt": [1, 2, 3]}"#).unwrap();
        assert_eq!(tokens.prompt, PromptInput::Tokens(vec![1, 2, 3]));
    }

    #[test]
    fn prompt_rejects_other_shapes() {
        assert!(serde_json::from_str::<CompletionRequest>(r#"{"prompt": {"a": 1}}"#).is_err());
        assert!(serde_json::from_str::<CompletionRequest>(r#"{"prompt": [-1]}"#).is_err());
    }

    #[test]
    fn load_request_scale_defaults_to_one() {
        let req: LoadAdapterRequest = serde_json::from_str(r#"{"path": "/a.gguf"}"#).unwrap();
        assert_eq!(req.scale, 1.0);
    }

    #[test]
    fn load_response_flattens_adapter() {
        let resp = LoadAdapterResponse {
            adapter: AdapterInfo {
                id: 2,
                path: "/a.gguf".to_string(),
                scale: 0.5,
            },
            total_adapters: 3,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], 2);
        assert_eq!(json["path"], "/a.gguf");
        assert_eq!(json["total_adapters"], 3);
    }

    #[test]
    fn chunk_omits_unset_stats() {
        let chunk = CompletionChunk {
            content: "a".to_string(),
            token: Some(97),
            stop: false,
            stop_reason: None,
            slot_id: None,
            tokens_evaluated: None,
            tokens_cached: None,
            tokens_predicted: None,
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert_eq!(json, r#"{"content":"a","token":97,"stop":false}"#);
    }
}
