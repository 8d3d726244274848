//! Native inference engines.

mod llama;

pub use llama::{LlamaAdapter, LlamaBackend, LlamaContext};
