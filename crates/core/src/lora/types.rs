//! LoRA registry data types.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;

/// Dense index into the registry. Reused after a clear.
pub type AdapterId = usize;

/// Public view of one registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub id: AdapterId,
    pub path: String,
    pub scale: f32,
}

/// A registry result together with the epoch and table size it left behind,
/// all read under the same lock.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub epoch: u64,
    /// Adapters in the table after the call.
    pub total: usize,
}

/// One `{id, scale}` pair of an apply batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdapterUpdate {
    pub id: AdapterId,
    pub scale: f32,
}

/// An adapter to load at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub path: PathBuf,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl AdapterSpec {
    pub fn new(path: impl Into<PathBuf>, scale: f32) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }
}

/// A loaded adapter and its current scale.
pub(crate) struct AdapterEntry<B: InferenceBackend> {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) scale: f32,
    pub(crate) adapter: Arc<B::Adapter>,
}

impl<B: InferenceBackend> AdapterEntry<B> {
    pub(crate) fn new(path: &Path, scale: f32, adapter: B::Adapter) -> Self {
        Self {
            name: adapter_name(path),
            path: path.to_path_buf(),
            scale,
            adapter: Arc::new(adapter),
        }
    }

    pub(crate) fn info(&self, id: AdapterId) -> AdapterInfo {
        AdapterInfo {
            id,
            path: self.path.display().to_string(),
            scale: self.scale,
        }
    }
}

/// Display name for logs: the file name without its extension.
pub(crate) fn adapter_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// The adapter set a slot should have bound.
///
/// Immutable once built. A new binding with a higher generation replaces it
/// whenever the effective adapter set changes.
pub struct AdapterBinding<B: InferenceBackend> {
    generation: u64,
    adapters: Vec<(Arc<B::Adapter>, f32)>,
}

impl<B: InferenceBackend> AdapterBinding<B> {
    /// No adapters, generation 0.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            adapters: Vec::new(),
        }
    }

    pub(crate) fn new(generation: u64, adapters: Vec<(Arc<B::Adapter>, f32)>) -> Self {
        Self {
            generation,
            adapters,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn scales(&self) -> Vec<f32> {
        self.adapters.iter().map(|(_, scale)| *scale).collect()
    }

    pub(crate) fn pairs(&self) -> Vec<(&B::Adapter, f32)> {
        self.adapters
            .iter()
            .map(|(adapter, scale)| (adapter.as_ref(), *scale))
            .collect()
    }
}

impl<B: InferenceBackend> std::fmt::Debug for AdapterBinding<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterBinding")
            .field("generation", &self.generation)
            .field("scales", &self.scales())
            .finish()
    }
}
