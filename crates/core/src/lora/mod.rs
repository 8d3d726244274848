//! Runtime-swappable LoRA adapters.
//!
//! The [`AdapterRegistry`] owns every loaded adapter. Each mutation produces
//! a new [`AdapterBinding`] that the slot pool installs on every slot, marking
//! all of them dirty so no cache computed under the old adapter set is reused.

mod registry;
mod types;

pub use registry::{AdapterRegistry, AdapterRegistryConfig, LoraError};
pub use types::{AdapterBinding, AdapterId, AdapterInfo, AdapterSpec, AdapterUpdate, Versioned};
