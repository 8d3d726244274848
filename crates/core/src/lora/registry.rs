//! Runtime LoRA adapter table and cross-slot invalidation.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::backend::{BackendError, InferenceBackend};
use crate::slots::SlotPool;

use super::types::{
    AdapterBinding, AdapterEntry, AdapterId, AdapterInfo, AdapterSpec, AdapterUpdate, Versioned,
};

/// Errors from adapter registry operations. None of them leave the registry
/// partially modified.
#[derive(Debug, Error)]
pub enum LoraError {
    #[error(transparent)]
    AdapterLoad(#[from] BackendError),
    #[error("invalid adapter id {id}: {count} adapters loaded")]
    InvalidId { id: AdapterId, count: usize },
    #[error("invalid scale {scale} for adapter {id}")]
    InvalidScale { id: AdapterId, scale: f32 },
    #[error("adapter limit reached: {0}")]
    RegistryFull(usize),
}

#[derive(Debug, Clone)]
pub struct AdapterRegistryConfig {
    pub max_adapters: usize,
}

impl Default for AdapterRegistryConfig {
    fn default() -> Self {
        Self { max_adapters: 8 }
    }
}

struct RegistryState<B: InferenceBackend> {
    entries: Vec<AdapterEntry<B>>,
    /// Bumped whenever the bound adapter set changes.
    generation: u64,
    /// Bumped by every clear; ids from an older epoch are stale.
    epoch: u64,
}

/// Owns every loaded adapter and keeps the slot pool in sync with it.
///
/// Mutations hold the registry lock for their whole duration and take the
/// pool lock inside it, never the other way round.
pub struct AdapterRegistry<B: InferenceBackend> {
    backend: Arc<B>,
    pool: Arc<SlotPool<B>>,
    max_adapters: usize,
    state: Mutex<RegistryState<B>>,
}

impl<B: InferenceBackend> AdapterRegistry<B> {
    pub fn new(backend: Arc<B>, pool: Arc<SlotPool<B>>, config: &AdapterRegistryConfig) -> Self {
        Self {
            backend,
            pool,
            max_adapters: config.max_adapters.max(1),
            state: Mutex::new(RegistryState {
                entries: Vec::new(),
                generation: 0,
                epoch: 0,
            }),
        }
    }

    pub fn list(&self) -> Vec<AdapterInfo> {
        self.list_versioned().value
    }

    pub fn list_versioned(&self) -> Versioned<Vec<AdapterInfo>> {
        let state = self.lock();
        versioned(&state, list_entries(&state.entries))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of clears so far.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Load an adapter and append it with the next dense id.
    ///
    /// A positive scale changes the effective adapter set, so every slot is
    /// marked dirty and rebound.
    pub fn load(&self, path: &Path, scale: f32) -> Result<AdapterInfo, LoraError> {
        self.load_versioned(path, scale).map(|loaded| loaded.value)
    }

    pub fn load_versioned(&self, path: &Path, scale: f32) -> Result<Versioned<AdapterInfo>, LoraError> {
        let mut state = self.lock();
        let id = state.entries.len();
        check_scale(id, scale)?;
        let info = self.load_entry(&mut state, path, scale)?;
        if scale > 0.0 {
            self.sync_slots(&mut state);
        }
        Ok(versioned(&state, info))
    }

    /// Load the configured startup adapters.
    ///
    /// Any failure frees the adapters loaded so far. Without `apply` the
    /// adapters are loaded with scale 0 and stay unbound until an explicit
    /// [`apply`](Self::apply).
    pub fn load_startup(&self, specs: &[AdapterSpec], apply: bool) -> Result<(), LoraError> {
        let mut state = self.lock();
        for spec in specs {
            let scale = if apply { spec.scale } else { 0.0 };
            let loaded = check_scale(state.entries.len(), scale)
                .and_then(|()| self.load_entry(&mut state, &spec.path, scale));
            if let Err(e) = loaded {
                let freed = state.entries.len();
                state.entries.clear();
                tracing::error!(path = %spec.path.display(), freed, error = %e, "startup adapter failed to load");
                return Err(e);
            }
        }
        if !specs.is_empty() {
            tracing::info!(
                count = specs.len(),
                applied = apply,
                "startup adapters loaded"
            );
            self.sync_slots(&mut state);
        }
        Ok(())
    }

    fn load_entry(
        &self,
        state: &mut RegistryState<B>,
        path: &Path,
        scale: f32,
    ) -> Result<AdapterInfo, LoraError> {
        if state.entries.len() >= self.max_adapters {
            return Err(LoraError::RegistryFull(self.max_adapters));
        }
        let adapter = self.backend.load_adapter(path)?;
        let id = state.entries.len();
        let entry = AdapterEntry::new(path, scale, adapter);
        tracing::info!(id, name = %entry.name, path = %path.display(), scale, "adapter loaded");
        let info = entry.info(id);
        state.entries.push(entry);
        Ok(info)
    }

    /// Set scales for a batch of adapters.
    ///
    /// Every id and scale is validated before anything changes. On success
    /// all slots are marked dirty and rebound, and the updated table is
    /// returned.
    pub fn apply(&self, updates: &[AdapterUpdate]) -> Result<Vec<AdapterInfo>, LoraError> {
        self.apply_versioned(updates).map(|applied| applied.value)
    }

    pub fn apply_versioned(
        &self,
        updates: &[AdapterUpdate],
    ) -> Result<Versioned<Vec<AdapterInfo>>, LoraError> {
        let mut state = self.lock();
        let count = state.entries.len();
        for update in updates {
            if update.id >= count {
                return Err(LoraError::InvalidId {
                    id: update.id,
                    count,
                });
            }
            check_scale(update.id, update.scale)?;
        }

        for update in updates {
            let entry = &mut state.entries[update.id];
            tracing::info!(id = update.id, name = %entry.name, scale = update.scale, "adapter scale set");
            entry.scale = update.scale;
        }
        self.sync_slots(&mut state);
        Ok(versioned(&state, list_entries(&state.entries)))
    }

    /// Drop every adapter and reset ids to start from 0.
    ///
    /// Slots are invalidated even when the registry was already empty.
    /// Native adapter memory is released once no slot has it bound.
    pub fn clear(&self) -> usize {
        self.clear_versioned().value
    }

    /// [`clear`](Self::clear), reporting the epoch it started.
    pub fn clear_versioned(&self) -> Versioned<usize> {
        let mut state = self.lock();
        let cleared = state.entries.len();
        state.entries.clear();
        state.epoch += 1;
        tracing::info!(cleared, epoch = state.epoch, "adapters cleared");
        self.sync_slots(&mut state);
        versioned(&state, cleared)
    }

    /// Rebuild the bound adapter set and push it to every slot.
    fn sync_slots(&self, state: &mut RegistryState<B>) {
        state.generation += 1;
        let adapters = state
            .entries
            .iter()
            .filter(|entry| entry.scale > 0.0)
            .map(|entry| (Arc::clone(&entry.adapter), entry.scale))
            .collect();
        self.pool
            .install_binding(AdapterBinding::new(state.generation, adapters));
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: InferenceBackend> std::fmt::Debug for AdapterRegistry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("AdapterRegistry")
            .field("adapters", &list_entries(&state.entries))
            .field("generation", &state.generation)
            .field("epoch", &state.epoch)
            .finish()
    }
}

fn versioned<B: InferenceBackend, T>(state: &RegistryState<B>, value: T) -> Versioned<T> {
    Versioned {
        value,
        epoch: state.epoch,
        total: state.entries.len(),
    }
}

fn list_entries<B: InferenceBackend>(entries: &[AdapterEntry<B>]) -> Vec<AdapterInfo> {
    entries
        .iter()
        .enumerate()
        .map(|(id, entry)| entry.info(id))
        .collect()
}

fn check_scale(id: AdapterId, scale: f32) -> Result<(), LoraError> {
    if scale.is_finite() {
        Ok(())
    } else {
        Err(LoraError::InvalidScale { id, scale })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ContextParams;
    use crate::slots::SlotPoolConfig;
    use crate::testing::MockBackend;

    fn setup(num_slots: usize) -> (Arc<MockBackend>, Arc<SlotPool<MockBackend>>, AdapterRegistry<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let pool = Arc::new(
            SlotPool::start(
                Arc::clone(&backend),
                &SlotPoolConfig {
                    num_slots,
                    context: ContextParams {
                        n_ctx: 64,
                        n_batch: 16,
                        n_threads: None,
                    },
                },
            )
            .unwrap(),
        );
        let registry = AdapterRegistry::new(
            Arc::clone(&backend),
            Arc::clone(&pool),
            &AdapterRegistryConfig::default(),
        );
        (backend, pool, registry)
    }

    #[test]
    fn load_assigns_dense_ids() {
        let (_, _, registry) = setup(1);
        let a = registry.load(Path::new("A.gguf"), 1.0).unwrap();
        let b = registry.load(Path::new("B.gguf"), 0.5).unwrap();
        assert_eq!((a.id, b.id), (0, 1));
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn failed_load_leaves_registry_unchanged() {
        let (backend, pool, registry) = setup(2);
        registry.load(Path::new("A.gguf"), 1.0).unwrap();
        backend.break_adapter("broken.gguf");
        let before = pool.stats().dirty;

        let err = registry.load(Path::new("broken.gguf"), 1.0).unwrap_err();
        assert!(matches!(err, LoraError::AdapterLoad(_)));
        assert_eq!(registry.len(), 1);
        assert_eq!(pool.stats().dirty, before);
    }

    #[test]
    fn load_with_positive_scale_invalidates_slots() {
        let (_, pool, registry) = setup(2);
        registry.load(Path::new("A.gguf"), 1.0).unwrap();
        assert_eq!(pool.stats().dirty, 2);
    }

    #[test]
    fn load_with_zero_scale_leaves_slots_alone() {
        let (_, pool, registry) = setup(2);
        registry.load(Path::new("A.gguf"), 0.0).unwrap();
        assert_eq!(pool.stats().dirty, 0);
    }

    #[test]
    fn apply_updates_scales_and_binds_in_id_order() {
        let (backend, pool, registry) = setup(1);
        registry.load(Path::new("A.gguf"), 0.0).unwrap();
        registry.load(Path::new("B.gguf"), 0.0).unwrap();

        let listed = registry
            .apply(&[
                AdapterUpdate { id: 1, scale: 0.25 },
                AdapterUpdate { id: 0, scale: 0.5 },
            ])
            .unwrap();
        assert_eq!(listed[0].scale, 0.5);
        assert_eq!(listed[1].scale, 0.25);
        assert_eq!(pool.stats().dirty, 1);

        let slot = pool.acquire(&[1]).unwrap();
        assert_eq!(
            backend.bound_adapters(0),
            vec![("A.gguf".to_string(), 0.5), ("B.gguf".to_string(), 0.25)]
        );
        drop(slot);
    }

    #[test]
    fn apply_with_invalid_id_changes_nothing() {
        let (_, pool, registry) = setup(2);
        registry.load(Path::new("A.gguf"), 0.0).unwrap();
        let err = registry
            .apply(&[
                AdapterUpdate { id: 0, scale: 0.9 },
                AdapterUpdate { id: 1, scale: 0.1 },
            ])
            .unwrap_err();
        assert!(matches!(err, LoraError::InvalidId { id: 1, count: 1 }));
        assert_eq!(registry.list()[0].scale, 0.0);
        assert_eq!(pool.stats().dirty, 0);
    }

    #[test]
    fn apply_rejects_non_finite_scale() {
        let (_, _, registry) = setup(1);
        registry.load(Path::new("A.gguf"), 1.0).unwrap();
        let err = registry
            .apply(&[AdapterUpdate {
                id: 0,
                scale: f32::NAN,
            }])
            .unwrap_err();
        assert!(matches!(err, LoraError::InvalidScale { id: 0, .. }));
        assert_eq!(registry.list()[0].scale, 1.0);
    }

    #[test]
    fn duplicate_ids_last_wins() {
        let (_, _, registry) = setup(1);
        registry.load(Path::new("A.gguf"), 1.0).unwrap();
        let listed = registry
            .apply(&[
                AdapterUpdate { id: 0, scale: 0.1 },
                AdapterUpdate { id: 0, scale: 0.7 },
            ])
            .unwrap();
        assert_eq!(listed[0].scale, 0.7);
    }

    #[test]
    fn versioned_results_carry_epoch_of_the_mutation() {
        let (_, _, registry) = setup(1);
        let loaded = registry.load_versioned(Path::new("A.gguf"), 1.0).unwrap();
        assert_eq!((loaded.value.id, loaded.epoch, loaded.total), (0, 0, 1));

        let cleared = registry.clear_versioned();
        assert_eq!((cleared.value, cleared.epoch, cleared.total), (1, 1, 0));

        registry.load(Path::new("B.gguf"), 1.0).unwrap();
        let applied = registry
            .apply_versioned(&[AdapterUpdate { id: 0, scale: 0.5 }])
            .unwrap();
        assert_eq!(applied.epoch, 1);
        assert_eq!(applied.value[0].path, "B.gguf");

        let listed = registry.list_versioned();
        assert_eq!(listed.epoch, 1);
        assert_eq!(listed.total, 1);
        assert_eq!(listed.value, applied.value);
    }

    #[test]
    fn registry_full_rejects_load() {
        let (backend, pool, _) = setup(1);
        let registry = AdapterRegistry::new(
            Arc::clone(&backend),
            pool,
            &AdapterRegistryConfig { max_adapters: 1 },
        );
        registry.load(Path::new("A.gguf"), 1.0).unwrap();
        let err = registry.load(Path::new("B.gguf"), 1.0).unwrap_err();
        assert!(matches!(err, LoraError::RegistryFull(1)));
    }

    #[test]
    fn clear_frees_adapters_and_reuses_ids() {
        let (backend, _, registry) = setup(2);
        registry.load(Path::new("A.gguf"), 1.0).unwrap();
        registry.load(Path::new("B.gguf"), 1.0).unwrap();
        assert_eq!(registry.clear(), 2);
        assert!(registry.list().is_empty());
        assert_eq!(registry.epoch(), 1);
        // Both slots were idle, so nothing holds the adapters any more.
        assert_eq!(backend.adapters_freed(), 2);

        let c = registry.load(Path::new("C.gguf"), 1.0).unwrap();
        assert_eq!(c.id, 0);
    }

    #[test]
    fn clear_on_empty_registry_still_invalidates() {
        let (_, pool, registry) = setup(3);
        assert_eq!(registry.clear(), 0);
        assert_eq!(pool.stats().dirty, 3);
    }

    #[test]
    fn startup_failure_frees_loaded_adapters() {
        let (backend, _, registry) = setup(1);
        backend.break_adapter("bad.gguf");
        let specs = vec![
            AdapterSpec::new("A.gguf", 1.0),
            AdapterSpec::new("bad.gguf", 1.0),
        ];
        assert!(registry.load_startup(&specs, true).is_err());
        assert!(registry.is_empty());
        assert_eq!(backend.adapters_freed(), 1);
    }

    #[test]
    fn startup_without_apply_binds_nothing() {
        let (backend, pool, registry) = setup(1);
        registry
            .load_startup(&[AdapterSpec::new("A.gguf", 0.8)], false)
            .unwrap();
        assert_eq!(registry.list()[0].scale, 0.0);
        drop(pool.acquire(&[1]).unwrap());
        assert!(backend.bound_adapters(0).is_empty());
    }

    #[test]
    fn startup_with_apply_binds_configured_scales() {
        let (backend, pool, registry) = setup(1);
        registry
            .load_startup(&[AdapterSpec::new("A.gguf", 0.8)], true)
            .unwrap();
        drop(pool.acquire(&[1]).unwrap());
        assert_eq!(backend.bound_adapters(0), vec![("A.gguf".to_string(), 0.8)]);
    }
}
