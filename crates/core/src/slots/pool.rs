//! Fixed pool of slots with prefix-aware assignment.

use std::cmp::Reverse;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::backend::{common_prefix_len, ContextParams, InferenceBackend, TokenId};
use crate::lora::AdapterBinding;

use super::error::PoolError;
use super::slot::{Slot, SlotControl, SlotId};

#[derive(Debug, Clone)]
pub struct SlotPoolConfig {
    /// Number of contexts to create. Creation failures shrink the pool.
    pub num_slots: usize,
    pub context: ContextParams,
}

impl Default for SlotPoolConfig {
    fn default() -> Self {
        Self {
            num_slots: 1,
            context: ContextParams::default(),
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub num_slots: usize,
    pub idle: usize,
    pub busy: usize,
    pub dirty: usize,
    /// Threads blocked in `acquire`.
    pub waiting: usize,
}

struct SlotEntry<B: InferenceBackend> {
    control: Arc<SlotControl>,
    /// `None` while the slot is checked out.
    slot: Option<Slot<B>>,
    /// Logical release time; 0 means never used.
    released_at: u64,
}

struct PoolState<B: InferenceBackend> {
    entries: Vec<SlotEntry<B>>,
    binding: Arc<AdapterBinding<B>>,
    clock: u64,
    waiting: usize,
    shutdown: bool,
}

/// Owns every slot and hands them out one thread at a time.
///
/// Assignment prefers the idle slot sharing the longest prefix with the
/// incoming prompt, then the least recently released one. When every slot is
/// busy, `acquire` blocks until one is released.
pub struct SlotPool<B: InferenceBackend> {
    state: Mutex<PoolState<B>>,
    available: Condvar,
}

impl<B: InferenceBackend> SlotPool<B> {
    /// Create the pool's contexts.
    ///
    /// Individual context failures are logged and skipped; the pool only
    /// fails when not a single context could be created.
    pub fn start(backend: Arc<B>, config: &SlotPoolConfig) -> Result<Self, PoolError> {
        let binding = Arc::new(AdapterBinding::empty());
        let mut entries = Vec::with_capacity(config.num_slots);
        for attempt in 0..config.num_slots {
            let ctx = match backend.create_context(&config.context) {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "failed to create slot context");
                    continue;
                }
            };
            let control = Arc::new(SlotControl::default());
            let slot = Slot::new(
                entries.len(),
                Arc::clone(&backend),
                ctx,
                config.context.n_batch,
                Arc::clone(&control),
                Arc::clone(&binding),
            );
            entries.push(SlotEntry {
                control,
                slot: Some(slot),
                released_at: 0,
            });
        }

        if entries.is_empty() {
            return Err(PoolError::NoSlots);
        }
        tracing::info!(
            slots = entries.len(),
            requested = config.num_slots,
            n_ctx = config.context.n_ctx,
            "slot pool started"
        );

        Ok(Self {
            state: Mutex::new(PoolState {
                entries,
                binding,
                clock: 0,
                waiting: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the best idle slot for `prompt`, blocking while none is idle.
    pub fn acquire(&self, prompt: &[TokenId]) -> Result<SlotGuard<'_, B>, PoolError> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return Err(PoolError::ShuttingDown);
            }
            if let Some(slot) = take_best(&mut state.entries, prompt) {
                return self.check_out(state, slot);
            }
            state.waiting += 1;
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            state.waiting -= 1;
        }
    }

    /// Like [`acquire`](Self::acquire) but returns `None` instead of blocking.
    pub fn try_acquire(&self, prompt: &[TokenId]) -> Result<Option<SlotGuard<'_, B>>, PoolError> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(PoolError::ShuttingDown);
        }
        match take_best(&mut state.entries, prompt) {
            Some(slot) => self.check_out(state, slot).map(Some),
            None => Ok(None),
        }
    }

    fn check_out(
        &self,
        mut state: MutexGuard<'_, PoolState<B>>,
        mut slot: Slot<B>,
    ) -> Result<SlotGuard<'_, B>, PoolError> {
        let binding = Arc::clone(&state.binding);
        if slot.bound_generation() != binding.generation() {
            // Whatever is cached was computed under the old adapters.
            slot.mark_for_refresh();
            if let Err(source) = slot.rebind(&binding) {
                let id = slot.id();
                tracing::warn!(slot = id, error = %source, "adapter rebind failed at acquisition");
                self.put_back(&mut state, slot);
                return Err(PoolError::AdapterBind { slot: id, source });
            }
            tracing::debug!(
                slot = slot.id(),
                generation = binding.generation(),
                adapters = binding.len(),
                "rebound adapters at acquisition"
            );
        }
        tracing::trace!(slot = slot.id(), cached = slot.cache_tokens().len(), "slot acquired");
        Ok(SlotGuard {
            pool: self,
            slot: Some(slot),
        })
    }

    /// Return a slot. Usually called through [`SlotGuard`]'s drop.
    pub fn release(&self, guard: SlotGuard<'_, B>) {
        drop(guard);
    }

    fn release_slot(&self, mut slot: Slot<B>) {
        let mut state = self.lock();
        // Catch up with a binding installed while the slot was busy so stale
        // adapters are not kept alive by an idle slot. The holder may have
        // prefilled after the binding changed, which consumed the dirty bit
        // set by the install, so the cache has to be invalidated again.
        if slot.bound_generation() != state.binding.generation() {
            slot.mark_for_refresh();
            let binding = Arc::clone(&state.binding);
            if let Err(e) = slot.rebind(&binding) {
                tracing::warn!(slot = slot.id(), error = %e, "adapter rebind failed at release");
            }
        }
        self.put_back(&mut state, slot);
    }

    fn put_back(&self, state: &mut PoolState<B>, slot: Slot<B>) {
        state.clock += 1;
        let released_at = state.clock;
        let id = slot.id();
        if let Some(entry) = state.entries.get_mut(id) {
            tracing::trace!(slot = id, cached = slot.cache_tokens().len(), "slot released");
            entry.slot = Some(slot);
            entry.released_at = released_at;
        }
        self.available.notify_one();
    }

    /// Visit every slot with the pool lock held.
    ///
    /// Busy slots only expose their refresh flag; idle slots can be accessed
    /// directly.
    pub fn apply_to_all<F>(&self, mut f: F)
    where
        F: FnMut(SlotHandle<'_, B>),
    {
        let mut state = self.lock();
        for (id, entry) in state.entries.iter_mut().enumerate() {
            f(SlotHandle {
                id,
                control: entry.control.as_ref(),
                slot: entry.slot.as_mut(),
            });
        }
    }

    /// Mark every slot dirty.
    pub fn mark_all_for_refresh(&self) {
        self.apply_to_all(|handle| handle.mark_for_refresh());
    }

    /// Make `binding` the adapter set for every slot.
    ///
    /// All slots are marked dirty. Idle slots are rebound immediately; busy
    /// slots keep their current adapters until they are next acquired.
    pub(crate) fn install_binding(&self, binding: AdapterBinding<B>) {
        let binding = Arc::new(binding);
        let mut state = self.lock();
        state.binding = Arc::clone(&binding);
        let mut rebound = 0usize;
        let mut deferred = 0usize;
        for entry in state.entries.iter_mut() {
            entry.control.mark_dirty();
            match entry.slot.as_mut() {
                Some(slot) => match slot.rebind(&binding) {
                    Ok(()) => rebound += 1,
                    Err(e) => {
                        tracing::warn!(slot = slot.id(), error = %e, "adapter rebind failed, retrying at acquisition");
                    }
                },
                None => deferred += 1,
            }
        }
        tracing::info!(
            generation = binding.generation(),
            adapters = binding.len(),
            rebound,
            deferred,
            "adapter binding installed"
        );
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let idle = state.entries.iter().filter(|e| e.slot.is_some()).count();
        let dirty = state
            .entries
            .iter()
            .filter(|e| e.control.is_dirty())
            .count();
        PoolStats {
            num_slots: state.entries.len(),
            idle,
            busy: state.entries.len() - idle,
            dirty,
            waiting: state.waiting,
        }
    }

    /// Fail current and future waiters with [`PoolError::ShuttingDown`].
    ///
    /// Slots already checked out stay valid until their guards drop.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if !state.shutdown {
            state.shutdown = true;
            tracing::info!(waiting = state.waiting, "slot pool shutting down");
        }
        self.available.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: InferenceBackend> std::fmt::Debug for SlotPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool").field("stats", &self.stats()).finish()
    }
}

/// Remove and return the best idle slot for `prompt`.
///
/// Longest common prefix wins; ties go to the least recently released slot,
/// then the lowest id. Dirty slots count as having no prefix.
fn take_best<B: InferenceBackend>(
    entries: &mut [SlotEntry<B>],
    prompt: &[TokenId],
) -> Option<Slot<B>> {
    let index = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let slot = entry.slot.as_ref()?;
            let prefix = if entry.control.is_dirty() {
                0
            } else {
                common_prefix_len(slot.cache_tokens(), prompt)
            };
            Some((index, prefix, entry.released_at))
        })
        .min_by_key(|&(index, prefix, released_at)| (Reverse(prefix), released_at, index))
        .map(|(index, ..)| index)?;
    entries[index].slot.take()
}

/// Exclusive access to a checked-out slot. Returns it to the pool on drop.
///
/// If the holder panics, the slot comes back dirty.
pub struct SlotGuard<'a, B: InferenceBackend> {
    pool: &'a SlotPool<B>,
    slot: Option<Slot<B>>,
}

impl<B: InferenceBackend> Deref for SlotGuard<'_, B> {
    type Target = Slot<B>;

    fn deref(&self) -> &Slot<B> {
        self.slot.as_ref().expect("slot is present until the guard drops")
    }
}

impl<B: InferenceBackend> DerefMut for SlotGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut Slot<B> {
        self.slot.as_mut().expect("slot is present until the guard drops")
    }
}

impl<B: InferenceBackend> Drop for SlotGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if std::thread::panicking() {
                slot.mark_for_refresh();
            }
            self.pool.release_slot(slot);
        }
    }
}

impl<B: InferenceBackend> std::fmt::Debug for SlotGuard<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SlotGuard").field(&self.slot).finish()
    }
}

/// A slot as seen from [`SlotPool::apply_to_all`].
pub struct SlotHandle<'a, B: InferenceBackend> {
    id: SlotId,
    control: &'a SlotControl,
    slot: Option<&'a mut Slot<B>>,
}

impl<'a, B: InferenceBackend> SlotHandle<'a, B> {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_none()
    }

    pub fn is_dirty(&self) -> bool {
        self.control.is_dirty()
    }

    pub fn mark_for_refresh(&self) {
        self.control.mark_dirty();
    }

    /// The slot itself, if it is idle.
    pub fn idle_slot(&mut self) -> Option<&mut Slot<B>> {
        self.slot.as_deref_mut()
    }
}
