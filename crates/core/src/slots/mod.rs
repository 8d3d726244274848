//! Slots: execution contexts with resident KV caches, and the pool that
//! schedules requests onto them.

mod error;
mod pool;
mod slot;

pub use error::{PoolError, SlotError};
pub use pool::{PoolStats, SlotGuard, SlotHandle, SlotPool, SlotPoolConfig};
pub use slot::{Generation, PrefillStats, Slot, SlotId};

pub(crate) use slot::SlotControl;
