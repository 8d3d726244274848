//! Thread-per-connection execution: a bounded pool of OS threads, each
//! running one [`ClientSession`] to completion.

mod pool;
mod session;

pub use pool::{default_worker_count, Job, WorkerError, WorkerPool, WorkerPoolConfig};
pub use session::{ClientSession, SessionError, SessionOutcome, SessionSink};
