//! Fixed pool of OS threads running client sessions to completion.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;

/// A unit of work for a worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("all workers are busy and the queue is full")]
    Overloaded,
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Jobs accepted beyond those already running.
    pub queue_depth: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let workers = default_worker_count();
        Self {
            workers,
            queue_depth: workers,
        }
    }
}

/// Available parallelism plus a few threads for clients stuck on I/O.
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get() + 4)
        .unwrap_or(16)
}

pub struct WorkerPool {
    sender: Mutex<Option<SyncSender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn start(config: &WorkerPoolConfig) -> Result<Self, WorkerError> {
        let workers = config.workers.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Job>(config.queue_depth);
        let receiver = Arc::new(Mutex::new(receiver));
        let busy = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let receiver = Arc::clone(&receiver);
            let busy = Arc::clone(&busy);
            let handle = thread::Builder::new()
                .name(format!("slotserve-worker-{index}"))
                .spawn(move || worker_loop(index, &receiver, &busy))?;
            handles.push(handle);
        }
        tracing::info!(workers, queue_depth = config.queue_depth, "worker pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            workers,
            busy,
        })
    }

    /// Queue `job` without blocking.
    pub fn submit<F>(&self, job: F) -> Result<(), WorkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(WorkerError::ShuttingDown);
        };
        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(WorkerError::Overloaded),
            Err(TrySendError::Disconnected(_)) => Err(WorkerError::ShuttingDown),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Workers currently running a job.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, let queued ones finish and join every worker.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread exited by panic");
            }
        }
        tracing::info!(workers = count, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("busy", &self.busy())
            .finish()
    }
}

fn worker_loop(index: usize, receiver: &Mutex<Receiver<Job>>, busy: &AtomicUsize) {
    loop {
        let job = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(job) = job else {
            break;
        };

        busy.fetch_add(1, Ordering::AcqRel);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(
                worker = index,
                panic = %panic_payload_message(payload),
                "job panicked, worker continues"
            );
        }
        busy.fetch_sub(1, Ordering::AcqRel);
    }
    tracing::debug!(worker = index, "worker exiting");
}

fn panic_payload_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else {
        "unknown panic".to_string()
    }
}
