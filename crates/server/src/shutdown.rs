//! Graceful shutdown.
//!
//! [`shutdown_signal`] resolves on SIGINT or SIGTERM and is passed to
//! `axum::serve().with_graceful_shutdown()`. Once the listener has stopped,
//! [`drain`] wakes every request still waiting for a slot and joins the
//! worker threads.

use std::sync::Arc;
use std::time::Duration;

use slotserve_core::backend::InferenceBackend;
use slotserve_core::slots::SlotPool;
use slotserve_core::worker::WorkerPool;

/// Returns a future that resolves when an OS shutdown signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    {
        tokio::select! {
            () = ctrl_c => {
                tracing::info!("Received SIGINT, shutting down");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("Received Ctrl+C, shutting down");
    }
}

/// Stop the slot pool and join the workers.
///
/// Returns `false` when the workers did not finish within `timeout`; their
/// threads are left to exit with the process.
pub async fn drain<B: InferenceBackend>(
    pool: Arc<SlotPool<B>>,
    workers: Arc<WorkerPool>,
    timeout: Duration,
) -> bool {
    pool.shutdown();
    let busy = workers.busy();
    tracing::info!(busy, "waiting for in-flight sessions");

    let join = tokio::task::spawn_blocking(move || workers.shutdown());
    match tokio::time::timeout(timeout, join).await {
        Ok(Ok(())) => {
            tracing::info!("workers stopped");
            true
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "worker shutdown task failed");
            false
        }
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "workers did not stop in time");
            false
        }
    }
}
