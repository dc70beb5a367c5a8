//! Cancellable acquisition for async callers.
//!
//! Acquisition blocks a thread with no timeout. These wrappers run it on
//! Tokio's blocking pool and race it against a [`CancellationToken`]. A
//! cancelled caller gets [`NamespaceError::Cancelled`] right away; the
//! worker keeps waiting, and if ownership is granted later the guard is
//! released in the background, so cancellation never leaks a held mutex.

use crate::error::{NamespaceError, Result};
use crate::platform::NamespacePlatform;
use crate::runtime::{NamedMutexGuard, NamespaceRuntime};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Acquire the mutex guarding `pool` without blocking the async executor.
pub async fn take_pool_mutex_cancellable<P: NamespacePlatform>(
    runtime: Arc<NamespaceRuntime<P>>,
    pool: impl Into<String>,
    cancel: CancellationToken,
) -> Result<NamedMutexGuard<P>> {
    let pool = pool.into();
    let label = pool.clone();
    run_cancellable(label, cancel, move || runtime.take_pool_mutex(&pool)).await
}

/// Acquire the installation mutex without blocking the async executor.
pub async fn take_installation_mutex_cancellable<P: NamespacePlatform>(
    runtime: Arc<NamespaceRuntime<P>>,
    cancel: CancellationToken,
) -> Result<NamedMutexGuard<P>> {
    let label = runtime.installation_mutex_name().to_string();
    run_cancellable(label, cancel, move || runtime.take_installation_mutex()).await
}

async fn run_cancellable<P, F>(
    label: String,
    cancel: CancellationToken,
    acquire: F,
) -> Result<NamedMutexGuard<P>>
where
    P: NamespacePlatform,
    F: FnOnce() -> Result<NamedMutexGuard<P>> + Send + 'static,
{
    let mut worker = tokio::task::spawn_blocking(acquire);

    tokio::select! {
        biased;

        joined = &mut worker => {
            joined.map_err(|e| NamespaceError::Worker(e.to_string()))?
        }
        () = cancel.cancelled() => {
            info!(mutex = %label, "Acquisition cancelled");
            tokio::spawn(async move {
                if let Ok(Ok(guard)) = worker.await {
                    debug!(mutex = %guard.name(), "Releasing mutex granted after cancellation");
                    guard.release();
                }
            });
            Err(NamespaceError::Cancelled { name: label })
        }
    }
}
