//! nsmutex core - Named Mutexes in a Secured Namespace
//!
//! Serializes work on a shared named resource (a "pool") across threads
//! and processes, plus one global installation operation, using named
//! mutexes that live inside a namespace only a single trust principal may
//! create or open.
//!
//! # Design:
//! - Pool identifiers are NFC-normalized and SHA-256 hashed into
//!   fixed-length object names (see [`naming`])
//! - Namespace bootstrap runs once per process, retrying the create/open
//!   race between processes (see [`runtime`])
//! - The operating system side sits behind [`NamespacePlatform`], with a
//!   Unix backend and an in-memory backend for race simulation
//!
//! ```rust,no_run
//! # use nsmutex_core::{NamespaceConfig, SystemRuntime};
//! let runtime = SystemRuntime::system(NamespaceConfig::for_current_user());
//! let guard = runtime.take_pool_mutex("WireGuard")?;
//! // ... operate on the pool ...
//! guard.release();
//! # Ok::<(), nsmutex_core::NamespaceError>(())
//! ```

pub mod blocking;
pub mod config;
pub mod error;
pub mod logger;
pub mod naming;
pub mod platform;
pub mod runtime;

pub use config::{NamespaceConfig, Principal};
pub use error::{NamespaceError, Result, SystemError};
pub use logger::{CallbackLayer, LogLevel, LoggerHandle};
pub use naming::{derive_mutex_name, derive_mutex_name_utf16, ObjectName};
pub use platform::{BoundaryDescriptor, MemoryPlatform, NamespacePlatform, UnixPlatform, WaitOutcome};
pub use runtime::{NamedMutexGuard, NamespaceRuntime, RuntimeStats, SystemRuntime};

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Formats to stderr, filtered by `RUST_LOG` (default `info`), and also
/// feeds a [`CallbackLayer`] whose handle is returned. Does nothing but
/// return a detached handle if a global subscriber is already set.
pub fn init_tracing() -> LoggerHandle {
    let (callback, handle) = CallbackLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(callback)
        .try_init()
        .is_ok();

    if installed {
        info!("Initializing nsmutex v{}", env!("CARGO_PKG_VERSION"));
    }
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        let _first = init_tracing();
        // A second install must not panic
        let second = init_tracing();
        second.set_logger(|_, _| {});
    }
}
