//! Namespace Runtime - Bootstrap, Acquisition and Release
//!
//! [`NamespaceRuntime`] is the process-wide service object behind every
//! named mutex. It owns the bootstrap state machine:
//!
//! ```text
//! Uninitialized ──ensure_ready()──▶ Ready ──shutdown()──▶ Uninitialized
//!        ▲                            │
//!        └──── failure (not cached) ──┘ (never: Ready is sticky)
//! ```
//!
//! Bootstrap opens the hash provider and creates or attaches to the
//! secured namespace, exactly once per process while it stays `Ready`.
//! Both mutex managers go through it before touching any named object.
//!
//! # Concurrency:
//! - The internal guard serializes the bootstrap decision only.
//!   Cross-process exclusion is entirely the platform's named objects.
//! - Acquisition blocks the calling thread with no timeout. See
//!   [`crate::blocking`] for a cancellable wrapper.
//! - Guards hold their own `Arc` of the platform, so `shutdown()` never
//!   invalidates a mutex that is currently held.

use crate::config::NamespaceConfig;
use crate::error::{format_system_error, NamespaceError, Result, SystemError};
use crate::naming::{HashProvider, MutexNamer, ObjectName};
use crate::platform::{BoundaryDescriptor, NamespacePlatform, UnixPlatform, WaitOutcome};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Runtime backed by the host's named objects.
pub type SystemRuntime = NamespaceRuntime<UnixPlatform>;

enum BootstrapState {
    Uninitialized,
    Ready { namer: MutexNamer },
}

#[derive(Default)]
struct Counters {
    bootstraps: AtomicU64,
    namespace_retries: AtomicU64,
    acquisitions: AtomicU64,
    abandoned: AtomicU64,
}

/// Snapshot of a runtime's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    /// Completed bootstraps (one per `Uninitialized -> Ready` transition)
    pub bootstraps: u64,
    /// Namespace opens retried after `PathNotFound`
    pub namespace_retries: u64,
    /// Successful mutex acquisitions, abandoned ones included
    pub acquisitions: u64,
    /// Acquisitions that inherited an abandoned mutex
    pub abandoned: u64,
}

/// Which manager an acquisition came from; used in log lines.
#[derive(Debug, Clone, Copy)]
enum MutexKind {
    Pool,
    Installation,
}

impl fmt::Display for MutexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool => write!(f, "pool mutex"),
            Self::Installation => write!(f, "installation mutex"),
        }
    }
}

/// Process-wide namespace service.
///
/// Construct one per process (this is the lifecycle `Init`), share it via
/// `Arc`, and call [`shutdown`](Self::shutdown) for the lifecycle
/// `Cleanup`.
pub struct NamespaceRuntime<P: NamespacePlatform> {
    platform: Arc<P>,
    config: NamespaceConfig,
    state: Mutex<BootstrapState>,
    counters: Counters,
}

impl SystemRuntime {
    /// Runtime over the host filesystem rooted at the configured root directory.
    pub fn system(config: NamespaceConfig) -> Self {
        let platform = UnixPlatform::new(config.resolved_root_dir());
        Self::new(platform, config)
    }
}

impl<P: NamespacePlatform> NamespaceRuntime<P> {
    /// Create a runtime in the `Uninitialized` state. No platform calls are made.
    pub fn new(platform: P, config: NamespaceConfig) -> Self {
        debug!(namespace = %config.namespace, "Creating NamespaceRuntime");
        Self {
            platform: Arc::new(platform),
            config,
            state: Mutex::new(BootstrapState::Uninitialized),
            counters: Counters::default(),
        }
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// The platform backing this runtime.
    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    /// Returns `true` once bootstrap has succeeded and until shutdown.
    pub fn is_ready(&self) -> bool {
        matches!(*self.lock_state(), BootstrapState::Ready { .. })
    }

    /// Snapshot the runtime counters.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            bootstraps: self.counters.bootstraps.load(Ordering::Relaxed),
            namespace_retries: self.counters.namespace_retries.load(Ordering::Relaxed),
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BootstrapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bootstrap the secured namespace if it is not ready yet.
    ///
    /// Safe to call from any number of threads: the first caller does the
    /// work, the rest wait on the guard and observe its outcome. Success
    /// is cached until [`shutdown`](Self::shutdown); failure is not.
    pub fn ensure_ready(&self) -> Result<()> {
        self.ready_namer().map(drop)
    }

    /// Bootstrap if needed and hand out a copy of the namer, so callers
    /// derive names without holding the bootstrap guard.
    fn ready_namer(&self) -> Result<MutexNamer> {
        let mut state = self.lock_state();
        if let BootstrapState::Ready { namer } = &*state {
            return Ok(namer.clone());
        }

        // Dropped on every failure path below, leaving the state retryable.
        let hasher = HashProvider::open();
        let boundary = BoundaryDescriptor::new(self.config.boundary.clone(), self.config.principal);
        self.create_or_open_namespace(&boundary)?;

        let namer = MutexNamer::new(
            hasher,
            self.config.namespace.clone(),
            self.config.pool_mutex_prefix.clone(),
        );
        *state = BootstrapState::Ready {
            namer: namer.clone(),
        };
        self.counters.bootstraps.fetch_add(1, Ordering::Relaxed);
        info!(namespace = %self.config.namespace, "Private namespace ready");
        Ok(namer)
    }

    fn create_or_open_namespace(&self, boundary: &BoundaryDescriptor) -> Result<()> {
        let name = self.config.namespace.as_str();
        let mut retries = 0u32;

        loop {
            match self.platform.create_namespace(boundary, name) {
                Ok(()) => {
                    debug!(namespace = name, "Created private namespace");
                    return Ok(());
                }
                Err(SystemError::AlreadyExists) => {}
                Err(e) => {
                    error!("{}", format_system_error("Failed to create private namespace", &e));
                    return Err(NamespaceError::Bootstrap(e));
                }
            }

            match self.platform.open_namespace(boundary, name) {
                Ok(()) => {
                    debug!(namespace = name, "Opened existing private namespace");
                    return Ok(());
                }
                Err(SystemError::PathNotFound) => {
                    if let Some(max) = self.config.max_namespace_retries {
                        if retries >= max {
                            error!(
                                namespace = name,
                                attempts = retries + 1,
                                "Failed to open private namespace: it keeps disappearing"
                            );
                            return Err(NamespaceError::RetriesExhausted {
                                attempts: retries + 1,
                            });
                        }
                    }
                    retries += 1;
                    self.counters.namespace_retries.fetch_add(1, Ordering::Relaxed);
                    debug!(namespace = name, retries, "Private namespace vanished while opening, retrying");
                }
                Err(e) => {
                    error!("{}", format_system_error("Failed to open private namespace", &e));
                    return Err(NamespaceError::Bootstrap(e));
                }
            }
        }
    }

    /// Tear down the bootstrap state, closing the hash provider.
    ///
    /// Returns `true` if the runtime was ready. A later acquisition
    /// bootstraps again. Mutexes currently held stay valid.
    pub fn shutdown(&self) -> bool {
        let mut state = self.lock_state();
        let was_ready = matches!(*state, BootstrapState::Ready { .. });
        *state = BootstrapState::Uninitialized;
        if was_ready {
            debug!(namespace = %self.config.namespace, "Namespace runtime shut down");
        }
        was_ready
    }

    /// Derive the mutex name guarding `pool`, bootstrapping if needed.
    pub fn pool_mutex_name(&self, pool: &str) -> Result<ObjectName> {
        Ok(self.ready_namer()?.derive(pool))
    }

    /// Block until the mutex guarding `pool` is owned.
    ///
    /// An abandoned mutex counts as acquired; check
    /// [`NamedMutexGuard::was_abandoned`] if the protected operation
    /// needs to repair state left behind by the previous owner.
    pub fn take_pool_mutex(&self, pool: &str) -> Result<NamedMutexGuard<P>> {
        let name = self.pool_mutex_name(pool)?;
        self.acquire(name, MutexKind::Pool)
    }

    /// UTF-16 variant of [`take_pool_mutex`](Self::take_pool_mutex).
    pub fn take_pool_mutex_utf16(&self, pool: &[u16]) -> Result<NamedMutexGuard<P>> {
        let name = self.ready_namer()?.derive_utf16(pool)?;
        self.acquire(name, MutexKind::Pool)
    }

    /// Name of the installation mutex.
    pub fn installation_mutex_name(&self) -> ObjectName {
        ObjectName::new(
            self.config.namespace.clone(),
            self.config.installation_mutex.clone(),
        )
    }

    /// Block until the installation mutex is owned.
    pub fn take_installation_mutex(&self) -> Result<NamedMutexGuard<P>> {
        self.ensure_ready()?;
        self.acquire(self.installation_mutex_name(), MutexKind::Installation)
    }

    fn acquire(&self, name: ObjectName, kind: MutexKind) -> Result<NamedMutexGuard<P>> {
        let mutex = match self.platform.create_or_open_mutex(&name) {
            Ok(mutex) => mutex,
            Err(e) => {
                error!(mutex = %name, "{}", format_system_error(&format!("Failed to create {kind}"), &e));
                return Err(NamespaceError::MutexCreate {
                    name: name.to_string(),
                    source: e,
                });
            }
        };

        let outcome = match self.platform.wait_acquire(&mutex) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.platform.close(mutex);
                error!(mutex = %name, "{}", format_system_error(&format!("Failed to acquire {kind}"), &e));
                return Err(NamespaceError::MutexWait {
                    name: name.to_string(),
                    source: e,
                });
            }
        };

        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        if outcome == WaitOutcome::Abandoned {
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            warn!(mutex = %name, "Acquired abandoned {kind}");
        } else {
            debug!(mutex = %name, "Acquired {kind}");
        }

        Ok(NamedMutexGuard {
            platform: Arc::clone(&self.platform),
            mutex: Some(mutex),
            name,
            outcome,
        })
    }
}

impl<P: NamespacePlatform> fmt::Debug for NamespaceRuntime<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceRuntime")
            .field("namespace", &self.config.namespace)
            .field("ready", &self.is_ready())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Ownership of a named mutex.
///
/// Released exactly once: by [`release`](Self::release), or on drop.
#[must_use = "dropping the guard releases the mutex immediately"]
pub struct NamedMutexGuard<P: NamespacePlatform> {
    platform: Arc<P>,
    mutex: Option<P::Mutex>,
    name: ObjectName,
    outcome: WaitOutcome,
}

impl<P: NamespacePlatform> NamedMutexGuard<P> {
    /// Fully qualified name of the held mutex.
    pub fn name(&self) -> &ObjectName {
        &self.name
    }

    /// How ownership was obtained.
    pub fn outcome(&self) -> WaitOutcome {
        self.outcome
    }

    /// `true` if the previous owner terminated while holding the mutex.
    pub fn was_abandoned(&self) -> bool {
        self.outcome == WaitOutcome::Abandoned
    }

    /// Release ownership and destroy the local handle.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(mutex) = self.mutex.take() {
            self.platform.release(mutex);
            debug!(mutex = %self.name, "Released mutex");
        }
    }
}

impl<P: NamespacePlatform> Drop for NamedMutexGuard<P> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<P: NamespacePlatform> fmt::Debug for NamedMutexGuard<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedMutexGuard")
            .field("name", &self.name.to_string())
            .field("outcome", &self.outcome)
            .finish()
    }
}
