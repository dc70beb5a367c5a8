//! Platform Capabilities - Named Objects Behind a Trait
//!
//! The bootstrap retry loop and name derivation are portable; the objects
//! they manipulate are not. This module defines the small set of
//! operations the runtime needs from the operating system:
//!
//! - create / open a secured namespace scoped by a [`BoundaryDescriptor`]
//! - create-or-open a named mutex inside it
//! - block until that mutex is owned
//! - release ownership and destroy the local handle
//!
//! # Implementations:
//! - [`UnixPlatform`](unix::UnixPlatform): owner-restricted directories
//!   and `flock(2)` lock files, shared between processes
//! - [`MemoryPlatform`](memory::MemoryPlatform): in-process objects with
//!   race and failure injection for exercising the retry paths

pub mod memory;
pub mod unix;

pub use memory::MemoryPlatform;
pub use unix::UnixPlatform;

use crate::config::Principal;
use crate::error::SystemError;
use crate::naming::ObjectName;

/// Describes the trust boundary a secured namespace is scoped to.
///
/// Built by the runtime during bootstrap from configuration, never from
/// per-call caller input, and dropped once the namespace is created or
/// opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryDescriptor {
    name: String,
    principal: Principal,
}

impl BoundaryDescriptor {
    /// Create a boundary tagged with `principal`.
    pub fn new(name: impl Into<String>, principal: Principal) -> Self {
        Self {
            name: name.into(),
            principal,
        }
    }

    /// Boundary name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The well-known principal allowed inside the boundary.
    pub fn principal(&self) -> Principal {
        self.principal
    }
}

/// How ownership of a mutex was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The previous owner released it.
    Acquired,
    /// The previous owner went away without releasing it.
    Abandoned,
}

/// Result alias for platform calls.
pub type PlatformResult<T> = std::result::Result<T, SystemError>;

/// Operating system capabilities required by the namespace runtime.
///
/// Implementations must be shareable across threads: one platform value
/// backs every guard handed out by a runtime.
pub trait NamespacePlatform: Send + Sync + 'static {
    /// A local handle to a named mutex.
    type Mutex: Send + 'static;

    /// Create a new secured namespace.
    ///
    /// Must fail with [`SystemError::AlreadyExists`] if it already exists.
    fn create_namespace(&self, boundary: &BoundaryDescriptor, name: &str) -> PlatformResult<()>;

    /// Open an existing secured namespace.
    ///
    /// Must fail with [`SystemError::PathNotFound`] if the namespace
    /// disappeared since it was observed.
    fn open_namespace(&self, boundary: &BoundaryDescriptor, name: &str) -> PlatformResult<()>;

    /// Create or open a named mutex without taking ownership.
    fn create_or_open_mutex(&self, name: &ObjectName) -> PlatformResult<Self::Mutex>;

    /// Block until the calling thread owns `mutex`. No timeout.
    fn wait_acquire(&self, mutex: &Self::Mutex) -> PlatformResult<WaitOutcome>;

    /// Release ownership of `mutex`, then destroy the local handle.
    fn release(&self, mutex: Self::Mutex);

    /// Destroy a handle that was never acquired.
    fn close(&self, mutex: Self::Mutex) {
        drop(mutex);
    }
}
