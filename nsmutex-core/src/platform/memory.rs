//! In-Process Named Objects with Fault Injection
//!
//! `MemoryPlatform` keeps namespaces and mutexes in a shared table so the
//! runtime's retry and failure paths can be driven deterministically:
//!
//! - [`precreate_namespace`](MemoryPlatform::precreate_namespace) stands in
//!   for another process that won the creation race
//! - [`vanish_on_open`](MemoryPlatform::vanish_on_open) reproduces the
//!   window where a namespace is observed but torn down before it opens
//! - [`abandon`](MemoryPlatform::abandon) drops ownership the way a dying
//!   owner does, without a release
//! - `fail_next_*` inject one-shot system errors
//!
//! Clones share the same table, so a test keeps one clone for inspection
//! while the runtime owns another.

use super::{BoundaryDescriptor, NamespacePlatform, PlatformResult, WaitOutcome};
use crate::error::SystemError;
use crate::naming::ObjectName;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Per-operation call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryCalls {
    /// `create_namespace` calls
    pub create_namespace: usize,
    /// `open_namespace` calls
    pub open_namespace: usize,
    /// `create_or_open_mutex` calls
    pub create_mutex: usize,
    /// `wait_acquire` calls
    pub wait: usize,
    /// `release` calls
    pub release: usize,
    /// `close` calls on never-acquired handles
    pub close: usize,
}

#[derive(Debug, Default)]
struct MutexSlot {
    owner: Option<u64>,
    abandoned: bool,
}

#[derive(Debug, Default)]
struct State {
    namespaces: HashMap<String, BoundaryDescriptor>,
    mutexes: HashMap<String, MutexSlot>,
    vanishing_opens: u32,
    create_namespace_error: Option<SystemError>,
    open_namespace_error: Option<SystemError>,
    create_mutex_error: Option<SystemError>,
    wait_error: Option<SystemError>,
    calls: MemoryCalls,
    next_token: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    released: Condvar,
}

/// Local handle to an in-memory named mutex.
#[derive(Debug)]
pub struct MemoryMutex {
    name: String,
    token: u64,
}

impl MemoryMutex {
    /// Fully qualified name of the mutex.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// In-process implementation of [`NamespacePlatform`].
#[derive(Debug, Clone, Default)]
pub struct MemoryPlatform {
    shared: Arc<Shared>,
}

impl MemoryPlatform {
    /// Create an empty object table.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a namespace as if another process had done it.
    pub fn precreate_namespace(&self, boundary: &BoundaryDescriptor, name: &str) {
        self.state()
            .namespaces
            .insert(name.to_owned(), boundary.clone());
    }

    /// Remove a namespace, as its last holder going away would.
    pub fn remove_namespace(&self, name: &str) -> bool {
        self.state().namespaces.remove(name).is_some()
    }

    /// Make the next `count` opens fail with `PathNotFound`.
    pub fn vanish_on_open(&self, count: u32) {
        self.state().vanishing_opens = count;
    }

    /// Fail the next `create_namespace` call with `err`.
    pub fn fail_next_create_namespace(&self, err: SystemError) {
        self.state().create_namespace_error = Some(err);
    }

    /// Fail the next `open_namespace` call with `err`.
    pub fn fail_next_open_namespace(&self, err: SystemError) {
        self.state().open_namespace_error = Some(err);
    }

    /// Fail the next `create_or_open_mutex` call with `err`.
    pub fn fail_next_create_mutex(&self, err: SystemError) {
        self.state().create_mutex_error = Some(err);
    }

    /// Fail the next `wait_acquire` call with `err`.
    pub fn fail_next_wait(&self, err: SystemError) {
        self.state().wait_error = Some(err);
    }

    /// Drop ownership without releasing, as a terminated owner would.
    ///
    /// The next waiter observes [`WaitOutcome::Abandoned`].
    pub fn abandon(&self, mutex: MemoryMutex) {
        let mut state = self.state();
        if let Some(slot) = state.mutexes.get_mut(&mutex.name) {
            if slot.owner == Some(mutex.token) {
                slot.owner = None;
                slot.abandoned = true;
            }
        }
        drop(state);
        self.shared.released.notify_all();
    }

    /// Whether any handle currently owns `name`.
    pub fn is_owned(&self, name: &ObjectName) -> bool {
        self.state()
            .mutexes
            .get(&name.to_string())
            .map_or(false, |slot| slot.owner.is_some())
    }

    /// Whether a namespace called `name` exists.
    pub fn has_namespace(&self, name: &str) -> bool {
        self.state().namespaces.contains_key(name)
    }

    /// Snapshot of the call counters.
    pub fn calls(&self) -> MemoryCalls {
        self.state().calls.clone()
    }
}

impl NamespacePlatform for MemoryPlatform {
    type Mutex = MemoryMutex;

    fn create_namespace(&self, boundary: &BoundaryDescriptor, name: &str) -> PlatformResult<()> {
        let mut state = self.state();
        state.calls.create_namespace += 1;
        if let Some(err) = state.create_namespace_error.take() {
            return Err(err);
        }
        if state.namespaces.contains_key(name) {
            return Err(SystemError::AlreadyExists);
        }
        state.namespaces.insert(name.to_owned(), boundary.clone());
        trace!(namespace = name, "Created in-memory namespace");
        Ok(())
    }

    fn open_namespace(&self, boundary: &BoundaryDescriptor, name: &str) -> PlatformResult<()> {
        let mut state = self.state();
        state.calls.open_namespace += 1;
        if let Some(err) = state.open_namespace_error.take() {
            return Err(err);
        }
        if state.vanishing_opens > 0 {
            state.vanishing_opens -= 1;
            return Err(SystemError::PathNotFound);
        }
        match state.namespaces.get(name) {
            Some(existing) if existing == boundary => Ok(()),
            Some(_) => Err(SystemError::AccessDenied),
            None => Err(SystemError::PathNotFound),
        }
    }

    fn create_or_open_mutex(&self, name: &ObjectName) -> PlatformResult<Self::Mutex> {
        let mut state = self.state();
        state.calls.create_mutex += 1;
        if let Some(err) = state.create_mutex_error.take() {
            return Err(err);
        }
        if !state.namespaces.contains_key(name.namespace()) {
            return Err(SystemError::PathNotFound);
        }
        let key = name.to_string();
        state.mutexes.entry(key.clone()).or_default();
        state.next_token += 1;
        Ok(MemoryMutex {
            name: key,
            token: state.next_token,
        })
    }

    fn wait_acquire(&self, mutex: &Self::Mutex) -> PlatformResult<WaitOutcome> {
        let mut state = self.state();
        state.calls.wait += 1;
        if let Some(err) = state.wait_error.take() {
            return Err(err);
        }
        loop {
            let slot = state.mutexes.entry(mutex.name.clone()).or_default();
            if slot.owner.is_none() {
                slot.owner = Some(mutex.token);
                let outcome = if std::mem::take(&mut slot.abandoned) {
                    WaitOutcome::Abandoned
                } else {
                    WaitOutcome::Acquired
                };
                return Ok(outcome);
            }
            state = self
                .shared
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(&self, mutex: Self::Mutex) {
        let mut state = self.state();
        state.calls.release += 1;
        if let Some(slot) = state.mutexes.get_mut(&mutex.name) {
            if slot.owner == Some(mutex.token) {
                slot.owner = None;
            }
        }
        drop(state);
        self.shared.released.notify_all();
    }

    fn close(&self, mutex: Self::Mutex) {
        self.state().calls.close += 1;
        drop(mutex);
    }
}
