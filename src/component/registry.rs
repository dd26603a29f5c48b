//! Purpose: Module-side object-entry table, singleton cache, and usage counter.
//! Exports: `ComponentRegistry`, `ObjectEntry`, `CreatorFn`.
//! Role: Backs a module's `CafCreateInstance` and `CafDllCanUnloadNow` exports.
//! Invariants: Lookup is a linear scan with exact, case-sensitive identifier equality.
//! Invariants: Returned pointers always carry their own reference.
//! Invariants: `can_unload` is a point-in-time snapshot of the usage counter.
//! Invariants: Singleton creators run outside the state lock; when two callers race, the
//! first published instance wins and the other is released.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::abi::{self, CafResult};
use crate::component::iid::{IID_OBJECT, InterfaceId};
use crate::component::object::{Component, ComponentObject, InterfaceEntry};
use crate::core::loader::LibraryHandle;

pub type CreatorFn =
    fn(&'static ComponentRegistry, &InterfaceId) -> Result<NonNull<c_void>, CafResult>;

/// One row of a module's object table.
#[derive(Clone, Copy)]
pub struct ObjectEntry {
    identifier: &'static str,
    creator: CreatorFn,
    interface_map: fn() -> &'static [InterfaceEntry],
    singleton: bool,
}

impl ObjectEntry {
    pub const fn new<T: Component>(identifier: &'static str) -> Self {
        Self {
            identifier,
            creator: ComponentObject::<T>::instantiate,
            interface_map: T::interface_map,
            singleton: false,
        }
    }

    /// A row whose instance is created once and shared until the module terminates.
    pub const fn singleton<T: Component>(identifier: &'static str) -> Self {
        Self {
            identifier,
            creator: ComponentObject::<T>::instantiate,
            interface_map: T::interface_map,
            singleton: true,
        }
    }

    pub fn identifier(&self) -> &'static str {
        self.identifier
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }
}

struct CachedObject(NonNull<c_void>);

// Components are `Send + Sync`; the cache only stores and releases the pointer.
unsafe impl Send for CachedObject {}

struct ModuleState {
    entries: &'static [ObjectEntry],
    handle: Option<LibraryHandle>,
    singletons: Vec<(usize, CachedObject)>,
}

impl ModuleState {
    fn cached(&self, index: usize) -> Option<NonNull<c_void>> {
        self.singletons
            .iter()
            .find(|(slot, _)| *slot == index)
            .map(|(_, object)| object.0)
    }
}

pub struct ComponentRegistry {
    state: Mutex<ModuleState>,
    locks: AtomicUsize,
}

impl ComponentRegistry {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(ModuleState {
                entries: &[],
                handle: None,
                singletons: Vec::new(),
            }),
            locks: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, ModuleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the table and module handle, checking every interface map up front.
    pub fn init(&self, entries: &'static [ObjectEntry], handle: LibraryHandle) {
        for entry in entries {
            let map = (entry.interface_map)();
            if map.is_empty() {
                tracing::warn!(
                    identifier = entry.identifier,
                    "object entry has an empty interface map"
                );
            }
        }
        let mut state = self.state();
        state.entries = entries;
        state.handle = Some(handle);
        tracing::debug!(entries = entries.len(), "component registry initialized");
    }

    /// Releases cached singletons and forgets the table.
    pub fn term(&self) {
        let cached = {
            let mut state = self.state();
            state.entries = &[];
            state.handle = None;
            std::mem::take(&mut state.singletons)
        };
        for (_, object) in cached {
            unsafe { abi::release(object.0) };
        }
    }

    pub fn module_handle(&self) -> Option<LibraryHandle> {
        self.state().handle
    }

    pub fn lock(&self) {
        self.locks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unlock(&self) {
        self.locks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn lock_count(&self) -> usize {
        self.locks.load(Ordering::Relaxed)
    }

    pub fn can_unload(&self) -> bool {
        self.lock_count() == 0
    }

    /// Creates (or, for singletons, reuses) the object registered as `identifier`.
    pub fn create_instance(
        &'static self,
        identifier: &str,
        iid: &InterfaceId,
    ) -> Result<NonNull<c_void>, CafResult> {
        let state = self.state();
        let (index, entry) = state
            .entries
            .iter()
            .copied()
            .enumerate()
            .find(|(_, entry)| entry.identifier == identifier)
            .ok_or(CafResult::NOT_FOUND)?;

        if !entry.singleton {
            drop(state);
            return (entry.creator)(self, iid);
        }

        if let Some(base) = state.cached(index) {
            return unsafe { abi::query_interface(base, iid) };
        }
        // The creator runs unlocked so a constructor may create objects from this module.
        drop(state);
        let built = (entry.creator)(self, &IID_OBJECT)?;

        let mut state = self.state();
        let (base, loser) = match state.cached(index) {
            Some(winner) => (winner, Some(built)),
            None => {
                state.singletons.push((index, CachedObject(built)));
                tracing::debug!(identifier, "cached singleton instance");
                (built, None)
            }
        };
        let result = unsafe { abi::query_interface(base, iid) };
        drop(state);
        if let Some(loser) = loser {
            tracing::debug!(identifier, "singleton raced; dropping the extra instance");
            unsafe { abi::release(loser) };
        }
        result
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
