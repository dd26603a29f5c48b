//! Purpose: The shared context subsystem sessions load through.
//! Exports: `Host`.
//! Role: Owns the loader, the subsystem registry, and the identifier -> handle cache.
//! Invariants: Lock order is module cache first, then the loader mutex.
//! Invariants: A cached handle holds one loader reference per live session that adopted it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::config::ConfigSource;
use crate::core::loader::{LibraryHandle, LibraryLoader};
use crate::core::registry::SubsystemRegistry;

pub struct Host {
    loader: LibraryLoader,
    registry: SubsystemRegistry,
    modules: Mutex<HashMap<String, LibraryHandle>>,
}

impl Host {
    /// A host over the platform loader.
    pub fn new(config: impl ConfigSource + 'static) -> Self {
        Self::with_loader(LibraryLoader::default(), SubsystemRegistry::new(config))
    }

    pub fn with_loader(loader: LibraryLoader, registry: SubsystemRegistry) -> Self {
        Self {
            loader,
            registry,
            modules: Mutex::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &LibraryLoader {
        &self.loader
    }

    pub fn registry(&self) -> &SubsystemRegistry {
        &self.registry
    }

    pub(crate) fn lock_modules(&self) -> MutexGuard<'_, HashMap<String, LibraryHandle>> {
        self.modules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cached_module(&self, identifier: &str) -> Option<LibraryHandle> {
        self.lock_modules().get(identifier).copied()
    }
}
