//! Purpose: Load, unload, and resolve symbols in shared libraries with per-path ref counts.
//! Exports: `LibraryLoader`, `LibraryHandle`, `LoaderBackend`, `OsLoaderBackend`,
//! `normalize_library_name`.
//! Role: The only component that talks to the platform dynamic loader.
//! Invariants: Every backend call runs under the loader mutex; `dlerror` state is
//! process-global, so even lookups are serialized.
//! Invariants: Counts are kept per OS handle, so two spellings of one library share a
//! single count; every spelling that reached the handle is kept as an alias.
//! Invariants: A cached library stays open while its count is above zero; the attach
//! notification runs once per physical open and the detach notification once per close,
//! both whenever the module exports `CafDllMain`.
//! Invariants: A library whose attach notification fails is closed before the error surfaces.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use crate::abi::{DLL_MAIN_SYMBOL, DllMainFn, LoadReason};
use crate::core::error::{Error, ErrorKind};

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod win32;

#[cfg(unix)]
pub use unix::OsLoaderBackend;
#[cfg(windows)]
pub use win32::OsLoaderBackend;

#[cfg(windows)]
const LIBRARY_PREFIX: &str = "";
#[cfg(not(windows))]
const LIBRARY_PREFIX: &str = "lib";

#[cfg(windows)]
const LIBRARY_SUFFIX: &str = ".dll";
#[cfg(target_os = "macos")]
const LIBRARY_SUFFIX: &str = ".dylib";
#[cfg(not(any(windows, target_os = "macos")))]
const LIBRARY_SUFFIX: &str = ".so";

/// Opaque OS handle of a loaded library.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct LibraryHandle(usize);

impl LibraryHandle {
    pub fn from_raw(raw: *mut c_void) -> Self {
        Self(raw as usize)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

/// Platform dynamic-loader primitives. Implementations report OS error text in the
/// returned `Error` and are only ever called with the loader mutex held.
pub trait LoaderBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<LibraryHandle, Error>;
    /// `None` searches the main program and the global symbol table.
    fn symbol(&self, handle: Option<LibraryHandle>, name: &str) -> Result<*const c_void, Error>;
    fn close(&self, handle: LibraryHandle) -> Result<(), Error>;
    /// Asks the OS which file backs `handle`. glibc answers through `dlinfo` and
    /// Windows through `GetModuleFileNameW`; other unix targets have no query and
    /// return `NotFound`, so only handles this loader cached can be named there.
    fn path_of_handle(&self, handle: LibraryHandle) -> Result<PathBuf, Error>;
    fn path_of_address(&self, address: *const c_void) -> Result<PathBuf, Error>;
}

/// Applies the platform prefix and suffix to a library name when they are missing.
///
/// The prefix is only added to the file name component, and a suffix followed by a
/// version (`libm.so.6`) counts as present.
pub fn normalize_library_name(name: &str) -> PathBuf {
    let path = Path::new(name);
    let Some(file_name) = path.file_name().and_then(|file| file.to_str()) else {
        return path.to_path_buf();
    };
    let mut normalized = String::with_capacity(file_name.len() + 8);
    if !file_name.starts_with(LIBRARY_PREFIX) {
        normalized.push_str(LIBRARY_PREFIX);
    }
    normalized.push_str(file_name);
    if !has_library_suffix(file_name) {
        normalized.push_str(LIBRARY_SUFFIX);
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(normalized),
        _ => PathBuf::from(normalized),
    }
}

fn has_library_suffix(file_name: &str) -> bool {
    let lowered;
    let file_name = if cfg!(windows) {
        lowered = file_name.to_ascii_lowercase();
        lowered.as_str()
    } else {
        file_name
    };
    file_name.ends_with(LIBRARY_SUFFIX) || file_name.contains(&format!("{LIBRARY_SUFFIX}."))
}

#[derive(Debug)]
struct ModuleRefCount {
    /// The spelling that first opened the library.
    path: PathBuf,
    ref_count: usize,
}

#[derive(Default)]
struct ModuleTable {
    by_handle: HashMap<LibraryHandle, ModuleRefCount>,
    by_path: HashMap<PathBuf, LibraryHandle>,
}

pub struct LibraryLoader {
    backend: Box<dyn LoaderBackend>,
    modules: Mutex<ModuleTable>,
}

impl LibraryLoader {
    pub fn new(backend: impl LoaderBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            modules: Mutex::new(ModuleTable::default()),
        }
    }

    fn modules(&self) -> MutexGuard<'_, ModuleTable> {
        self.modules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Loads `name`, or bumps the count of an already-loaded library at the same path.
    pub fn load(&self, name: &str, must_invoke_init: bool) -> Result<LibraryHandle, Error> {
        let path = normalize_library_name(name);
        let mut modules = self.modules();
        if let Some(&handle) = modules.by_path.get(&path) {
            let module = Self::lookup_mut(&mut modules, handle)?;
            module.ref_count += 1;
            tracing::debug!(
                path = %path.display(),
                ref_count = module.ref_count,
                "library already loaded"
            );
            return Ok(handle);
        }

        let handle = self.backend.open(&path)?;
        if let Some(module) = modules.by_handle.get_mut(&handle) {
            // Another spelling of a library we already hold: keep one OS reference.
            module.ref_count += 1;
            let ref_count = module.ref_count;
            let first = module.path.clone();
            if let Err(err) = self.backend.close(handle) {
                tracing::warn!(path = %path.display(), error = %err, "close of duplicate open");
            }
            modules.by_path.insert(path.clone(), handle);
            tracing::debug!(
                path = %path.display(),
                first = %first.display(),
                ref_count,
                "library already loaded under another name"
            );
            return Ok(handle);
        }

        if let Err(err) = self.notify(handle, LoadReason::Attach, must_invoke_init) {
            if let Err(close_err) = self.backend.close(handle) {
                tracing::warn!(path = %path.display(), error = %close_err, "close after failed attach");
            }
            return Err(err.with_path(path));
        }

        modules.by_path.insert(path.clone(), handle);
        modules.by_handle.insert(
            handle,
            ModuleRefCount {
                path: path.clone(),
                ref_count: 1,
            },
        );
        tracing::debug!(path = %path.display(), "library loaded");
        Ok(handle)
    }

    /// `load` without the error: failures are logged and come back as `None`.
    pub fn try_load(&self, name: &str, must_invoke_init: bool) -> Option<LibraryHandle> {
        match self.load(name, must_invoke_init) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(library = name, error = %err, "library load failed");
                None
            }
        }
    }

    /// Takes one more reference on a library that is already loaded.
    pub fn retain(&self, handle: LibraryHandle) -> Result<usize, Error> {
        let mut modules = self.modules();
        let module = Self::lookup_mut(&mut modules, handle)?;
        module.ref_count += 1;
        Ok(module.ref_count)
    }

    /// Drops one reference; returns `true` when the library was actually closed.
    ///
    /// The last reference runs the module's detach notification whenever `CafDllMain`
    /// is exported, matching `load`; `must_invoke_init` only makes a missing entry
    /// point worth a warning.
    pub fn unload(&self, handle: LibraryHandle, must_invoke_init: bool) -> Result<bool, Error> {
        let mut modules = self.modules();
        let module = Self::lookup_mut(&mut modules, handle)?;
        module.ref_count -= 1;
        if module.ref_count > 0 {
            tracing::debug!(ref_count = module.ref_count, "library still referenced");
            return Ok(false);
        }

        let path = modules
            .by_handle
            .remove(&handle)
            .map(|module| module.path)
            .unwrap_or_default();
        modules.by_path.retain(|_, aliased| *aliased != handle);
        // Same gating as attach: runs when exported, and a required entry that is
        // missing only gets a warning since the close goes ahead anyway.
        if let Err(err) = self.notify(handle, LoadReason::Detach, must_invoke_init) {
            tracing::warn!(path = %path.display(), error = %err, "detach notification failed");
        }
        self.backend.close(handle).map_err(|err| err.with_path(&path))?;
        tracing::debug!(path = %path.display(), "library unloaded");
        Ok(true)
    }

    /// Resolves `symbol` in `handle`, or in the global table when `handle` is `None`.
    pub fn function_address(
        &self,
        handle: Option<LibraryHandle>,
        symbol: &str,
    ) -> Result<*const c_void, Error> {
        let _modules = self.modules();
        self.backend.symbol(handle, symbol)
    }

    pub fn library_name_from_handle(&self, handle: LibraryHandle) -> Result<PathBuf, Error> {
        let modules = self.modules();
        if let Some(module) = modules.by_handle.get(&handle) {
            return Ok(module.path.clone());
        }
        self.backend.path_of_handle(handle)
    }

    pub fn library_name_from_address(&self, address: *const c_void) -> Result<PathBuf, Error> {
        let _modules = self.modules();
        self.backend.path_of_address(address)
    }

    pub fn ref_count(&self, handle: LibraryHandle) -> Option<usize> {
        self.modules()
            .by_handle
            .get(&handle)
            .map(|module| module.ref_count)
    }

    /// Number of distinct libraries held open, however many names reach them.
    pub fn loaded_count(&self) -> usize {
        self.modules().by_handle.len()
    }

    fn lookup_mut(
        modules: &mut ModuleTable,
        handle: LibraryHandle,
    ) -> Result<&mut ModuleRefCount, Error> {
        modules
            .by_handle
            .get_mut(&handle)
            .ok_or_else(|| {
                Error::new(ErrorKind::LoadFailure).with_message("library handle is not loaded")
            })
    }

    /// Runs the module's `CafDllMain`. Called with the loader mutex held.
    fn notify(
        &self,
        handle: LibraryHandle,
        reason: LoadReason,
        required: bool,
    ) -> Result<(), Error> {
        let address = match self.backend.symbol(Some(handle), DLL_MAIN_SYMBOL) {
            Ok(address) => address,
            Err(err) if required => {
                return Err(Error::new(ErrorKind::LoadFailure)
                    .with_message(format!("module does not export {DLL_MAIN_SYMBOL}"))
                    .with_source(err));
            }
            Err(_) => return Ok(()),
        };
        let entry = unsafe { std::mem::transmute::<*const c_void, DllMainFn>(address) };
        if unsafe { entry(handle.as_raw(), reason as u32, ptr::null_mut()) } {
            return Ok(());
        }
        Err(Error::new(ErrorKind::LoadFailure)
            .with_message(format!("{DLL_MAIN_SYMBOL} rejected {reason:?}")))
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new(OsLoaderBackend)
    }
}
