// In-process fixtures: sample interfaces and components, plus a loader backend whose
// "libraries" are tables of function pointers living in the test binary.
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::abi::{
    CAN_UNLOAD_NOW_SYMBOL, CREATE_INSTANCE_SYMBOL, CanUnloadNowFn, CreateInstanceFn,
    DLL_MAIN_SYMBOL, DllMainFn, LoadReason, ObjectVtbl,
};
use crate::component::iid::{IID_OBJECT, InterfaceId};
use crate::component::object::{Component, InterfaceEntry, component_from_interface};
use crate::component::registry::ObjectEntry;
use crate::component::smart::Interface;
use crate::core::error::{Error, ErrorKind};
use crate::core::loader::{LibraryHandle, LoaderBackend};

pub const IID_GREETER: InterfaceId = InterfaceId::from_u128(0x6b1f0c2e_4a57_4f0b_9d3a_0e51c7a2b901);
pub const IID_COUNTER: InterfaceId = InterfaceId::from_u128(0x6b1f0c2e_4a57_4f0b_9d3a_0e51c7a2b902);
pub const IID_UNKNOWN: InterfaceId = InterfaceId::from_u128(0x6b1f0c2e_4a57_4f0b_9d3a_0e51c7a2b9ff);

#[repr(C)]
pub struct IGreeterVtbl {
    base: ObjectVtbl,
    greeting: unsafe extern "C" fn(*mut c_void) -> u32,
}

#[repr(C)]
pub struct IGreeter {
    vtbl: *const IGreeterVtbl,
}

unsafe impl Interface for IGreeter {
    const IID: InterfaceId = IID_GREETER;
}

impl IGreeter {
    pub fn greeting(&self) -> u32 {
        unsafe { ((*self.vtbl).greeting)(self.this_ptr()) }
    }
}

#[repr(C)]
pub struct ICounterVtbl {
    base: ObjectVtbl,
    increment: unsafe extern "C" fn(*mut c_void) -> u32,
}

#[repr(C)]
pub struct ICounter {
    vtbl: *const ICounterVtbl,
}

unsafe impl Interface for ICounter {
    const IID: InterfaceId = IID_COUNTER;
}

impl ICounter {
    pub fn increment(&self) -> u32 {
        unsafe { ((*self.vtbl).increment)(self.this_ptr()) }
    }
}

/// An interface no test component implements.
#[repr(C)]
pub struct IUnknownThing {
    vtbl: *const ObjectVtbl,
}

unsafe impl Interface for IUnknownThing {
    const IID: InterfaceId = IID_UNKNOWN;
}

#[derive(Default)]
pub struct Greeter {
    count: AtomicU32,
}

impl Greeter {
    pub fn code(&self) -> u32 {
        42
    }
}

unsafe extern "C" fn greeter_greeting(this: *mut c_void) -> u32 {
    unsafe { component_from_interface::<Greeter>(this) }.code()
}

unsafe extern "C" fn greeter_increment(this: *mut c_void) -> u32 {
    let greeter = unsafe { component_from_interface::<Greeter>(this) };
    greeter.count.fetch_add(1, Ordering::Relaxed) + 1
}

static GREETER_VTBL: IGreeterVtbl = IGreeterVtbl {
    base: ObjectVtbl::BASE,
    greeting: greeter_greeting,
};

static COUNTER_VTBL: ICounterVtbl = ICounterVtbl {
    base: ObjectVtbl::BASE,
    increment: greeter_increment,
};

static GREETER_MAP: [InterfaceEntry; 2] = unsafe {
    [
        InterfaceEntry::new(IID_GREETER, &GREETER_VTBL),
        InterfaceEntry::new(IID_COUNTER, &COUNTER_VTBL),
    ]
};

impl Component for Greeter {
    fn interface_map() -> &'static [InterfaceEntry] {
        &GREETER_MAP
    }
}

pub static GREETER_ENTRIES: [ObjectEntry; 2] = [
    ObjectEntry::new::<Greeter>("Test.Greeter"),
    ObjectEntry::singleton::<Greeter>("Test.SharedGreeter"),
];

static TRACKED_DROPS: AtomicUsize = AtomicUsize::new(0);
static BASE_ONLY_MAP: [InterfaceEntry; 1] = [InterfaceEntry::object(IID_OBJECT)];

/// Counts its drops so tests can see exactly when a cell is destroyed.
#[derive(Default)]
pub struct Tracked;

impl Drop for Tracked {
    fn drop(&mut self) {
        TRACKED_DROPS.fetch_add(1, Ordering::SeqCst);
    }
}

impl Component for Tracked {
    fn interface_map() -> &'static [InterfaceEntry] {
        &BASE_ONLY_MAP
    }
}

pub fn tracked_drops() -> usize {
    TRACKED_DROPS.load(Ordering::SeqCst)
}

pub struct Panicky;

impl Default for Panicky {
    fn default() -> Self {
        panic!("component construction failed");
    }
}

impl Component for Panicky {
    fn interface_map() -> &'static [InterfaceEntry] {
        &BASE_ONLY_MAP
    }
}

#[derive(Default)]
struct NotificationCounts {
    attaches: AtomicUsize,
    detaches: AtomicUsize,
}

/// Attach/detach counters of a `TestLibrary::notified` library.
#[derive(Clone, Default)]
pub struct Notifications(Arc<NotificationCounts>);

impl Notifications {
    pub fn attaches(&self) -> usize {
        self.0.attaches.load(Ordering::SeqCst)
    }

    pub fn detaches(&self) -> usize {
        self.0.detaches.load(Ordering::SeqCst)
    }
}

fn notification_targets() -> MutexGuard<'static, HashMap<LibraryHandle, Notifications>> {
    static TARGETS: OnceLock<Mutex<HashMap<LibraryHandle, Notifications>>> = OnceLock::new();
    TARGETS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

unsafe extern "C" fn notified_main(handle: *mut c_void, reason: u32, _reserved: *mut c_void) -> bool {
    let targets = notification_targets();
    let Some(notifications) = targets.get(&LibraryHandle::from_raw(handle)) else {
        return false;
    };
    match LoadReason::from_code(reason) {
        Some(LoadReason::Attach) => notifications.0.attaches.fetch_add(1, Ordering::SeqCst),
        Some(LoadReason::Detach) => notifications.0.detaches.fetch_add(1, Ordering::SeqCst),
        None => return false,
    };
    true
}

unsafe extern "C" fn rejecting_main(_handle: *mut c_void, reason: u32, _reserved: *mut c_void) -> bool {
    reason != LoadReason::Attach as u32
}

static GLOBAL_MARKER: u8 = 0;

#[derive(Clone, Default)]
pub struct TestLibrary {
    symbols: HashMap<&'static str, usize>,
    notifications: Option<Notifications>,
}

impl TestLibrary {
    /// No exports at all.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn rejecting_attach() -> Self {
        Self::plain().with_symbol(DLL_MAIN_SYMBOL, rejecting_main as DllMainFn as usize)
    }

    pub fn notified() -> Self {
        let mut library =
            Self::plain().with_symbol(DLL_MAIN_SYMBOL, notified_main as DllMainFn as usize);
        library.notifications = Some(Notifications::default());
        library
    }

    /// A library exporting the full module ABI; see `fake_module!`.
    pub fn module(create: CreateInstanceFn, can_unload: CanUnloadNowFn, main: DllMainFn) -> Self {
        Self::plain()
            .with_symbol(CREATE_INSTANCE_SYMBOL, create as usize)
            .with_symbol(CAN_UNLOAD_NOW_SYMBOL, can_unload as usize)
            .with_symbol(DLL_MAIN_SYMBOL, main as usize)
    }

    pub fn notifications(&self) -> Notifications {
        self.notifications.clone().unwrap_or_default()
    }

    fn with_symbol(mut self, name: &'static str, address: usize) -> Self {
        self.symbols.insert(name, address);
        self
    }
}

struct OpenLibrary {
    path: PathBuf,
    os_refs: usize,
}

#[derive(Default)]
struct BackendState {
    libraries: HashMap<PathBuf, TestLibrary>,
    /// Alternate spelling -> the path it resolves to, like a symlink.
    aliases: HashMap<PathBuf, PathBuf>,
    open: HashMap<LibraryHandle, OpenLibrary>,
    opens: usize,
    closes: usize,
}

/// Loader backend over `TestLibrary` tables; clones share state.
#[derive(Clone, Default)]
pub struct TestBackend {
    state: Arc<Mutex<BackendState>>,
}

static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(0x1000);

impl TestBackend {
    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_library(&self, path: impl Into<PathBuf>, library: TestLibrary) {
        self.state().libraries.insert(path.into(), library);
    }

    /// Makes `alias` open the same library, and the same handle, as `target`.
    pub fn add_alias(&self, alias: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        self.state().aliases.insert(alias.into(), target.into());
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }
}

impl LoaderBackend for TestBackend {
    fn open(&self, path: &Path) -> Result<LibraryHandle, Error> {
        let mut state = self.state();
        let resolved = state
            .aliases
            .get(path)
            .cloned()
            .unwrap_or_else(|| path.to_path_buf());
        let Some(library) = state.libraries.get(&resolved) else {
            return Err(Error::new(ErrorKind::LoadFailure)
                .with_message(format!("no such library: {}", path.display()))
                .with_path(path));
        };
        let notifications = library.notifications.clone();
        state.opens += 1;
        let already_open = state
            .open
            .iter_mut()
            .find(|(_, open)| open.path == resolved);
        if let Some((handle, open)) = already_open {
            open.os_refs += 1;
            return Ok(*handle);
        }

        let handle = LibraryHandle::from_raw(
            NEXT_HANDLE.fetch_add(0x10, Ordering::Relaxed) as *mut c_void,
        );
        if let Some(notifications) = notifications {
            notification_targets().insert(handle, notifications);
        }
        state.open.insert(
            handle,
            OpenLibrary {
                path: resolved,
                os_refs: 1,
            },
        );
        Ok(handle)
    }

    fn symbol(&self, handle: Option<LibraryHandle>, name: &str) -> Result<*const c_void, Error> {
        let state = self.state();
        let address = match handle {
            None => (name == "global_marker").then_some(&GLOBAL_MARKER as *const u8 as usize),
            Some(handle) => state
                .open
                .get(&handle)
                .and_then(|open| state.libraries.get(&open.path))
                .and_then(|library| library.symbols.get(name).copied()),
        };
        address
            .map(|address| address as *const c_void)
            .ok_or_else(|| {
                Error::new(ErrorKind::LoadFailure).with_message(format!("undefined symbol: {name}"))
            })
    }

    fn close(&self, handle: LibraryHandle) -> Result<(), Error> {
        let mut state = self.state();
        let Some(open) = state.open.get_mut(&handle) else {
            return Err(Error::new(ErrorKind::LoadFailure).with_message("close of unknown handle"));
        };
        open.os_refs -= 1;
        if open.os_refs == 0 {
            state.open.remove(&handle);
        }
        state.closes += 1;
        Ok(())
    }

    fn path_of_handle(&self, handle: LibraryHandle) -> Result<PathBuf, Error> {
        self.state()
            .open
            .get(&handle)
            .map(|open| open.path.clone())
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("unknown handle"))
    }

    fn path_of_address(&self, _address: *const c_void) -> Result<PathBuf, Error> {
        Err(Error::new(ErrorKind::NotFound).with_message("addresses are not tracked"))
    }
}

/// Declares `mod $name` holding a module-side `ComponentRegistry` and the three ABI
/// exports for `$entries`; `$name::library()` wraps them as a `TestLibrary`.
macro_rules! fake_module {
    ($name:ident, $entries:path) => {
        mod $name {
            use std::ffi::{c_char, c_void};

            use $crate::abi::CafResult;
            use $crate::component::{ComponentRegistry, InterfaceId};

            pub static MODULE: ComponentRegistry = ComponentRegistry::new();

            unsafe extern "C" fn create(
                identifier: *const c_char,
                iid: *const InterfaceId,
                out: *mut *mut c_void,
            ) -> CafResult {
                unsafe { $crate::abi::module_create_instance(&MODULE, identifier, iid, out) }
            }

            extern "C" fn can_unload() -> bool {
                $crate::abi::module_can_unload_now(&MODULE)
            }

            extern "C" fn dll_main(handle: *mut c_void, reason: u32, _reserved: *mut c_void) -> bool {
                $crate::abi::module_main(&MODULE, &$entries, handle, reason)
            }

            pub fn library() -> $crate::test_support::TestLibrary {
                $crate::test_support::TestLibrary::module(create, can_unload, dll_main)
            }
        }
    };
}

pub(crate) use fake_module;
