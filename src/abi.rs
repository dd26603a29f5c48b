//! Purpose: C ABI contract between a host process and a loadable subsystem module.
//! Exports: `CafResult`, `ObjectVtbl`, entry-point signatures, raw object helpers,
//! and the `export_subsystem!` macro a module crate uses to publish its entry points.
//! Role: The only surface that crosses the load boundary; everything here is `#[repr(C)]`
//! or a plain function pointer.
//! Invariants: Exported functions never unwind; panics are caught and mapped to a result code.
//! Invariants: The host touches module objects only through the vtable the module built.
//! Invariants: Result codes are stable; unknown codes read back as `UNKNOWN_FAILURE`.

use std::ffi::{CStr, c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};

use crate::component::iid::InterfaceId;
use crate::component::registry::{ComponentRegistry, ObjectEntry};
use crate::core::error::{Error, ErrorKind};
use crate::core::loader::LibraryHandle;

pub const CREATE_INSTANCE_SYMBOL: &str = "CafCreateInstance";
pub const CAN_UNLOAD_NOW_SYMBOL: &str = "CafDllCanUnloadNow";
pub const DLL_MAIN_SYMBOL: &str = "CafDllMain";

/// `CafCreateInstance(identifier, iid, out)`
pub type CreateInstanceFn =
    unsafe extern "C" fn(*const c_char, *const InterfaceId, *mut *mut c_void) -> CafResult;
/// `CafDllCanUnloadNow()`
pub type CanUnloadNowFn = unsafe extern "C" fn() -> bool;
/// `CafDllMain(handle, reason, reserved)`
pub type DllMainFn = unsafe extern "C" fn(*mut c_void, u32, *mut c_void) -> bool;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum LoadReason {
    Detach = 0,
    Attach = 1,
}

impl LoadReason {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(LoadReason::Detach),
            1 => Some(LoadReason::Attach),
            _ => None,
        }
    }
}

/// Status code returned across the module boundary.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CafResult(pub i32);

impl CafResult {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_POINTER: Self = Self(1);
    pub const OUT_OF_MEMORY: Self = Self(2);
    pub const INTERFACE_NOT_SUPPORTED: Self = Self(3);
    pub const NOT_FOUND: Self = Self(4);
    pub const UNKNOWN_FAILURE: Self = Self(5);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn into_result(self) -> Result<(), Error> {
        if self.is_success() {
            return Ok(());
        }
        Err(Error::from(self))
    }

    pub fn from_error_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound => Self::NOT_FOUND,
            ErrorKind::InterfaceNotSupported => Self::INTERFACE_NOT_SUPPORTED,
            ErrorKind::OutOfMemory => Self::OUT_OF_MEMORY,
            ErrorKind::Usage => Self::INVALID_POINTER,
            _ => Self::UNKNOWN_FAILURE,
        }
    }
}

impl From<CafResult> for Error {
    fn from(code: CafResult) -> Self {
        match code {
            CafResult::SUCCESS => {
                Error::new(ErrorKind::UnknownFailure).with_message("success code treated as error")
            }
            CafResult::INVALID_POINTER => {
                Error::new(ErrorKind::Usage).with_message("module rejected a null pointer")
            }
            CafResult::OUT_OF_MEMORY => {
                Error::new(ErrorKind::OutOfMemory).with_message("module ran out of memory")
            }
            CafResult::INTERFACE_NOT_SUPPORTED => Error::new(ErrorKind::InterfaceNotSupported)
                .with_message("interface not supported by object"),
            CafResult::NOT_FOUND => {
                Error::new(ErrorKind::NotFound).with_message("identifier not found in module")
            }
            CafResult(code) => Error::new(ErrorKind::UnknownFailure)
                .with_message(format!("module failed with code {code}")),
        }
    }
}

/// The QueryInterface/AddRef/Release triad every interface vtable starts with.
#[repr(C)]
pub struct ObjectVtbl {
    pub query_interface:
        unsafe extern "C" fn(*mut c_void, *const InterfaceId, *mut *mut c_void) -> CafResult,
    pub add_ref: unsafe extern "C" fn(*mut c_void) -> u32,
    pub release: unsafe extern "C" fn(*mut c_void) -> u32,
}

/// # Safety
/// `object` must be a live interface pointer whose first word is a vtable pointer.
unsafe fn vtbl_of<'a>(object: NonNull<c_void>) -> &'a ObjectVtbl {
    unsafe { &**(object.as_ptr() as *const *const ObjectVtbl) }
}

/// Increments the object's reference count and returns the new count.
///
/// # Safety
/// `object` must be a live interface pointer obtained from a module.
pub unsafe fn add_ref(object: NonNull<c_void>) -> u32 {
    unsafe { (vtbl_of(object).add_ref)(object.as_ptr()) }
}

/// Decrements the object's reference count and returns the new count; at zero the
/// object is gone and `object` must not be used again.
///
/// # Safety
/// `object` must be a live interface pointer holding a reference owned by the caller.
pub unsafe fn release(object: NonNull<c_void>) -> u32 {
    unsafe { (vtbl_of(object).release)(object.as_ptr()) }
}

/// Asks `object` for `iid`; on success the returned pointer carries its own reference.
///
/// # Safety
/// `object` must be a live interface pointer obtained from a module.
pub unsafe fn query_interface(
    object: NonNull<c_void>,
    iid: &InterfaceId,
) -> Result<NonNull<c_void>, CafResult> {
    let mut out = ptr::null_mut();
    let code = unsafe { (vtbl_of(object).query_interface)(object.as_ptr(), iid, &mut out) };
    if !code.is_success() {
        return Err(code);
    }
    NonNull::new(out).ok_or(CafResult::UNKNOWN_FAILURE)
}

/// Body of a module's `CafCreateInstance` export.
///
/// # Safety
/// `identifier` must be null or a NUL-terminated string, `iid` null or valid, and `out`
/// null or writable.
pub unsafe fn module_create_instance(
    module: &'static ComponentRegistry,
    identifier: *const c_char,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> CafResult {
    if out.is_null() {
        return CafResult::INVALID_POINTER;
    }
    unsafe {
        *out = ptr::null_mut();
    }
    if identifier.is_null() || iid.is_null() {
        return CafResult::INVALID_POINTER;
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let Ok(identifier) = unsafe { CStr::from_ptr(identifier) }.to_str() else {
            return CafResult::NOT_FOUND;
        };
        let iid = unsafe { &*iid };
        match module.create_instance(identifier, iid) {
            Ok(object) => {
                unsafe {
                    *out = object.as_ptr();
                }
                CafResult::SUCCESS
            }
            Err(code) => code,
        }
    }));
    outcome.unwrap_or_else(|_| {
        tracing::warn!("panic caught in CafCreateInstance");
        CafResult::UNKNOWN_FAILURE
    })
}

/// Body of a module's `CafDllCanUnloadNow` export.
pub fn module_can_unload_now(module: &'static ComponentRegistry) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| module.can_unload())).unwrap_or(false)
}

/// Body of a module's `CafDllMain` export: attach initializes the registry, detach tears it down.
pub fn module_main(
    module: &'static ComponentRegistry,
    entries: &'static [ObjectEntry],
    handle: *mut c_void,
    reason: u32,
) -> bool {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match LoadReason::from_code(reason) {
        Some(LoadReason::Attach) => {
            module.init(entries, LibraryHandle::from_raw(handle));
            true
        }
        Some(LoadReason::Detach) => {
            module.term();
            true
        }
        None => false,
    }));
    outcome.unwrap_or(false)
}

/// Publishes `CafCreateInstance`, `CafDllCanUnloadNow`, and `CafDllMain` for a module.
///
/// ```ignore
/// static MODULE: ComponentRegistry = ComponentRegistry::new();
/// static ENTRIES: [ObjectEntry; 1] = [ObjectEntry::new::<Echo>("Caf.Echo")];
/// cafbase::export_subsystem!(MODULE, ENTRIES);
/// ```
#[macro_export]
macro_rules! export_subsystem {
    ($module:path, $entries:path) => {
        #[allow(non_snake_case)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn CafCreateInstance(
            identifier: *const ::std::ffi::c_char,
            iid: *const $crate::component::InterfaceId,
            out: *mut *mut ::std::ffi::c_void,
        ) -> $crate::abi::CafResult {
            unsafe { $crate::abi::module_create_instance(&$module, identifier, iid, out) }
        }

        #[allow(non_snake_case)]
        #[unsafe(no_mangle)]
        pub extern "C" fn CafDllCanUnloadNow() -> bool {
            $crate::abi::module_can_unload_now(&$module)
        }

        #[allow(non_snake_case)]
        #[unsafe(no_mangle)]
        pub extern "C" fn CafDllMain(
            handle: *mut ::std::ffi::c_void,
            reason: u32,
            _reserved: *mut ::std::ffi::c_void,
        ) -> bool {
            $crate::abi::module_main(&$module, &$entries, handle, reason)
        }
    };
}
