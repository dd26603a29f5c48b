/*
Purpose: Sample subsystem module exporting the CAF module ABI.
Key Exports: CafCreateInstance, CafDllCanUnloadNow, CafDllMain, IEcho, IID_ECHO.
Role: End-to-end fixture for `cafhost load` and `cafhost create`.
Invariants: Calls reach the host only through `IEcho`'s vtable.
Notes: "Caf.Echo" builds a fresh object per request; "Caf.EchoShared" is one shared instance.
*/

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};

use cafbase::abi::ObjectVtbl;
use cafbase::component::{
    Component, ComponentRegistry, Interface, InterfaceEntry, InterfaceId, ObjectEntry,
    component_from_interface,
};

pub const IID_ECHO: InterfaceId = InterfaceId::from_u128(0x3c0e9a4d_81f2_4b6a_a7d5_5e2b19c84f10);

#[repr(C)]
pub struct IEchoVtbl {
    base: ObjectVtbl,
    echo: unsafe extern "C" fn(*mut c_void, u64) -> u64,
    calls: unsafe extern "C" fn(*mut c_void) -> u64,
}

/// Host-side view of an echo object.
#[repr(C)]
pub struct IEcho {
    vtbl: *const IEchoVtbl,
}

unsafe impl Interface for IEcho {
    const IID: InterfaceId = IID_ECHO;
}

impl IEcho {
    pub fn echo(&self, value: u64) -> u64 {
        unsafe { ((*self.vtbl).echo)(self.this_ptr(), value) }
    }

    /// Number of `echo` calls this object has served.
    pub fn calls(&self) -> u64 {
        unsafe { ((*self.vtbl).calls)(self.this_ptr()) }
    }
}

#[derive(Default)]
pub struct Echo {
    calls: AtomicU64,
}

unsafe extern "C" fn echo_echo(this: *mut c_void, value: u64) -> u64 {
    let echo = unsafe { component_from_interface::<Echo>(this) };
    echo.calls.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(value, "echo");
    value
}

unsafe extern "C" fn echo_calls(this: *mut c_void) -> u64 {
    let echo = unsafe { component_from_interface::<Echo>(this) };
    echo.calls.load(Ordering::Relaxed)
}

static ECHO_VTBL: IEchoVtbl = IEchoVtbl {
    base: ObjectVtbl::BASE,
    echo: echo_echo,
    calls: echo_calls,
};

static ECHO_MAP: [InterfaceEntry; 1] = [unsafe { InterfaceEntry::new(IID_ECHO, &ECHO_VTBL) }];

impl Component for Echo {
    fn interface_map() -> &'static [InterfaceEntry] {
        &ECHO_MAP
    }
}

static MODULE: ComponentRegistry = ComponentRegistry::new();

static ENTRIES: [ObjectEntry; 2] = [
    ObjectEntry::new::<Echo>("Caf.Echo"),
    ObjectEntry::singleton::<Echo>("Caf.EchoShared"),
];

cafbase::export_subsystem!(MODULE, ENTRIES);
