//! Purpose: Reference-counted component cells and QueryInterface dispatch.
//! Exports: `Component`, `InterfaceEntry`, `ComponentObject`, `component_from_interface`.
//! Role: Module-side object model; the host sees only interface pointers and `ObjectVtbl`.
//! Invariants: A cell's count goes 0 -> 1 -> ... -> 0 exactly once; the thread that
//! observes the final decrement destroys it.
//! Invariants: QueryInterface either hands out a pointer carrying a fresh reference or
//! leaves the output null with the count unchanged.
//! Invariants: Every live cell holds one lock on its owning `ComponentRegistry`.
//! Notes: An interface pointer is the address of a per-entry slot inside the cell. Each
//! slot starts with its vtable pointer and keeps a back-pointer to the cell header, so
//! dispatch never needs byte-offset arithmetic.

use std::alloc::{self, Layout};
use std::any::type_name;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicU32, Ordering};

use crate::abi::{CafResult, ObjectVtbl};
use crate::component::iid::{IID_OBJECT, InterfaceId};
use crate::component::registry::ComponentRegistry;

/// A type that can be instantiated inside a module and exposed through interface pointers.
pub trait Component: Default + Send + Sync + 'static {
    /// Interface map for the type. The first entry is the base object identity.
    fn interface_map() -> &'static [InterfaceEntry];
}

#[derive(Clone, Copy)]
pub struct InterfaceEntry {
    iid: InterfaceId,
    vtbl: *const ObjectVtbl,
}

// Entries only point at immutable `'static` vtables.
unsafe impl Send for InterfaceEntry {}
unsafe impl Sync for InterfaceEntry {}

impl InterfaceEntry {
    /// An entry whose vtable is only the QueryInterface/AddRef/Release triad.
    pub const fn object(iid: InterfaceId) -> Self {
        Self {
            iid,
            vtbl: &ObjectVtbl::BASE,
        }
    }

    /// # Safety
    /// `V` must be `#[repr(C)]` and start with an `ObjectVtbl` equal to `ObjectVtbl::BASE`.
    /// Every other function in `V` must treat its `this` argument as an interface pointer
    /// of the component type whose map lists this entry.
    pub const unsafe fn new<V>(iid: InterfaceId, vtbl: &'static V) -> Self {
        Self {
            iid,
            vtbl: vtbl as *const V as *const ObjectVtbl,
        }
    }

    pub fn iid(&self) -> InterfaceId {
        self.iid
    }
}

impl ObjectVtbl {
    pub const BASE: ObjectVtbl = ObjectVtbl {
        query_interface: object_query_interface,
        add_ref: object_add_ref,
        release: object_release,
    };
}

#[repr(C)]
struct InterfaceSlot {
    vtbl: *const ObjectVtbl,
    owner: *const ObjectHeader,
}

#[repr(C)]
struct ObjectHeader {
    refs: AtomicU32,
    module: &'static ComponentRegistry,
    destroy: unsafe fn(*const ObjectHeader),
    map: &'static [InterfaceEntry],
    slots: Box<[InterfaceSlot]>,
}

impl ObjectHeader {
    fn find_slot(&self, iid: &InterfaceId) -> Option<NonNull<c_void>> {
        let index = if *iid == IID_OBJECT {
            (!self.slots.is_empty()).then_some(0)
        } else {
            self.map.iter().position(|entry| entry.iid == *iid)
        }?;
        let slot = &self.slots[index] as *const InterfaceSlot as *mut c_void;
        NonNull::new(slot)
    }

    fn query(&self, iid: &InterfaceId) -> Result<NonNull<c_void>, CafResult> {
        let slot = self
            .find_slot(iid)
            .ok_or(CafResult::INTERFACE_NOT_SUPPORTED)?;
        self.refs.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }
}

/// # Safety
/// `header` must point at a live cell and the caller must own one of its references.
unsafe fn release_header(header: *const ObjectHeader) -> u32 {
    let (previous, destroy) = {
        let cell = unsafe { &*header };
        (cell.refs.fetch_sub(1, Ordering::Release), cell.destroy)
    };
    debug_assert!(previous > 0, "component released more times than referenced");
    if previous == 1 {
        atomic::fence(Ordering::Acquire);
        unsafe { destroy(header) };
        return 0;
    }
    previous - 1
}

/// # Safety
/// `this` must be an interface pointer handed out by a `ComponentObject`.
unsafe fn header_of(this: *mut c_void) -> *const ObjectHeader {
    unsafe { (*(this as *const InterfaceSlot)).owner }
}

unsafe extern "C" fn object_query_interface(
    this: *mut c_void,
    iid: *const InterfaceId,
    out: *mut *mut c_void,
) -> CafResult {
    if out.is_null() {
        return CafResult::INVALID_POINTER;
    }
    unsafe {
        *out = ptr::null_mut();
    }
    if this.is_null() || iid.is_null() {
        return CafResult::INVALID_POINTER;
    }
    let header = unsafe { &*header_of(this) };
    match header.query(unsafe { &*iid }) {
        Ok(slot) => {
            unsafe {
                *out = slot.as_ptr();
            }
            CafResult::SUCCESS
        }
        Err(code) => code,
    }
}

unsafe extern "C" fn object_add_ref(this: *mut c_void) -> u32 {
    let header = unsafe { &*header_of(this) };
    header.refs.fetch_add(1, Ordering::Relaxed) + 1
}

unsafe extern "C" fn object_release(this: *mut c_void) -> u32 {
    unsafe { release_header(header_of(this)) }
}

/// Heap cell holding one component value behind its header.
#[repr(C)]
pub struct ComponentObject<T: Component> {
    header: ObjectHeader,
    value: T,
}

impl<T: Component> ComponentObject<T> {
    fn allocate(module: &'static ComponentRegistry) -> Result<NonNull<ObjectHeader>, CafResult> {
        let value = T::default();
        let layout = Layout::new::<Self>();
        let cell = unsafe { alloc::alloc(layout) } as *mut Self;
        let Some(cell) = NonNull::new(cell) else {
            tracing::warn!(component = type_name::<T>(), "component allocation failed");
            return Err(CafResult::OUT_OF_MEMORY);
        };
        let header = cell.as_ptr() as *const ObjectHeader;
        let map = T::interface_map();
        let slots = map
            .iter()
            .map(|entry| InterfaceSlot {
                vtbl: entry.vtbl,
                owner: header,
            })
            .collect();
        unsafe {
            cell.as_ptr().write(Self {
                header: ObjectHeader {
                    refs: AtomicU32::new(0),
                    module,
                    destroy: Self::destroy,
                    map,
                    slots,
                },
                value,
            });
        }
        module.lock();
        Ok(cell.cast())
    }

    unsafe fn destroy(header: *const ObjectHeader) {
        let cell = header as *mut Self;
        let module = unsafe { (*cell).header.module };
        unsafe {
            ptr::drop_in_place(cell);
            alloc::dealloc(cell as *mut u8, Layout::new::<Self>());
        }
        module.unlock();
    }

    /// Creates a new cell and returns it queried to `iid`.
    ///
    /// The construction reference is taken before the query and dropped after it, so a
    /// failed query destroys the cell again.
    pub fn instantiate(
        module: &'static ComponentRegistry,
        iid: &InterfaceId,
    ) -> Result<NonNull<c_void>, CafResult> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let header = Self::allocate(module)?;
            let header = header.as_ptr() as *const ObjectHeader;
            let cell = unsafe { &*header };
            cell.refs.fetch_add(1, Ordering::Relaxed);
            let result = cell.query(iid);
            unsafe { release_header(header) };
            result
        }));
        outcome.unwrap_or_else(|_| {
            tracing::warn!(component = type_name::<T>(), "panic while constructing component");
            Err(CafResult::UNKNOWN_FAILURE)
        })
    }

    /// Out-parameter form of `instantiate`; `out` is null unless the result is success.
    ///
    /// # Safety
    /// `out` must be null or valid for writes.
    pub unsafe fn creator(
        module: &'static ComponentRegistry,
        iid: &InterfaceId,
        out: *mut *mut c_void,
    ) -> CafResult {
        if out.is_null() {
            return CafResult::INVALID_POINTER;
        }
        unsafe {
            *out = ptr::null_mut();
        }
        match Self::instantiate(module, iid) {
            Ok(object) => {
                unsafe {
                    *out = object.as_ptr();
                }
                CafResult::SUCCESS
            }
            Err(code) => code,
        }
    }
}

/// Borrows the component value behind an interface pointer inside a vtable thunk.
///
/// # Safety
/// `this` must be a live interface pointer produced by `ComponentObject::<T>`, and the
/// returned borrow must not outlive the caller's reference.
pub unsafe fn component_from_interface<'a, T: Component>(this: *mut c_void) -> &'a T {
    let cell = unsafe { header_of(this) } as *const ComponentObject<T>;
    unsafe { &(*cell).value }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi;
    use crate::test_support::{
        Greeter, IID_COUNTER, IID_GREETER, IID_UNKNOWN, Panicky, Tracked, tracked_drops,
    };

    static OBJECT_MODULE: ComponentRegistry = ComponentRegistry::new();
    static LOCK_MODULE: ComponentRegistry = ComponentRegistry::new();
    static TRACKED_MODULE: ComponentRegistry = ComponentRegistry::new();
    static PANIC_MODULE: ComponentRegistry = ComponentRegistry::new();
    static FAILED_MODULE: ComponentRegistry = ComponentRegistry::new();

    #[test]
    fn query_interface_adds_exactly_one_reference() {
        let object =
            ComponentObject::<Greeter>::instantiate(&OBJECT_MODULE, &IID_GREETER).expect("create");
        let counter = unsafe { abi::query_interface(object, &IID_COUNTER) }.expect("counter");
        assert_eq!(unsafe { abi::add_ref(object) }, 3);
        assert_eq!(unsafe { abi::release(object) }, 2);
        assert_eq!(unsafe { abi::release(counter) }, 1);
        assert_eq!(unsafe { abi::release(object) }, 0);
    }

    #[test]
    fn unsupported_interface_leaves_count_and_output_untouched() {
        let object =
            ComponentObject::<Greeter>::instantiate(&OBJECT_MODULE, &IID_GREETER).expect("create");
        let err = unsafe { abi::query_interface(object, &IID_UNKNOWN) }.unwrap_err();
        assert_eq!(err, CafResult::INTERFACE_NOT_SUPPORTED);
        assert_eq!(unsafe { abi::add_ref(object) }, 2);
        assert_eq!(unsafe { abi::release(object) }, 1);
        assert_eq!(unsafe { abi::release(object) }, 0);
    }

    #[test]
    fn base_identity_is_the_first_slot_for_every_interface() {
        let greeter =
            ComponentObject::<Greeter>::instantiate(&OBJECT_MODULE, &IID_GREETER).expect("create");
        let counter = unsafe { abi::query_interface(greeter, &IID_COUNTER) }.expect("counter");
        let base_a = unsafe { abi::query_interface(greeter, &IID_OBJECT) }.expect("base");
        let base_b = unsafe { abi::query_interface(counter, &IID_OBJECT) }.expect("base");
        assert_eq!(base_a, base_b);
        assert_ne!(base_a, counter);
        for object in [base_a, base_b, counter, greeter] {
            unsafe { abi::release(object) };
        }
    }

    #[test]
    fn releases_needed_match_references_taken() {
        let before = tracked_drops();
        let object =
            ComponentObject::<Tracked>::instantiate(&TRACKED_MODULE, &IID_OBJECT).expect("create");
        for _ in 0..4 {
            unsafe { abi::add_ref(object) };
        }
        for remaining in (1..=4).rev() {
            assert_eq!(unsafe { abi::release(object) }, remaining);
            assert_eq!(tracked_drops(), before);
        }
        assert_eq!(unsafe { abi::release(object) }, 0);
        assert_eq!(tracked_drops(), before + 1);
    }

    #[test]
    fn live_objects_hold_module_locks() {
        assert!(LOCK_MODULE.can_unload());
        let first =
            ComponentObject::<Greeter>::instantiate(&LOCK_MODULE, &IID_GREETER).expect("create");
        let second =
            ComponentObject::<Greeter>::instantiate(&LOCK_MODULE, &IID_GREETER).expect("create");
        assert_eq!(LOCK_MODULE.lock_count(), 2);
        unsafe { abi::release(first) };
        assert!(!LOCK_MODULE.can_unload());
        unsafe { abi::release(second) };
        assert!(LOCK_MODULE.can_unload());
    }

    #[test]
    fn failed_query_during_creation_destroys_the_cell() {
        let err =
            ComponentObject::<Greeter>::instantiate(&FAILED_MODULE, &IID_UNKNOWN).unwrap_err();
        assert_eq!(err, CafResult::INTERFACE_NOT_SUPPORTED);
        let mut out = 0x1 as *mut c_void;
        let code =
            unsafe { ComponentObject::<Greeter>::creator(&FAILED_MODULE, &IID_UNKNOWN, &mut out) };
        assert_eq!(code, CafResult::INTERFACE_NOT_SUPPORTED);
        assert!(out.is_null());
        assert!(FAILED_MODULE.can_unload());
    }

    #[test]
    fn creator_rejects_null_output() {
        let code = unsafe {
            ComponentObject::<Greeter>::creator(&OBJECT_MODULE, &IID_GREETER, ptr::null_mut())
        };
        assert_eq!(code, CafResult::INVALID_POINTER);
    }

    #[test]
    fn panics_in_construction_become_unknown_failure() {
        let mut out = ptr::null_mut();
        let code = unsafe { ComponentObject::<Panicky>::creator(&PANIC_MODULE, &IID_OBJECT, &mut out) };
        assert_eq!(code, CafResult::UNKNOWN_FAILURE);
        assert!(out.is_null());
        assert!(PANIC_MODULE.can_unload());
    }

    #[test]
    fn thunks_reach_the_component_value() {
        let object =
            ComponentObject::<Greeter>::instantiate(&OBJECT_MODULE, &IID_GREETER).expect("create");
        let greeter = unsafe { component_from_interface::<Greeter>(object.as_ptr()) };
        assert_eq!(greeter.code(), Greeter::default().code());
        unsafe { abi::release(object) };
    }
}
