//! Purpose: Client-side typed reference to a module object.
//! Exports: `Interface`, `CafObject`, `SmartRef`.
//! Role: The host's safe handle over raw interface pointers; drives AddRef/Release.
//! Invariants: A non-null `SmartRef` owns exactly one reference on its object.
//! Invariants: Casting to an unsupported interface yields a null handle, never an error.
//! Invariants: `Deref` exposes interface methods only; the reference triad stays hidden.

use std::any::type_name;
use std::ffi::c_void;
use std::fmt;
use std::ops::Deref;
use std::ptr::{self, NonNull};

use crate::abi::{self, ObjectVtbl};
use crate::component::iid::{IID_OBJECT, InterfaceId};
use crate::core::error::Error;
use crate::core::host::Host;
use crate::core::subsystem::SubsystemHandle;

/// An interface type as seen by callers: a `#[repr(C)]` struct whose first field is the
/// pointer to a vtable that starts with `ObjectVtbl`.
///
/// # Safety
/// Implementors must uphold that layout, and `IID` must name exactly that vtable.
pub unsafe trait Interface: Sized {
    const IID: InterfaceId;

    /// The `this` argument for calls through this interface's vtable.
    fn this_ptr(&self) -> *mut c_void {
        self as *const Self as *mut c_void
    }
}

/// The base object interface every component answers.
#[repr(C)]
pub struct CafObject {
    vtbl: *const ObjectVtbl,
}

unsafe impl Interface for CafObject {
    const IID: InterfaceId = IID_OBJECT;
}

pub struct SmartRef<I: Interface> {
    ptr: Option<NonNull<I>>,
}

// Module objects are `Send + Sync` and use atomic reference counts.
unsafe impl<I: Interface> Send for SmartRef<I> {}
unsafe impl<I: Interface> Sync for SmartRef<I> {}

impl<I: Interface> SmartRef<I> {
    pub const fn null() -> Self {
        Self { ptr: None }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// Adopts `ptr`, taking a new reference on it.
    ///
    /// # Safety
    /// `ptr` must be null or a live interface pointer of type `I`.
    pub unsafe fn from_raw(ptr: *mut I) -> Self {
        let ptr = NonNull::new(ptr);
        if let Some(object) = ptr {
            unsafe { abi::add_ref(object.cast()) };
        }
        Self { ptr }
    }

    /// Adopts `ptr` together with the reference it already carries.
    ///
    /// # Safety
    /// `ptr` must be null or a live interface pointer of type `I` whose reference is
    /// transferred to the returned handle.
    pub unsafe fn from_raw_owned(ptr: *mut I) -> Self {
        Self {
            ptr: NonNull::new(ptr),
        }
    }

    /// Queries any interface pointer of an object for `I`; null on failure.
    ///
    /// # Safety
    /// `object` must be null or a live interface pointer.
    pub unsafe fn from_object(object: *mut c_void) -> Self {
        let Some(object) = NonNull::new(object) else {
            return Self::null();
        };
        match unsafe { abi::query_interface(object, &I::IID) } {
            Ok(found) => Self {
                ptr: Some(found.cast()),
            },
            Err(_) => Self::null(),
        }
    }

    /// Re-queries another handle's object for `I`; null if `I` is unsupported.
    pub fn from_other<K: Interface>(other: &SmartRef<K>) -> Self {
        match other.ptr {
            Some(object) => unsafe { Self::from_object(object.as_ptr().cast()) },
            None => Self::null(),
        }
    }

    pub fn try_cast<J: Interface>(&self) -> Option<SmartRef<J>> {
        let cast = SmartRef::<J>::from_other(self);
        (!cast.is_null()).then_some(cast)
    }

    /// Releases the current object and adopts `ptr`.
    ///
    /// # Safety
    /// Same contract as `from_raw`.
    pub unsafe fn attach(&mut self, ptr: *mut I) {
        *self = unsafe { Self::from_raw(ptr) };
    }

    /// Releases the current object and adopts `object` queried for `I`.
    ///
    /// # Safety
    /// Same contract as `from_object`.
    pub unsafe fn attach_object(&mut self, object: *mut c_void) {
        *self = unsafe { Self::from_object(object) };
    }

    pub fn reset(&mut self) {
        if let Some(object) = self.ptr.take() {
            unsafe { abi::release(object.cast()) };
        }
    }

    /// Replaces the current object with a new instance of `identifier` from the subsystem
    /// of the same name. With `fail_on_error` unset, failures leave the handle null.
    pub fn create_instance(
        &mut self,
        host: &Host,
        identifier: &str,
        fail_on_error: bool,
    ) -> Result<(), Error> {
        self.reset();
        let mut subsystem = SubsystemHandle::new(host);
        let created = subsystem
            .load(identifier)
            .and_then(|()| subsystem.create::<I>(identifier));
        match created {
            Ok(instance) => {
                *self = instance;
                Ok(())
            }
            Err(err) if fail_on_error => Err(err),
            Err(err) => {
                tracing::debug!(identifier, error = %err, "instance creation failed");
                Ok(())
            }
        }
    }

    /// Raw pointer carrying a new reference; the caller must release it.
    pub fn add_refed_interface(&self) -> *mut I {
        match self.ptr {
            Some(object) => {
                unsafe { abi::add_ref(object.cast()) };
                object.as_ptr()
            }
            None => ptr::null_mut(),
        }
    }

    /// Raw pointer borrowed from this handle.
    pub fn non_add_refed_interface(&self) -> *mut I {
        self.ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Gives up ownership without releasing.
    pub fn into_raw(self) -> *mut I {
        let raw = self.non_add_refed_interface();
        std::mem::forget(self);
        raw
    }

    pub fn get(&self) -> Option<&I> {
        self.ptr.map(|object| unsafe { &*object.as_ptr() })
    }

    /// True when both handles reach the same object through its base identity.
    pub fn same_object<K: Interface>(&self, other: &SmartRef<K>) -> bool {
        let mine = SmartRef::<CafObject>::from_other(self);
        let theirs = SmartRef::<CafObject>::from_other(other);
        match (mine.ptr, theirs.ptr) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl<I: Interface> Default for SmartRef<I> {
    fn default() -> Self {
        Self::null()
    }
}

impl<I: Interface> Clone for SmartRef<I> {
    fn clone(&self) -> Self {
        unsafe { Self::from_raw(self.non_add_refed_interface()) }
    }
}

impl<I: Interface> Drop for SmartRef<I> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<I: Interface> Deref for SmartRef<I> {
    type Target = I;

    fn deref(&self) -> &I {
        match self.get() {
            Some(interface) => interface,
            None => panic!("dereferenced a null SmartRef<{}>", type_name::<I>()),
        }
    }
}

impl<I: Interface> fmt::Debug for SmartRef<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartRef")
            .field("interface", &type_name::<I>())
            .field("ptr", &self.non_add_refed_interface())
            .finish()
    }
}
