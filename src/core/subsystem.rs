//! Purpose: One caller's load session against a subsystem module.
//! Exports: `SubsystemHandle`.
//! Role: Resolves identifiers through the host, keeps the module's entry points cached,
//! and is the only path by which the host asks a module for objects.
//! Invariants: Unloaded <-> Loaded; a failed operation leaves the state it found.
//! Invariants: Each loaded session owns exactly one loader reference on its module.
//! Invariants: Only unloadable sessions give their module back, and only when the module
//! reports `CafDllCanUnloadNow`.
//! Notes: The CanUnloadNow answer is a snapshot; an object created between that call and
//! the close is not guarded against.
//! Notes: A module's cached singleton holds one module lock until the module detaches, and
//! detach only follows a true CanUnloadNow. Once any singleton exists, `unload` declines
//! (or reports `Busy`) for every session, so that module stays loaded for the process.

use std::ffi::{CString, c_void};
use std::ptr::{self, NonNull};

use crate::abi::{
    CAN_UNLOAD_NOW_SYMBOL, CREATE_INSTANCE_SYMBOL, CanUnloadNowFn, CreateInstanceFn,
};
use crate::component::iid::InterfaceId;
use crate::component::smart::{Interface, SmartRef};
use crate::core::error::{Error, ErrorKind};
use crate::core::host::Host;
use crate::core::loader::LibraryHandle;

struct Session {
    identifier: String,
    handle: LibraryHandle,
    create_fn: Option<CreateInstanceFn>,
    can_unload_fn: Option<CanUnloadNowFn>,
}

pub struct SubsystemHandle<'h> {
    host: &'h Host,
    unloadable: bool,
    session: Option<Session>,
}

impl<'h> SubsystemHandle<'h> {
    /// A session whose module stays loaded for the life of the host.
    pub fn new(host: &'h Host) -> Self {
        Self {
            host,
            unloadable: false,
            session: None,
        }
    }

    /// A session that may give its module back once the module agrees.
    pub fn unloadable(host: &'h Host) -> Self {
        Self {
            host,
            unloadable: true,
            session: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    pub fn identifier(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|session| session.identifier.as_str())
    }

    pub fn is_unloadable(&self) -> bool {
        self.unloadable
    }

    pub fn module_handle(&self) -> Option<LibraryHandle> {
        self.session.as_ref().map(|session| session.handle)
    }

    pub fn load(&mut self, identifier: &str) -> Result<(), Error> {
        if self.unloadable {
            self.unload(true)?;
        } else if let Some(session) = &self.session {
            return Err(Error::new(ErrorKind::DoubleLoad)
                .with_message(format!("session already holds {}", session.identifier))
                .with_identifier(identifier));
        }

        let host = self.host;
        let mut modules = host.lock_modules();
        let handle = match modules.get(identifier) {
            Some(&handle) => {
                let ref_count = host
                    .loader()
                    .retain(handle)
                    .map_err(|err| err.with_identifier(identifier))?;
                tracing::debug!(identifier, ref_count, "adopted cached subsystem module");
                handle
            }
            None => {
                let registry = host.registry();
                if !registry.is_registered(identifier) {
                    return Err(Error::new(ErrorKind::NotRegistered)
                        .with_message("subsystem is not registered")
                        .with_identifier(identifier));
                }
                let path = registry.module_path(identifier)?;
                let handle = host
                    .loader()
                    .load(&path.to_string_lossy(), true)
                    .map_err(|err| err.with_identifier(identifier))?;
                modules.insert(identifier.to_string(), handle);
                tracing::debug!(identifier, path = %path.display(), "subsystem module loaded");
                handle
            }
        };
        drop(modules);

        self.session = Some(Session {
            identifier: identifier.to_string(),
            handle,
            create_fn: None,
            can_unload_fn: None,
        });
        Ok(())
    }

    /// Gives the module back if it reports it can be unloaded.
    ///
    /// Returns `Ok(false)` when nothing was loaded, or when the module is busy and
    /// `must_unload_now` is unset. A busy module with `must_unload_now` set is `Busy`.
    pub fn unload(&mut self, must_unload_now: bool) -> Result<bool, Error> {
        let host = self.host;
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        if !self.unloadable {
            return Err(Error::new(ErrorKind::CannotUnloadNonUnloadable)
                .with_message("session was not created unloadable")
                .with_identifier(session.identifier.as_str()));
        }

        let can_unload_now = match session.can_unload_fn {
            Some(entry) => entry,
            None => {
                let address = resolve(host, session, CAN_UNLOAD_NOW_SYMBOL)?;
                let entry = unsafe { std::mem::transmute::<*const c_void, CanUnloadNowFn>(address) };
                session.can_unload_fn = Some(entry);
                entry
            }
        };
        if !unsafe { can_unload_now() } {
            if must_unload_now {
                return Err(Error::new(ErrorKind::Busy)
                    .with_message("module still has live objects")
                    .with_identifier(session.identifier.as_str()));
            }
            tracing::debug!(identifier = %session.identifier, "module busy; unload declined");
            return Ok(false);
        }

        let handle = session.handle;
        let outcome = {
            let mut modules = host.lock_modules();
            let outcome = host.loader().unload(handle, true);
            if host.loader().ref_count(handle).is_none() {
                modules.retain(|_, cached| *cached != handle);
            }
            outcome
        };
        let session = self.session.take();
        let closed = outcome.map_err(|err| match &session {
            Some(session) => err.with_identifier(session.identifier.as_str()),
            None => err,
        })?;
        if let Some(session) = session {
            tracing::debug!(identifier = %session.identifier, closed, "subsystem unloaded");
        }
        Ok(true)
    }

    /// Asks the loaded module for a new `identifier` object queried to `iid`. The
    /// returned pointer carries one reference owned by the caller.
    pub fn create_instance(
        &mut self,
        identifier: &str,
        iid: &InterfaceId,
    ) -> Result<NonNull<c_void>, Error> {
        let host = self.host;
        let Some(session) = self.session.as_mut() else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("subsystem is not loaded")
                .with_identifier(identifier));
        };
        let create = match session.create_fn {
            Some(entry) => entry,
            None => {
                let address = resolve(host, session, CREATE_INSTANCE_SYMBOL)?;
                let entry =
                    unsafe { std::mem::transmute::<*const c_void, CreateInstanceFn>(address) };
                session.create_fn = Some(entry);
                entry
            }
        };

        let c_identifier = CString::new(identifier).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("identifier contains NUL")
                .with_source(err)
        })?;
        let mut out = ptr::null_mut();
        unsafe { create(c_identifier.as_ptr(), iid, &mut out) }
            .into_result()
            .map_err(|err| err.with_identifier(identifier))?;
        NonNull::new(out).ok_or_else(|| {
            Error::new(ErrorKind::UnknownFailure)
                .with_message("module reported success without an object")
                .with_identifier(identifier)
        })
    }

    pub fn create<I: Interface>(&mut self, identifier: &str) -> Result<SmartRef<I>, Error> {
        let object = self.create_instance(identifier, &I::IID)?;
        Ok(unsafe { SmartRef::from_raw_owned(object.as_ptr().cast()) })
    }
}

fn resolve(host: &Host, session: &Session, symbol: &str) -> Result<*const c_void, Error> {
    host.loader()
        .function_address(Some(session.handle), symbol)
        .map_err(|err| {
            Error::new(ErrorKind::LoadFailure)
                .with_message(format!("module does not export {symbol}"))
                .with_identifier(session.identifier.as_str())
                .with_source(err)
        })
}

impl Drop for SubsystemHandle<'_> {
    fn drop(&mut self) {
        if !self.unloadable || self.session.is_none() {
            return;
        }
        match self.unload(false) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(identifier = ?self.identifier(), "module kept loaded at drop");
            }
            Err(err) => tracing::warn!(error = %err, "unload at drop failed"),
        }
    }
}
