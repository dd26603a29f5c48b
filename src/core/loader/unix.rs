// dlopen-family backend. Callers hold the loader mutex, so `dlerror` reads are not racy.
use std::ffi::{CStr, CString, OsStr, c_void};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use super::{LibraryHandle, LoaderBackend};
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Default)]
pub struct OsLoaderBackend;

impl LoaderBackend for OsLoaderBackend {
    fn open(&self, path: &Path) -> Result<LibraryHandle, Error> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("library path contains NUL")
                .with_path(path)
                .with_source(err)
        })?;
        let raw = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if raw.is_null() {
            return Err(Error::new(ErrorKind::LoadFailure)
                .with_message(format!("dlopen failed: {}", last_dl_error()))
                .with_path(path));
        }
        Ok(LibraryHandle::from_raw(raw))
    }

    fn symbol(&self, handle: Option<LibraryHandle>, name: &str) -> Result<*const c_void, Error> {
        let c_name = CString::new(name).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("symbol name contains NUL")
                .with_source(err)
        })?;
        let target = handle.map_or(libc::RTLD_DEFAULT, LibraryHandle::as_raw);
        unsafe {
            libc::dlerror();
        }
        let address = unsafe { libc::dlsym(target, c_name.as_ptr()) };
        if address.is_null() {
            return Err(Error::new(ErrorKind::LoadFailure)
                .with_message(format!("dlsym({name}) failed: {}", last_dl_error())));
        }
        Ok(address as *const c_void)
    }

    fn close(&self, handle: LibraryHandle) -> Result<(), Error> {
        let rc = unsafe { libc::dlclose(handle.as_raw()) };
        if rc != 0 {
            return Err(Error::new(ErrorKind::LoadFailure)
                .with_message(format!("dlclose failed: {}", last_dl_error())));
        }
        Ok(())
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn path_of_handle(&self, handle: LibraryHandle) -> Result<PathBuf, Error> {
        let mut map: *const LinkMapHead = std::ptr::null();
        let rc = unsafe {
            libc::dlinfo(
                handle.as_raw(),
                libc::RTLD_DI_LINKMAP,
                (&mut map as *mut *const LinkMapHead).cast(),
            )
        };
        if rc != 0 || map.is_null() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("dlinfo failed: {}", last_dl_error())));
        }
        let name = unsafe { (*map).l_name };
        if name.is_null() {
            return Err(Error::new(ErrorKind::NotFound).with_message("loaded object has no file name"));
        }
        let name = unsafe { CStr::from_ptr(name) };
        if name.is_empty() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("handle names the main program"));
        }
        Ok(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn path_of_handle(&self, _handle: LibraryHandle) -> Result<PathBuf, Error> {
        Err(Error::new(ErrorKind::NotFound)
            .with_message("handle was not loaded through this loader"))
    }

    fn path_of_address(&self, address: *const c_void) -> Result<PathBuf, Error> {
        let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
        let rc = unsafe { libc::dladdr(address, info.as_mut_ptr()) };
        if rc == 0 {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("address does not belong to a loaded object"));
        }
        let info = unsafe { info.assume_init() };
        if info.dli_fname.is_null() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("loaded object has no file name"));
        }
        let name = unsafe { CStr::from_ptr(info.dli_fname) };
        Ok(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
    }
}

/// Leading fields of glibc's `struct link_map`; only `l_name` is read.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[repr(C)]
struct LinkMapHead {
    _l_addr: usize,
    l_name: *const libc::c_char,
}

fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dynamic loader error".to_string();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}
