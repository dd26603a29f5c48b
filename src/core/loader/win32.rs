// LoadLibraryW-family backend.
use std::ffi::{CString, OsString, c_void};
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use ::windows::Win32::Foundation::{FreeLibrary, HMODULE};
use ::windows::Win32::System::LibraryLoader::{
    GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    GetModuleFileNameW, GetModuleHandleExW, GetModuleHandleW, GetProcAddress, LoadLibraryW,
};
use ::windows::core::{HSTRING, PCSTR, PCWSTR};

use super::{LibraryHandle, LoaderBackend};
use crate::core::error::{Error, ErrorKind};

const MAX_MODULE_PATH: usize = 32 * 1024;

#[derive(Clone, Copy, Debug, Default)]
pub struct OsLoaderBackend;

fn to_module(handle: LibraryHandle) -> HMODULE {
    HMODULE(handle.as_raw() as isize)
}

fn from_module(module: HMODULE) -> LibraryHandle {
    LibraryHandle::from_raw(module.0 as *mut c_void)
}

fn os_error(context: &str, err: ::windows::core::Error) -> Error {
    Error::new(ErrorKind::LoadFailure)
        .with_message(format!("{context}: {}", err.message()))
        .with_source(err)
}

impl LoaderBackend for OsLoaderBackend {
    fn open(&self, path: &Path) -> Result<LibraryHandle, Error> {
        let wide = HSTRING::from(path.as_os_str());
        let module = unsafe { LoadLibraryW(&wide) }
            .map_err(|err| os_error("LoadLibraryW failed", err).with_path(path))?;
        Ok(from_module(module))
    }

    fn symbol(&self, handle: Option<LibraryHandle>, name: &str) -> Result<*const c_void, Error> {
        let c_name = CString::new(name).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("symbol name contains NUL")
                .with_source(err)
        })?;
        let module = match handle {
            Some(handle) => to_module(handle),
            None => unsafe { GetModuleHandleW(PCWSTR::null()) }
                .map_err(|err| os_error("GetModuleHandleW failed", err))?,
        };
        let address = unsafe { GetProcAddress(module, PCSTR::from_raw(c_name.as_ptr() as *const u8)) };
        match address {
            Some(address) => Ok(address as *const c_void),
            None => Err(os_error(
                &format!("GetProcAddress({name}) failed"),
                ::windows::core::Error::from_win32(),
            )),
        }
    }

    fn close(&self, handle: LibraryHandle) -> Result<(), Error> {
        unsafe { FreeLibrary(to_module(handle)) }.map_err(|err| os_error("FreeLibrary failed", err))
    }

    fn path_of_handle(&self, handle: LibraryHandle) -> Result<PathBuf, Error> {
        module_file_name(to_module(handle))
    }

    fn path_of_address(&self, address: *const c_void) -> Result<PathBuf, Error> {
        let mut module = HMODULE::default();
        unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                PCWSTR::from_raw(address as *const u16),
                &mut module,
            )
        }
        .map_err(|err| os_error("GetModuleHandleExW failed", err))?;
        module_file_name(module)
    }
}

fn module_file_name(module: HMODULE) -> Result<PathBuf, Error> {
    let mut buffer = vec![0u16; MAX_MODULE_PATH];
    let len = unsafe { GetModuleFileNameW(module, &mut buffer) } as usize;
    if len == 0 {
        return Err(os_error(
            "GetModuleFileNameW failed",
            ::windows::core::Error::from_win32(),
        ));
    }
    buffer.truncate(len);
    Ok(PathBuf::from(OsString::from_wide(&buffer)))
}
