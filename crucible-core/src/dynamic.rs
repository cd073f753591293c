//! Dynamically loaded backend modules.
//!
//! A module is a cdylib exporting [`MODULE_SYMBOL`], normally written with
//! [`declare_backend!`](crate::declare_backend). The library handle stays
//! alive as long as the registry entry does; a session must never outlive
//! the library whose code backs its model.

use std::ffi::c_void;
use std::fs::File;
use std::path::Path;

use libloading::Library;

use crate::backend::{BackendDescriptor, BackendModule, Model};
use crate::error::{Error, Result};
use crate::params::SessionParams;

/// Constructor symbol every backend module must export. Returns a
/// `Box<Box<dyn BackendModule>>` erased to a raw pointer.
pub const MODULE_SYMBOL: &[u8] = b"crucible_backend_module\0";

type ModuleCtor = unsafe extern "C" fn() -> *mut c_void;

/// A backend living in a shared library.
pub struct DynamicBackend {
    module: Box<dyn BackendModule>,
    // Declared after `module` so the code it points into outlives it.
    _lib: Library,
}

impl DynamicBackend {
    /// Load a module from `path` and resolve its constructor symbol.
    pub fn load(path: &Path) -> Result<Self> {
        let fail = |reason: String| Error::LoadFailed {
            path: path.to_path_buf(),
            reason,
        };
        let lib = unsafe { Library::new(path) }.map_err(|e| fail(e.to_string()))?;
        let raw = {
            let ctor: libloading::Symbol<ModuleCtor> =
                unsafe { lib.get(MODULE_SYMBOL) }.map_err(|e| fail(e.to_string()))?;
            unsafe { ctor() }
        };
        if raw.is_null() {
            return Err(fail("module constructor returned null".into()));
        }
        let module = *unsafe { Box::from_raw(raw as *mut Box<dyn BackendModule>) };
        Ok(Self { module, _lib: lib })
    }
}

impl BackendModule for DynamicBackend {
    fn descriptor(&self) -> BackendDescriptor {
        self.module.descriptor()
    }

    fn identify(&self, header: &[u8]) -> bool {
        self.module.identify(header)
    }

    fn construct(
        &self,
        path: &Path,
        file: File,
        params: &SessionParams,
    ) -> Result<Box<dyn Model>> {
        self.module.construct(path, file, params)
    }
}

/// Export a [`BackendModule`](crate::backend::BackendModule) constructor from
/// a backend cdylib.
///
/// ```ignore
/// crucible_core::declare_backend!(MyBackend::new());
/// ```
#[macro_export]
macro_rules! declare_backend {
    ($ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn crucible_backend_module() -> *mut ::std::ffi::c_void {
            let module: ::std::boxed::Box<dyn $crate::backend::BackendModule> =
                ::std::boxed::Box::new($ctor);
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(module)) as *mut ::std::ffi::c_void
        }
    };
}
