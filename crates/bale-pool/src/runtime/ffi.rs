//! Dynamic module loading for module-reference tasks.
//!
//! A task module is a dynamic library exporting an entry point with the
//! [`ModuleEntryFn`] signature. Input and output are JSON bytes; the output
//! buffer is allocated by the module with `malloc` and released here with
//! `libc::free`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use serde_json::Value;

use crate::error::{Error, Result};

/// Entry point exported by a task module.
///
/// `(input_ptr, input_len, out_ptr, out_len) -> status`
pub type ModuleEntryFn = unsafe extern "C" fn(*const u8, usize, *mut *mut u8, *mut usize) -> i32;

/// Status code returned by a module entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ModuleStatus {
    /// Output holds the JSON result
    Success = 0,
    /// Module could not decode its input
    InputError = -1,
    /// Module ran and reported a failure; output holds the message
    TaskError = -2,
    /// Module could not encode its output
    OutputError = -3,
    /// Module panicked
    Panic = -4,
}

impl From<i32> for ModuleStatus {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::InputError,
            -3 => Self::OutputError,
            -4 => Self::Panic,
            _ => Self::TaskError,
        }
    }
}

impl ModuleStatus {
    fn describe(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InputError => "module rejected its input",
            Self::TaskError => "module reported an error",
            Self::OutputError => "module failed to encode its output",
            Self::Panic => "module panicked",
        }
    }
}

/// RAII guard for FFI-allocated memory.
struct FfiMemoryGuard {
    ptr: *mut u8,
}

impl FfiMemoryGuard {
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by `malloc`.
    unsafe fn new(ptr: *mut u8) -> Self {
        Self { ptr }
    }

    fn to_vec(&self, len: usize) -> Vec<u8> {
        if self.ptr.is_null() || len == 0 {
            return Vec::new();
        }
        // SAFETY: the module wrote `len` bytes at `ptr`.
        unsafe { std::slice::from_raw_parts(self.ptr, len) }.to_vec()
    }
}

impl Drop for FfiMemoryGuard {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::free(self.ptr as *mut libc::c_void);
            }
        }
    }
}

/// Libraries loaded by this worker, kept open for its lifetime.
#[derive(Default)]
pub struct ModuleCache {
    libraries: HashMap<PathBuf, Library>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the library at `path` has already been loaded.
    pub fn is_loaded(&self, path: &Path) -> bool {
        self.libraries.contains_key(path)
    }

    fn library(&mut self, path: &Path) -> Result<&Library> {
        if !self.libraries.contains_key(path) {
            // SAFETY: running a module's initializers is the point of a module task;
            // callers only submit paths to libraries they trust.
            let library = unsafe { Library::new(path) }?;
            tracing::debug!("Loaded task module {}", path.display());
            self.libraries.insert(path.to_path_buf(), library);
        }
        Ok(&self.libraries[path])
    }

    /// Call `symbol` from the library at `path` with `args`.
    pub fn invoke(&mut self, path: &Path, symbol: &str, args: &Value) -> Result<Value> {
        let input = serde_json::to_vec(args)?;
        let library = self.library(path)?;

        // SAFETY: the module contract requires `symbol` to have the ModuleEntryFn signature.
        let entry: Symbol<ModuleEntryFn> = unsafe { library.get(symbol.as_bytes()) }?;

        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let code = unsafe { entry(input.as_ptr(), input.len(), &mut out_ptr, &mut out_len) };

        let guard = unsafe { FfiMemoryGuard::new(out_ptr) };
        let bytes = guard.to_vec(out_len);

        match ModuleStatus::from(code) {
            ModuleStatus::Success if bytes.is_empty() => Ok(Value::Null),
            ModuleStatus::Success => Ok(serde_json::from_slice(&bytes)?),
            status => {
                let detail = String::from_utf8_lossy(&bytes);
                if detail.is_empty() {
                    Err(Error::TaskFailed(status.describe().to_string()))
                } else {
                    Err(Error::TaskFailed(format!("{}: {}", status.describe(), detail)))
                }
            }
        }
    }
}
