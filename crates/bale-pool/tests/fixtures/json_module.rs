//! Task module used by the module-task tests.
//!
//! Compiled on the fly with `rustc --crate-type cdylib`; every export follows
//! the `(input_ptr, input_len, out_ptr, out_len) -> status` entry signature.

use std::sync::atomic::{AtomicUsize, Ordering};

extern "C" {
    fn malloc(size: usize) -> *mut u8;
}

static CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe fn emit(bytes: &[u8], out_ptr: *mut *mut u8, out_len: *mut usize) {
    let buf = malloc(bytes.len().max(1));
    if buf.is_null() {
        return;
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
    *out_ptr = buf;
    *out_len = bytes.len();
}

/// Returns its input unchanged.
#[no_mangle]
pub unsafe extern "C" fn echo(
    input: *const u8,
    input_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let bytes = std::slice::from_raw_parts(input, input_len);
    emit(bytes, out_ptr, out_len);
    0
}

/// Always fails with a message.
#[no_mangle]
pub unsafe extern "C" fn reject(
    _input: *const u8,
    _input_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    emit(b"value out of range", out_ptr, out_len);
    -2
}

/// Counts how often it ran in this process; state survives only while the library stays loaded.
#[no_mangle]
pub unsafe extern "C" fn calls(
    _input: *const u8,
    _input_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let n = CALLS.fetch_add(1, Ordering::SeqCst) + 1;
    emit(format!("{{\"calls\":{}}}", n).as_bytes(), out_ptr, out_len);
    0
}
