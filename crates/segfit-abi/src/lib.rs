//! # segfit-abi
//!
//! `extern "C"` exports over one process-wide [`Heap`] instance:
//! `mm_init`, `mm_deinit`, `mm_malloc`, `mm_free`, the error-slot
//! accessors, and the read-only arena boundary accessors.
//!
//! The core allocator promises nothing under concurrent use; the global
//! instance is wrapped in a mutex purely so the exported symbols are
//! not instant undefined behavior when misused across threads. Calls
//! are strictly serialized and no further cross-thread semantics are
//! promised.

use std::ffi::{c_int, c_void};
use std::sync::OnceLock;

use parking_lot::Mutex;
use segfit_core::errno;
use segfit_core::heap::Heap;

/// The process-wide heap instance behind the C symbols.
fn global_heap() -> &'static Mutex<Heap> {
    static HEAP: OnceLock<Mutex<Heap>> = OnceLock::new();
    HEAP.get_or_init(|| Mutex::new(Heap::new()))
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initializes the process-wide heap with a usable budget of `size`
/// bytes.
///
/// Returns 0 on success, −1 on failure with the error slot set
/// (*invalid-argument* for a zero size, *internal* when already
/// initialized, *no-memory* when the OS mapping fails).
#[unsafe(no_mangle)]
pub extern "C" fn mm_init(size: usize) -> c_int {
    match global_heap().lock().init(size) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Tears the process-wide heap down, releasing its mapping.
///
/// Outstanding payload pointers dangle afterwards. Idempotent when the
/// heap was never initialized. Returns 0 on success, −1 on failure with
/// the error slot set.
#[unsafe(no_mangle)]
pub extern "C" fn mm_deinit() -> c_int {
    match global_heap().lock().deinit() {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Allocates a block with at least `size` usable bytes.
///
/// Returns the 16-aligned payload address, or null on failure with the
/// error slot set. A zero `size` returns null without touching the
/// error slot.
///
/// # Safety
///
/// The caller must pass the returned pointer to [`mm_free`] at most
/// once and must not use it after `mm_free` or [`mm_deinit`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_malloc(size: usize) -> *mut c_void {
    global_heap().lock().malloc(size).cast()
}

/// Frees a block previously returned by [`mm_malloc`]. Null is a
/// no-op.
///
/// # Safety
///
/// `ptr` must be null or a payload returned by [`mm_malloc`] that has
/// not been freed since. Under the `check`/`abort` hardening levels
/// violations are detected and rejected.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_free(ptr: *mut c_void) {
    // SAFETY: forwarded under the caller's contract.
    unsafe { global_heap().lock().free(ptr.cast()) }
}

// ---------------------------------------------------------------------------
// Error slot
// ---------------------------------------------------------------------------

/// Reads the process-wide error slot.
#[unsafe(no_mangle)]
pub extern "C" fn get_mm_errno() -> c_int {
    errno::get_code()
}

/// Writes the process-wide error slot.
#[unsafe(no_mangle)]
pub extern "C" fn set_mm_errno(value: c_int) {
    errno::set_code(value);
}

// ---------------------------------------------------------------------------
// Arena boundary accessors
// ---------------------------------------------------------------------------

/// Start of the heap region (null before `mm_init`/after `mm_deinit`).
#[unsafe(no_mangle)]
pub extern "C" fn mm_heap_start() -> *const c_void {
    global_heap().lock().heap_start().cast()
}

/// Current brk cursor (null before `mm_init`/after `mm_deinit`).
#[unsafe(no_mangle)]
pub extern "C" fn mm_brk() -> *const c_void {
    global_heap().lock().brk().cast()
}

/// End of the heap region (null before `mm_init`/after `mm_deinit`).
#[unsafe(no_mangle)]
pub extern "C" fn mm_heap_end() -> *const c_void {
    global_heap().lock().heap_end().cast()
}
