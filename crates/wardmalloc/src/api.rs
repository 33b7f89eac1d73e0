//! Standard C allocator entry points.
//!
//! These are ordinary Rust functions with the C ABI; the `replace-malloc`
//! feature additionally exports them unmangled so the cdylib can displace
//! the system allocator via LD_PRELOAD. They stay mangled by default so
//! ordinary Rust builds (including the test runner) keep their libc heap.

use crate::alloc;
use crate::init;
use crate::root;
use crate::slab;
use crate::util::{set_errno, PAGE_SIZE};
use core::ffi::c_void;
use core::ptr;

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    init::init();
    let size = alloc::adjust_size_for_canaries(size);
    alloc::allocate(size) as *mut c_void
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let total_size = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => {
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
    };
    init::init();
    let total_size = alloc::adjust_size_for_canaries(total_size);

    if cfg!(feature = "zero-on-free") {
        // Slots are zeroed on free and fresh pages arrive zeroed.
        return alloc::allocate(total_size) as *mut c_void;
    }

    let p = alloc::allocate(total_size);
    if p.is_null() {
        return ptr::null_mut();
    }
    if total_size != 0 && total_size <= crate::util::MAX_SLAB_SIZE {
        ptr::write_bytes(p, 0, total_size - crate::util::CANARY_SIZE);
    }
    p as *mut c_void
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    alloc::reallocate(ptr as *mut u8, size) as *mut c_void
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    alloc::deallocate(ptr as *mut u8);
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    alloc::deallocate(ptr as *mut u8);
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn free_sized(ptr: *mut c_void, expected_size: usize) {
    alloc::deallocate_sized(ptr as *mut u8, expected_size);
}

// ============================================================================
// Aligned allocation
// ============================================================================

unsafe fn alloc_aligned_simple(alignment: usize, size: usize) -> *mut c_void {
    match alloc::allocate_aligned(alignment, size, 1) {
        Ok(p) => p as *mut c_void,
        Err(err) => {
            set_errno(err);
            ptr::null_mut()
        }
    }
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> libc::c_int {
    init::init();
    let size = alloc::adjust_size_for_canaries(size);
    match alloc::allocate_aligned(alignment, size, core::mem::size_of::<*mut c_void>()) {
        Ok(p) => {
            *memptr = p as *mut c_void;
            0
        }
        Err(err) => err,
    }
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    init::init();
    let size = alloc::adjust_size_for_canaries(size);
    alloc_aligned_simple(alignment, size)
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    init::init();
    let size = alloc::adjust_size_for_canaries(size);
    alloc_aligned_simple(alignment, size)
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    init::init();
    let size = alloc::adjust_size_for_canaries(size);
    alloc_aligned_simple(PAGE_SIZE, size)
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let rounded = match size.checked_add(PAGE_SIZE - 1) {
        Some(v) => v & !(PAGE_SIZE - 1),
        None => 0,
    };
    if rounded == 0 {
        set_errno(libc::ENOMEM);
        return ptr::null_mut();
    }
    init::init();
    let size = alloc::adjust_size_for_canaries(rounded);
    alloc_aligned_simple(PAGE_SIZE, size)
}

// ============================================================================
// Introspection
// ============================================================================

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    alloc::usable_size(ptr as *mut u8)
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn malloc_object_size(ptr: *mut c_void) -> usize {
    alloc::object_size(ptr as *mut u8)
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn malloc_object_size_fast(ptr: *mut c_void) -> usize {
    alloc::object_size_fast(ptr as *mut u8)
}

/// Purge cached empty slabs back to the OS. Returns nonzero if anything was
/// released.
#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn malloc_trim(_pad: usize) -> libc::c_int {
    if !root::is_init() {
        return 0;
    }
    slab::trim() as libc::c_int
}

// ============================================================================
// Compatibility stubs
// ============================================================================

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn mallopt(_param: libc::c_int, _value: libc::c_int) -> libc::c_int {
    0
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn malloc_stats() {}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn mallinfo() -> libc::mallinfo {
    core::mem::zeroed()
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn malloc_info(_options: libc::c_int, _fp: *mut libc::FILE) -> libc::c_int {
    set_errno(libc::ENOSYS);
    -1
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn malloc_get_state() -> *mut c_void {
    ptr::null_mut()
}

#[cfg_attr(feature = "replace-malloc", no_mangle)]
pub unsafe extern "C" fn malloc_set_state(_state: *mut c_void) -> libc::c_int {
    -2
}
