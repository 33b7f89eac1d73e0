#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// Reserve `size` bytes of address space at an OS-chosen address.
/// The range is inaccessible (PROT_NONE) until committed with `protect_rw`.
/// Returns null on failure.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
#[inline]
pub unsafe fn map(size: usize) -> *mut u8 {
    sys::map(size)
}

/// Replace `[ptr, ptr + size)` with a fresh inaccessible mapping, dropping
/// any committed pages while keeping the reservation. Returns false on
/// failure.
///
/// # Safety
/// The range must lie within a mapping previously returned by `map`.
#[inline]
pub unsafe fn map_fixed(ptr: *mut u8, size: usize) -> bool {
    sys::map_fixed(ptr, size)
}

/// Release a mapping entirely.
///
/// # Safety
/// `ptr`/`size` must describe a range obtained from `map`.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Commit a reserved range as read-write. Returns false on failure.
///
/// # Safety
/// The range must be page-aligned and within a reservation.
#[inline]
pub unsafe fn protect_rw(ptr: *mut u8, size: usize) -> bool {
    sys::protect_rw(ptr, size)
}

/// Make a committed range read-only. Returns false on failure.
///
/// # Safety
/// The range must be page-aligned and mapped.
#[inline]
pub unsafe fn protect_ro(ptr: *mut u8, size: usize) -> bool {
    sys::protect_ro(ptr, size)
}

/// Move the pages backing `[old, old + old_size)` over `[new, new + new_size)`
/// without copying, unmapping whatever was at the destination. Returns false
/// when the platform cannot do this; the caller falls back to a copy.
///
/// # Safety
/// Both ranges must be page-aligned; `new` must be a mapped destination the
/// caller owns.
#[inline]
pub unsafe fn remap_fixed(old: *mut u8, old_size: usize, new: *mut u8, new_size: usize) -> bool {
    sys::remap_fixed(old, old_size, new, new_size)
}

/// Fill `buf` with OS entropy. Aborts on persistent failure: the allocator's
/// placement and canary defenses are worthless with a predictable seed.
pub fn get_entropy(buf: &mut [u8]) {
    sys::get_entropy(buf)
}

/// The runtime page size, for the init-time check against `PAGE_SIZE`.
pub fn runtime_page_size() -> usize {
    sys::runtime_page_size()
}
