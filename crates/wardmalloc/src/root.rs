//! Process-wide root constants, made read-only after init.
//!
//! The fields here are what a heap-corruption exploit would want to redirect:
//! the slab region bounds drive free/realloc dispatch and the region-table
//! pointers drive large-allocation lookups. The root occupies its own page
//! and is `mprotect`ed read-only once init completes, so a post-init write
//! anywhere into it traps.

use crate::platform;
use crate::regions::RegionInfo;
use crate::util::{fatal, PAGE_SIZE};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

#[repr(C, align(4096))]
pub struct Root {
    pub slab_region_start: *mut u8,
    pub slab_region_end: *mut u8,
    pub region_tables: [*mut RegionInfo; 2],
    pub initialized: AtomicBool,
    _pad: [u8; PAGE_SIZE - 4 * core::mem::size_of::<*mut u8>() - 1],
}

struct RootHolder(UnsafeCell<Root>);
unsafe impl Sync for RootHolder {}

static ROOT: RootHolder = RootHolder(UnsafeCell::new(Root {
    slab_region_start: ptr::null_mut(),
    slab_region_end: ptr::null_mut(),
    region_tables: [ptr::null_mut(), ptr::null_mut()],
    initialized: AtomicBool::new(false),
    _pad: [0; PAGE_SIZE - 4 * core::mem::size_of::<*mut u8>() - 1],
}));

#[inline(always)]
pub fn ro() -> &'static Root {
    unsafe { &*ROOT.0.get() }
}

/// Mutable access for the init path only.
///
/// # Safety
/// Must only be used under the init lock before the root is RO-protected.
pub unsafe fn ro_mut() -> *mut Root {
    ROOT.0.get()
}

#[inline(always)]
pub fn is_init() -> bool {
    ro().initialized.load(Ordering::Acquire)
}

pub fn enforce_init() {
    if !is_init() {
        fatal("invalid uninitialized allocator usage");
    }
}

/// Freeze the root for the rest of the process lifetime.
///
/// # Safety
/// Must be called exactly once, at the end of init.
pub unsafe fn protect() {
    if !platform::protect_ro(ROOT.0.get() as *mut u8, PAGE_SIZE) {
        fatal("failed to protect allocator data");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_fills_exactly_one_page() {
        assert_eq!(core::mem::size_of::<Root>(), PAGE_SIZE);
        assert_eq!(core::mem::align_of::<Root>(), PAGE_SIZE);
    }
}
