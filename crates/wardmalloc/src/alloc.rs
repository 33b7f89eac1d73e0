//! Dispatcher: routes every operation to the slab engine or the region
//! registry by pointer range, and implements the realloc policy.

use crate::pages;
use crate::platform;
use crate::regions;
use crate::root;
use crate::slab;
use crate::slab::size_class::{get_size_info, get_size_info_align};
use crate::util::{fatal, page_ceil, CANARY_SIZE, MAX_SLAB_SIZE, MIN_ALIGN, PAGE_SIZE};
use core::ptr;

/// Below this, moving a large allocation by copy beats the mremap syscalls.
const MREMAP_THRESHOLD: usize = 4 * 1024 * 1024;

#[inline]
fn is_slab_pointer(p: *mut u8) -> bool {
    let ro = root::ro();
    let addr = p as usize;
    addr >= ro.slab_region_start as usize && addr < ro.slab_region_end as usize
}

/// Inflate small requests so the canary fits in the slot without shrinking
/// the user-visible usable size.
#[inline]
pub(crate) fn adjust_size_for_canaries(size: usize) -> usize {
    if size > 0 && size <= MAX_SLAB_SIZE {
        size + CANARY_SIZE
    } else {
        size
    }
}

/// # Safety
/// The allocator must be initialized.
pub unsafe fn allocate(size: usize) -> *mut u8 {
    if size <= MAX_SLAB_SIZE {
        return slab::allocate_small(size);
    }
    regions::allocate_large(size)
}

/// # Safety
/// `p` must be null or a live allocation from this allocator.
pub unsafe fn deallocate(p: *mut u8) {
    if p.is_null() {
        return;
    }
    if is_slab_pointer(p) {
        slab::deallocate_small(p, None);
        return;
    }
    regions::deallocate_large(p, None);
}

/// # Safety
/// Same as `deallocate`.
pub unsafe fn deallocate_sized(p: *mut u8, expected_size: usize) {
    if p.is_null() {
        return;
    }
    if is_slab_pointer(p) {
        let expected = get_size_info(adjust_size_for_canaries(expected_size)).size;
        slab::deallocate_small(p, Some(expected));
        return;
    }
    regions::deallocate_large(p, Some(expected_size));
}

/// # Safety
/// `old` must be null or a live allocation from this allocator.
pub unsafe fn reallocate(old: *mut u8, size: usize) -> *mut u8 {
    if old.is_null() {
        crate::init::init();
        return allocate(adjust_size_for_canaries(size));
    }

    let size = adjust_size_for_canaries(size);

    let old_size;
    if is_slab_pointer(old) {
        old_size = slab::slab_usable_size(old);
        if size <= MAX_SLAB_SIZE && get_size_info(size).size == old_size {
            return old;
        }
    } else {
        root::enforce_init();

        let region = match regions::find_info(old) {
            Some(r) => r,
            None => fatal("invalid realloc"),
        };
        old_size = region.size;
        let old_guard_size = region.guard_size;

        let new_rounded = size.checked_add(PAGE_SIZE - 1).map(|v| v & !(PAGE_SIZE - 1));
        if new_rounded == Some(page_ceil(old_size)) {
            if !regions::update_size(old, size) {
                fatal("invalid realloc");
            }
            return old;
        }

        // In-place shrink: install the guard at the new data end, then
        // release the tail of the old span past that guard. The interval
        // is exactly old_rounded - rounded bytes, keeping the trailing
        // guard width unchanged.
        if size < old_size && size > MAX_SLAB_SIZE {
            let rounded_size = page_ceil(size);
            let old_rounded_size = page_ceil(old_size);

            let new_end = old.add(rounded_size);
            if !platform::map_fixed(new_end, old_guard_size) {
                return ptr::null_mut();
            }
            let new_guard_end = new_end.add(old_guard_size);
            platform::unmap(new_guard_end, old_rounded_size - rounded_size);

            if !regions::update_size(old, size) {
                fatal("invalid realloc");
            }
            return old;
        }

        let copy_size = size.min(old_size);
        if copy_size >= MREMAP_THRESHOLD {
            // Register the fresh region first, then move the pages into it
            // without copying.
            let new = allocate(size);
            if new.is_null() {
                return ptr::null_mut();
            }

            if regions::take(old).is_none() {
                fatal("invalid realloc");
            }

            if platform::remap_fixed(old, old_size, new, size) {
                // The data pages moved; only the old guards remain.
                platform::unmap(old.sub(old_guard_size), old_guard_size);
                platform::unmap(old.add(page_ceil(old_size)), old_guard_size);
            } else {
                ptr::copy_nonoverlapping(old, new, copy_size);
                pages::free_pages(old, old_size, old_guard_size);
            }
            return new;
        }
    }

    let new = allocate(size);
    if new.is_null() {
        return ptr::null_mut();
    }
    let mut copy_size = size.min(old_size);
    if copy_size > 0 && copy_size <= MAX_SLAB_SIZE {
        copy_size -= CANARY_SIZE;
    }
    ptr::copy_nonoverlapping(old, new, copy_size);
    if is_slab_pointer(old) {
        slab::deallocate_small(old, None);
    } else {
        regions::deallocate_large(old, None);
    }
    new
}

/// Aligned allocation. For alignments within a page, the first size class
/// divisible by the alignment serves the request; above a page, a dedicated
/// guarded aligned span does.
///
/// # Safety
/// The allocator must be initialized.
pub unsafe fn allocate_aligned(
    alignment: usize,
    size: usize,
    min_alignment: usize,
) -> Result<*mut u8, libc::c_int> {
    if !alignment.is_power_of_two() || alignment < min_alignment {
        return Err(libc::EINVAL);
    }

    if alignment <= PAGE_SIZE {
        let size = if size <= MAX_SLAB_SIZE && alignment > MIN_ALIGN {
            get_size_info_align(size, alignment).size
        } else {
            size
        };

        let p = allocate(size);
        if p.is_null() {
            return Err(libc::ENOMEM);
        }
        return Ok(p);
    }

    let guard_size = regions::draw_guard_size(size);
    let p = pages::alloc_pages_aligned(size, alignment, guard_size);
    if p.is_null() {
        return Err(libc::ENOMEM);
    }

    if !regions::register(p, size, guard_size) {
        pages::free_pages(p, size, guard_size);
        return Err(libc::ENOMEM);
    }
    Ok(p)
}

/// # Safety
/// `p` must be null or a live allocation from this allocator.
pub unsafe fn usable_size(p: *mut u8) -> usize {
    if p.is_null() {
        return 0;
    }

    if is_slab_pointer(p) {
        let size = slab::slab_usable_size(p);
        return if size != 0 { size - CANARY_SIZE } else { 0 };
    }

    root::enforce_init();

    match regions::find_info(p) {
        Some(region) => region.size,
        None => fatal("invalid malloc_usable_size"),
    }
}

/// Object-size query for fortified callers: unknown pointers report
/// SIZE_MAX ("no bound known") rather than aborting.
///
/// # Safety
/// `p` must be null or a pointer the caller believes is a heap object.
pub unsafe fn object_size(p: *mut u8) -> usize {
    if p.is_null() {
        return 0;
    }

    if is_slab_pointer(p) {
        let size = slab::slab_usable_size(p);
        return if size != 0 { size - CANARY_SIZE } else { 0 };
    }

    if !root::is_init() {
        return 0;
    }

    match regions::find_info(p) {
        Some(region) => region.size,
        None => usize::MAX,
    }
}

/// Lock-free variant of `object_size`: never touches the region registry.
///
/// # Safety
/// Same as `object_size`.
pub unsafe fn object_size_fast(p: *mut u8) -> usize {
    if p.is_null() {
        return 0;
    }

    if is_slab_pointer(p) {
        let size = slab::slab_usable_size(p);
        return if size != 0 { size - CANARY_SIZE } else { 0 };
    }

    if !root::is_init() {
        return 0;
    }

    usize::MAX
}
