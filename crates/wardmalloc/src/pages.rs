//! Guarded page-span allocation over the raw page provider.
//!
//! Every span is laid out as `[guard][data][guard]`; the returned pointer is
//! the inner data start. Reservation-only callers (metadata arrays, region
//! table buffers) pass `commit = false` and commit pieces themselves.

use crate::platform;
use crate::util::{page_ceil, set_errno, PAGE_SIZE};
use core::ptr;

/// Overflow-checked page rounding for caller-supplied sizes.
fn checked_page_ceil(size: usize) -> Option<usize> {
    size.checked_add(PAGE_SIZE - 1).map(|v| v & !(PAGE_SIZE - 1))
}

/// Allocate a span of `usable_size` bytes (page-rounded) with `guard_size`
/// inaccessible bytes on both sides. With `commit`, the inner span is
/// made read-write; otherwise the whole span stays reserved.
///
/// # Safety
/// `guard_size` must be page-aligned.
pub unsafe fn alloc_pages(usable_size: usize, guard_size: usize, commit: bool) -> *mut u8 {
    let real_size = match checked_page_ceil(usable_size)
        .filter(|&usable| usable != 0)
        .and_then(|usable| usable.checked_add(guard_size.wrapping_mul(2)))
    {
        Some(real) => real,
        None => {
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
    };
    let usable = real_size - guard_size * 2;

    let base = platform::map(real_size);
    if base.is_null() {
        return ptr::null_mut();
    }
    let usable_ptr = base.add(guard_size);
    if commit && !platform::protect_rw(usable_ptr, usable) {
        platform::unmap(base, real_size);
        return ptr::null_mut();
    }
    usable_ptr
}

/// Allocate a committed span whose inner pointer is aligned to `alignment`
/// (> PAGE_SIZE, power of two). Over-reserves by the alignment slack and
/// trims the unused head and tail back to the OS.
///
/// # Safety
/// `alignment` must be a power of two greater than the page size and
/// `guard_size` page-aligned.
pub unsafe fn alloc_pages_aligned(usable_size: usize, alignment: usize, guard_size: usize) -> *mut u8 {
    let usable = match checked_page_ceil(usable_size).filter(|&v| v != 0) {
        Some(v) => v,
        None => {
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
    };
    let slack = alignment - PAGE_SIZE;
    let real_size = match usable
        .checked_add(slack)
        .and_then(|n| n.checked_add(guard_size.wrapping_mul(2)))
    {
        Some(real) => real,
        None => {
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
    };

    let base = platform::map(real_size);
    if base.is_null() {
        return ptr::null_mut();
    }

    let usable_ptr = crate::util::align_up(base as usize + guard_size, alignment) as *mut u8;
    let lead = usable_ptr as usize - guard_size - base as usize;
    if lead > 0 {
        platform::unmap(base, lead);
    }
    let end = usable_ptr.add(usable + guard_size);
    let trail = base as usize + real_size - end as usize;
    if trail > 0 {
        platform::unmap(end, trail);
    }

    if !platform::protect_rw(usable_ptr, usable) {
        free_pages(usable_ptr, usable, guard_size);
        return ptr::null_mut();
    }
    usable_ptr
}

/// Release a span previously returned by `alloc_pages`/`alloc_pages_aligned`.
///
/// # Safety
/// Arguments must match the original allocation.
pub unsafe fn free_pages(usable_ptr: *mut u8, usable_size: usize, guard_size: usize) {
    let usable = page_ceil(usable_size);
    platform::unmap(usable_ptr.sub(guard_size), usable + guard_size * 2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::PAGE_SIZE;

    #[test]
    fn guarded_span_is_writable_inside() {
        unsafe {
            let p = alloc_pages(3 * PAGE_SIZE, PAGE_SIZE, true);
            assert!(!p.is_null());
            core::ptr::write_bytes(p, 0xA5, 3 * PAGE_SIZE);
            assert_eq!(p.read(), 0xA5);
            assert_eq!(p.add(3 * PAGE_SIZE - 1).read(), 0xA5);
            free_pages(p, 3 * PAGE_SIZE, PAGE_SIZE);
        }
    }

    #[test]
    fn aligned_span_honors_alignment() {
        unsafe {
            for align_shift in [13usize, 16, 20] {
                let alignment = 1 << align_shift;
                let p = alloc_pages_aligned(PAGE_SIZE, alignment, PAGE_SIZE);
                assert!(!p.is_null());
                assert_eq!(p as usize % alignment, 0);
                core::ptr::write_bytes(p, 0x5A, PAGE_SIZE);
                free_pages(p, PAGE_SIZE, PAGE_SIZE);
            }
        }
    }

    #[test]
    fn zero_usable_size_fails() {
        unsafe {
            assert!(alloc_pages(0, PAGE_SIZE, true).is_null());
        }
    }
}
