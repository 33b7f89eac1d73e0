use crate::util::fatal;
use core::ptr;

/// Reserve inaccessible address space.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Drop committed pages in a range, keeping the reservation.
///
/// # Safety
/// The range must lie within an existing mapping.
pub unsafe fn map_fixed(ptr: *mut u8, size: usize) -> bool {
    let result = libc::mmap(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
        -1,
        0,
    );
    result != libc::MAP_FAILED
}

/// # Safety
/// `ptr`/`size` must describe a mapped range.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// # Safety
/// The range must be page-aligned and reserved.
pub unsafe fn protect_rw(ptr: *mut u8, size: usize) -> bool {
    libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    ) == 0
}

/// # Safety
/// The range must be page-aligned and mapped.
pub unsafe fn protect_ro(ptr: *mut u8, size: usize) -> bool {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ) == 0
}

/// Move pages between mappings with mremap(MREMAP_FIXED).
///
/// # Safety
/// Both ranges must be page-aligned and owned by the caller.
pub unsafe fn remap_fixed(old: *mut u8, old_size: usize, new: *mut u8, new_size: usize) -> bool {
    let result = libc::mremap(
        old as *mut libc::c_void,
        old_size,
        new_size,
        libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
        new as *mut libc::c_void,
    );
    result != libc::MAP_FAILED
}

/// Fill `buf` from getrandom(2), retrying short reads and EINTR.
pub fn get_entropy(buf: &mut [u8]) {
    let mut filled = 0;
    while filled < buf.len() {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_getrandom,
                buf.as_mut_ptr().add(filled),
                buf.len() - filled,
                0,
            )
        };
        if ret < 0 {
            let err = unsafe { *libc::__errno_location() };
            if err == libc::EINTR {
                continue;
            }
            fatal("getrandom failed");
        }
        filled += ret as usize;
    }
}

pub fn runtime_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
