use crate::util::fatal;
use core::ptr;

/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// # Safety
/// The range must lie within an existing mapping.
pub unsafe fn map_fixed(ptr: *mut u8, size: usize) -> bool {
    let result = libc::mmap(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
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

/// No mremap on macOS; callers fall back to copying.
///
/// # Safety
/// Trivially safe -- always fails.
pub unsafe fn remap_fixed(_old: *mut u8, _old_size: usize, _new: *mut u8, _new_size: usize) -> bool {
    false
}

/// Fill `buf` from getentropy(2), which caps each request at 256 bytes.
pub fn get_entropy(buf: &mut [u8]) {
    for chunk in buf.chunks_mut(256) {
        let ret = unsafe { libc::getentropy(chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if ret != 0 {
            fatal("getentropy failed");
        }
    }
}

pub fn runtime_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
