#![no_main]

use core::ffi::c_void;
use libfuzzer_sys::fuzz_target;
use wardmalloc::api;

// Exercise size and alignment boundaries: allocate, write the full extent,
// verify alignment and usable size, then free.

fuzz_target!(|data: &[u8]| {
    let mut i = 0;
    while i + 4 <= data.len() {
        let raw = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        i += 4;

        let size = (raw as usize) % (1024 * 1024); // cap at 1 MiB
        let align_shift = (raw >> 24) % 14; // up to 128 KiB alignment

        unsafe {
            let ptr = api::malloc(size) as *mut u8;
            if size == 0 {
                assert!(!ptr.is_null(), "malloc(0) must return a unique pointer");
                assert_eq!(api::malloc_usable_size(ptr as *mut c_void), 0);
                api::free(ptr as *mut c_void);
            } else if !ptr.is_null() {
                assert_eq!(ptr as usize % 16, 0, "malloc({}) misaligned", size);
                let usable = api::malloc_usable_size(ptr as *mut c_void);
                assert!(usable >= size, "usable {} < requested {}", usable, size);
                std::ptr::write_bytes(ptr, 0xBB, size);
                assert_eq!(ptr.read(), 0xBB);
                assert_eq!(ptr.add(size - 1).read(), 0xBB);
                api::free(ptr as *mut c_void);
            }

            let alignment = 1usize << (4 + align_shift);
            let mut out: *mut c_void = std::ptr::null_mut();
            let ret = api::posix_memalign(&mut out, alignment, size);
            if ret == 0 {
                assert!(!out.is_null());
                assert_eq!(out as usize % alignment, 0);
                if size > 0 {
                    std::ptr::write_bytes(out as *mut u8, 0xCC, size);
                }
                api::free(out);
            }
        }
    }
});
