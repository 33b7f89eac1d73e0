#![no_main]

use core::ffi::c_void;
use libfuzzer_sys::fuzz_target;
use wardmalloc::api;

/// Interpret the input as a sequence of allocator operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=malloc, 1=free, 2=realloc, 3=calloc, 4=free_sized)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// Up to 64 live pointers are tracked. Any abort here is a finding: legal
/// op sequences must never trip the hardening checks.
const MAX_SLOTS: usize = 64;

fuzz_target!(|data: &[u8]| {
    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 5;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        unsafe {
            match opcode {
                0 => {
                    if !slots[slot].is_null() {
                        api::free(slots[slot] as *mut c_void);
                    }
                    let ptr = api::malloc(size) as *mut u8;
                    slots[slot] = ptr;
                    sizes[slot] = size;
                    if !ptr.is_null() && size > 0 {
                        std::ptr::write_bytes(ptr, 0xAA, size.min(256));
                    }
                }
                1 => {
                    if !slots[slot].is_null() {
                        api::free(slots[slot] as *mut c_void);
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                }
                2 => {
                    if !slots[slot].is_null() {
                        let new_ptr = api::realloc(slots[slot] as *mut c_void, size) as *mut u8;
                        if !new_ptr.is_null() {
                            slots[slot] = new_ptr;
                            sizes[slot] = size;
                            if size > 0 {
                                std::ptr::write_bytes(new_ptr, 0xBB, size.min(256));
                            }
                        }
                    }
                }
                3 => {
                    if !slots[slot].is_null() {
                        api::free(slots[slot] as *mut c_void);
                    }
                    let nmemb = (size % 64) + 1;
                    let elem = size / 64 + 1;
                    let ptr = api::calloc(nmemb, elem) as *mut u8;
                    slots[slot] = ptr;
                    sizes[slot] = nmemb * elem;
                    if !ptr.is_null() {
                        for j in 0..(nmemb * elem).min(256) {
                            assert_eq!(ptr.add(j).read(), 0, "calloc not zeroed");
                        }
                    }
                }
                _ => {
                    if !slots[slot].is_null() {
                        api::free_sized(slots[slot] as *mut c_void, sizes[slot]);
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                }
            }
        }
    }

    for slot in 0..MAX_SLOTS {
        if !slots[slot].is_null() {
            unsafe { api::free(slots[slot] as *mut c_void) };
        }
    }
});
