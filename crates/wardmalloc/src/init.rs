//! Lazy one-shot initialization and fork coordination.

use crate::platform;
use crate::regions;
use crate::root;
use crate::slab;
use crate::sync::RawMutex;
use crate::util::{fatal, PAGE_SIZE};
use core::sync::atomic::Ordering;

static INIT_LOCK: RawMutex = RawMutex::new();

#[inline(always)]
pub fn init() {
    if !root::is_init() {
        init_slow_path();
    }
}

#[cold]
#[inline(never)]
fn init_slow_path() {
    INIT_LOCK.lock();

    if root::is_init() {
        INIT_LOCK.unlock();
        return;
    }

    if platform::runtime_page_size() != PAGE_SIZE {
        fatal("page size mismatch");
    }

    unsafe {
        regions::init_tables();

        let root = root::ro_mut();
        let start = platform::map(slab::SLAB_REGION_SIZE);
        if start.is_null() {
            fatal("failed to allocate slab region");
        }
        (*root).slab_region_start = start;
        (*root).slab_region_end = start.add(slab::SLAB_REGION_SIZE);

        slab::init_classes(regions::rng_for_init());

        (*root).initialized.store(true, Ordering::Release);
        root::protect();
    }

    INIT_LOCK.unlock();

    // pthread_atfork may allocate, so register only once the allocator is
    // ready to avoid deadlocking on our own init lock.
    unsafe {
        if libc::pthread_atfork(Some(full_lock), Some(full_unlock), Some(post_fork_child)) != 0 {
            fatal("pthread_atfork failed");
        }
    }
}

// Lock order: regions registry first, then every class in index order. This
// is the only path holding more than one allocator lock, so the fixed order
// is all the deadlock-freedom argument there is to make.
unsafe extern "C" fn full_lock() {
    regions::lock();
    slab::lock_all();
}

unsafe extern "C" fn full_unlock() {
    regions::unlock();
    slab::unlock_all();
}

/// The child inherits the parent's mappings but none of its threads; lock
/// state is indeterminate and the PRNG streams must diverge from the parent.
unsafe extern "C" fn post_fork_child() {
    regions::reinit_after_fork();
    slab::reinit_after_fork();
}

/// Force init before main so the fork handlers and the read-only root are in
/// place as early as possible.
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static EARLY_INIT: unsafe extern "C" fn() = {
    unsafe extern "C" fn early_init() {
        crate::api::free(crate::api::malloc(16));
    }
    early_init
};
