//! Large-allocation region registry.
//!
//! Open-addressed hash table keyed by the allocation base pointer, probing
//! by decrementing index. Two buffers are reserved up front at the maximum
//! table size; growth rehashes into the other buffer and drops the old one
//! back to reserved-only, so a rehash never doubles the committed footprint.

use crate::pages;
use crate::platform;
use crate::random::RandomState;
use crate::root;
use crate::slab::CLASS_REGION_SIZE;
use crate::sync::RawMutex;
use crate::util::{fatal, page_ceil, PAGE_SHIFT, PAGE_SIZE};
use core::cell::UnsafeCell;
use core::ptr;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RegionInfo {
    pub p: *mut u8,
    pub size: usize,
    pub guard_size: usize,
}

impl RegionInfo {
    const fn empty() -> Self {
        RegionInfo {
            p: ptr::null_mut(),
            size: 0,
            guard_size: 0,
        }
    }
}

const INITIAL_REGION_TABLE_SIZE: usize = 256;
const MAX_REGION_TABLE_SIZE: usize = CLASS_REGION_SIZE / PAGE_SIZE;

pub(crate) struct RegionsInner {
    regions: *mut RegionInfo,
    total: usize,
    free: usize,
    pub(crate) rng: RandomState,
}

struct RegionsState {
    lock: RawMutex,
    inner: UnsafeCell<RegionsInner>,
}

unsafe impl Send for RegionsState {}
unsafe impl Sync for RegionsState {}

static REGIONS: RegionsState = RegionsState {
    lock: RawMutex::new(),
    inner: UnsafeCell::new(RegionsInner {
        regions: ptr::null_mut(),
        total: INITIAL_REGION_TABLE_SIZE,
        free: INITIAL_REGION_TABLE_SIZE,
        rng: RandomState::zeroed(),
    }),
};

/// Fold the page-number bits of a pointer into a table index.
fn hash_page(p: *mut u8) -> usize {
    let u = p as usize >> PAGE_SHIFT;
    let mut sum = u;
    sum = (sum << 7).wrapping_sub(sum).wrapping_add(u >> 16);
    sum = (sum << 7).wrapping_sub(sum).wrapping_add(u >> 32);
    sum = (sum << 7).wrapping_sub(sum).wrapping_add(u >> 48);
    sum
}

impl RegionsInner {
    unsafe fn entry(&self, index: usize) -> *mut RegionInfo {
        self.regions.add(index)
    }

    /// Double into the other pre-reserved buffer, rehashing every present
    /// entry, then drop the old buffer back to reserved-only.
    unsafe fn grow(&mut self) -> bool {
        let new_total = match self.total.checked_mul(2) {
            Some(t) if t <= MAX_REGION_TABLE_SIZE => t,
            _ => return false,
        };
        let new_size = new_total * core::mem::size_of::<RegionInfo>();
        let mask = new_total - 1;

        let tables = root::ro().region_tables;
        let target = if self.regions == tables[0] {
            tables[1]
        } else {
            tables[0]
        };

        if !platform::protect_rw(target as *mut u8, new_size) {
            return false;
        }

        for i in 0..self.total {
            let q = (*self.entry(i)).p;
            if !q.is_null() {
                let mut index = hash_page(q) & mask;
                while !(*target.add(index)).p.is_null() {
                    index = index.wrapping_sub(1) & mask;
                }
                *target.add(index) = *self.entry(i);
            }
        }

        platform::map_fixed(
            self.regions as *mut u8,
            page_ceil(self.total * core::mem::size_of::<RegionInfo>()),
        );
        self.free += self.total;
        self.total = new_total;
        self.regions = target;
        true
    }

    unsafe fn insert(&mut self, p: *mut u8, size: usize, guard_size: usize) -> bool {
        // Keep the load below 25% so probe chains stay short.
        if self.free * 4 < self.total && !self.grow() {
            return false;
        }

        let mask = self.total - 1;
        let mut index = hash_page(p) & mask;
        while !(*self.entry(index)).p.is_null() {
            index = index.wrapping_sub(1) & mask;
        }
        *self.entry(index) = RegionInfo { p, size, guard_size };
        self.free -= 1;
        true
    }

    unsafe fn find(&self, p: *mut u8) -> *mut RegionInfo {
        let mask = self.total - 1;
        let mut index = hash_page(p) & mask;
        loop {
            let r = (*self.entry(index)).p;
            if r == p && !r.is_null() {
                return self.entry(index);
            }
            if r.is_null() {
                return ptr::null_mut();
            }
            index = index.wrapping_sub(1) & mask;
        }
    }

    /// Backward-shift deletion: closing the gap keeps every surviving entry
    /// reachable from its ideal bucket without tombstones.
    unsafe fn delete(&mut self, region: *mut RegionInfo) {
        let mask = self.total - 1;
        self.free += 1;

        let mut i = region.offset_from(self.regions) as usize;
        loop {
            (*self.entry(i)).p = ptr::null_mut();
            (*self.entry(i)).size = 0;
            let j = i;
            loop {
                i = i.wrapping_sub(1) & mask;
                if (*self.entry(i)).p.is_null() {
                    return;
                }
                let r = hash_page((*self.entry(i)).p) & mask;
                // The item stays if its ideal bucket sits cyclically between
                // its current slot and the gap.
                if (i <= r && r < j) || (r < j && j < i) || (j < i && i <= r) {
                    continue;
                }
                *self.entry(j) = *self.entry(i);
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Locked entry points
// ---------------------------------------------------------------------------

/// Guard size for a large allocation: a random page multiple scaled to the
/// allocation (up to 1/8th of its pages).
pub fn draw_guard_size(size: usize) -> usize {
    REGIONS.lock.lock();
    let guard = unsafe {
        let inner = &mut *REGIONS.inner.get();
        (inner.rng.get_u64_uniform((size / PAGE_SIZE / 8) as u64) as usize + 1) * PAGE_SIZE
    };
    REGIONS.lock.unlock();
    guard
}

/// Register a guarded span. Returns false when the table is full and cannot
/// grow; the caller releases the span and fails the allocation.
pub unsafe fn register(p: *mut u8, size: usize, guard_size: usize) -> bool {
    REGIONS.lock.lock();
    let inserted = (*REGIONS.inner.get()).insert(p, size, guard_size);
    REGIONS.lock.unlock();
    inserted
}

/// Copy out the entry for `p`, if present.
pub unsafe fn find_info(p: *mut u8) -> Option<RegionInfo> {
    REGIONS.lock.lock();
    let inner = &*REGIONS.inner.get();
    let region = inner.find(p);
    let info = if region.is_null() { None } else { Some(*region) };
    REGIONS.lock.unlock();
    info
}

/// Update the recorded size of `p` in place. Returns false on a miss.
pub unsafe fn update_size(p: *mut u8, size: usize) -> bool {
    REGIONS.lock.lock();
    let inner = &mut *REGIONS.inner.get();
    let region = inner.find(p);
    let found = if region.is_null() {
        false
    } else {
        (*region).size = size;
        true
    };
    REGIONS.lock.unlock();
    found
}

/// Remove and return the entry for `p`, or None on a miss.
pub unsafe fn take(p: *mut u8) -> Option<RegionInfo> {
    REGIONS.lock.lock();
    let inner = &mut *REGIONS.inner.get();
    let region = inner.find(p);
    let info = if region.is_null() {
        None
    } else {
        let copy = *region;
        inner.delete(region);
        Some(copy)
    };
    REGIONS.lock.unlock();
    info
}

/// Allocate a guarded large region and register it.
pub unsafe fn allocate_large(size: usize) -> *mut u8 {
    let guard_size = draw_guard_size(size);

    let p = pages::alloc_pages(size, guard_size, true);
    if p.is_null() {
        return ptr::null_mut();
    }

    if !register(p, size, guard_size) {
        pages::free_pages(p, size, guard_size);
        return ptr::null_mut();
    }
    p
}

/// Free a large region. Unknown pointers are fatal: they are either a heap
/// attack or a bug that would otherwise corrupt another allocator's state.
pub unsafe fn deallocate_large(p: *mut u8, expected_size: Option<usize>) {
    root::enforce_init();

    let region = match take_checked(p, expected_size) {
        Some(r) => r,
        None => fatal("invalid free"),
    };
    pages::free_pages(p, region.size, region.guard_size);
}

unsafe fn take_checked(p: *mut u8, expected_size: Option<usize>) -> Option<RegionInfo> {
    REGIONS.lock.lock();
    let inner = &mut *REGIONS.inner.get();
    let region = inner.find(p);
    if region.is_null() {
        REGIONS.lock.unlock();
        return None;
    }
    if let Some(expected) = expected_size {
        if (*region).size != expected {
            fatal("sized deallocation mismatch");
        }
    }
    let copy = *region;
    inner.delete(region);
    REGIONS.lock.unlock();
    Some(copy)
}

// ---------------------------------------------------------------------------
// Init and fork support
// ---------------------------------------------------------------------------

/// Seed the registry PRNG, reserve both table buffers at the maximum size
/// and commit the first at the initial size.
///
/// # Safety
/// Single-threaded init only.
pub(crate) unsafe fn init_tables() {
    let inner = &mut *REGIONS.inner.get();
    inner.rng.init();

    let root = root::ro_mut();
    for table in &mut (*root).region_tables {
        let buffer = pages::alloc_pages(
            MAX_REGION_TABLE_SIZE * core::mem::size_of::<RegionInfo>(),
            PAGE_SIZE,
            false,
        ) as *mut RegionInfo;
        if buffer.is_null() {
            fatal("failed to reserve memory for regions table");
        }
        *table = buffer;
    }

    inner.regions = (*root).region_tables[0];
    if !platform::protect_rw(
        inner.regions as *mut u8,
        inner.total * core::mem::size_of::<RegionInfo>(),
    ) {
        fatal("failed to unprotect memory for regions table");
    }
}

/// The registry PRNG, shared with init for the per-class stripe gap draws.
///
/// # Safety
/// Single-threaded init only; everyone else goes through the locked entry
/// points.
pub(crate) unsafe fn rng_for_init() -> &'static mut RandomState {
    &mut (*REGIONS.inner.get()).rng
}

pub(crate) fn lock() {
    REGIONS.lock.lock();
}

pub(crate) fn unlock() {
    REGIONS.lock.unlock();
}

/// # Safety
/// Single-threaded post-fork child only.
pub(crate) unsafe fn reinit_after_fork() {
    REGIONS.lock.reset();
    (*REGIONS.inner.get()).rng.init();
}

#[cfg(test)]
mod tests {
    use super::*;

    // A standalone inner table over heap storage; grow is never triggered
    // (the test stays under the 25% load threshold).
    fn make_inner(total: usize) -> (RegionsInner, Vec<RegionInfo>) {
        let mut storage = vec![RegionInfo::empty(); total];
        let mut rng = RandomState::zeroed();
        rng.init();
        (
            RegionsInner {
                regions: storage.as_mut_ptr(),
                total,
                free: total,
                rng,
            },
            storage,
        )
    }

    fn key(i: usize) -> *mut u8 {
        // Page-aligned fake pointers, the same shape real regions have.
        ((i + 1) * PAGE_SIZE * 7) as *mut u8
    }

    #[test]
    fn insert_then_find() {
        let (mut inner, _storage) = make_inner(1024);
        unsafe {
            for i in 0..200 {
                assert!(inner.insert(key(i), i * PAGE_SIZE, PAGE_SIZE));
            }
            for i in 0..200 {
                let region = inner.find(key(i));
                assert!(!region.is_null(), "key {} not findable", i);
                assert_eq!((*region).size, i * PAGE_SIZE);
            }
            assert!(inner.find(key(1000)).is_null());
        }
    }

    #[test]
    fn delete_keeps_probe_chains_intact() {
        let (mut inner, _storage) = make_inner(1024);
        unsafe {
            for i in 0..200 {
                assert!(inner.insert(key(i), i, 0));
            }
            // Delete every third entry, then verify the rest still resolve.
            for i in (0..200).step_by(3) {
                let region = inner.find(key(i));
                assert!(!region.is_null());
                inner.delete(region);
            }
            for i in 0..200 {
                let region = inner.find(key(i));
                if i % 3 == 0 {
                    assert!(region.is_null(), "deleted key {} still present", i);
                } else {
                    assert!(!region.is_null(), "key {} lost after deletions", i);
                    assert_eq!((*region).size, i);
                }
            }
        }
    }

    #[test]
    fn reinsert_after_delete() {
        let (mut inner, _storage) = make_inner(256);
        unsafe {
            for round in 0..8 {
                for i in 0..32 {
                    assert!(inner.insert(key(i), round * 100 + i, 0));
                }
                for i in 0..32 {
                    let region = inner.find(key(i));
                    assert!(!region.is_null());
                    assert_eq!((*region).size, round * 100 + i);
                    inner.delete(region);
                }
            }
            assert_eq!(inner.free, 256);
        }
    }

    #[test]
    fn table_never_holds_duplicate_keys() {
        let (mut inner, storage) = make_inner(512);
        unsafe {
            for i in 0..64 {
                assert!(inner.insert(key(i), i, 0));
            }
            for i in (0..64).step_by(2) {
                let region = inner.find(key(i));
                inner.delete(region);
                assert!(inner.insert(key(i), i + 1000, 0));
            }
            for i in 0..64 {
                let occurrences = storage.iter().filter(|e| e.p == key(i)).count();
                assert_eq!(occurrences, 1, "key {} appears {} times", i, occurrences);
            }
        }
    }
}
