//! Small-object slab engine.
//!
//! Each size class owns a 256 GiB stripe of one huge reserved region; the
//! usable 128 GiB window starts at a random page gap inside the stripe.
//! Slab occupancy lives in out-of-band metadata records, never next to user
//! data. A slab is on exactly one of three lists: partial (doubly-linked,
//! has both live and free slots), empty (committed pages, no live slots) or
//! free (pages returned to the OS, reservation kept).

pub mod size_class;

use crate::divide::Divider;
use crate::pages;
use crate::platform;
use crate::random::RandomState;
use crate::root;
use crate::sync::RawMutex;
use crate::util::{fatal, set_errno, CANARY_MASK, CANARY_SIZE, PAGE_SIZE};
use core::cell::UnsafeCell;
use core::ptr;
use self::size_class::{get_size_info, get_slab_size, N_SIZE_CLASSES, SIZE_CLASSES, SIZE_CLASS_SLOTS};

/// Out-of-band record for one slab. Intrusive links: `next`/`prev` in the
/// partial list, `next` alone in the empty and free lists.
#[repr(C)]
pub struct SlabMeta {
    bitmap: u64,
    next: *mut SlabMeta,
    prev: *mut SlabMeta,
    canary_value: u64,
}

/// Usable window per class.
pub const CLASS_REGION_SIZE: usize = 128 << 30;
/// Stripe per class: usable window plus an equal reserved-only span.
pub const REAL_CLASS_REGION_SIZE: usize = CLASS_REGION_SIZE * 2;
pub const SLAB_REGION_SIZE: usize = REAL_CLASS_REGION_SIZE * N_SIZE_CLASSES;

/// Committed empty-slab bytes cached per class before purging to the free
/// list instead.
const MAX_EMPTY_SLABS_TOTAL: usize = 64 * 1024;

struct ClassInner {
    class_region_start: *mut u8,
    slab_info: *mut SlabMeta,

    // slabs with at least one allocated slot and at least one free slot
    // (LIFO doubly-linked)
    partial_slabs: *mut SlabMeta,

    // slabs without allocated slots, pages still committed (LIFO singly-linked)
    empty_slabs: *mut SlabMeta,
    empty_slabs_total: usize, // length * slab_size

    // slabs without allocated slots, pages purged and reservation kept
    // (FIFO singly-linked)
    free_slabs_head: *mut SlabMeta,
    free_slabs_tail: *mut SlabMeta,

    size_divisor: Divider,
    slab_size_divisor: Divider,
    rng: RandomState,
    metadata_allocated: usize,
    metadata_count: usize,
}

#[repr(C, align(64))]
struct SizeClassState {
    lock: RawMutex,
    inner: UnsafeCell<ClassInner>,
}

unsafe impl Send for SizeClassState {}
unsafe impl Sync for SizeClassState {}

impl SizeClassState {
    const fn new() -> Self {
        SizeClassState {
            lock: RawMutex::new(),
            inner: UnsafeCell::new(ClassInner {
                class_region_start: ptr::null_mut(),
                slab_info: ptr::null_mut(),
                partial_slabs: ptr::null_mut(),
                empty_slabs: ptr::null_mut(),
                empty_slabs_total: 0,
                free_slabs_head: ptr::null_mut(),
                free_slabs_tail: ptr::null_mut(),
                size_divisor: Divider::unset(),
                slab_size_divisor: Divider::unset(),
                rng: RandomState::zeroed(),
                metadata_allocated: 0,
                metadata_count: 0,
            }),
        }
    }
}

static CLASSES: [SizeClassState; N_SIZE_CLASSES] = {
    const EMPTY: SizeClassState = SizeClassState::new();
    [EMPTY; N_SIZE_CLASSES]
};

// ---------------------------------------------------------------------------
// Bitmap helpers
// ---------------------------------------------------------------------------

fn check_index(index: usize) {
    if index >= 64 {
        fatal("invalid index");
    }
}

fn set_slot(metadata: &mut SlabMeta, index: usize) {
    check_index(index);
    metadata.bitmap |= 1u64 << index;
}

fn clear_slot(metadata: &mut SlabMeta, index: usize) {
    check_index(index);
    metadata.bitmap &= !(1u64 << index);
}

fn get_slot(metadata: &SlabMeta, index: usize) -> bool {
    check_index(index);
    (metadata.bitmap >> index) & 1 != 0
}

fn get_mask(slots: usize) -> u64 {
    if slots < 64 {
        !0u64 << slots
    } else {
        0
    }
}

fn get_free_slot(rng: &mut RandomState, slots: usize, metadata: &SlabMeta) -> usize {
    let slots = slots.min(64);
    let masked = metadata.bitmap | get_mask(slots);
    if masked == u64::MAX {
        fatal("no zero bits");
    }

    #[cfg(feature = "slot-randomize")]
    {
        // Randomize the start of the linear search; a uniform choice over
        // the free slots would cost a full scan per allocation.
        let split = rng.get_u16_uniform(slots as u16);
        let random_split = !(!0u64 << split);
        let candidate = masked | random_split;
        if candidate != u64::MAX {
            return (!candidate).trailing_zeros() as usize;
        }
    }
    #[cfg(not(feature = "slot-randomize"))]
    let _ = rng;

    (!masked).trailing_zeros() as usize
}

fn has_free_slots(slots: usize, metadata: &SlabMeta) -> bool {
    let slots = slots.min(64);
    (metadata.bitmap | get_mask(slots)) != u64::MAX
}

fn is_free_slab(metadata: &SlabMeta) -> bool {
    metadata.bitmap == 0
}

// ---------------------------------------------------------------------------
// Hardening checks
// ---------------------------------------------------------------------------

#[allow(unused_variables)]
unsafe fn write_after_free_check(p: *mut u8, size: usize) {
    #[cfg(feature = "write-after-free-check")]
    {
        let mut i = 0;
        while i < size {
            if (p.add(i) as *const u64).read_unaligned() != 0 {
                fatal("detected write after free");
            }
            i += core::mem::size_of::<u64>();
        }
    }
}

#[allow(unused_variables)]
unsafe fn set_canary(metadata: &SlabMeta, p: *mut u8, size: usize) {
    #[cfg(feature = "canaries")]
    (p.add(size - CANARY_SIZE) as *mut u64).write_unaligned(metadata.canary_value);
}

fn draw_canary(rng: &mut RandomState) -> u64 {
    rng.get_u64() & CANARY_MASK
}

// ---------------------------------------------------------------------------
// Per-class engine
// ---------------------------------------------------------------------------

impl ClassInner {
    unsafe fn slab_for(&self, slab_size: usize, metadata: *mut SlabMeta) -> *mut u8 {
        let index = metadata.offset_from(self.slab_info) as usize;
        self.class_region_start.add(index * slab_size)
    }

    unsafe fn metadata_for(&self, p: *mut u8) -> *mut SlabMeta {
        // Wild frees below the class window wrap to a huge offset and are
        // rejected by the high-water check.
        let offset = (p as usize).wrapping_sub(self.class_region_start as usize) as u64;
        let index = self.slab_size_divisor.divide(offset) as usize;
        // Catches frees into slabs that were never handed out; anything past
        // the high-water mark has no live allocation by construction.
        if index >= self.metadata_count {
            fatal("invalid free within a slab yet to be used");
        }
        self.slab_info.add(index)
    }

    unsafe fn alloc_metadata(&mut self, slab_size: usize, non_zero_size: bool) -> *mut SlabMeta {
        if self.metadata_count >= self.metadata_allocated {
            let metadata_max = CLASS_REGION_SIZE / slab_size;
            if self.metadata_count >= metadata_max {
                set_errno(libc::ENOMEM);
                return ptr::null_mut();
            }
            let mut allocate = self.metadata_allocated * 2;
            if allocate > metadata_max {
                allocate = metadata_max;
            }
            if !platform::protect_rw(
                self.slab_info as *mut u8,
                allocate * core::mem::size_of::<SlabMeta>(),
            ) {
                return ptr::null_mut();
            }
            self.metadata_allocated = allocate;
        }

        let metadata = self.slab_info.add(self.metadata_count);
        let slab = self.slab_for(slab_size, metadata);
        if non_zero_size && !platform::protect_rw(slab, slab_size) {
            return ptr::null_mut();
        }
        self.metadata_count += 1;
        if cfg!(feature = "guard-slabs") {
            self.metadata_count += 1;
        }
        metadata
    }
}

fn enqueue_free_slab(c: &mut ClassInner, metadata: *mut SlabMeta) {
    unsafe {
        (*metadata).next = ptr::null_mut();
        if !c.free_slabs_tail.is_null() {
            (*c.free_slabs_tail).next = metadata;
        } else {
            c.free_slabs_head = metadata;
        }
        c.free_slabs_tail = metadata;
    }
}

pub fn allocate_small(requested_size: usize) -> *mut u8 {
    let info = get_size_info(requested_size);
    let size = if info.size != 0 { info.size } else { 16 };
    let state = &CLASSES[info.class];
    let slots = SIZE_CLASS_SLOTS[info.class] as usize;
    let slab_size = get_slab_size(slots, size);

    state.lock.lock();
    let p = unsafe {
        allocate_small_locked(
            &mut *state.inner.get(),
            requested_size,
            size,
            slots,
            slab_size,
        )
    };
    state.lock.unlock();
    p
}

unsafe fn allocate_small_locked(
    c: &mut ClassInner,
    requested_size: usize,
    size: usize,
    slots: usize,
    slab_size: usize,
) -> *mut u8 {
    if c.partial_slabs.is_null() {
        if !c.empty_slabs.is_null() {
            // Committed pages ready for reuse.
            let metadata = c.empty_slabs;
            c.empty_slabs = (*metadata).next;
            c.empty_slabs_total -= slab_size;

            (*metadata).next = ptr::null_mut();
            (*metadata).prev = ptr::null_mut();
            c.partial_slabs = metadata;

            let slab = c.slab_for(slab_size, metadata);
            let slot = get_free_slot(&mut c.rng, slots, &*metadata);
            set_slot(&mut *metadata, slot);
            let p = slab.add(slot * size);
            if requested_size != 0 {
                write_after_free_check(p, size - CANARY_SIZE);
                set_canary(&*metadata, p, size);
            }
            return p;
        } else if !c.free_slabs_head.is_null() {
            // Purged slab: pages must be recommitted, canary redrawn since
            // the old value may have been leaked before the purge.
            let metadata = c.free_slabs_head;
            (*metadata).canary_value = draw_canary(&mut c.rng);

            let slab = c.slab_for(slab_size, metadata);
            if requested_size != 0 && !platform::protect_rw(slab, slab_size) {
                return ptr::null_mut();
            }

            c.free_slabs_head = (*metadata).next;
            if c.free_slabs_head.is_null() {
                c.free_slabs_tail = ptr::null_mut();
            }

            (*metadata).next = ptr::null_mut();
            (*metadata).prev = ptr::null_mut();
            c.partial_slabs = metadata;

            let slot = get_free_slot(&mut c.rng, slots, &*metadata);
            set_slot(&mut *metadata, slot);
            let p = slab.add(slot * size);
            if requested_size != 0 {
                set_canary(&*metadata, p, size);
            }
            return p;
        }

        let metadata = c.alloc_metadata(slab_size, requested_size != 0);
        if metadata.is_null() {
            return ptr::null_mut();
        }
        (*metadata).canary_value = draw_canary(&mut c.rng);

        c.partial_slabs = metadata;
        let slab = c.slab_for(slab_size, metadata);
        let slot = get_free_slot(&mut c.rng, slots, &*metadata);
        set_slot(&mut *metadata, slot);
        let p = slab.add(slot * size);
        if requested_size != 0 {
            set_canary(&*metadata, p, size);
        }
        return p;
    }

    let metadata = c.partial_slabs;
    let slot = get_free_slot(&mut c.rng, slots, &*metadata);
    set_slot(&mut *metadata, slot);

    if !has_free_slots(slots, &*metadata) {
        c.partial_slabs = (*metadata).next;
        if !c.partial_slabs.is_null() {
            (*c.partial_slabs).prev = ptr::null_mut();
        }
    }

    let slab = c.slab_for(slab_size, metadata);
    let p = slab.add(slot * size);
    if requested_size != 0 {
        write_after_free_check(p, size - CANARY_SIZE);
        set_canary(&*metadata, p, size);
    }
    p
}

/// Class index of a pointer inside the slab region, from its stripe.
pub fn slab_size_class(p: *mut u8) -> usize {
    let offset = p as usize - root::ro().slab_region_start as usize;
    offset / REAL_CLASS_REGION_SIZE
}

pub fn slab_usable_size(p: *mut u8) -> usize {
    SIZE_CLASSES[slab_size_class(p)] as usize
}

/// # Safety
/// `p` must lie inside the slab region.
pub unsafe fn deallocate_small(p: *mut u8, expected_size: Option<usize>) {
    let class = slab_size_class(p);
    let state = &CLASSES[class];
    let size = SIZE_CLASSES[class] as usize;
    if let Some(expected) = expected_size {
        if size != expected {
            fatal("sized deallocation mismatch");
        }
    }
    let is_zero_size = size == 0;
    let size = if is_zero_size { 16 } else { size };
    let slots = SIZE_CLASS_SLOTS[class] as usize;
    let slab_size = get_slab_size(slots, size);

    state.lock.lock();
    deallocate_small_locked(
        &mut *state.inner.get(),
        p,
        size,
        is_zero_size,
        slots,
        slab_size,
    );
    state.lock.unlock();
}

unsafe fn deallocate_small_locked(
    c: &mut ClassInner,
    p: *mut u8,
    size: usize,
    is_zero_size: bool,
    slots: usize,
    slab_size: usize,
) {
    let metadata = c.metadata_for(p);
    let slab = c.slab_for(slab_size, metadata);
    let slot = c.size_divisor.divide((p as usize - slab as usize) as u64) as usize;

    if slab.add(slot * size) != p {
        fatal("invalid unaligned free");
    }

    if !get_slot(&*metadata, slot) {
        fatal("double free");
    }

    if !is_zero_size {
        #[cfg(feature = "zero-on-free")]
        ptr::write_bytes(p, 0, size - CANARY_SIZE);

        #[cfg(feature = "canaries")]
        {
            let canary_value = (p.add(size - CANARY_SIZE) as *const u64).read_unaligned();
            if canary_value != (*metadata).canary_value {
                fatal("canary corrupted");
            }
        }
    }

    if !has_free_slots(slots, &*metadata) {
        // The slab was full and detached; reattach to the partial list.
        (*metadata).next = c.partial_slabs;
        (*metadata).prev = ptr::null_mut();
        if !c.partial_slabs.is_null() {
            (*c.partial_slabs).prev = metadata;
        }
        c.partial_slabs = metadata;
    }

    clear_slot(&mut *metadata, slot);

    if is_free_slab(&*metadata) {
        if !(*metadata).prev.is_null() {
            (*(*metadata).prev).next = (*metadata).next;
        } else {
            c.partial_slabs = (*metadata).next;
        }
        if !(*metadata).next.is_null() {
            (*(*metadata).next).prev = (*metadata).prev;
        }
        (*metadata).prev = ptr::null_mut();

        if c.empty_slabs_total + slab_size > MAX_EMPTY_SLABS_TOTAL {
            if platform::map_fixed(slab, slab_size) {
                enqueue_free_slab(c, metadata);
                return;
            }
            // Purge failed (out of memory): keep the pages on the empty list.
        }

        (*metadata).next = c.empty_slabs;
        c.empty_slabs = metadata;
        c.empty_slabs_total += slab_size;
    }
}

/// Purge every cached empty slab back to the OS, keeping reservations.
/// Returns true if anything was released.
pub fn trim() -> bool {
    let mut trimmed = false;

    // Class 0 owns no committed pages, nothing to release there.
    for class in 1..N_SIZE_CLASSES {
        let state = &CLASSES[class];
        let slab_size = get_slab_size(
            SIZE_CLASS_SLOTS[class] as usize,
            SIZE_CLASSES[class] as usize,
        );

        state.lock.lock();
        unsafe {
            let c = &mut *state.inner.get();
            let mut iterator = c.empty_slabs;
            while !iterator.is_null() {
                let slab = c.slab_for(slab_size, iterator);
                if !platform::map_fixed(slab, slab_size) {
                    break;
                }

                let purged = iterator;
                iterator = (*iterator).next;
                c.empty_slabs_total -= slab_size;

                enqueue_free_slab(c, purged);
                trimmed = true;
            }
            c.empty_slabs = iterator;
        }
        state.lock.unlock();
    }

    trimmed
}

// ---------------------------------------------------------------------------
// Init and fork support
// ---------------------------------------------------------------------------

/// Set up every class: seed its PRNG, pick the random stripe gap, compute
/// divisors and reserve the metadata array.
///
/// # Safety
/// Single-threaded init only, after the slab region has been reserved.
pub(crate) unsafe fn init_classes(gap_rng: &mut RandomState) {
    let region_start = root::ro().slab_region_start;

    for (class, state) in CLASSES.iter().enumerate() {
        let c = &mut *state.inner.get();
        c.rng.init();

        let bound = ((REAL_CLASS_REGION_SIZE - CLASS_REGION_SIZE) / PAGE_SIZE - 1) as u64;
        let gap = (gap_rng.get_u64_uniform(bound) + 1) as usize * PAGE_SIZE;
        c.class_region_start = region_start.add(REAL_CLASS_REGION_SIZE * class + gap);

        let size = match SIZE_CLASSES[class] as usize {
            0 => 16,
            s => s,
        };
        c.size_divisor = Divider::new(size as u64);
        let slab_size = get_slab_size(SIZE_CLASS_SLOTS[class] as usize, size);
        c.slab_size_divisor = Divider::new(slab_size as u64);

        let metadata_max = CLASS_REGION_SIZE / slab_size;
        c.slab_info = pages::alloc_pages(
            metadata_max * core::mem::size_of::<SlabMeta>(),
            PAGE_SIZE,
            false,
        ) as *mut SlabMeta;
        if c.slab_info.is_null() {
            fatal("failed to reserve slab metadata");
        }
        c.metadata_allocated = PAGE_SIZE / core::mem::size_of::<SlabMeta>();
        if !platform::protect_rw(
            c.slab_info as *mut u8,
            c.metadata_allocated * core::mem::size_of::<SlabMeta>(),
        ) {
            fatal("failed to commit initial slab metadata");
        }
    }
}

pub(crate) fn lock_all() {
    for state in &CLASSES {
        state.lock.lock();
    }
}

pub(crate) fn unlock_all() {
    for state in &CLASSES {
        state.lock.unlock();
    }
}

/// # Safety
/// Single-threaded post-fork child only.
pub(crate) unsafe fn reinit_after_fork() {
    for state in &CLASSES {
        state.lock.reset();
        (*state.inner.get()).rng.init();
    }
}

// ---------------------------------------------------------------------------
// Introspection for the lifecycle tests
// ---------------------------------------------------------------------------

#[doc(hidden)]
#[derive(Clone, Copy, Default, Debug)]
pub struct ClassStats {
    pub metadata_count: usize,
    pub partial_slabs: usize,
    pub empty_slabs: usize,
    pub free_slabs: usize,
    pub live_slots: usize,
    pub empty_slabs_total: usize,
}

#[doc(hidden)]
pub fn class_stats(class: usize) -> ClassStats {
    let state = &CLASSES[class];
    state.lock.lock();
    let stats = unsafe {
        let c = &*state.inner.get();
        let mut stats = ClassStats {
            metadata_count: c.metadata_count,
            empty_slabs_total: c.empty_slabs_total,
            ..Default::default()
        };
        let mut node = c.partial_slabs;
        while !node.is_null() {
            stats.partial_slabs += 1;
            node = (*node).next;
        }
        let mut node = c.empty_slabs;
        while !node.is_null() {
            stats.empty_slabs += 1;
            node = (*node).next;
        }
        let mut node = c.free_slabs_head;
        while !node.is_null() {
            stats.free_slabs += 1;
            node = (*node).next;
        }
        for i in 0..c.metadata_count {
            stats.live_slots += (*c.slab_info.add(i)).bitmap.count_ones() as usize;
        }
        stats
    };
    state.lock.unlock();
    stats
}
