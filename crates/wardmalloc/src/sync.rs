use core::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const HELD: u32 = 1;
const HELD_WAITERS: u32 = 2;

/// Futex-backed mutex. `std::sync::Mutex` can allocate on its contention
/// paths, which is off-limits inside a malloc, so the allocator carries its
/// own three-state lock word: unlocked, held, and held-with-waiters. The
/// word doubles as the futex cell, and `reset` gives the post-fork child a
/// way to discard lock state inherited from threads that no longer exist.
pub struct RawMutex {
    word: AtomicU32,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn lock(&self) {
        if !self.try_acquire() {
            self.lock_contended();
        }
    }

    /// Contended path: advertise a waiter by swapping in HELD_WAITERS, and
    /// sleep until the holder releases. Acquiring through the same swap
    /// keeps the waiter marker sticky, so whoever wins still owes a wake
    /// at unlock even if it never actually slept.
    #[cold]
    fn lock_contended(&self) {
        while self.word.swap(HELD_WAITERS, Ordering::Acquire) != UNLOCKED {
            self.futex_wait(HELD_WAITERS);
        }
    }

    #[inline]
    pub fn unlock(&self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == HELD_WAITERS {
            self.futex_wake_one();
        }
    }

    fn futex_wait(&self, expected: u32) {
        #[cfg(target_os = "linux")]
        unsafe {
            // The kernel rechecks the word under its own lock, so a release
            // racing this call just turns it into an immediate return.
            libc::syscall(
                libc::SYS_futex,
                &self.word as *const AtomicU32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected as libc::c_int,
                core::ptr::null::<libc::timespec>(),
            );
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = expected;
            core::hint::spin_loop();
        }
    }

    #[cold]
    fn futex_wake_one(&self) {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.word as *const AtomicU32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1 as libc::c_int,
            );
        }
    }

    /// Force the lock word back to UNLOCKED.
    ///
    /// # Safety
    /// Only valid in the single-threaded post-fork child: the holder and
    /// any sleepers died with the parent's other threads, so there is
    /// nobody left to hand the lock to or to wake.
    pub unsafe fn reset(&self) {
        self.word.store(UNLOCKED, Ordering::Relaxed);
    }
}
