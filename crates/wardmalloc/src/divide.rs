//! Precomputed magic-multiply division.
//!
//! The hot deallocation path maps a pointer to its slab index and slot index
//! with two divisions by per-class constants. A hardware divide costs ~25
//! cycles; a widening multiply by a precomputed reciprocal costs ~4 and is
//! branch-free.

/// Division by a fixed divisor via the round-up reciprocal method:
/// `magic = floor(2^64 / d) + 1`, quotient = high word of `n * magic`.
///
/// Exact whenever `n * d < 2^64`. The divisors used here are object sizes
/// (<= 16384) and slab sizes (<= 64 KiB) against dividends bounded by the
/// 128 GiB class region, so the product never comes close to overflowing.
#[derive(Clone, Copy)]
pub struct Divider {
    magic: u64,
}

impl Divider {
    /// Placeholder used in const-initialized state before init runs.
    pub const fn unset() -> Self {
        Divider { magic: 0 }
    }

    pub fn new(divisor: u64) -> Self {
        debug_assert!(divisor >= 2);
        Divider {
            magic: (u64::MAX / divisor) + 1,
        }
    }

    #[inline(always)]
    pub fn divide(&self, n: u64) -> u64 {
        (((n as u128) * (self.magic as u128)) >> 64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::size_class::{get_slab_size, SIZE_CLASSES, SIZE_CLASS_SLOTS};

    #[test]
    fn matches_hardware_division_for_class_sizes() {
        for class in 0..SIZE_CLASSES.len() {
            let size = match SIZE_CLASSES[class] {
                0 => 16u64,
                s => s as u64,
            };
            let slots = SIZE_CLASS_SLOTS[class] as usize;
            let slab_size = get_slab_size(slots, size as usize) as u64;

            let size_div = Divider::new(size);
            let slab_div = Divider::new(slab_size);

            // Offsets within a slab for the slot divisor.
            for n in (0..slab_size).step_by(7).chain([0, slab_size - 1]) {
                assert_eq!(size_div.divide(n), n / size, "n={} d={}", n, size);
            }

            // Offsets within the class region for the slab divisor,
            // including the far end of the 128 GiB range.
            let class_region: u64 = 128 << 30;
            for n in [
                0,
                slab_size - 1,
                slab_size,
                slab_size + 1,
                slab_size * 1000 + 13,
                class_region - 1,
            ] {
                assert_eq!(slab_div.divide(n), n / slab_size, "n={} d={}", n, slab_size);
            }
        }
    }

    #[test]
    fn power_of_two_divisors() {
        for shift in 4..17 {
            let d = 1u64 << shift;
            let div = Divider::new(d);
            for n in [0, 1, d - 1, d, d + 1, d * 31 + 5, (1 << 37) - 1] {
                assert_eq!(div.divide(n), n / d);
            }
        }
    }
}
