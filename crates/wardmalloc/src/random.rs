//! ChaCha8-backed per-state CSPRNG.
//!
//! Every size class and the region registry carry their own state, each
//! seeded independently from OS entropy. Draws are served from a keystream
//! cache; the cipher is re-keyed from the OS after a fixed output budget so
//! a leaked state does not compromise past or distant-future placement.

use crate::platform;

const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 8;
const CACHE_SIZE: usize = 256;
const RESEED_AFTER: usize = 256 * 1024;

const SIGMA: [u32; 4] = [0x6170_7865, 0x3320_646e, 0x7962_2d32, 0x6b20_6574];

/// ChaCha block function with 8 rounds.
struct ChaCha {
    input: [u32; 16],
}

#[inline(always)]
fn quarter_round(x: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    x[a] = x[a].wrapping_add(x[b]);
    x[d] = (x[d] ^ x[a]).rotate_left(16);
    x[c] = x[c].wrapping_add(x[d]);
    x[b] = (x[b] ^ x[c]).rotate_left(12);
    x[a] = x[a].wrapping_add(x[b]);
    x[d] = (x[d] ^ x[a]).rotate_left(8);
    x[c] = x[c].wrapping_add(x[d]);
    x[b] = (x[b] ^ x[c]).rotate_left(7);
}

impl ChaCha {
    const fn zeroed() -> Self {
        ChaCha { input: [0; 16] }
    }

    fn keysetup(&mut self, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) {
        self.input[0..4].copy_from_slice(&SIGMA);
        for i in 0..8 {
            self.input[4 + i] =
                u32::from_le_bytes([key[i * 4], key[i * 4 + 1], key[i * 4 + 2], key[i * 4 + 3]]);
        }
        // Block counter starts at zero.
        self.input[12] = 0;
        self.input[13] = 0;
        self.input[14] = u32::from_le_bytes([iv[0], iv[1], iv[2], iv[3]]);
        self.input[15] = u32::from_le_bytes([iv[4], iv[5], iv[6], iv[7]]);
    }

    /// Write keystream into `out`, whose length must be a multiple of 64.
    fn keystream(&mut self, out: &mut [u8]) {
        debug_assert!(out.len() % 64 == 0);
        for block in out.chunks_exact_mut(64) {
            let mut x = self.input;
            for _ in 0..4 {
                quarter_round(&mut x, 0, 4, 8, 12);
                quarter_round(&mut x, 1, 5, 9, 13);
                quarter_round(&mut x, 2, 6, 10, 14);
                quarter_round(&mut x, 3, 7, 11, 15);
                quarter_round(&mut x, 0, 5, 10, 15);
                quarter_round(&mut x, 1, 6, 11, 12);
                quarter_round(&mut x, 2, 7, 8, 13);
                quarter_round(&mut x, 3, 4, 9, 14);
            }
            for i in 0..16 {
                let word = x[i].wrapping_add(self.input[i]);
                block[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
            }
            self.input[12] = self.input[12].wrapping_add(1);
            if self.input[12] == 0 {
                self.input[13] = self.input[13].wrapping_add(1);
            }
        }
    }
}

pub struct RandomState {
    cipher: ChaCha,
    cache: [u8; CACHE_SIZE],
    index: usize,
    output_since_reseed: usize,
}

impl RandomState {
    /// Const-initializable placeholder; `init` must run before any draw.
    pub const fn zeroed() -> Self {
        RandomState {
            cipher: ChaCha::zeroed(),
            cache: [0; CACHE_SIZE],
            index: CACHE_SIZE,
            output_since_reseed: 0,
        }
    }

    /// (Re)key from OS entropy and refill the cache.
    pub fn init(&mut self) {
        let mut seed = [0u8; KEY_SIZE + IV_SIZE];
        platform::get_entropy(&mut seed);
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        key.copy_from_slice(&seed[..KEY_SIZE]);
        iv.copy_from_slice(&seed[KEY_SIZE..]);
        self.cipher.keysetup(&key, &iv);
        self.output_since_reseed = 0;
        self.refill();
    }

    fn refill(&mut self) {
        if self.output_since_reseed >= RESEED_AFTER {
            self.init();
            return;
        }
        self.cipher.keystream(&mut self.cache);
        self.output_since_reseed += CACHE_SIZE;
        self.index = 0;
    }

    fn get_bytes(&mut self, out: &mut [u8]) {
        debug_assert!(out.len() <= CACHE_SIZE);
        if self.index + out.len() > CACHE_SIZE {
            self.refill();
        }
        out.copy_from_slice(&self.cache[self.index..self.index + out.len()]);
        self.index += out.len();
    }

    pub fn get_u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.get_bytes(&mut buf);
        u16::from_ne_bytes(buf)
    }

    pub fn get_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf);
        u64::from_ne_bytes(buf)
    }

    /// Uniform draw in `[0, bound)` by rejection sampling.
    pub fn get_u16_uniform(&mut self, bound: u16) -> u16 {
        if bound < 2 {
            return 0;
        }
        // Reject draws below 2^16 mod bound to remove modulo bias.
        let min = bound.wrapping_neg() % bound;
        loop {
            let r = self.get_u16();
            if r >= min {
                return r % bound;
            }
        }
    }

    /// Uniform draw in `[0, bound)` by rejection sampling.
    pub fn get_u64_uniform(&mut self, bound: u64) -> u64 {
        if bound < 2 {
            return 0;
        }
        let min = bound.wrapping_neg() % bound;
        loop {
            let r = self.get_u64();
            if r >= min {
                return r % bound;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_states_diverge() {
        let mut a = RandomState::zeroed();
        let mut b = RandomState::zeroed();
        a.init();
        b.init();
        // 128 bits of keystream from independently keyed states colliding
        // would indicate a broken seed path.
        let draws_a = [a.get_u64(), a.get_u64()];
        let draws_b = [b.get_u64(), b.get_u64()];
        assert_ne!(draws_a, draws_b);
    }

    #[test]
    fn uniform_respects_bound() {
        let mut state = RandomState::zeroed();
        state.init();
        for bound in [2u64, 3, 7, 64, 1000, 33_554_431] {
            for _ in 0..1000 {
                assert!(state.get_u64_uniform(bound) < bound);
            }
        }
        for bound in [2u16, 5, 51, 64, 256] {
            for _ in 0..1000 {
                assert!(state.get_u16_uniform(bound) < bound);
            }
        }
    }

    #[test]
    fn uniform_zero_and_one_bounds() {
        let mut state = RandomState::zeroed();
        state.init();
        assert_eq!(state.get_u64_uniform(0), 0);
        assert_eq!(state.get_u64_uniform(1), 0);
        assert_eq!(state.get_u16_uniform(0), 0);
        assert_eq!(state.get_u16_uniform(1), 0);
    }

    #[test]
    fn cache_refill_is_continuous() {
        let mut state = RandomState::zeroed();
        state.init();
        // Drain well past several cache refills.
        let mut last = state.get_u64();
        let mut all_equal = true;
        for _ in 0..(CACHE_SIZE * 4) {
            let next = state.get_u64();
            if next != last {
                all_equal = false;
            }
            last = next;
        }
        assert!(!all_equal, "keystream must not be constant across refills");
    }
}
