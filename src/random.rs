// random.rs — Small seedable PRNG (Mulberry32).
//
// Used where a node needs randomness that tests can pin down, such as the
// keypoint shuffler. Not cryptographic.

/// Mulberry32 generator. The same seed always yields the same sequence.
#[derive(Debug, Clone)]
pub struct Random {
    state: u32,
}

impl Random {
    pub fn new(seed: u32) -> Self {
        Random { state: seed ^ 0xCAFE_1337 }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_add(0x6D2B_79F5);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        t ^ (t >> 14)
    }

    /// Uniform in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        self.next_u32() as f64 / 4_294_967_296.0
    }

    /// Uniform in [0, n). Returns 0 for n = 0.
    pub fn next_below(&mut self, n: usize) -> usize {
        ((self.next_f64() * n as f64) as usize).min(n.saturating_sub(1))
    }

    /// Fisher–Yates shuffle of 0..n.
    pub fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut p: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = self.next_below(i + 1);
            p.swap(i, j);
        }
        p
    }
}
