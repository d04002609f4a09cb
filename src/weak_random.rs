/// Cheap xorshift generator. Used where a thread-safe CSPRNG would be
/// overkill, like choosing probe positions in the zone registry.
pub struct WeakRandom {
    seed: u64,
    low: u64,
    high: u64,
}

impl WeakRandom {
    fn advance(&mut self) -> u64 {
        let x = self.low;
        let y = self.high;
        self.low = y;
        self.high = Self::next_state(x, y);
        self.high.wrapping_add(self.low)
    }

    pub fn next_state(mut x: u64, y: u64) -> u64 {
        x ^= x << 23;
        x ^= x >> 17;
        x ^= y ^ (y >> 26);
        x
    }

    pub fn get_u64(&mut self) -> u64 {
        self.advance()
    }

    /// Uniform-ish index in `0..bound`. `bound` must be non-zero.
    pub fn get_below(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        (self.advance() % bound as u64) as usize
    }

    pub fn new(seed: Option<u64>) -> Self {
        let mut this = Self {
            seed: 0,
            high: 0,
            low: 0,
        };
        this.set_seed(seed.unwrap_or_else(rand::random));

        this
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn set_seed(&mut self, mut seed: u64) {
        self.seed = seed;

        if seed == 0 {
            seed = 1;
        }

        self.low = seed;
        self.high = seed;
        self.advance();
    }
}
