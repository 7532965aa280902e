use std::sync::atomic::{AtomicU64, Ordering};


/// The maximum height of nodes in a skipmap.
///
/// With [`node_height_from_bits`], one node is generated with this maximum height per
/// approximately one billion entries inserted into the map (on average).
pub(crate) const MAX_HEIGHT: usize = 16;

/// Fallback and stride for seeding; an arbitrary odd constant (the golden ratio in fixed
/// point), so consecutive default seeds are well spread over the seed space.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Seed source for maps constructed without an explicit seed, advanced once per map so that
/// distinct maps draw distinct height sequences.
static NEXT_SEED: AtomicU64 = AtomicU64::new(SEED_STRIDE);


/// Return a random value in `1..=MAX_HEIGHT`, in a geometric distribution (higher values are
/// exponentially less likely), decided by the low bits of `bits`.
///
/// The height is increased with probability `1/4` per level, consuming two bits of the draw
/// each time. Draws that would exceed `MAX_HEIGHT` are capped to it, making `MAX_HEIGHT`
/// slightly more likely than in an exact, unbounded geometric distribution.
pub(crate) const fn node_height_from_bits(mut bits: u64) -> usize {
    let mut height = 1;
    while height < MAX_HEIGHT && bits & 0b11 == 0 {
        height += 1;
        bits >>= 2;
    }
    height
}

/// A shared source of random node heights.
///
/// Concurrent inserters draw from one xorshift64 state advanced by compare-and-swap, so no
/// lock is needed; a failed swap means another thread advanced the state, and either result
/// is an equally good draw.
#[derive(Debug)]
pub(crate) struct HeightPrng {
    /// Never zero. Zero is the fixed point of xorshift.
    state: AtomicU64,
}

impl HeightPrng {
    /// Create a generator with a seed not shared by other generators made this way.
    pub(crate) fn new() -> Self {
        Self::with_seed(NEXT_SEED.fetch_add(SEED_STRIDE, Ordering::Relaxed))
    }

    /// Create a generator with the given seed. Equal seeds produce equal height sequences,
    /// as long as draws are not interleaved across threads.
    pub(crate) const fn with_seed(seed: u64) -> Self {
        let seed = if seed == 0 { SEED_STRIDE } else { seed };
        Self { state: AtomicU64::new(seed) }
    }

    /// Draw a node height in `1..=MAX_HEIGHT`; see [`node_height_from_bits`].
    pub(crate) fn next_height(&self) -> usize {
        node_height_from_bits(self.next_bits())
    }

    fn next_bits(&self) -> u64 {
        // The state orders nothing else; Relaxed is enough.
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            let new = xorshift64(old);
            match self
                .state
                .compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return new,
                Err(observed) => old = observed,
            }
        }
    }
}

#[inline]
const fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    if x == 0 { 1 } else { x }
}
