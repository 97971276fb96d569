use anyhow::{Result, bail};

/// log2 bits per block: 512 bits, the size of a cache line.
pub const BLOCK_SHIFT: u32 = 9;
const BLOCK_MASK: u64 = (1 << BLOCK_SHIFT) - 1;
const WORDS_PER_BLOCK: usize = 1 << (BLOCK_SHIFT - 6);

#[derive(Clone)]
#[repr(align(64))]
struct Block([u64; WORDS_PER_BLOCK]);

/// Blocked Bloom filter: `2^n_shift` bits addressed in cache-line blocks.
/// Every probe sequence for a key stays inside one block. Bits are only ever
/// set; the filter is monotonic for its lifetime.
pub struct BlockedBloom {
    n_shift: u32,
    n_hashes: u32,
    blocks: Vec<Block>,
}

impl BlockedBloom {
    pub fn new(n_shift: u32, n_hashes: u32) -> Result<Self> {
        if n_shift < BLOCK_SHIFT || n_shift + BLOCK_SHIFT > 64 {
            bail!(
                "bloom filter width 2^{} out of range (must be between 2^{} and 2^{})",
                n_shift,
                BLOCK_SHIFT,
                64 - BLOCK_SHIFT
            );
        }
        if n_hashes == 0 || n_hashes as u64 > BLOCK_MASK {
            bail!("bloom filter hash count {} out of range", n_hashes);
        }
        let n_blocks = 1usize << (n_shift - BLOCK_SHIFT);
        Ok(Self {
            n_shift,
            n_hashes,
            blocks: vec![Block([0; WORDS_PER_BLOCK]); n_blocks],
        })
    }

    pub fn n_hashes(&self) -> u32 {
        self.n_hashes
    }

    /// Sets the `n_hashes` probe bits for `hash` and returns how many of
    /// them were already set. A return value of `n_hashes` means every
    /// probed bit was set before this call: the key (barring block-level
    /// collisions) has been inserted at least once already.
    pub fn insert(&mut self, hash: u64) -> u32 {
        let block_bits = self.n_shift - BLOCK_SHIFT;
        let block = (hash & ((1u64 << block_bits) - 1)) as usize;
        let h1 = hash >> block_bits & BLOCK_MASK;
        let mut h2 = hash >> self.n_shift & BLOCK_MASK;
        if h2 & 31 == 0 {
            h2 = (h2 + 1) & BLOCK_MASK; // otherwise a few bits would repeat
        }
        let words = &mut self.blocks[block].0;
        let mut z = h1;
        let mut already_set = 0;
        for _ in 0..self.n_hashes {
            let word = &mut words[(z >> 6) as usize];
            let bit = 1u64 << (z & 63);
            already_set += (*word & bit != 0) as u32;
            *word |= bit;
            z = (z + h2) & BLOCK_MASK;
        }
        already_set
    }
}
