use crate::core::bloom::{BLOCK_SHIFT, BlockedBloom};
use crate::core::kmer::{self, MAX_KMER};
use crate::par;
use ahash::RandomState;
use anyhow::{Result, bail};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bloom prefilter sizing: `2^bits` bits across all shards, `n_hashes`
/// probes per key.
#[derive(Clone, Copy, Debug)]
pub struct BloomParams {
    pub bits: u32,
    pub n_hashes: u32,
}

/// One partition of the key space: an exact map from residual to saturating
/// counter, plus an optional Bloom prefilter gating entry creation. The
/// residual alone is the map key, so counter state never participates in
/// equality or hashing.
struct Shard {
    map: HashMap<u64, u16, RandomState>,
    bloom: Option<BlockedBloom>,
}

impl Shard {
    /// Processes one buffer of spread keys routed to this shard. With
    /// `create_if_absent`, unknown residuals gain an entry (Bloom-gated to
    /// the second sighting when a filter is present); without it, only
    /// existing entries are incremented. Returns the number of entries
    /// created.
    fn insert_list(
        &mut self,
        prefix_bits: u32,
        max_count: u16,
        create_if_absent: bool,
        keys: &[u64],
    ) -> u64 {
        let mut n_ins = 0u64;
        for &y in keys {
            let residual = y >> prefix_bits;
            if create_if_absent {
                let promote = match self.bloom.as_mut() {
                    Some(bf) => bf.insert(residual) == bf.n_hashes(),
                    None => true,
                };
                if promote {
                    let count = self.map.entry(residual).or_insert_with(|| {
                        n_ins += 1;
                        0
                    });
                    if *count < max_count {
                        *count += 1;
                    }
                }
            } else if let Some(count) = self.map.get_mut(&residual) {
                if *count < max_count {
                    *count += 1;
                }
            }
        }
        n_ins
    }
}

/// Sharded saturating-counter table over canonical k-mer keys. Keys are
/// spread with the invertible hash; the low `prefix_bits` bits of the spread
/// key select a shard and the high bits are the residual stored there. No
/// spread key can ever live in more than one shard.
pub struct CountTable {
    k: usize,
    prefix_bits: u32,
    counter_bits: u32,
    tot: u64,
    shards: Vec<Shard>,
}

/// Shard index of a spread key.
#[inline]
pub fn shard_of(y: u64, prefix_bits: u32) -> usize {
    (y & ((1u64 << prefix_bits) - 1)) as usize
}

impl CountTable {
    pub fn new(
        k: usize,
        prefix_bits: u32,
        counter_bits: u32,
        bloom: Option<BloomParams>,
    ) -> Result<Self> {
        if k == 0 || k > MAX_KMER {
            bail!("k-mer length must be between 1 and {}, got {}", MAX_KMER, k);
        }
        if counter_bits != 8 && counter_bits != 10 {
            bail!("counter width must be 8 or 10 bits, got {}", counter_bits);
        }
        if prefix_bits < counter_bits {
            bail!(
                "prefix length must be at least the counter width ({}), got {}",
                counter_bits,
                prefix_bits
            );
        }
        if prefix_bits > 32 {
            bail!("prefix length must be at most 32, got {}", prefix_bits);
        }
        if let Some(bp) = bloom {
            if bp.bits <= prefix_bits + BLOCK_SHIFT {
                bail!(
                    "bloom filter width 2^{} too small for prefix length {}",
                    bp.bits,
                    prefix_bits
                );
            }
        }
        let n_shards = 1usize << prefix_bits;
        let mut shards = Vec::with_capacity(n_shards);
        for _ in 0..n_shards {
            let bloom = match bloom {
                Some(bp) => Some(BlockedBloom::new(bp.bits - prefix_bits, bp.n_hashes)?),
                None => None,
            };
            shards.push(Shard {
                map: HashMap::default(),
                bloom,
            });
        }
        Ok(Self {
            k,
            prefix_bits,
            counter_bits,
            tot: 0,
            shards,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn prefix_bits(&self) -> u32 {
        self.prefix_bits
    }

    pub fn counter_bits(&self) -> u32 {
        self.counter_bits
    }

    /// Saturation ceiling: counters clamp here instead of wrapping.
    pub fn max_count(&self) -> u16 {
        ((1u32 << self.counter_bits) - 1) as u16
    }

    pub fn n_shards(&self) -> usize {
        self.shards.len()
    }

    /// Number of distinct keys currently held.
    pub fn len(&self) -> u64 {
        self.tot
    }

    pub fn is_empty(&self) -> bool {
        self.tot == 0
    }

    pub fn has_filters(&self) -> bool {
        self.shards.iter().any(|s| s.bloom.is_some())
    }

    /// Inserts one shard's buffer of spread keys. Returns the number of
    /// newly created entries.
    pub fn insert_list(&mut self, shard: usize, create_if_absent: bool, keys: &[u64]) -> u64 {
        let prefix_bits = self.prefix_bits;
        let max_count = self.max_count();
        let n_ins = self.shards[shard].insert_list(prefix_bits, max_count, create_if_absent, keys);
        self.tot += n_ins;
        n_ins
    }

    /// Stage-2 fan-out: processes every shard's buffer, each shard owned
    /// exclusively by the one worker it is assigned to for the duration of
    /// the call. Returns the number of newly created entries.
    pub fn insert_buffers(
        &mut self,
        n_threads: usize,
        create_if_absent: bool,
        bufs: &[Vec<u64>],
    ) -> u64 {
        debug_assert_eq!(bufs.len(), self.shards.len());
        let prefix_bits = self.prefix_bits;
        let max_count = self.max_count();
        let n_ins = AtomicU64::new(0);
        par::parallel_for_mut(n_threads, &mut self.shards, |i, shard, _tid| {
            let ins = shard.insert_list(prefix_bits, max_count, create_if_absent, &bufs[i]);
            if ins > 0 {
                n_ins.fetch_add(ins, Ordering::Relaxed);
            }
        });
        let n_ins = n_ins.into_inner();
        self.tot += n_ins;
        n_ins
    }

    /// Point query for one canonical k-mer key, bypassing the pipeline.
    pub fn get(&self, kmer_key: u64) -> Option<u16> {
        let y = kmer::spread(kmer_key, kmer::kmer_mask(self.k));
        let shard = &self.shards[shard_of(y, self.prefix_bits)];
        shard.map.get(&(y >> self.prefix_bits)).copied()
    }

    /// Zeroes every counter while keeping the keyset intact.
    pub fn clear_counts(&mut self, n_threads: usize) {
        par::parallel_for_mut(n_threads, &mut self.shards, |_, shard, _| {
            for count in shard.map.values_mut() {
                *count = 0;
            }
        });
    }

    /// Destroys the Bloom prefilters, freeing their memory. The table keeps
    /// counting exactly without them.
    pub fn drop_filters(&mut self) {
        for shard in &mut self.shards {
            shard.bloom = None;
        }
    }

    /// Rebuilds every shard keeping only entries whose count lies in
    /// `[min, max]`, and recomputes the distinct-key total.
    pub fn shrink(&mut self, min: u16, max: u16, n_threads: usize) {
        par::parallel_for_mut(n_threads, &mut self.shards, |_, shard, _| {
            shard.map.retain(|_, count| *count >= min && *count <= max);
            shard.map.shrink_to_fit();
        });
        self.tot = self.shards.iter().map(|s| s.map.len() as u64).sum();
    }

    /// Count distribution: slot `c` holds the number of distinct keys whose
    /// counter equals `c`. Workers accumulate into disjoint partial
    /// histograms which are summed serially.
    pub fn histogram(&self, n_threads: usize) -> Vec<u64> {
        let n_counts = 1usize << self.counter_bits;
        let partials = par::parallel_map_chunks(n_threads, &self.shards, |chunk, _tid| {
            let mut cnt = vec![0u64; n_counts];
            for shard in chunk {
                for &count in shard.map.values() {
                    cnt[count as usize] += 1;
                }
            }
            cnt
        });
        let mut cnt = vec![0u64; n_counts];
        for part in &partials {
            for (acc, v) in cnt.iter_mut().zip(part) {
                *acc += v;
            }
        }
        cnt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kmer::{kmer_mask, spread};

    fn spread_key(table: &CountTable, kmer_key: u64) -> u64 {
        spread(kmer_key, kmer_mask(table.k()))
    }

    #[test]
    fn rejects_bad_config() {
        assert!(CountTable::new(0, 10, 10, None).is_err());
        assert!(CountTable::new(32, 10, 10, None).is_err());
        assert!(CountTable::new(31, 7, 8, None).is_err());
        assert!(CountTable::new(31, 9, 10, None).is_err());
        assert!(CountTable::new(31, 10, 9, None).is_err());
        let bad_bloom = BloomParams { bits: 12, n_hashes: 4 };
        assert!(CountTable::new(31, 10, 10, Some(bad_bloom)).is_err());
        assert!(CountTable::new(31, 10, 10, None).is_ok());
    }

    #[test]
    fn counter_saturates_at_ceiling() {
        let mut table = CountTable::new(15, 8, 8, None).unwrap();
        let y = spread_key(&table, 12345);
        let shard = shard_of(y, table.prefix_bits());
        for _ in 0..300 {
            table.insert_list(shard, true, &[y]);
        }
        assert_eq!(table.get(12345), Some(table.max_count()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn shard_routing_is_deterministic_and_disjoint() {
        let mut table = CountTable::new(11, 8, 8, None).unwrap();
        let keys: Vec<u64> = (0..2000u64).collect();
        for &key in &keys {
            let y = spread_key(&table, key);
            let shard = shard_of(y, table.prefix_bits());
            assert_eq!(shard, shard_of(y, table.prefix_bits()));
            table.insert_list(shard, true, &[y]);
        }
        // Every key lands in exactly one shard: the total distinct count
        // equals the number of distinct keys inserted.
        assert_eq!(table.len(), keys.len() as u64);
        for &key in &keys {
            assert_eq!(table.get(key), Some(1));
        }
    }

    #[test]
    fn tally_only_pass_creates_nothing() {
        let mut table = CountTable::new(15, 8, 8, None).unwrap();
        let y = spread_key(&table, 7);
        let shard = shard_of(y, table.prefix_bits());
        table.insert_list(shard, false, &[y]);
        assert_eq!(table.get(7), None);
        assert_eq!(table.len(), 0);

        table.insert_list(shard, true, &[y]);
        table.insert_list(shard, false, &[y, y]);
        assert_eq!(table.get(7), Some(3));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn clear_counts_keeps_keyset() {
        let mut table = CountTable::new(15, 8, 8, None).unwrap();
        for key in 0..100u64 {
            let y = spread_key(&table, key);
            table.insert_list(shard_of(y, table.prefix_bits()), true, &[y, y]);
        }
        table.clear_counts(4);
        assert_eq!(table.len(), 100);
        for key in 0..100u64 {
            assert_eq!(table.get(key), Some(0));
        }
    }

    #[test]
    fn histogram_conserves_distinct_total() {
        let mut table = CountTable::new(15, 8, 8, None).unwrap();
        for key in 0..500u64 {
            let y = spread_key(&table, key);
            let shard = shard_of(y, table.prefix_bits());
            let reps = (key % 7) + 1;
            for _ in 0..reps {
                table.insert_list(shard, true, &[y]);
            }
        }
        let hist = table.histogram(4);
        assert_eq!(hist.len(), 256);
        assert_eq!(hist.iter().sum::<u64>(), table.len());
        assert_eq!(hist[0], 0);
    }

    #[test]
    fn shrink_filters_and_is_idempotent() {
        let mut table = CountTable::new(15, 8, 8, None).unwrap();
        for key in 0..300u64 {
            let y = spread_key(&table, key);
            let shard = shard_of(y, table.prefix_bits());
            let reps = if key % 3 == 0 { 1 } else { 4 };
            for _ in 0..reps {
                table.insert_list(shard, true, &[y]);
            }
        }
        let max = table.max_count();
        table.shrink(2, max, 4);
        assert_eq!(table.len(), 200);
        for key in 0..300u64 {
            match table.get(key) {
                Some(count) => assert_eq!(count, 4),
                None => assert_eq!(key % 3, 0),
            }
        }
        let hist = table.histogram(2);
        table.shrink(2, max, 4);
        assert_eq!(table.len(), 200);
        assert_eq!(table.histogram(2), hist);
    }

    #[test]
    fn insert_buffers_matches_serial_insert() {
        let mut parallel = CountTable::new(13, 8, 8, None).unwrap();
        let mut serial = CountTable::new(13, 8, 8, None).unwrap();
        let n_shards = parallel.n_shards();
        let mut bufs = vec![Vec::new(); n_shards];
        for key in 0..5000u64 {
            let y = spread_key(&parallel, key % 1000);
            bufs[shard_of(y, parallel.prefix_bits())].push(y);
        }
        let n_ins = parallel.insert_buffers(4, true, &bufs);
        assert_eq!(n_ins, 1000);
        for (shard, buf) in bufs.iter().enumerate() {
            serial.insert_list(shard, true, buf);
        }
        assert_eq!(parallel.len(), serial.len());
        for key in 0..1000u64 {
            assert_eq!(parallel.get(key), serial.get(key));
        }
    }

    #[test]
    fn bloom_gate_delays_creation_to_second_sighting() {
        let bloom = BloomParams { bits: 20, n_hashes: 4 };
        let mut table = CountTable::new(15, 10, 10, Some(bloom)).unwrap();
        let y = spread_key(&table, 99);
        let shard = shard_of(y, table.prefix_bits());
        table.insert_list(shard, true, &[y]);
        assert_eq!(table.get(99), None, "first sighting must not create");
        table.insert_list(shard, true, &[y]);
        assert_eq!(table.get(99), Some(1), "second sighting promotes");
        table.insert_list(shard, true, &[y]);
        assert_eq!(table.get(99), Some(2));
    }
}
