use crate::core::io::open_source;
use crate::core::kmer::{CanonicalKmers, kmer_mask, spread};
use crate::core::seq::FastxReader;
use crate::core::table::{CountTable, shard_of};
use crate::par;
use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

/// Knobs of one counting pass. The reduced configurations (no Bloom filter,
/// shallow pipeline, single-threaded insert) are all instances of the same
/// engine selected through these values.
#[derive(Clone, Copy, Debug)]
pub struct CountOptions {
    /// Batch size in bases for one pipeline block.
    pub chunk_size: usize,
    /// Worker threads for the shard fan-out and the reductions.
    pub n_threads: usize,
    /// Number of overlapped pipeline stages (1..=3).
    pub pipeline_depth: usize,
}

impl Default for CountOptions {
    fn default() -> Self {
        Self {
            chunk_size: 10_000_000,
            n_threads: 4,
            pipeline_depth: 3,
        }
    }
}

/// Stage-0 output: a batch of raw sequences capped by total base count.
struct SeqBlock {
    seqs: Vec<Vec<u8>>,
    /// Expected k-mer count, used to pre-size the per-shard buffers.
    nk: usize,
}

/// Stage-1 output: spread keys routed into one buffer per destination shard.
struct KeyBlock {
    n_seqs: usize,
    bufs: Vec<Vec<u64>>,
}

/// Counts one input file into `table`. With `create_if_absent`, unseen keys
/// gain entries (the build pass); without it only existing entries are
/// tallied (the exact re-count pass of the two-phase algorithm).
pub fn count_file(
    path: &Path,
    table: &mut CountTable,
    create_if_absent: bool,
    opts: &CountOptions,
) -> Result<()> {
    let reader = open_source(path, opts.n_threads)
        .with_context(|| format!("failed to open sequence input {}", path.display()))?;
    count_reader(FastxReader::new(reader), table, create_if_absent, opts)
}

/// Runs the read -> extract -> insert pipeline over an already-open record
/// stream.
pub fn count_reader<R: Read + Send>(
    reader: FastxReader<R>,
    table: &mut CountTable,
    create_if_absent: bool,
    opts: &CountOptions,
) -> Result<()> {
    let k = table.k();
    let prefix_bits = table.prefix_bits();
    let n_shards = table.n_shards();
    let mask = kmer_mask(k);
    let chunk_size = opts.chunk_size.max(1);
    let n_threads = opts.n_threads.max(1);

    let mut reader = reader;
    let read = move || -> Result<Option<SeqBlock>> {
        let mut seqs = Vec::new();
        let mut sum_len = 0usize;
        let mut nk = 0usize;
        while let Some(rec) = reader.next_record()? {
            let len = rec.seq.len();
            if len < k {
                continue;
            }
            sum_len += len;
            nk += len - k + 1;
            seqs.push(rec.seq);
            if sum_len >= chunk_size {
                break;
            }
        }
        if seqs.is_empty() {
            Ok(None)
        } else {
            Ok(Some(SeqBlock { seqs, nk }))
        }
    };

    let extract = move |block: SeqBlock| -> KeyBlock {
        let cap = (block.nk as f64 * 1.2 / n_shards as f64) as usize + 1;
        let mut bufs: Vec<Vec<u64>> = (0..n_shards).map(|_| Vec::with_capacity(cap)).collect();
        for seq in &block.seqs {
            for key in CanonicalKmers::new(seq, k) {
                let y = spread(key, mask);
                bufs[shard_of(y, prefix_bits)].push(y);
            }
        }
        KeyBlock {
            n_seqs: block.seqs.len(),
            bufs,
        }
    };

    let insert = |keys: KeyBlock| {
        table.insert_buffers(n_threads, create_if_absent, &keys.bufs);
        eprintln!(
            "[M] processed {} sequences; {} distinct k-mers in the table",
            keys.n_seqs,
            table.len()
        );
    };

    par::pipeline(opts.pipeline_depth, read, extract, insert)
}
