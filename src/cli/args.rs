use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "kira-kc",
    version,
    about = "Canonical k-mer counter with Bloom-filter singleton elimination"
)]
pub struct Cli {
    /// Input sequences: FASTA or FASTQ, plain or gzip-compressed.
    pub input: PathBuf,

    /// Second-pass input for two-phase counting; defaults to INPUT.
    pub input2: Option<PathBuf>,

    /// k-mer length.
    #[arg(short = 'k', long = "kmer-len", default_value_t = 31)]
    pub kmer_len: usize,

    /// Shard-selector prefix length in bits (2^p shards).
    #[arg(short = 'p', long = "prefix-bits", default_value_t = 10)]
    pub prefix_bits: u32,

    /// Bloom filter size of 2^BITS bits; 0 disables the filter and the
    /// two-phase run.
    #[arg(short = 'b', long = "bloom-bits", default_value_t = 0)]
    pub bloom_bits: u32,

    /// Bloom filter hash functions per key.
    #[arg(short = 'H', long = "bloom-hashes", default_value_t = 4)]
    pub bloom_hashes: u32,

    /// Batch size in bases for one pipeline block.
    #[arg(short = 'K', long = "chunk-size", default_value_t = 10_000_000)]
    pub chunk_size: usize,

    /// Worker threads.
    #[arg(short = 't', long, default_value_t = num_cpus::get())]
    pub threads: usize,

    /// Saturating counter width.
    #[arg(long, value_enum, default_value_t = CounterBitsArg::C10)]
    pub counter_bits: CounterBitsArg,

    /// Number of overlapped pipeline stages.
    #[arg(long, default_value_t = 3)]
    pub pipeline_depth: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CounterBitsArg {
    #[value(name = "8")]
    C8,
    #[value(name = "10")]
    C10,
}

impl CounterBitsArg {
    pub fn bits(self) -> u32 {
        match self {
            CounterBitsArg::C8 => 8,
            CounterBitsArg::C10 => 10,
        }
    }
}
