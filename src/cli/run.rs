use crate::cli::args::Cli;
use crate::core::engine::{self, CountOptions};
use crate::core::table::{BloomParams, CountTable};
use anyhow::{Result, bail};
use clap::Parser;
use std::env;
use std::io::{self, BufWriter, Write};
use std::time::{Duration, Instant};

pub fn entry() -> Result<()> {
    run(Cli::parse())
}

fn run(args: Cli) -> Result<()> {
    let stats = stats_enabled();
    let t0 = Instant::now();

    if !args.input.is_file() {
        bail!("input file not found: {}", args.input.display());
    }
    if let Some(input2) = &args.input2 {
        if !input2.is_file() {
            bail!("input file not found: {}", input2.display());
        }
    }
    if args.threads == 0 {
        bail!("--threads must be >= 1");
    }
    if !(1..=3).contains(&args.pipeline_depth) {
        bail!("--pipeline-depth must be 1, 2 or 3");
    }
    if args.input2.is_some() && args.bloom_bits == 0 {
        bail!("a second input is only used by the two-phase run; enable it with --bloom-bits");
    }

    let bloom = if args.bloom_bits > 0 {
        Some(BloomParams {
            bits: args.bloom_bits,
            n_hashes: args.bloom_hashes,
        })
    } else {
        None
    };
    let mut table = CountTable::new(
        args.kmer_len,
        args.prefix_bits,
        args.counter_bits.bits(),
        bloom,
    )?;
    let opts = CountOptions {
        chunk_size: args.chunk_size,
        n_threads: args.threads,
        pipeline_depth: args.pipeline_depth,
    };

    let t_count = Instant::now();
    engine::count_file(&args.input, &mut table, true, &opts)?;
    stage_done(stats, "count", t_count);

    if bloom.is_some() {
        // Second phase: the filter has done its job; keep the promoted
        // keyset, re-tally it exactly, then drop what only one sighting
        // (or a false positive) put there.
        let t_recount = Instant::now();
        table.drop_filters();
        table.clear_counts(args.threads);
        let input2 = args.input2.as_ref().unwrap_or(&args.input);
        engine::count_file(input2, &mut table, false, &opts)?;
        let max = table.max_count();
        table.shrink(2, max, args.threads);
        eprintln!("[M] {} distinct k-mers after shrinking", table.len());
        stage_done(stats, "recount", t_recount);
    }

    let t_hist = Instant::now();
    let hist = table.histogram(args.threads);
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for (count, n) in hist.iter().enumerate().skip(1) {
        writeln!(out, "{}\t{}", count, n)?;
    }
    out.flush()?;
    stage_done(stats, "histogram", t_hist);

    stage_done(stats, "total", t0);
    Ok(())
}

fn stats_enabled() -> bool {
    matches!(env::var("KC_STATS").as_deref(), Ok("1"))
}

fn stage_done(stats: bool, name: &str, t: Instant) {
    if stats {
        eprintln!("KC_STATS stage={} time={}", name, fmt_dur(t.elapsed()));
    }
}

fn fmt_dur(d: Duration) -> String {
    if d.as_secs_f64() < 1.0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{:.3}s", d.as_secs_f64())
    }
}
