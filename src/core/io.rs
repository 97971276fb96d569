use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use gzp::deflate::{Bgzf, Mgzip};
use gzp::par::decompress::ParDecompressBuilder;
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InputKind {
    Plain,
    Gzip,
}

/// Read-only memory map exposed as a byte reader, so plain files go through
/// the same incremental record parser as compressed ones.
pub struct MmapReader {
    mmap: Mmap,
    pos: usize,
}

impl MmapReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        // SAFETY: read-only file mapping.
        let mmap = unsafe { Mmap::map(&file) }.with_context(|| "mmap failed")?;
        Ok(Self { mmap, pos: 0 })
    }
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.mmap[self.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Opens a sequence file as a byte stream: memory-mapped when plain,
/// decompressed (multi-threaded where the variant allows) when gzipped.
pub fn open_source(path: &Path, threads: usize) -> Result<Box<dyn Read + Send>> {
    match detect_input_kind(path)? {
        InputKind::Plain => Ok(Box::new(MmapReader::open(path)?)),
        InputKind::Gzip => open_gzip_reader(path, threads),
    }
}

pub fn detect_input_kind(path: &Path) -> Result<InputKind> {
    if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
        if ext.eq_ignore_ascii_case("gz") {
            return Ok(InputKind::Gzip);
        }
    }
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut magic = [0u8; 2];
    let n = file
        .read(&mut magic)
        .with_context(|| "failed to read magic bytes")?;
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(InputKind::Gzip)
    } else {
        Ok(InputKind::Plain)
    }
}

#[derive(Clone, Copy, Debug)]
enum GzipVariant {
    Standard,
    Mgzip,
    Bgzf,
}

fn detect_gzip_variant(path: &Path) -> Result<GzipVariant> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut header = [0u8; 20];
    let n = file
        .read(&mut header)
        .with_context(|| "failed to read gzip header")?;
    if n < 14 {
        return Ok(GzipVariant::Standard);
    }
    if header[0] != 0x1f || header[1] != 0x8b {
        return Ok(GzipVariant::Standard);
    }
    if header[3] & 4 == 0 {
        return Ok(GzipVariant::Standard);
    }
    if header[12] == b'B' && header[13] == b'C' {
        return Ok(GzipVariant::Bgzf);
    }
    if header[12] == b'I' && header[13] == b'G' {
        return Ok(GzipVariant::Mgzip);
    }
    Ok(GzipVariant::Standard)
}

pub fn open_gzip_reader(path: &Path, threads: usize) -> Result<Box<dyn Read + Send>> {
    let variant = detect_gzip_variant(path)?;
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let reader: Box<dyn Read + Send> = match variant {
        GzipVariant::Bgzf => {
            if threads > 1 {
                Box::new(
                    ParDecompressBuilder::<Bgzf>::new()
                        .num_threads(threads)
                        .unwrap()
                        .from_reader(reader),
                )
            } else {
                Box::new(MultiGzDecoder::new(reader))
            }
        }
        GzipVariant::Mgzip => {
            if threads > 1 {
                Box::new(
                    ParDecompressBuilder::<Mgzip>::new()
                        .num_threads(threads)
                        .unwrap()
                        .from_reader(reader),
                )
            } else {
                Box::new(MultiGzDecoder::new(reader))
            }
        }
        GzipVariant::Standard => Box::new(MultiGzDecoder::new(reader)),
    };
    Ok(reader)
}
