use anyhow::{Context, Result, bail};
use memchr::memchr;
use std::io::Read;
use std::ops::Range;

const READ_BUF: usize = 1 << 16;

/// One sequence record. Quality values, when present in the input, are
/// validated for length and discarded.
pub struct SeqRecord {
    pub name: Vec<u8>,
    pub seq: Vec<u8>,
}

/// Incremental FASTA/FASTQ reader over any byte source. The format is
/// detected per record from its leading marker (`>` or `@`); FASTA
/// sequences may span multiple lines, FASTQ quality is length-driven so a
/// leading `@` in a quality line cannot be mistaken for a header.
pub struct FastxReader<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    eof: bool,
    pending_header: Option<Vec<u8>>,
    n_records: u64,
}

impl<R: Read> FastxReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_BUF),
            start: 0,
            eof: false,
            pending_header: None,
            n_records: 0,
        }
    }

    /// Next record, or `Ok(None)` at end of stream.
    pub fn next_record(&mut self) -> Result<Option<SeqRecord>> {
        let header: Vec<u8> = match self.pending_header.take() {
            Some(line) => line,
            None => loop {
                match self.take_line()? {
                    None => return Ok(None),
                    Some(r) if r.is_empty() => continue,
                    Some(r) => break self.buf[r].to_vec(),
                }
            },
        };
        let lead = header[0];
        if lead != b'>' && lead != b'@' {
            bail!(
                "input is not FASTA/FASTQ: record {} starts with {:?}",
                self.n_records + 1,
                lead as char
            );
        }
        let name = header[1..].to_vec();
        let mut seq = Vec::new();
        if lead == b'>' {
            self.read_fasta_tail(&mut seq)?;
        } else {
            self.read_fastq_tail(&mut seq)?;
        }
        self.n_records += 1;
        Ok(Some(SeqRecord { name, seq }))
    }

    fn read_fasta_tail(&mut self, seq: &mut Vec<u8>) -> Result<()> {
        loop {
            let Some(r) = self.take_line()? else {
                return Ok(());
            };
            if r.is_empty() {
                continue;
            }
            let first = self.buf[r.start];
            if first == b'>' || first == b'@' {
                self.pending_header = Some(self.buf[r].to_vec());
                return Ok(());
            }
            seq.extend_from_slice(&self.buf[r]);
        }
    }

    fn read_fastq_tail(&mut self, seq: &mut Vec<u8>) -> Result<()> {
        loop {
            let Some(r) = self.take_line()? else {
                bail!(
                    "truncated FASTQ record {}: missing '+' separator",
                    self.n_records + 1
                );
            };
            if r.is_empty() {
                continue;
            }
            if self.buf[r.start] == b'+' {
                break;
            }
            seq.extend_from_slice(&self.buf[r]);
        }
        let mut qual_len = 0usize;
        while qual_len < seq.len() {
            let Some(r) = self.take_line()? else {
                bail!(
                    "truncated FASTQ record {}: quality shorter than sequence",
                    self.n_records + 1
                );
            };
            qual_len += r.len();
        }
        if qual_len > seq.len() {
            bail!(
                "FASTQ record {}: quality longer than sequence",
                self.n_records + 1
            );
        }
        Ok(())
    }

    /// Byte range of the next line within the internal buffer, terminator
    /// excluded, `\r` stripped. Valid only until the next call.
    fn take_line(&mut self) -> Result<Option<Range<usize>>> {
        loop {
            if let Some(off) = memchr(b'\n', &self.buf[self.start..]) {
                let s = self.start;
                let mut e = s + off;
                self.start = e + 1;
                if e > s && self.buf[e - 1] == b'\r' {
                    e -= 1;
                }
                return Ok(Some(s..e));
            }
            if self.eof {
                if self.start >= self.buf.len() {
                    return Ok(None);
                }
                let s = self.start;
                let mut e = self.buf.len();
                self.start = e;
                if e > s && self.buf[e - 1] == b'\r' {
                    e -= 1;
                }
                return Ok(Some(s..e));
            }
            self.refill()?;
        }
    }

    fn refill(&mut self) -> Result<()> {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        let old = self.buf.len();
        self.buf.resize(old + READ_BUF, 0);
        let n = self
            .inner
            .read(&mut self.buf[old..])
            .context("failed to read sequence input")?;
        self.buf.truncate(old + n);
        if n == 0 {
            self.eof = true;
        }
        Ok(())
    }
}
