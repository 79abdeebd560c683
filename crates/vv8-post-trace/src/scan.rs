use std::collections::VecDeque;
use std::io::{self, BufRead, Read};

/// Line scanner over a byte stream. Lines are `\n`-delimited; the buffer
/// grows to fit, so records far past the usual 64 KiB line-buffer limit
/// (observed >128 MiB) stream through without truncation.
pub struct LineScanner<R> {
    reader: R,
    buf: Vec<u8>,
    lines: u64,
    bytes: u64,
}

impl<R: BufRead> LineScanner<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, buf: Vec::new(), lines: 0, bytes: 0 }
    }

    /// Read the next line, without its terminator, paired with its
    /// 1-based line number. Returns `None` at end of stream.
    pub fn next_line(&mut self) -> io::Result<Option<(u64, &[u8])>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.lines += 1;
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        self.bytes += self.buf.len() as u64 + 1;
        Ok(Some((self.lines, &self.buf)))
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Ordered concatenation of log segments, presented as one stream.
/// Fragmented logs (`stem.0.log`, `stem.1.log`, ...) are read as if the
/// engine had written a single file.
pub struct SegmentReader {
    segments: VecDeque<Box<dyn Read>>,
}

impl SegmentReader {
    pub fn new(segments: Vec<Box<dyn Read>>) -> Self {
        Self { segments: segments.into() }
    }
}

impl Read for SegmentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(front) = self.segments.front_mut() {
            let n = front.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.segments.pop_front();
        }
        Ok(0)
    }
}
