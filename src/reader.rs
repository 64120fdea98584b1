/// Chunked line reader for multi-megabyte raw traces.
///
/// Yields logical `\n`-terminated lines as borrowed spans of the internal
/// buffer, so the hot loop never allocates per line. Lines that straddle a
/// chunk boundary are shifted to the buffer start before the next read; a
/// line longer than the whole buffer is a hard error rather than something
/// to paper over with reallocation.
use std::io::Read;

use anyhow::{Context, Result};
use memchr::memchr;

use crate::core::types::TraceError;

/// Default chunk buffer size. A single trace line must fit.
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 20;

pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    filled: usize,
    eof: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> LineReader<R> {
        LineReader::with_buffer_size(inner, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(inner: R, size: usize) -> LineReader<R> {
        LineReader {
            inner,
            buf: vec![0; size],
            pos: 0,
            filled: 0,
            eof: false,
        }
    }

    /// Returns the next non-empty line without its terminator, or `None` at
    /// end of input. A trailing `\r` is stripped so traces written on Windows
    /// hosts parse identically.
    pub fn next_line(&mut self) -> Result<Option<&[u8]>> {
        let (start, end) = loop {
            if let Some(offset) = memchr(b'\n', &self.buf[self.pos..self.filled]) {
                let start = self.pos;
                let mut end = self.pos + offset;
                self.pos = end + 1;
                if end > start && self.buf[end - 1] == b'\r' {
                    end -= 1;
                }
                if end == start {
                    continue;
                }
                break (start, end);
            }
            if self.eof {
                if self.pos == self.filled {
                    return Ok(None);
                }
                // Final line without a terminator.
                let start = self.pos;
                let mut end = self.filled;
                self.pos = self.filled;
                if end > start && self.buf[end - 1] == b'\r' {
                    end -= 1;
                }
                if end == start {
                    return Ok(None);
                }
                break (start, end);
            }
            self.refill()?;
        };
        Ok(Some(&self.buf[start..end]))
    }

    fn refill(&mut self) -> Result<()> {
        if self.pos == 0 && self.filled == self.buf.len() {
            return Err(TraceError::ReadBufferTooSmall(self.buf.len()).into());
        }
        self.buf.copy_within(self.pos..self.filled, 0);
        self.filled -= self.pos;
        self.pos = 0;
        let read = self
            .inner
            .read(&mut self.buf[self.filled..])
            .context("Failed to read trace input")?;
        if read == 0 {
            self.eof = true;
        } else {
            self.filled += read;
        }
        Ok(())
    }
}
