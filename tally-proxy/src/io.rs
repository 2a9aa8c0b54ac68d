use monoio::io::AsyncReadRent;
use std::io;

/// Read buffer over a monoio reader.
///
/// Bytes are read in rented chunks and appended to an owned buffer that
/// the codec parses in place. One instance lives for the whole connection,
/// so leftover bytes (pipelined requests) carry over between exchanges.
pub struct BufferedReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    scratch: Vec<u8>,
}

impl<R> BufferedReader<R> {
    pub fn new(inner: R, read_size: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(read_size),
            pos: 0,
            scratch: Vec::with_capacity(read_size.max(1)),
        }
    }

    /// Bytes read but not yet consumed.
    #[inline]
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Mark `n` buffered bytes as used.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Give back the reader. Any unconsumed bytes are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncReadRent> BufferedReader<R> {
    /// Read once more from the underlying stream. Returns the number of new
    /// bytes, `0` at end of stream.
    pub async fn fill(&mut self) -> io::Result<usize> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }

        let scratch = std::mem::take(&mut self.scratch);
        let (res, scratch) = self.inner.read(scratch).await;
        self.scratch = scratch;
        let n = res?;
        self.buf.extend_from_slice(&self.scratch[..n]);
        Ok(n)
    }
}
