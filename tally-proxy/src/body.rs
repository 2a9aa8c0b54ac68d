use crate::codec::BodyDecoder;
use crate::io::BufferedReader;
use bytes::Bytes;
use monoio::io::AsyncReadRent;
use std::io;

/// A request body as seen by handlers: a pull stream of byte chunks.
#[allow(async_fn_in_trait)]
pub trait Body {
    /// Next chunk, `None` once the body is exhausted.
    async fn chunk(&mut self) -> Option<io::Result<Bytes>>;

    /// Total length when known up front.
    fn size_hint(&self) -> Option<u64>;

    /// An independent copy that yields the same bytes from the start, when
    /// the body is held in memory.
    fn try_replay(&self) -> Option<Replayable>;
}

impl<B: Body> Body for &mut B {
    async fn chunk(&mut self) -> Option<io::Result<Bytes>> {
        (**self).chunk().await
    }

    fn size_hint(&self) -> Option<u64> {
        (**self).size_hint()
    }

    fn try_replay(&self) -> Option<Replayable> {
        (**self).try_replay()
    }
}

/// In-memory body. Yields its bytes once; replay hands out fresh copies.
#[derive(Debug, Clone, Default)]
pub struct Replayable {
    data: Bytes,
    taken: bool,
}

impl Replayable {
    pub fn new(data: Bytes) -> Self {
        Self { data, taken: false }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl Body for Replayable {
    async fn chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.taken || self.data.is_empty() {
            return None;
        }
        self.taken = true;
        Some(Ok(self.data.clone()))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn try_replay(&self) -> Option<Replayable> {
        Some(Replayable::new(self.data.clone()))
    }
}

/// Body streamed off a connection, decoded per its framing.
pub struct IncomingBody<'a, R> {
    reader: &'a mut BufferedReader<R>,
    decoder: BodyDecoder,
    size: Option<u64>,
    failed: bool,
}

impl<'a, R: AsyncReadRent> IncomingBody<'a, R> {
    pub fn new(reader: &'a mut BufferedReader<R>, decoder: BodyDecoder) -> Self {
        let size = decoder.remaining();
        Self {
            reader,
            decoder,
            size,
            failed: false,
        }
    }

    /// Every byte of the body has been read off the wire, so the next
    /// message on the connection starts at the read position.
    pub fn is_complete(&self) -> bool {
        !self.failed && self.decoder.is_done()
    }

    /// Read and discard whatever is left, up to `limit` bytes.
    pub async fn drain(&mut self, limit: usize) -> io::Result<bool> {
        let mut seen = 0usize;
        while let Some(chunk) = self.chunk().await {
            seen += chunk?.len();
            if seen > limit {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl<R: AsyncReadRent> Body for IncomingBody<'_, R> {
    async fn chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.failed {
            return None;
        }
        loop {
            if self.decoder.is_done() {
                return None;
            }

            let step = match self.decoder.decode(self.reader.buffered()) {
                Ok(d) => (Bytes::copy_from_slice(d.data), d.consumed, d.done),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(io::Error::new(io::ErrorKind::InvalidData, e)));
                }
            };
            let (data, consumed, done) = step;
            self.reader.consume(consumed);
            if !data.is_empty() {
                return Some(Ok(data));
            }
            if done {
                return None;
            }
            if consumed > 0 {
                continue;
            }

            match self.reader.fill().await {
                Ok(0) => {
                    if let Err(e) = self.decoder.eof() {
                        self.failed = true;
                        return Some(Err(io::Error::new(io::ErrorKind::UnexpectedEof, e)));
                    }
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }

    fn size_hint(&self) -> Option<u64> {
        self.size
    }

    fn try_replay(&self) -> Option<Replayable> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
            .build()
            .expect("monoio runtime build failed")
            .block_on(f)
    }

    #[test]
    fn replayable_yields_once_and_replays() {
        block_on(async {
            let mut body = Replayable::new(Bytes::from_static(b"payload"));
            assert_eq!(body.size_hint(), Some(7));
            assert_eq!(&body.chunk().await.unwrap().unwrap()[..], b"payload");
            assert!(body.chunk().await.is_none());

            let mut again = body.try_replay().unwrap();
            assert_eq!(&again.chunk().await.unwrap().unwrap()[..], b"payload");
        });
    }

    #[test]
    fn empty_replayable_has_no_chunks() {
        block_on(async {
            let mut body = Replayable::default();
            assert!(body.chunk().await.is_none());
            assert_eq!(body.size_hint(), Some(0));
        });
    }

    async fn total_len<B: Body>(mut body: B) -> usize {
        let mut n = 0;
        while let Some(chunk) = body.chunk().await {
            n += chunk.unwrap().len();
        }
        n
    }

    #[test]
    fn mut_ref_forwards() {
        block_on(async {
            let mut body = Replayable::new(Bytes::from_static(b"xyz"));
            assert_eq!(total_len(&mut body).await, 3);
            // The borrowed body was consumed in place.
            assert!(body.chunk().await.is_none());
        });
    }
}
