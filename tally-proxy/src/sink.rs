use crate::codec::{self, CHUNKED_TERMINATOR};
use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderValue};
use http::{StatusCode, Version};
use monoio::io::{AsyncWriteRent, AsyncWriteRentExt};
use std::io;
use tally_core::{HeaderMultimap, ResponseSnapshot};

/// Where a handler writes its response.
///
/// The head is sent on the first `write_head`, `write_body` or `finish`
/// call; later `write_head` calls are ignored and header edits made after
/// that point have no effect on the wire.
#[allow(async_fn_in_trait)]
pub trait ResponseSink {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Send the status line and headers. First call wins.
    async fn write_head(&mut self, status: StatusCode) -> io::Result<()>;

    /// Send body bytes, implying `write_head(200)` if no head was sent.
    async fn write_body(&mut self, chunk: Bytes) -> io::Result<()>;

    /// End the response, implying `write_head(200)` if no head was sent.
    async fn finish(&mut self) -> io::Result<()>;

    /// Status sent so far, `None` before the head.
    fn status(&self) -> Option<StatusCode>;
}

/// Send a short `text/plain` response such as `502 Bad Gateway`, replacing
/// any headers set so far.
pub async fn respond_plain<S: ResponseSink>(sink: &mut S, status: StatusCode) -> io::Result<()> {
    let body = format!(
        "{} {}\n",
        status.as_str(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    let headers = sink.headers_mut();
    headers.clear();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    sink.write_head(status).await?;
    sink.write_body(Bytes::from(body)).await?;
    sink.finish().await
}

/// Encodes the response straight onto the client connection.
pub struct DirectSink<'a, W> {
    writer: &'a mut W,
    headers: HeaderMap,
    status: Option<StatusCode>,
    version: Version,
    head_request: bool,
    keep_alive: bool,
    chunked: bool,
    bodiless: bool,
    finished: bool,
    buf: Vec<u8>,
}

impl<'a, W: AsyncWriteRent> DirectSink<'a, W> {
    pub fn new(writer: &'a mut W, version: Version, head_request: bool, keep_alive: bool) -> Self {
        Self {
            writer,
            headers: HeaderMap::new(),
            status: None,
            version,
            head_request,
            keep_alive,
            chunked: false,
            bodiless: false,
            finished: false,
            buf: Vec::with_capacity(1024),
        }
    }

    /// The response was fully framed and the client asked to keep the
    /// connection, so another request may follow.
    pub fn reusable(&self) -> bool {
        self.finished && self.keep_alive
    }

    async fn send_buf(&mut self) -> io::Result<()> {
        let buf = std::mem::take(&mut self.buf);
        let (res, mut buf) = self.writer.write_all(buf).await;
        buf.clear();
        self.buf = buf;
        res.map(|_| ())
    }
}

impl<W: AsyncWriteRent> ResponseSink for DirectSink<'_, W> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        self.status = Some(status);
        self.bodiless = self.head_request || !codec::status_has_body(status);

        // Framing is ours to decide.
        self.headers.remove(header::TRANSFER_ENCODING);
        self.headers.remove(header::CONNECTION);
        if !self.bodiless && !self.headers.contains_key(header::CONTENT_LENGTH) {
            if self.version == Version::HTTP_10 {
                // No chunked encoding for 1.0 clients: delimit by closing.
                self.keep_alive = false;
            } else {
                self.chunked = true;
                self.headers
                    .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
        }
        if !self.keep_alive {
            self.headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        } else if self.version == Version::HTTP_10 {
            self.headers
                .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        codec::encode_response_head(&mut self.buf, status, &self.headers);
        self.send_buf().await
    }

    async fn write_body(&mut self, chunk: Bytes) -> io::Result<()> {
        if self.status.is_none() {
            self.write_head(StatusCode::OK).await?;
        }
        if self.bodiless || chunk.is_empty() {
            return Ok(());
        }
        if self.chunked {
            codec::encode_chunk(&mut self.buf, &chunk);
        } else {
            self.buf.extend_from_slice(&chunk);
        }
        self.send_buf().await
    }

    async fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.status.is_none() {
            // Nothing was written: an empty 200.
            if !self.headers.contains_key(header::CONTENT_LENGTH) {
                self.headers
                    .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
            self.write_head(StatusCode::OK).await?;
        }
        if self.chunked && !self.bodiless {
            self.buf.extend_from_slice(CHUNKED_TERMINATOR);
            self.send_buf().await?;
        }
        self.writer.flush().await?;
        self.finished = true;
        Ok(())
    }

    fn status(&self) -> Option<StatusCode> {
        self.status
    }
}

/// Forwards everything to an inner sink while keeping a copy of the status,
/// the headers as they were when the head went out, and the body.
///
/// The header copy is taken before the inner sink sees the head, so it
/// holds what the handler set. Framing the inner sink adds on the wire
/// (`transfer-encoding`, `connection`, an implied `content-length: 0`) is
/// not recorded.
pub struct TeeSink<'s, S> {
    inner: &'s mut S,
    status: Option<StatusCode>,
    header: Option<HeaderMap>,
    body: BytesMut,
}

impl<'s, S: ResponseSink> TeeSink<'s, S> {
    pub fn new(inner: &'s mut S) -> Self {
        Self {
            inner,
            status: None,
            header: None,
            body: BytesMut::new(),
        }
    }

    /// Captured bytes so far.
    pub fn captured_body(&self) -> &[u8] {
        &self.body
    }

    /// Take the capture as a snapshot. A response whose head never went out
    /// is recorded as an implicit 200 with the headers set so far.
    pub fn take_snapshot(&mut self) -> ResponseSnapshot {
        let header = match self.header.take() {
            Some(h) => h,
            None => self.inner.headers_mut().clone(),
        };
        ResponseSnapshot {
            status: self.status.unwrap_or(StatusCode::OK).as_u16(),
            header: HeaderMultimap::from(header),
            body: std::mem::take(&mut self.body).freeze(),
        }
    }
}

impl<S: ResponseSink> ResponseSink for TeeSink<'_, S> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    async fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        self.status = Some(status);
        self.header = Some(self.inner.headers_mut().clone());
        self.inner.write_head(status).await
    }

    async fn write_body(&mut self, chunk: Bytes) -> io::Result<()> {
        if self.status.is_none() {
            self.write_head(StatusCode::OK).await?;
        }
        self.body.extend_from_slice(&chunk);
        self.inner.write_body(chunk).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        if self.status.is_none() {
            self.write_head(StatusCode::OK).await?;
        }
        self.inner.finish().await
    }

    fn status(&self) -> Option<StatusCode> {
        self.status
    }
}
