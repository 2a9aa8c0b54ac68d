//! Snapshot capture around any handler.
//!
//! [`Capture`] buffers the request body, hands the inner handler a
//! replayable copy and a tee over the real sink, then assembles one
//! [`LogEntry`] per exchange and hands it to the recorder.

use crate::body::{Body, Replayable};
use crate::sink::{ResponseSink, TeeSink, respond_plain};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use http::header;
use http::request::Parts;
use http::{Request, StatusCode};
use std::io;
use tally_core::{HeaderMultimap, LogEntry, RequestSnapshot, TallyError};
use tally_recorder::{EntrySender, Submit};
use tracing::{debug, warn};

/// Serves one exchange: consumes the request, writes the response.
#[allow(async_fn_in_trait)]
pub trait Handler {
    async fn serve<B: Body, S: ResponseSink>(
        &self,
        req: Request<B>,
        sink: &mut S,
    ) -> io::Result<()>;
}

pub struct Capture<H> {
    inner: H,
    sender: EntrySender,
    max_body_bytes: usize,
}

impl<H: Handler> Capture<H> {
    pub fn new(inner: H, sender: EntrySender, max_body_bytes: usize) -> Self {
        Self {
            inner,
            sender,
            max_body_bytes,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

impl<H: Handler> Handler for Capture<H> {
    async fn serve<B: Body, S: ResponseSink>(
        &self,
        req: Request<B>,
        sink: &mut S,
    ) -> io::Result<()> {
        let started = Utc::now();
        let (parts, mut body) = req.into_parts();

        let bytes = match read_body(&mut body, self.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(method = %parts.method, uri = %parts.uri, error = %e, "Failed to read request body");
                return respond_plain(sink, StatusCode::BAD_REQUEST).await;
            }
        };

        let mut exchange = Exchange {
            sender: &self.sender,
            started,
            request: Some(request_snapshot(&parts, bytes.clone())),
            sink: TeeSink::new(sink),
        };

        let req = Request::from_parts(parts, Replayable::new(bytes));
        let result = match self.inner.serve(req, &mut exchange.sink).await {
            Ok(()) => exchange.sink.finish().await,
            Err(e) => {
                // A half-sent response must not be terminated as if whole;
                // the caller closes the connection instead.
                if exchange.sink.status().is_none() {
                    let _ = respond_plain(&mut exchange.sink, StatusCode::INTERNAL_SERVER_ERROR)
                        .await;
                }
                Err(e)
            }
        };
        exchange.submit().await;

        result
    }
}

/// Read the whole body, refusing anything over `limit` bytes.
pub async fn read_body<B: Body>(body: &mut B, limit: usize) -> Result<Bytes, TallyError> {
    if let Some(n) = body.size_hint() {
        if n > limit as u64 {
            return Err(TallyError::BodyTooLarge { limit });
        }
    }

    let mut buf = BytesMut::with_capacity(body.size_hint().unwrap_or(0).min(64 * 1024) as usize);
    while let Some(chunk) = body.chunk().await {
        let chunk = chunk.map_err(|e| TallyError::ClientBodyRead(e.to_string()))?;
        if buf.len() + chunk.len() > limit {
            return Err(TallyError::BodyTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn request_snapshot(parts: &Parts, body: Bytes) -> RequestSnapshot {
    let host = parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(header::HOST)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        })
        .unwrap_or_default();

    RequestSnapshot {
        method: parts.method.to_string(),
        host,
        uri: parts.uri.to_string(),
        header: HeaderMultimap::from(&parts.headers),
        body,
    }
}

/// One in-flight exchange. Submits its entry exactly once: normally after
/// the response is finished, otherwise from `Drop` when the exchange is
/// cancelled or unwinds.
///
/// The entry stays in the guard until a queue slot is held, so an exchange
/// cancelled while waiting on a full queue still reaches `Drop`'s
/// non-blocking submit, which counts it as dropped if there is no room.
struct Exchange<'a, 's, S: ResponseSink> {
    sender: &'a EntrySender,
    started: DateTime<Utc>,
    request: Option<RequestSnapshot>,
    sink: TeeSink<'s, S>,
}

impl<S: ResponseSink> Exchange<'_, '_, S> {
    fn take_entry(&mut self) -> Option<LogEntry> {
        let request = self.request.take()?;
        Some(LogEntry::new(request, self.sink.take_snapshot(), self.started))
    }

    async fn submit(&mut self) {
        if self.request.is_none() {
            return;
        }
        let sender = self.sender;
        let slot = sender.reserve().await;
        if let Some(entry) = self.take_entry() {
            slot.submit(entry);
        }
    }
}

impl<S: ResponseSink> Drop for Exchange<'_, '_, S> {
    fn drop(&mut self) {
        if let Some(entry) = self.take_entry() {
            let outcome = self.sender.try_submit(entry);
            debug!(?outcome, "Exchange ended early, recorded partial entry");
            if outcome == Submit::Dropped {
                warn!("Partial entry dropped, intake queue full");
            }
        }
    }
}
