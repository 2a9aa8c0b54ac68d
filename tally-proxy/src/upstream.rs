//! Forwarding handler: sends each exchange to the single upstream host over
//! a per-worker keep-alive pool and streams the response back.

use crate::body::{Body, IncomingBody};
use crate::capture::{Handler, read_body};
use crate::codec::{self, BodyDecoder, Framing, ResponseHead};
use crate::connection::ClientAddr;
use crate::io::BufferedReader;
use crate::sink::{ResponseSink, respond_plain};
use crate::transport::Transport;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, StatusCode};
use monoio::io::AsyncWriteRentExt;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use tracing::{debug, warn};

const READ_SIZE: usize = 16 * 1024;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

// ── Connection pool ───────────────────────────────────────────

/// Thread-local idle connection pool for one upstream.
pub struct ConnPool<C> {
    idle: VecDeque<C>,
    max_idle: usize,
}

impl<C> ConnPool<C> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: VecDeque::with_capacity(max_idle.min(64)),
            max_idle,
        }
    }

    #[inline]
    pub fn take(&mut self) -> Option<C> {
        self.idle.pop_front()
    }

    #[inline]
    pub fn put(&mut self, conn: C) {
        if self.idle.len() < self.max_idle {
            self.idle.push_back(conn);
        }
        // else: dropped (closes fd)
    }

    pub fn len(&self) -> usize {
        self.idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
    }
}

// ── Handler ───────────────────────────────────────────────────

/// Why one forwarding attempt failed.
enum Failure {
    /// The connection died before any response byte arrived. Safe to retry
    /// on a fresh connection, since the upstream saw nothing usable.
    Stale(io::Error),
    /// Failed before the response head reached the client.
    BeforeHead(String),
    /// Failed while streaming the body; the client already has the head.
    Midstream(io::Error),
}

pub struct Upstream<T: Transport> {
    transport: T,
    pool: RefCell<ConnPool<T::Conn>>,
}

impl<T: Transport> Upstream<T> {
    pub fn new(transport: T, keepalive_pool_size: usize) -> Self {
        Self {
            transport,
            pool: RefCell::new(ConnPool::new(keepalive_pool_size)),
        }
    }

    pub fn idle_connections(&self) -> usize {
        self.pool.borrow().len()
    }

    /// One request/response round trip on `conn`. Returns the connection
    /// when it can be reused.
    async fn round_trip<S: ResponseSink>(
        &self,
        mut conn: T::Conn,
        request: &[u8],
        method: &Method,
        sink: &mut S,
    ) -> Result<Option<T::Conn>, Failure> {
        let (res, _) = conn.write_all(request.to_vec()).await;
        res.map_err(Failure::Stale)?;

        let mut reader = BufferedReader::new(conn, READ_SIZE);
        let head = read_response_head(&mut reader).await?;

        let mut upstream_reusable = codec::wants_keep_alive(head.version, &head.headers);
        let framing = codec::response_framing(method, head.status, &head.headers)
            .map_err(|e| Failure::BeforeHead(e.to_string()))?;
        if framing == Framing::UntilClose {
            upstream_reusable = false;
        }

        codec::copy_end_to_end(&head.headers, sink.headers_mut());
        sink.write_head(head.status)
            .await
            .map_err(Failure::Midstream)?;

        let mut body = IncomingBody::new(&mut reader, BodyDecoder::new(framing));
        while let Some(chunk) = body.chunk().await {
            let chunk = chunk.map_err(Failure::Midstream)?;
            sink.write_body(chunk).await.map_err(Failure::Midstream)?;
        }
        let complete = body.is_complete();

        if upstream_reusable && complete && reader.buffered().is_empty() {
            Ok(Some(reader.into_inner()))
        } else {
            Ok(None)
        }
    }
}

/// Read the final response head, skipping interim 1xx responses.
async fn read_response_head<R: monoio::io::AsyncReadRent>(
    reader: &mut BufferedReader<R>,
) -> Result<ResponseHead, Failure> {
    let mut received = false;
    loop {
        match codec::parse_response_head(reader.buffered()) {
            Ok(Some((head, n))) => {
                reader.consume(n);
                if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                    continue;
                }
                return Ok(head);
            }
            Ok(None) => {}
            Err(e) => return Err(Failure::BeforeHead(format!("bad response head: {e}"))),
        }

        match reader.fill().await {
            Ok(0) if !received => {
                return Err(Failure::Stale(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed before responding",
                )));
            }
            Ok(0) => return Err(Failure::BeforeHead("upstream closed mid-head".into())),
            Ok(_) => received = true,
            Err(e) if !received => return Err(Failure::Stale(e)),
            Err(e) => return Err(Failure::BeforeHead(e.to_string())),
        }
    }
}

/// Add the client address to `x-forwarded-for`, after any earlier hops.
fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        ip
    } else {
        format!("{}, {ip}", prior.join(", "))
    };
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, v);
    }
}

impl<T: Transport> Handler for Upstream<T> {
    async fn serve<B: Body, S: ResponseSink>(
        &self,
        req: Request<B>,
        sink: &mut S,
    ) -> io::Result<()> {
        let (mut parts, mut body) = req.into_parts();

        let payload = match body.try_replay() {
            Some(replay) => replay.into_bytes(),
            None => match read_body(&mut body, usize::MAX).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Failed to read request body for upstream");
                    return respond_plain(sink, StatusCode::BAD_REQUEST).await;
                }
            },
        };

        if let Some(ClientAddr(peer)) = parts.extensions.get::<ClientAddr>().copied() {
            append_forwarded_for(&mut parts.headers, peer);
        }

        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let content_length = if !payload.is_empty()
            || parts.method == Method::POST
            || parts.method == Method::PUT
            || parts.method == Method::PATCH
        {
            Some(payload.len() as u64)
        } else {
            None
        };

        let mut request = Vec::with_capacity(512 + payload.len());
        codec::encode_request_head(
            &mut request,
            &parts.method,
            target,
            &parts.headers,
            content_length,
            self.transport.authority(),
        );
        let mut wire = request;
        wire.extend_from_slice(&payload);

        let mut retried = false;
        loop {
            // Never hold the pool borrow across an await.
            let pooled = self.pool.borrow_mut().take();
            let (conn, from_pool) = match pooled {
                Some(conn) => (conn, true),
                None => match self.transport.connect().await {
                    Ok(conn) => (conn, false),
                    Err(e) => {
                        warn!(addr = %self.transport.authority(), error = %e, "Upstream connect failed");
                        return respond_plain(sink, StatusCode::BAD_GATEWAY).await;
                    }
                },
            };

            match self.round_trip(conn, &wire, &parts.method, sink).await {
                Ok(Some(conn)) => {
                    self.pool.borrow_mut().put(conn);
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Err(Failure::Stale(e)) if from_pool && !retried => {
                    debug!(error = %e, "Pooled upstream connection was stale, retrying");
                    retried = true;
                }
                Err(Failure::Stale(e)) => {
                    warn!(addr = %self.transport.authority(), error = %e, "Upstream failed before responding");
                    return respond_plain(sink, StatusCode::BAD_GATEWAY).await;
                }
                Err(Failure::BeforeHead(reason)) => {
                    warn!(addr = %self.transport.authority(), reason = %reason, "Upstream response unusable");
                    return respond_plain(sink, StatusCode::BAD_GATEWAY).await;
                }
                Err(Failure::Midstream(e)) => {
                    debug!(error = %e, "Response stream aborted");
                    return Err(e);
                }
            }
        }
    }
}
