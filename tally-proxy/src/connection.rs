use crate::body::IncomingBody;
use crate::capture::Handler;
use crate::codec::{self, BodyDecoder, Framing, RESP_100_CONTINUE, RESP_400, RESP_431};
use crate::io::BufferedReader;
use crate::sink::{DirectSink, ResponseSink, respond_plain};
use http::{Method, Request, StatusCode};
use monoio::io::{AsyncWriteRentExt, Splitable};
use monoio::net::TcpStream;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::debug;

/// Address of the client that sent a request, stored in its extensions.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnLimits {
    /// Largest accepted request head; bigger heads get 431.
    pub max_head_bytes: usize,
    /// How much unread request body may be skipped to keep the connection
    /// alive; beyond this the connection is closed instead.
    pub drain_limit: usize,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            drain_limit: 64 * 1024,
        }
    }
}

/// Serve one client connection (HTTP/1.1 with keep-alive).
///
/// Exchanges on a connection run strictly one after another. The handler
/// is shared by every connection on this worker thread.
pub async fn handle_connection<H: Handler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Rc<H>,
    limits: ConnLimits,
) -> anyhow::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufferedReader::new(rd, 8192);

    loop {
        // ── Request head ──
        let (head, consumed) = loop {
            match codec::parse_request_head(reader.buffered()) {
                Ok(Some(parsed)) => break parsed,
                Ok(None) => {
                    if reader.buffered().len() >= limits.max_head_bytes {
                        let (res, _) = wr.write_all(RESP_431.to_vec()).await;
                        res?;
                        return Ok(());
                    }
                    if reader.fill().await? == 0 {
                        return Ok(());
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "HTTP parse error");
                    let (res, _) = wr.write_all(RESP_400.to_vec()).await;
                    res?;
                    return Ok(());
                }
            }
        };
        if consumed > limits.max_head_bytes {
            let (res, _) = wr.write_all(RESP_431.to_vec()).await;
            res?;
            return Ok(());
        }
        reader.consume(consumed);

        let framing = match codec::request_framing(head.headers()) {
            Ok(framing) => framing,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Bad request framing");
                let (res, _) = wr.write_all(RESP_400.to_vec()).await;
                res?;
                return Ok(());
            }
        };

        let version = head.version();
        let keep_alive = codec::wants_keep_alive(version, head.headers());
        let head_request = *head.method() == Method::HEAD;

        if framing != Framing::Empty && codec::expects_continue(head.headers()) {
            let (res, _) = wr.write_all(RESP_100_CONTINUE.to_vec()).await;
            res?;
        }

        // ── Exchange ──
        let mut body = IncomingBody::new(&mut reader, BodyDecoder::new(framing));
        let (parts, ()) = head.into_parts();
        let mut request = Request::from_parts(parts, &mut body);
        request.extensions_mut().insert(ClientAddr(peer));

        let mut sink = DirectSink::new(&mut wr, version, head_request, keep_alive);
        if let Err(e) = handler.serve(request, &mut sink).await {
            debug!(peer = %peer, error = %e, "Exchange failed");
            if sink.status().is_none() {
                let _ = respond_plain(&mut sink, StatusCode::INTERNAL_SERVER_ERROR).await;
            }
            return Ok(());
        }
        sink.finish().await?;
        let reusable = sink.reusable();

        if !body.is_complete() && !body.drain(limits.drain_limit).await.unwrap_or(false) {
            return Ok(());
        }
        if !reusable {
            return Ok(());
        }
    }
}
