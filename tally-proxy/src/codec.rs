//! HTTP/1.1 wire format: head parsing, head encoding, body framing.
//!
//! Everything here is synchronous and works on byte slices, so the
//! connection loop and the upstream client only deal with I/O.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, StatusCode, Version};
use thiserror::Error;

/// Upper bound on header lines in one message head.
pub const MAX_HEADERS: usize = 100;

pub const RESP_400: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
pub const RESP_431: &[u8] =
    b"HTTP/1.1 431 Request Header Fields Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
pub const RESP_100_CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Terminating zero-length chunk with an empty trailer section.
pub const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("invalid method: {0}")]
    Method(#[from] http::method::InvalidMethod),

    #[error("invalid request target: {0}")]
    Uri(#[from] http::uri::InvalidUri),

    #[error("invalid header name: {0}")]
    HeaderName(#[from] http::header::InvalidHeaderName),

    #[error("invalid header value: {0}")]
    HeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error("invalid status code: {0}")]
    Status(#[from] http::status::InvalidStatusCode),

    #[error("invalid content-length")]
    ContentLength,

    #[error("unsupported transfer-encoding")]
    TransferEncoding,

    #[error("invalid chunked encoding")]
    Chunked,

    #[error("message body ended early")]
    UnexpectedEof,
}

// ── Head parsing ──────────────────────────────────────────────

/// Parse a request head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the request
/// (with an empty body) and the number of bytes the head occupied.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(Request<()>, usize)>, CodecError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw);

    let consumed = match req.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let mut request = Request::new(());
    *request.method_mut() = Method::from_bytes(req.method.unwrap_or("GET").as_bytes())?;
    *request.uri_mut() = req.path.unwrap_or("/").parse()?;
    *request.version_mut() = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    *request.headers_mut() = collect_headers(req.headers)?;

    Ok(Some((request, consumed)))
}

/// Status line and headers of an upstream response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, CodecError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut raw);

    let consumed = match resp.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let head = ResponseHead {
        status: StatusCode::from_u16(resp.code.unwrap_or(0))?,
        version: match resp.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        },
        headers: collect_headers(resp.headers)?,
    };
    Ok(Some((head, consumed)))
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, CodecError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        if h.name.is_empty() {
            break;
        }
        headers.append(
            HeaderName::from_bytes(h.name.as_bytes())?,
            HeaderValue::from_bytes(h.value)?,
        );
    }
    Ok(headers)
}

// ── Header semantics ──────────────────────────────────────────

/// Headers that describe a single hop and are never forwarded.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Tokens named by the `Connection` header, lowercased.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// True when `name` must be stripped before forwarding: a standard
/// hop-by-hop header or one listed in `Connection`.
pub fn is_hop_header(name: &HeaderName, connection_tokens: &[String]) -> bool {
    is_hop_by_hop(name) || connection_tokens.iter().any(|t| t == name.as_str())
}

/// Copy end-to-end headers from `src` into `dst`.
pub fn copy_end_to_end(src: &HeaderMap, dst: &mut HeaderMap) {
    let tokens = connection_tokens(src);
    for (name, value) in src.iter() {
        if !is_hop_header(name, &tokens) {
            dst.append(name.clone(), value.clone());
        }
    }
}

/// Whether the peer wants the connection kept open after this message.
pub fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let tokens = connection_tokens(headers);
    if tokens.iter().any(|t| t == "close") {
        return false;
    }
    match version {
        Version::HTTP_10 => tokens.iter().any(|t| t == "keep-alive"),
        _ => true,
    }
}

pub fn expects_continue(headers: &HeaderMap) -> bool {
    headers
        .get(header::EXPECT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
}

// ── Body framing ──────────────────────────────────────────────

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the peer closes (responses only).
    UntilClose,
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, CodecError> {
    let mut found: Option<u64> = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let n: u64 = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(CodecError::ContentLength)?;
        match found {
            Some(prev) if prev != n => return Err(CodecError::ContentLength),
            _ => found = Some(n),
        }
    }
    Ok(found)
}

/// `Ok(true)` when chunked is the final transfer coding.
fn chunked(headers: &HeaderMap) -> Result<bool, CodecError> {
    let last = headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .last();
    match last {
        None => Ok(false),
        Some(t) if t.eq_ignore_ascii_case("chunked") => Ok(true),
        Some(_) => Err(CodecError::TransferEncoding),
    }
}

pub fn request_framing(headers: &HeaderMap) -> Result<Framing, CodecError> {
    if chunked(headers)? {
        return Ok(Framing::Chunked);
    }
    Ok(match content_length(headers)? {
        None | Some(0) => Framing::Empty,
        Some(n) => Framing::Length(n),
    })
}

pub fn response_framing(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<Framing, CodecError> {
    if *method == Method::HEAD || !status_has_body(status) {
        return Ok(Framing::Empty);
    }
    match chunked(headers) {
        Ok(true) => return Ok(Framing::Chunked),
        Ok(false) => {}
        // Unknown coding on a response: read until close.
        Err(_) => return Ok(Framing::UntilClose),
    }
    Ok(match content_length(headers)? {
        Some(0) => Framing::Empty,
        Some(n) => Framing::Length(n),
        None => Framing::UntilClose,
    })
}

pub fn status_has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

// ── Body decoding ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
    Done,
}

/// One step of body decoding over the currently buffered bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct Decoded<'a> {
    /// Bytes of input used up by this step, framing included.
    pub consumed: usize,
    /// Payload bytes found in this step (may be empty).
    pub data: &'a [u8],
    /// The body is complete.
    pub done: bool,
}

/// Incremental body decoder. Feed it whatever is buffered; it reports how
/// much it used and which payload bytes it found.
#[derive(Debug, Clone)]
pub struct BodyDecoder {
    state: DecodeState,
}

impl BodyDecoder {
    pub fn new(framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty | Framing::Length(0) => DecodeState::Done,
            Framing::Length(n) => DecodeState::Length(n),
            Framing::Chunked => DecodeState::Chunked(ChunkState::Size),
            Framing::UntilClose => DecodeState::UntilClose,
        };
        Self { state }
    }

    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Known remaining length, when the framing carries one.
    pub fn remaining(&self) -> Option<u64> {
        match self.state {
            DecodeState::Length(n) => Some(n),
            DecodeState::Done => Some(0),
            _ => None,
        }
    }

    /// Decode from `buf`. A result with `consumed == 0`, no data and
    /// `done == false` means more input is required.
    pub fn decode<'a>(&mut self, buf: &'a [u8]) -> Result<Decoded<'a>, CodecError> {
        let mut offset = 0;
        loop {
            let rest = &buf[offset..];
            match self.state {
                DecodeState::Done => return Ok(step(offset, &[], true)),
                DecodeState::UntilClose => {
                    return Ok(Decoded {
                        consumed: offset + rest.len(),
                        data: rest,
                        done: false,
                    });
                }
                DecodeState::Length(remaining) => {
                    let n = (remaining.min(rest.len() as u64)) as usize;
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        DecodeState::Done
                    } else {
                        DecodeState::Length(left)
                    };
                    return Ok(Decoded {
                        consumed: offset + n,
                        data: &rest[..n],
                        done: left == 0,
                    });
                }
                DecodeState::Chunked(ChunkState::Size) => {
                    match httparse::parse_chunk_size(rest).map_err(|_| CodecError::Chunked)? {
                        httparse::Status::Complete((used, 0)) => {
                            offset += used;
                            self.state = DecodeState::Chunked(ChunkState::Trailers);
                        }
                        httparse::Status::Complete((used, size)) => {
                            offset += used;
                            self.state = DecodeState::Chunked(ChunkState::Data(size));
                        }
                        httparse::Status::Partial => return Ok(step(offset, &[], false)),
                    }
                }
                DecodeState::Chunked(ChunkState::Data(remaining)) => {
                    if rest.is_empty() {
                        return Ok(step(offset, &[], false));
                    }
                    let n = (remaining.min(rest.len() as u64)) as usize;
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        DecodeState::Chunked(ChunkState::DataEnd)
                    } else {
                        DecodeState::Chunked(ChunkState::Data(left))
                    };
                    return Ok(Decoded {
                        consumed: offset + n,
                        data: &rest[..n],
                        done: false,
                    });
                }
                DecodeState::Chunked(ChunkState::DataEnd) => {
                    if rest.len() < 2 {
                        return Ok(step(offset, &[], false));
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(CodecError::Chunked);
                    }
                    offset += 2;
                    self.state = DecodeState::Chunked(ChunkState::Size);
                }
                DecodeState::Chunked(ChunkState::Trailers) => {
                    let Some(eol) = rest.windows(2).position(|w| w == b"\r\n") else {
                        return Ok(step(offset, &[], false));
                    };
                    offset += eol + 2;
                    if eol == 0 {
                        self.state = DecodeState::Done;
                        return Ok(step(offset, &[], true));
                    }
                    // Trailer fields are discarded.
                }
            }
        }
    }

    /// The peer closed the stream. Only until-close bodies may end this way.
    pub fn eof(&mut self) -> Result<(), CodecError> {
        match self.state {
            DecodeState::Done => Ok(()),
            DecodeState::UntilClose => {
                self.state = DecodeState::Done;
                Ok(())
            }
            _ => Err(CodecError::UnexpectedEof),
        }
    }
}

fn step(consumed: usize, data: &[u8], done: bool) -> Decoded<'_> {
    Decoded {
        consumed,
        data,
        done,
    }
}

// ── Encoding ──────────────────────────────────────────────────

/// Encode a request head for the upstream hop.
///
/// Hop-by-hop headers are dropped, `content-length` is rewritten from
/// `content_length`, and the client's `Host` is kept (or `fallback_host`
/// supplied when the client sent none).
pub fn encode_request_head(
    buf: &mut Vec<u8>,
    method: &Method,
    target: &str,
    headers: &HeaderMap,
    content_length: Option<u64>,
    fallback_host: &str,
) {
    buf.clear();
    buf.extend_from_slice(method.as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    let tokens = connection_tokens(headers);
    for (name, value) in headers.iter() {
        if is_hop_header(name, &tokens)
            || *name == header::CONTENT_LENGTH
            || *name == header::EXPECT
        {
            continue;
        }
        push_header(buf, name.as_str().as_bytes(), value.as_bytes());
    }
    if !headers.contains_key(header::HOST) {
        push_header(buf, b"host", fallback_host.as_bytes());
    }
    buf.extend_from_slice(b"connection: keep-alive\r\n");
    if let Some(n) = content_length {
        let mut itoa_buf = itoa::Buffer::new();
        push_header(buf, b"content-length", itoa_buf.format(n).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
}

/// Encode a response status line and headers exactly as given.
pub fn encode_response_head(buf: &mut Vec<u8>, status: StatusCode, headers: &HeaderMap) {
    buf.clear();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(status.as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (name, value) in headers.iter() {
        push_header(buf, name.as_str().as_bytes(), value.as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
}

/// Append one chunk frame. Empty input writes nothing, since a zero-size
/// frame would end the body.
pub fn encode_chunk(buf: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    buf.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

#[inline]
fn push_header(buf: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    buf.extend_from_slice(name);
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    /// Feed `parts` to a fresh decoder one at a time, as separate reads would.
    fn decode_all(framing: Framing, parts: &[&[u8]]) -> (Vec<u8>, bool) {
        let mut decoder = BodyDecoder::new(framing);
        let mut pending: Vec<u8> = Vec::new();
        let mut out = Vec::new();
        for part in parts {
            pending.extend_from_slice(part);
            loop {
                let d = decoder.decode(&pending).unwrap();
                out.extend_from_slice(d.data);
                let consumed = d.consumed;
                let done = d.done;
                pending.drain(..consumed);
                if done {
                    return (out, true);
                }
                if consumed == 0 {
                    break;
                }
            }
        }
        (out, decoder.is_done())
    }

    // ── parse_request_head ───────────────────────────────────────

    #[test]
    fn parse_request_head_complete() {
        let raw = b"POST /users?id=7 HTTP/1.1\r\nHost: api.local\r\nX-Trace: a\r\nX-Trace: b\r\n\r\nbody";
        let (req, n) = parse_request_head(raw).unwrap().unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().to_string(), "/users?id=7");
        assert_eq!(req.version(), Version::HTTP_11);
        assert_eq!(req.headers()["host"], "api.local");
        assert_eq!(req.headers().get_all("x-trace").iter().count(), 2);
        assert_eq!(&raw[n..], b"body");
    }

    #[test]
    fn parse_request_head_partial_needs_more() {
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nHost: a").unwrap().is_none());
    }

    #[test]
    fn parse_request_head_rejects_garbage() {
        assert!(parse_request_head(b"NOT HTTP\r\n\r\n").is_err());
    }

    #[test]
    fn parse_request_head_http10() {
        let (req, _) = parse_request_head(b"GET / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert_eq!(req.version(), Version::HTTP_10);
    }

    #[test]
    fn parse_response_head_complete() {
        let raw = b"HTTP/1.1 201 Created\r\ncontent-length: 2\r\n\r\nok";
        let (head, n) = parse_response_head(raw).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::CREATED);
        assert_eq!(head.headers["content-length"], "2");
        assert_eq!(&raw[n..], b"ok");
    }

    // ── framing ──────────────────────────────────────────────────

    #[test]
    fn request_framing_rules() {
        assert_eq!(request_framing(&headers(&[])).unwrap(), Framing::Empty);
        assert_eq!(
            request_framing(&headers(&[("content-length", "12")])).unwrap(),
            Framing::Length(12)
        );
        assert_eq!(
            request_framing(&headers(&[("transfer-encoding", "chunked"), ("content-length", "3")]))
                .unwrap(),
            Framing::Chunked
        );
        assert!(request_framing(&headers(&[("content-length", "abc")])).is_err());
        assert!(request_framing(&headers(&[("content-length", "1"), ("content-length", "2")])).is_err());
        assert!(request_framing(&headers(&[("transfer-encoding", "gzip")])).is_err());
    }

    #[test]
    fn response_framing_rules() {
        let none = headers(&[]);
        let cl = headers(&[("content-length", "5")]);
        assert_eq!(response_framing(&Method::HEAD, StatusCode::OK, &cl).unwrap(), Framing::Empty);
        assert_eq!(response_framing(&Method::GET, StatusCode::NO_CONTENT, &none).unwrap(), Framing::Empty);
        assert_eq!(response_framing(&Method::GET, StatusCode::NOT_MODIFIED, &cl).unwrap(), Framing::Empty);
        assert_eq!(response_framing(&Method::GET, StatusCode::OK, &cl).unwrap(), Framing::Length(5));
        assert_eq!(response_framing(&Method::GET, StatusCode::OK, &none).unwrap(), Framing::UntilClose);
        assert_eq!(
            response_framing(&Method::GET, StatusCode::OK, &headers(&[("transfer-encoding", "chunked")]))
                .unwrap(),
            Framing::Chunked
        );
    }

    #[test]
    fn keep_alive_defaults_per_version() {
        assert!(wants_keep_alive(Version::HTTP_11, &headers(&[])));
        assert!(!wants_keep_alive(Version::HTTP_11, &headers(&[("connection", "Close")])));
        assert!(!wants_keep_alive(Version::HTTP_10, &headers(&[])));
        assert!(wants_keep_alive(Version::HTTP_10, &headers(&[("connection", "keep-alive")])));
    }

    // ── BodyDecoder ──────────────────────────────────────────────

    #[test]
    fn length_decoder_stops_at_content_length() {
        let mut d = BodyDecoder::new(Framing::Length(5));
        let step = d.decode(b"helloGET / HTTP/1.1").unwrap();
        assert_eq!(step.data, b"hello");
        assert_eq!(step.consumed, 5);
        assert!(step.done);
        assert!(d.is_done());
    }

    #[test]
    fn length_decoder_across_reads() {
        let (body, done) = decode_all(Framing::Length(11), &[b"hello", b" ", b"world"]);
        assert_eq!(body, b"hello world");
        assert!(done);
    }

    #[test]
    fn chunked_decoder_whole_buffer() {
        let (body, done) = decode_all(
            Framing::Chunked,
            &[b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"],
        );
        assert_eq!(body, b"hello world");
        assert!(done);
    }

    #[test]
    fn chunked_decoder_split_everywhere() {
        let wire = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nExpires: never\r\n\r\n";
        let parts: Vec<&[u8]> = wire.chunks(1).collect();
        let (body, done) = decode_all(Framing::Chunked, &parts);
        assert_eq!(body, b"Wikipedia");
        assert!(done);
    }

    #[test]
    fn chunked_decoder_rejects_bad_size() {
        let mut d = BodyDecoder::new(Framing::Chunked);
        assert!(d.decode(b"zz\r\n").is_err());
    }

    #[test]
    fn chunked_decoder_rejects_missing_crlf_after_data() {
        let mut d = BodyDecoder::new(Framing::Chunked);
        let first = d.decode(b"3\r\nabcXY").unwrap();
        assert_eq!(first.data, b"abc");
        assert!(d.decode(b"XY").is_err());
    }

    #[test]
    fn eof_only_ends_until_close_bodies() {
        let mut until_close = BodyDecoder::new(Framing::UntilClose);
        assert_eq!(until_close.decode(b"abc").unwrap().data, b"abc");
        assert!(until_close.eof().is_ok());
        assert!(until_close.is_done());

        let mut truncated = BodyDecoder::new(Framing::Length(10));
        truncated.decode(b"abc").unwrap();
        assert!(truncated.eof().is_err());
    }

    // ── encoding ─────────────────────────────────────────────────

    #[test]
    fn encode_request_head_filters_hop_by_hop_and_keeps_host() {
        let mut buf = Vec::new();
        let h = headers(&[
            ("host", "client.example"),
            ("connection", "close, x-private"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("x-private", "secret"),
            ("x-forwarded-for", "1.2.3.4"),
            ("content-length", "999"),
        ]);
        encode_request_head(&mut buf, &Method::POST, "/submit", &h, Some(4), "backend:80");
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("host: client.example\r\n"));
        assert!(!text.contains("backend:80"));
        assert!(!text.contains("keep-alive: timeout=5"));
        assert!(!text.contains("transfer-encoding"));
        assert!(!text.contains("upgrade"));
        assert!(!text.contains("x-private"));
        assert!(text.contains("x-forwarded-for: 1.2.3.4\r\n"));
        assert!(text.contains("content-length: 4\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encode_request_head_supplies_missing_host() {
        let mut buf = Vec::new();
        encode_request_head(&mut buf, &Method::GET, "/", &HeaderMap::new(), None, "backend:8080");
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("host: backend:8080\r\n"));
        assert!(!text.contains("content-length"));
    }

    #[test]
    fn encode_response_head_status_line() {
        let mut buf = Vec::new();
        encode_response_head(&mut buf, StatusCode::IM_A_TEAPOT, &headers(&[("x-a", "1")]));
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 418 I'm a teapot\r\n"));
        assert!(text.contains("x-a: 1\r\n"));

        encode_response_head(&mut buf, StatusCode::from_u16(599).unwrap(), &HeaderMap::new());
        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 599 Unknown\r\n"));
    }

    #[test]
    fn encode_chunk_frames_and_skips_empty() {
        let mut buf = Vec::new();
        encode_chunk(&mut buf, b"");
        assert!(buf.is_empty());
        encode_chunk(&mut buf, &[b'x'; 26]);
        assert!(buf.starts_with(b"1a\r\n"));
        assert!(buf.ends_with(b"\r\n"));

        let (body, done) = decode_all(
            Framing::Chunked,
            &[&buf, CHUNKED_TERMINATOR],
        );
        assert_eq!(body, vec![b'x'; 26]);
        assert!(done);
    }

    #[test]
    fn canned_responses_parse() {
        for raw in [RESP_400, RESP_431] {
            let (head, n) = parse_response_head(raw).unwrap().unwrap();
            assert!(head.status.is_client_error());
            assert_eq!(n, raw.len());
        }
    }
}
