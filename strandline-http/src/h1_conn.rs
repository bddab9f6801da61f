//! HTTP/1.1 exchange over a [`Connection`].
//!
//! One request, one response, no pipelining. The response is delivered to
//! the sink as it is decoded, so buffered and streaming calls share the same
//! receive path.

use tracing::trace;

use crate::error::HttpError;
use crate::framing::{self, BodyFraming, ChunkedDecoder};
use crate::request::Request;
use crate::response::Version;
use crate::sink::Delivery;
use crate::transport::Connection;

/// Socket read size.
pub(crate) const READ_BUF_SIZE: usize = 16 * 1024;

/// Headers whose values the engine derives itself.
const FRAMING_HEADERS: [&str; 2] = ["content-length", "transfer-encoding"];

/// Serialize the request line and headers.
pub(crate) fn encode_head(request: &Request, user_agent: &str) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(request.method().as_bytes());
    head.push(b' ');
    head.extend_from_slice(request.path().as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");

    let mut line = |name: &str, value: &str| {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    };

    if request.header("host").is_none() {
        line("Host", &request.target().authority());
    }
    if !user_agent.is_empty() && request.header("user-agent").is_none() {
        line("User-Agent", user_agent);
    }
    for (name, value) in request.headers() {
        if FRAMING_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        line(name, value);
    }
    let payload = request.payload();
    if !payload.is_empty() {
        if request.header("content-type").is_none() {
            line("Content-Type", "application/json");
        }
        line("Content-Length", &payload.len().to_string());
    }
    if request.header("connection").is_none() {
        line("Connection", "keep-alive");
    }

    head.extend_from_slice(b"\r\n");
    head
}

/// Send the head, then the payload piece by piece.
pub(crate) fn write_request(
    conn: &mut Connection,
    request: &Request,
    user_agent: &str,
) -> Result<(), HttpError> {
    conn.send_all(&encode_head(request, user_agent))?;
    request
        .payload()
        .write_chunks(|chunk| conn.send_all(chunk))
}

/// Result of a completed HTTP/1.1 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Exchange {
    pub version: Version,
    /// The connection can carry another request.
    pub reusable: bool,
}

enum Phase {
    Head,
    Length(u64),
    Chunked(ChunkedDecoder),
    UntilClose,
    Done,
}

/// Incremental response parser feeding a [`Delivery`].
pub(crate) struct ResponseReader {
    buf: Vec<u8>,
    max_header_bytes: usize,
    head_request: bool,
    phase: Phase,
    version: Version,
    keep_alive: bool,
    received_any: bool,
}

impl ResponseReader {
    pub(crate) fn new(request: &Request, max_header_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_header_bytes,
            head_request: request.is_head(),
            phase: Phase::Head,
            version: Version::Http11,
            keep_alive: true,
            received_any: false,
        }
    }

    /// Seed the parser with bytes that were already read from the
    /// connection.
    pub(crate) fn with_prefetched(mut self, prefetched: Vec<u8>) -> Self {
        self.received_any |= !prefetched.is_empty();
        self.buf = prefetched;
        self
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    fn exchange(&self) -> Exchange {
        Exchange {
            version: self.version,
            reusable: self.is_done() && self.keep_alive && self.buf.is_empty(),
        }
    }

    /// Decode whatever is buffered without reading more. Fails unless the
    /// buffer holds the whole response.
    pub(crate) fn finish_buffered(mut self, delivery: &mut Delivery<'_>) -> Result<Exchange, HttpError> {
        self.advance(delivery)?;
        if !self.is_done() {
            return Err(HttpError::Framing("buffered response is incomplete".into()));
        }
        Ok(self.exchange())
    }

    /// Read from `conn` until the response is complete.
    pub(crate) fn run(
        mut self,
        conn: &mut Connection,
        delivery: &mut Delivery<'_>,
    ) -> Result<Exchange, HttpError> {
        self.advance(delivery)?;
        let mut chunk = vec![0u8; READ_BUF_SIZE];
        while !self.is_done() {
            let n = conn.recv(&mut chunk)?;
            if n == 0 {
                self.on_eof(delivery, conn.from_pool)?;
                break;
            }
            self.received_any = true;
            self.buf.extend_from_slice(&chunk[..n]);
            self.advance(delivery)?;
        }
        if !self.buf.is_empty() {
            trace!(surplus = self.buf.len(), "bytes after response end");
        }
        Ok(self.exchange())
    }

    fn advance(&mut self, delivery: &mut Delivery<'_>) -> Result<(), HttpError> {
        loop {
            match &mut self.phase {
                Phase::Head => {
                    let Some((head, framing)) =
                        framing::parse_head(&self.buf, self.max_header_bytes, self.head_request)?
                    else {
                        return Ok(());
                    };
                    self.buf.drain(..framing.header_len);
                    if framing::is_interim(head.status()) {
                        trace!(status = head.status(), "skipping interim response");
                        continue;
                    }

                    self.version = head.version();
                    self.keep_alive = !framing.connection_close && head.status() != 101;
                    delivery.headers(&head)?;
                    self.phase = match framing.body {
                        BodyFraming::Length(n) => Phase::Length(n),
                        BodyFraming::Chunked => Phase::Chunked(ChunkedDecoder::new()),
                        BodyFraming::CloseDelimited => {
                            self.keep_alive = false;
                            Phase::UntilClose
                        }
                    };
                }
                Phase::Length(remaining) => {
                    let n = (*remaining).min(self.buf.len() as u64) as usize;
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        self.phase = Phase::Done;
                        let result = delivery.finish(&self.buf[..n]);
                        self.buf.drain(..n);
                        return result;
                    }
                    delivery.body(&self.buf[..n])?;
                    self.buf.drain(..n);
                    return Ok(());
                }
                Phase::Chunked(decoder) => {
                    let mut decoded = Vec::new();
                    let used = decoder.decode(&self.buf, &mut decoded)?;
                    self.buf.drain(..used);
                    if decoder.is_done() {
                        self.phase = Phase::Done;
                        return delivery.finish(&decoded);
                    }
                    return delivery.body(&decoded);
                }
                Phase::UntilClose => {
                    delivery.body(&self.buf)?;
                    self.buf.clear();
                    return Ok(());
                }
                Phase::Done => return Ok(()),
            }
        }
    }

    fn on_eof(&mut self, delivery: &mut Delivery<'_>, reused: bool) -> Result<(), HttpError> {
        self.keep_alive = false;
        match self.phase {
            Phase::Head if !self.received_any && reused => Err(HttpError::ConnectionClosed),
            Phase::Head if !self.received_any => Err(HttpError::Framing(
                "connection closed before any response bytes".into(),
            )),
            Phase::Head => Err(HttpError::Framing(
                "connection closed inside response head".into(),
            )),
            Phase::Length(remaining) => Err(HttpError::Framing(format!(
                "connection closed with {remaining} body bytes outstanding"
            ))),
            Phase::Chunked(_) => Err(HttpError::Framing(
                "connection closed inside chunked body".into(),
            )),
            Phase::UntilClose => {
                self.phase = Phase::Done;
                delivery.finish(&[])
            }
            Phase::Done => Ok(()),
        }
    }
}

/// Send `request` and receive its response on `conn`.
pub(crate) fn exchange(
    conn: &mut Connection,
    request: &Request,
    user_agent: &str,
    max_header_bytes: usize,
    delivery: &mut Delivery<'_>,
) -> Result<Exchange, HttpError> {
    write_request(conn, request, user_agent)?;
    ResponseReader::new(request, max_header_bytes).run(conn, delivery)
}
