//! HTTP/1.1 response framing: status line and headers, body delimiting
//! and incremental chunked decoding.

use crate::error::HttpError;
use crate::response::Version;

/// Header slots offered to the parser. More headers is a framing error.
const MAX_HEADERS: usize = 128;

/// Longest accepted chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 4096;

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    status: u16,
    version: Version,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub(crate) fn new(status: u16, version: Version, headers: Vec<(String, String)>) -> Self {
        Self {
            status,
            version,
            headers,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Headers in received order. HTTP/2 names are lowercase.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn into_parts(self) -> (u16, Version, Vec<(String, String)>) {
        (self.status, self.version, self.headers)
    }
}

/// How the end of a response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Chunked,
    Length(u64),
    /// The body runs until the server closes the connection.
    CloseDelimited,
}

/// Framing decisions taken from a parsed head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    /// Bytes of status line and headers, final CRLF included.
    pub header_len: usize,
    pub body: BodyFraming,
    /// The server will not accept another request on this connection.
    pub connection_close: bool,
}

/// Parse a response head from the start of `buf`.
///
/// Returns `Ok(None)` while the head is incomplete. Heads longer than
/// `max_header_bytes` are rejected as soon as that many bytes are buffered.
pub fn parse_head(
    buf: &[u8],
    max_header_bytes: usize,
    head_request: bool,
) -> Result<Option<(ResponseHead, Framing)>, HttpError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut slots);

    let header_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            if buf.len() > max_header_bytes {
                return Err(oversized(max_header_bytes));
            }
            return Ok(None);
        }
        Err(e) => return Err(HttpError::Framing(format!("invalid response head: {e}"))),
    };
    if header_len > max_header_bytes {
        return Err(oversized(max_header_bytes));
    }

    let (Some(minor), Some(status)) = (parsed.version, parsed.code) else {
        return Err(HttpError::Framing("incomplete status line".into()));
    };
    let version = if minor == 0 {
        Version::Http10
    } else {
        Version::Http11
    };

    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();

    let body = body_framing(version, status, head_request, &headers)?;
    let connection_close = wants_close(version, &headers);

    Ok(Some((
        ResponseHead::new(status, version, headers),
        Framing {
            header_len,
            body,
            connection_close,
        },
    )))
}

fn oversized(max: usize) -> HttpError {
    HttpError::Framing(format!("response head exceeds {max} bytes"))
}

fn body_framing(
    version: Version,
    status: u16,
    head_request: bool,
    headers: &[(String, String)],
) -> Result<BodyFraming, HttpError> {
    if head_request || (100..200).contains(&status) || matches!(status, 204 | 304) {
        return Ok(BodyFraming::Length(0));
    }

    let mut length: Option<u64> = None;
    let mut chunked = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            let n = value
                .parse::<u64>()
                .map_err(|_| HttpError::Framing(format!("invalid content-length {value:?}")))?;
            if length.is_some_and(|prev| prev != n) {
                return Err(HttpError::Framing("conflicting content-length".into()));
            }
            length = Some(n);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked |= value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        }
    }

    // Transfer-Encoding overrides Content-Length.
    if chunked && version == Version::Http11 {
        return Ok(BodyFraming::Chunked);
    }
    Ok(length.map_or(BodyFraming::CloseDelimited, BodyFraming::Length))
}

fn wants_close(version: Version, headers: &[(String, String)]) -> bool {
    let has_token = |token: &str| {
        headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
            .flat_map(|(_, value)| value.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    match version {
        Version::Http10 => !has_token("keep-alive"),
        _ => has_token("close"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder.
///
/// Chunk extensions are skipped. Trailer fields are consumed and dropped.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    /// The terminal chunk and trailer section have been consumed.
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Decode as much of `src` as possible, appending chunk data to `out`.
    /// Returns the number of input bytes consumed; the caller keeps the
    /// rest and passes it again with more input.
    pub fn decode(&mut self, src: &[u8], out: &mut Vec<u8>) -> Result<usize, HttpError> {
        let mut pos = 0;
        loop {
            let rest = &src[pos..];
            match self.state {
                ChunkState::Size => {
                    let Some(line) = find_crlf(rest) else {
                        if rest.len() > MAX_CHUNK_LINE {
                            return Err(HttpError::Framing("chunk size line too long".into()));
                        }
                        return Ok(pos);
                    };
                    let size = parse_chunk_size(&rest[..line])?;
                    pos += line + 2;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(left) => {
                    if rest.is_empty() {
                        return Ok(pos);
                    }
                    let n = rest.len().min(usize::try_from(left).unwrap_or(usize::MAX));
                    out.extend_from_slice(&rest[..n]);
                    pos += n;
                    let left = left - n as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                }
                ChunkState::DataEnd => {
                    if rest.len() < 2 {
                        return Ok(pos);
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(HttpError::Framing("missing CRLF after chunk data".into()));
                    }
                    pos += 2;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(line) = find_crlf(rest) else {
                        if rest.len() > MAX_CHUNK_LINE {
                            return Err(HttpError::Framing("trailer field too long".into()));
                        }
                        return Ok(pos);
                    };
                    pos += line + 2;
                    if line == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(pos),
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let digits = line.split(|&b| b == b';').next().unwrap_or_default();
    let digits = std::str::from_utf8(digits)
        .map_err(|_| HttpError::Framing("chunk size is not ASCII".into()))?
        .trim();
    if digits.is_empty() || digits.len() > 16 {
        return Err(HttpError::Framing(format!("invalid chunk size {digits:?}")));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|_| HttpError::Framing(format!("invalid chunk size {digits:?}")))
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Whether `buf` already holds a whole response, head and body.
/// Close-delimited bodies are never complete before the connection closes.
pub fn is_complete_response(
    buf: &[u8],
    max_header_bytes: usize,
    head_request: bool,
) -> Result<bool, HttpError> {
    let mut start = 0;
    loop {
        let Some((head, framing)) = parse_head(&buf[start..], max_header_bytes, head_request)?
        else {
            return Ok(false);
        };
        let body = &buf[start + framing.header_len..];
        if is_interim(head.status()) {
            start += framing.header_len;
            continue;
        }
        return match framing.body {
            BodyFraming::Length(n) => Ok(body.len() as u64 >= n),
            BodyFraming::Chunked => {
                let mut decoder = ChunkedDecoder::new();
                decoder.decode(body, &mut Vec::new())?;
                Ok(decoder.is_done())
            }
            BodyFraming::CloseDelimited => Ok(false),
        };
    }
}

/// 1xx responses other than 101 precede the final response.
pub(crate) fn is_interim(status: u16) -> bool {
    (100..200).contains(&status) && status != 101
}
