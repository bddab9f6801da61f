//! Loopback servers and sinks shared by the integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use strandline_h2::frame::decode_frame;
use strandline_h2::{CLIENT_PREFACE, Frame, HeaderField, block};
use strandline_http::{ClientConfig, HttpClient, ResponseHead, StreamSink, Target};

pub fn client() -> HttpClient {
    HttpClient::with_config(ClientConfig {
        connect_timeout_ms: 2_000,
        io_timeout_ms: 5_000,
        ..ClientConfig::default()
    })
    .unwrap()
}

/// Bind an ephemeral port and run `serve` on a server thread.
pub fn spawn_server<T: Send + 'static>(
    serve: impl FnOnce(TcpListener) -> T + Send + 'static,
) -> (Target, JoinHandle<T>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || serve(listener));
    (Target::plain("127.0.0.1", port), handle)
}

/// A port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn accept(listener: &TcpListener) -> TcpStream {
    let (stream, _) = listener.accept().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Read one HTTP/1.1 request, head and `Content-Length` body. Returns
/// `None` if the peer closed first.
pub fn read_request(stream: &mut impl Read) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    let body_len = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + body_len {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(buf)
}

/// Read until the peer closes, ignoring errors.
pub fn drain(stream: &mut impl Read) {
    let mut chunk = [0u8; 4096];
    while matches!(stream.read(&mut chunk), Ok(n) if n > 0) {}
}

pub fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

// -- HTTP/2 server side --

/// Read the client preface and its SETTINGS frame.
pub fn read_preface(stream: &mut impl Read) {
    let mut preface = [0u8; 24];
    stream.read_exact(&mut preface).unwrap();
    assert_eq!(&preface[..], CLIENT_PREFACE);

    let mut header = [0u8; 9];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(header[3], strandline_h2::frame::FRAME_SETTINGS);
    let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
}

pub fn write_frames(stream: &mut impl Write, frames: &[Frame]) {
    let mut out = Vec::new();
    for frame in frames {
        frame.encode(&mut out).unwrap();
    }
    stream.write_all(&out).unwrap();
    stream.flush().unwrap();
}

pub fn headers_frame(stream_id: u32, fields: &[HeaderField], end_stream: bool) -> Frame {
    let mut encoded = Vec::new();
    block::encode(fields, &mut encoded).unwrap();
    Frame::Headers {
        stream_id,
        block: encoded,
        end_stream,
        end_headers: true,
        priority: None,
    }
}

pub fn data_frame(stream_id: u32, payload: &[u8], end_stream: bool) -> Frame {
    Frame::Data {
        stream_id,
        payload: payload.to_vec(),
        end_stream,
    }
}

/// Complete the SETTINGS exchange, wait for the request HEADERS, then run
/// `respond` with the stream id and decoded request headers.
pub fn serve_h2<S: Read + Write>(
    stream: &mut S,
    respond: impl FnOnce(&mut S, u32, Vec<HeaderField>),
) {
    read_preface(stream);
    write_frames(
        stream,
        &[
            Frame::Settings {
                ack: false,
                params: Vec::new(),
            },
            Frame::Settings {
                ack: true,
                params: Vec::new(),
            },
        ],
    );

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        while let Some((frame, consumed)) = decode_frame(&buf, 1 << 20).unwrap() {
            buf.drain(..consumed);
            if let Frame::Headers {
                stream_id,
                block: encoded,
                end_headers: true,
                ..
            } = frame
            {
                let headers = block::decode(&encoded, None).unwrap();
                respond(stream, stream_id, headers);
                return;
            }
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "client closed before sending HEADERS");
        buf.extend_from_slice(&chunk[..n]);
    }
}

// -- Sinks --

/// Records every sink call.
#[derive(Debug, Default)]
pub struct Recorder {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<Vec<u8>>,
    pub finals: usize,
    pub calls_after_final: usize,
}

impl Recorder {
    pub fn body(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

impl StreamSink for Recorder {
    fn on_headers(&mut self, head: &ResponseHead) -> bool {
        self.status = Some(head.status());
        self.headers = head.headers().to_vec();
        true
    }

    fn on_body(&mut self, chunk: &[u8], is_final: bool) -> bool {
        if self.finals > 0 {
            self.calls_after_final += 1;
        }
        if !chunk.is_empty() {
            self.chunks.push(chunk.to_vec());
        }
        if is_final {
            self.finals += 1;
        }
        true
    }
}
