//! Integration tests: a blocking loopback server speaking the frame and
//! header block formats, driven by a client `H2Connection`.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use strandline_h2::frame::decode_frame;
use strandline_h2::{
    CLIENT_PREFACE, ConnState, Frame, H2Connection, H2Event, HeaderField, Settings, block,
};

// -- Server side --

/// Reads the client preface and frames until the request HEADERS arrive,
/// then runs `respond` with the decoded request header block.
fn spawn_h2_server(
    respond: impl FnOnce(&mut TcpStream, u32, Vec<HeaderField>) + Send + 'static,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut preface = [0u8; 24];
        stream.read_exact(&mut preface).unwrap();
        assert_eq!(&preface[..], CLIENT_PREFACE);

        let mut buf = Vec::new();
        let mut out = Vec::new();
        Frame::Settings {
            ack: false,
            params: Vec::new(),
        }
        .encode(&mut out)
        .unwrap();
        stream.write_all(&out).unwrap();

        loop {
            while let Some((frame, consumed)) = decode_frame(&buf, 1 << 20).unwrap() {
                buf.drain(..consumed);
                match frame {
                    Frame::Settings { ack: false, .. } => {
                        let mut ack = Vec::new();
                        Frame::Settings {
                            ack: true,
                            params: Vec::new(),
                        }
                        .encode(&mut ack)
                        .unwrap();
                        stream.write_all(&ack).unwrap();
                    }
                    Frame::Headers {
                        stream_id,
                        block: encoded,
                        end_headers: true,
                        ..
                    } => {
                        let headers = block::decode(&encoded, None).unwrap();
                        respond(&mut stream, stream_id, headers);
                        return;
                    }
                    _ => {}
                }
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "client closed before sending HEADERS");
            buf.extend_from_slice(&chunk[..n]);
        }
    });
    (addr, handle)
}

fn write_frames(stream: &mut TcpStream, frames: &[Frame]) {
    let mut out = Vec::new();
    for frame in frames {
        frame.encode(&mut out).unwrap();
    }
    stream.write_all(&out).unwrap();
}

fn headers_frame(stream_id: u32, fields: &[HeaderField], end_stream: bool) -> Frame {
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

// -- Client side --

struct Client {
    tcp: TcpStream,
    h2: H2Connection,
    events: Vec<H2Event>,
}

impl Client {
    fn connect(addr: SocketAddr, h2: H2Connection) -> Self {
        let tcp = TcpStream::connect(addr).unwrap();
        tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut client = Self {
            tcp,
            h2,
            events: Vec::new(),
        };
        client.flush();
        client
    }

    fn flush(&mut self) {
        if self.h2.has_pending_send() {
            let out = self.h2.take_pending_send();
            self.tcp.write_all(&out).unwrap();
        }
    }

    /// Read once and feed the connection. Returns false on EOF.
    fn pump(&mut self) -> bool {
        let mut chunk = [0u8; 8192];
        let n = self.tcp.read(&mut chunk).unwrap();
        if n == 0 {
            return false;
        }
        self.h2.recv(&chunk[..n]).unwrap();
        self.flush();
        while let Some(event) = self.h2.poll_event() {
            self.events.push(event);
        }
        true
    }

    fn drive_until(&mut self, mut done: impl FnMut(&H2Connection) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&self.h2) {
            assert!(Instant::now() < deadline, "timed out");
            if !self.pump() {
                break;
            }
        }
    }
}

fn get(authority: &str) -> Vec<HeaderField> {
    vec![
        HeaderField::new(":method", "GET"),
        HeaderField::new(":path", "/"),
        HeaderField::new(":scheme", "http"),
        HeaderField::new(":authority", authority),
    ]
}

// -- Tests --

#[test]
fn h2c_request_response() {
    let (addr, server) = spawn_h2_server(|stream, stream_id, headers| {
        assert!(headers.contains(&HeaderField::new(":method", "GET")));
        write_frames(
            stream,
            &[
                headers_frame(
                    stream_id,
                    &[
                        HeaderField::new(":status", "200"),
                        HeaderField::new("content-type", "text/plain"),
                    ],
                    false,
                ),
                Frame::Data {
                    stream_id,
                    payload: b"hel".to_vec(),
                    end_stream: false,
                },
                Frame::Data {
                    stream_id,
                    payload: b"lo".to_vec(),
                    end_stream: true,
                },
            ],
        );
    });

    let h2 = H2Connection::cleartext(Settings::client_default()).unwrap();
    let mut client = Client::connect(addr, h2);
    client.drive_until(|h2| h2.is_ready());
    assert_eq!(client.h2.state(), ConnState::SettingsExchanged);

    client
        .h2
        .send_request(&get(&addr.to_string()), true)
        .unwrap();
    client.flush();
    client.drive_until(|h2| h2.is_closed());

    let mut status = None;
    let mut body = Vec::new();
    for event in client.events.drain(..) {
        match event {
            H2Event::Response { status: s, .. } => status = Some(s),
            H2Event::Data { data, .. } => body.extend_from_slice(&data),
            _ => {}
        }
    }
    assert_eq!(status, Some(200));
    assert_eq!(body, b"hello");
    server.join().unwrap();
}

#[test]
fn h2c_headers_only_response() {
    let (addr, server) = spawn_h2_server(|stream, stream_id, _| {
        write_frames(
            stream,
            &[headers_frame(
                stream_id,
                &[HeaderField::new(":status", "204")],
                true,
            )],
        );
    });

    let h2 = H2Connection::cleartext(Settings::client_default()).unwrap();
    let mut client = Client::connect(addr, h2);
    client.drive_until(|h2| h2.is_ready());
    client.h2.send_request(&get("localhost"), true).unwrap();
    client.flush();
    client.drive_until(|h2| h2.is_closed());

    assert!(client.events.iter().any(|e| matches!(
        e,
        H2Event::Response {
            status: 204,
            end_stream: true,
            ..
        }
    )));
    server.join().unwrap();
}

#[test]
fn http1_server_triggers_downgrade() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // Preface plus the client's SETTINGS frame, so nothing is left
        // unread when the socket closes.
        let mut preface = [0u8; 24 + 9];
        stream.read_exact(&mut preface).unwrap();
        let len = u32::from_be_bytes([0, preface[24], preface[25], preface[26]]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).unwrap();
        stream
            .write_all(b"HTTP/1.1 505 HTTP Version Not Supported\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
    });

    let h2 = H2Connection::cleartext(Settings::client_default()).unwrap();
    let mut client = Client::connect(addr, h2);
    client.drive_until(|h2| h2.state() == ConnState::Downgraded);

    match client.events.first() {
        Some(H2Event::Downgrade { prefetched }) => {
            assert!(prefetched.starts_with(b"HTTP/1.1 505"));
        }
        other => panic!("expected Downgrade, got {other:?}"),
    }
    server.join().unwrap();
}
