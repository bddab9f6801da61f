//! HTTP/2 client connection state machine.
//!
//! `H2Connection` is a sans-IO HTTP/2 client. Feed bytes in via `recv()`,
//! pull bytes out via `take_pending_send()`, and drain events with
//! `poll_event()`.
//!
//! A connection carries a single request. It moves through
//! [`ConnState::PrefaceSent`] → [`ConnState::SettingsExchanged`] →
//! [`ConnState::HeadersSent`] → [`ConnState::StreamingBody`] →
//! [`ConnState::Closed`]. A cleartext connection whose peer answers the
//! preface with an HTTP/1.x status line moves to [`ConnState::Downgraded`]
//! instead and hands back the bytes it had buffered.

use std::collections::{HashMap, VecDeque};

use crate::block::{self, HeaderField};
use crate::error::{ErrorCode, H2Error};
use crate::flowcontrol::{self, FlowControl};
use crate::frame::{self, FRAME_HEADER_LEN, Frame};
use crate::settings::{Setting, Settings};
use crate::stream::{H2Stream, StreamState};

/// HTTP/2 connection preface (RFC 7540 Section 3.5).
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Start of an HTTP/1.x status line.
const HTTP1_PREFIX: &[u8] = b"HTTP/1.";

/// Cap on buffered header block bytes when no MAX_HEADER_LIST_SIZE is set.
const MAX_HEADER_BLOCK: usize = 1 << 20;

/// Events produced by the HTTP/2 connection for the application.
#[derive(Debug)]
pub enum H2Event {
    /// Final response headers. `headers` still contains `:status`.
    Response {
        stream_id: u32,
        status: u16,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Response body bytes.
    Data {
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
    },
    /// Trailing header block; always ends the stream.
    Trailers {
        stream_id: u32,
        headers: Vec<HeaderField>,
    },
    /// Stream was reset by the peer.
    StreamReset {
        stream_id: u32,
        error_code: ErrorCode,
    },
    /// Peer sent GOAWAY.
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    /// Peer acknowledged our SETTINGS.
    SettingsAcknowledged,
    /// Cleartext peer answered with HTTP/1.x. `prefetched` holds every byte
    /// received so far, starting with the status line.
    Downgrade { prefetched: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Preface and SETTINGS queued, handshake incomplete.
    PrefaceSent,
    /// Peer SETTINGS received and ours acknowledged.
    SettingsExchanged,
    /// Request HEADERS queued, no response headers yet.
    HeadersSent,
    /// Response headers delivered, body in progress.
    StreamingBody,
    /// Response complete, or GOAWAY received.
    Closed,
    /// Peer speaks HTTP/1.x.
    Downgraded,
}

enum Sniff {
    Http1,
    Undecided,
    Frames,
}

/// Classify the first bytes from the peer.
fn sniff(buf: &[u8]) -> Sniff {
    let n = buf.len().min(HTTP1_PREFIX.len());
    if buf[..n] != HTTP1_PREFIX[..n] {
        Sniff::Frames
    } else if n == HTTP1_PREFIX.len() {
        Sniff::Http1
    } else {
        Sniff::Undecided
    }
}

fn parse_status(value: &[u8]) -> Result<u16, H2Error> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..=999).contains(s))
        .ok_or_else(|| H2Error::ProtocolError("malformed :status".into()))
}

/// Client-side HTTP/2 connection.
pub struct H2Connection {
    state: ConnState,
    /// Whether an HTTP/1.x answer to the preface is a downgrade rather
    /// than an error. Only cleartext connections allow it.
    allow_downgrade: bool,
    /// Set once the first bytes have been classified as HTTP/2 frames.
    framed: bool,

    local_settings: Settings,
    remote_settings: Settings,
    remote_settings_seen: bool,
    local_settings_acked: bool,

    streams: HashMap<u32, H2Stream>,
    next_stream_id: u32,

    conn_recv_window: FlowControl,
    conn_send_window: FlowControl,
    /// Windows are topped back up to these values.
    conn_recv_target: i64,
    stream_recv_target: i64,

    /// Stream currently receiving a header block (HEADERS + CONTINUATION).
    /// No other frames may interleave until END_HEADERS.
    continuation_stream: Option<u32>,

    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    events: VecDeque<H2Event>,
}

impl H2Connection {
    /// Connection over a secure channel. An HTTP/1.x peer is an error.
    pub fn new(settings: Settings) -> Result<Self, H2Error> {
        Self::build(settings, false)
    }

    /// Prior-knowledge cleartext (h2c) connection, which downgrades when
    /// the peer answers with HTTP/1.x.
    pub fn cleartext(settings: Settings) -> Result<Self, H2Error> {
        Self::build(settings, true)
    }

    fn build(settings: Settings, allow_downgrade: bool) -> Result<Self, H2Error> {
        settings.validate()?;

        let mut send_buf = Vec::new();
        send_buf.extend_from_slice(CLIENT_PREFACE);
        Frame::Settings {
            ack: false,
            params: settings.params(),
        }
        .encode(&mut send_buf)?;

        // The connection window starts at 65535 regardless of SETTINGS.
        let stream_recv_target = i64::from(settings.initial_window_size);
        let conn_recv_target = stream_recv_target.max(flowcontrol::DEFAULT_WINDOW_SIZE);
        if conn_recv_target > flowcontrol::DEFAULT_WINDOW_SIZE {
            Frame::WindowUpdate {
                stream_id: 0,
                increment: (conn_recv_target - flowcontrol::DEFAULT_WINDOW_SIZE) as u32,
            }
            .encode(&mut send_buf)?;
        }

        Ok(Self {
            state: ConnState::PrefaceSent,
            allow_downgrade,
            framed: false,
            local_settings: settings,
            remote_settings: Settings::default(),
            remote_settings_seen: false,
            local_settings_acked: false,
            streams: HashMap::new(),
            next_stream_id: 1,
            conn_recv_window: FlowControl::new(conn_recv_target),
            conn_send_window: FlowControl::default(),
            conn_recv_target,
            stream_recv_target,
            continuation_stream: None,
            recv_buf: Vec::new(),
            send_buf,
            events: VecDeque::new(),
        })
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Both SETTINGS frames have been exchanged.
    pub fn is_ready(&self) -> bool {
        self.remote_settings_seen && self.local_settings_acked
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Settings most recently announced by the peer.
    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// Feed received bytes from the transport.
    ///
    /// Any error is a connection error; the connection must not be used
    /// afterwards.
    pub fn recv(&mut self, data: &[u8]) -> Result<(), H2Error> {
        if self.state == ConnState::Downgraded {
            return Err(H2Error::InvalidState("connection downgraded to HTTP/1.1"));
        }
        self.recv_buf.extend_from_slice(data);

        if !self.framed {
            match sniff(&self.recv_buf) {
                Sniff::Undecided => return Ok(()),
                Sniff::Http1 if self.allow_downgrade => {
                    self.state = ConnState::Downgraded;
                    let prefetched = std::mem::take(&mut self.recv_buf);
                    self.events.push_back(H2Event::Downgrade { prefetched });
                    return Ok(());
                }
                Sniff::Http1 => return Err(H2Error::Http1Peer),
                Sniff::Frames => self.framed = true,
            }
        }

        while let Some((frame, consumed)) =
            frame::decode_frame(&self.recv_buf, self.local_settings.max_frame_size)?
        {
            self.recv_buf.drain(..consumed);
            self.handle_frame(frame, consumed - FRAME_HEADER_LEN)?;
        }
        Ok(())
    }

    /// Poll the next event, if any.
    pub fn poll_event(&mut self) -> Option<H2Event> {
        self.events.pop_front()
    }

    /// Take all pending bytes to send to the transport.
    pub fn take_pending_send(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.send_buf)
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// Queue the request header block and return its stream ID.
    ///
    /// `headers` should include the pseudo-headers (`:method`, `:path`,
    /// `:scheme`, `:authority`). Blocks larger than the peer's
    /// MAX_FRAME_SIZE are split across CONTINUATION frames.
    pub fn send_request(
        &mut self,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<u32, H2Error> {
        if self.state != ConnState::SettingsExchanged {
            return Err(H2Error::InvalidState("request requires a fresh, ready connection"));
        }

        let mut encoded = Vec::new();
        block::encode(headers, &mut encoded)?;

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let max_frame = self.remote_settings.max_frame_size as usize;
        let mut fragments = encoded.chunks(max_frame).peekable();
        Frame::Headers {
            stream_id,
            block: fragments.next().unwrap_or_default().to_vec(),
            end_stream,
            end_headers: fragments.peek().is_none(),
            priority: None,
        }
        .encode(&mut self.send_buf)?;
        while let Some(fragment) = fragments.next() {
            Frame::Continuation {
                stream_id,
                block: fragment.to_vec(),
                end_headers: fragments.peek().is_none(),
            }
            .encode(&mut self.send_buf)?;
        }

        let mut stream = H2Stream::new(
            self.stream_recv_target,
            i64::from(self.remote_settings.initial_window_size),
        );
        if end_stream {
            stream.state = StreamState::HalfClosedLocal;
        }
        self.streams.insert(stream_id, stream);
        self.state = ConnState::HeadersSent;

        Ok(stream_id)
    }

    // -- Internal processing --

    fn handle_frame(&mut self, frame: Frame, payload_len: usize) -> Result<(), H2Error> {
        if !self.remote_settings_seen && !matches!(frame, Frame::Settings { ack: false, .. }) {
            return Err(H2Error::ProtocolError(
                "server preface must start with SETTINGS".into(),
            ));
        }

        if let Some(expected) = self.continuation_stream {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == expected => {}
                _ => {
                    return Err(H2Error::ProtocolError(
                        "expected CONTINUATION frame".into(),
                    ));
                }
            }
        }

        match frame {
            Frame::Settings { ack: true, .. } => {
                if !self.local_settings_acked {
                    self.local_settings_acked = true;
                    self.events.push_back(H2Event::SettingsAcknowledged);
                    self.check_ready();
                }
            }
            Frame::Settings { ack: false, params } => self.handle_settings(&params)?,
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                if let Some(priority) = priority
                    && let Some(stream) = self.streams.get_mut(&stream_id)
                {
                    stream.priority = Some(priority);
                }
                self.handle_headers(stream_id, &block, end_stream, end_headers)?;
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => self.handle_continuation(stream_id, &block, end_headers)?,
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => self.handle_data(stream_id, payload, end_stream, payload_len)?,
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.state = StreamState::Closed;
                }
                self.events.push_back(H2Event::StreamReset {
                    stream_id,
                    error_code,
                });
                self.check_finished();
            }
            Frame::Ping {
                ack: false,
                opaque_data,
            } => {
                Frame::Ping {
                    ack: true,
                    opaque_data,
                }
                .encode(&mut self.send_buf)?;
            }
            Frame::Ping { ack: true, .. } => {}
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                self.state = ConnState::Closed;
                self.events.push_back(H2Event::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data,
                });
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                if stream_id == 0 {
                    self.conn_send_window.increase(increment)?;
                } else if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.send_window.increase(increment)?;
                }
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.priority = Some(priority);
                }
            }
            Frame::PushPromise { .. } => {
                return Err(H2Error::ProtocolError(
                    "PUSH_PROMISE received but ENABLE_PUSH=0".into(),
                ));
            }
            // Unknown frame types MUST be ignored.
            Frame::Unknown { .. } => {}
        }

        Ok(())
    }

    fn handle_settings(&mut self, params: &[Setting]) -> Result<(), H2Error> {
        let mut next = self.remote_settings.clone();
        let delta = next.apply(params);

        // Adjust send windows on all open streams (RFC 7540 Section 6.9.2).
        if delta != 0 {
            for stream in self.streams.values_mut() {
                if stream.state != StreamState::Closed {
                    stream.send_window.adjust(delta)?;
                }
            }
        }
        self.remote_settings = next;

        Frame::Settings {
            ack: true,
            params: Vec::new(),
        }
        .encode(&mut self.send_buf)?;

        self.remote_settings_seen = true;
        self.check_ready();
        Ok(())
    }

    fn check_ready(&mut self) {
        if self.state == ConnState::PrefaceSent && self.is_ready() {
            self.state = ConnState::SettingsExchanged;
        }
    }

    /// The request stream has ended from the peer's side.
    fn check_finished(&mut self) {
        if self.streams.values().all(|s| !s.state.recv_open()) {
            self.state = ConnState::Closed;
        }
    }

    fn header_block_limit(&self) -> usize {
        self.local_settings
            .max_header_list_size
            .map_or(MAX_HEADER_BLOCK, |v| v as usize + 2)
    }

    fn handle_headers(
        &mut self,
        stream_id: u32,
        fragment: &[u8],
        end_stream: bool,
        end_headers: bool,
    ) -> Result<(), H2Error> {
        let limit = self.header_block_limit();
        let stream = self.streams.get_mut(&stream_id).ok_or_else(|| {
            H2Error::ProtocolError(format!("HEADERS on unknown stream {stream_id}"))
        })?;
        if !stream.state.recv_open() {
            return Err(H2Error::StreamError(stream_id, ErrorCode::StreamClosed));
        }

        stream.header_buf.extend_from_slice(fragment);
        if stream.header_buf.len() > limit {
            return Err(H2Error::HeaderBlock("header block too large"));
        }

        if end_headers {
            let full_block = std::mem::take(&mut stream.header_buf);
            self.finish_header_block(stream_id, &full_block, end_stream)
        } else {
            stream.headers_end_stream = end_stream;
            self.continuation_stream = Some(stream_id);
            Ok(())
        }
    }

    fn handle_continuation(
        &mut self,
        stream_id: u32,
        fragment: &[u8],
        end_headers: bool,
    ) -> Result<(), H2Error> {
        if self.continuation_stream != Some(stream_id) {
            return Err(H2Error::ProtocolError("unexpected CONTINUATION".into()));
        }
        let limit = self.header_block_limit();
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(H2Error::InvalidState("continuation on vanished stream"))?;

        stream.header_buf.extend_from_slice(fragment);
        if stream.header_buf.len() > limit {
            return Err(H2Error::HeaderBlock("header block too large"));
        }
        if !end_headers {
            return Ok(());
        }

        self.continuation_stream = None;
        let full_block = std::mem::take(&mut stream.header_buf);
        let end_stream = stream.headers_end_stream;
        self.finish_header_block(stream_id, &full_block, end_stream)
    }

    fn finish_header_block(
        &mut self,
        stream_id: u32,
        encoded: &[u8],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        let headers = block::decode(encoded, self.local_settings.max_header_list_size)?;
        let status = headers
            .iter()
            .find(|h| h.name == b":status")
            .map(|h| parse_status(&h.value))
            .transpose()?;

        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(H2Error::InvalidState("headers on vanished stream"))?;

        let event = match status {
            Some(status) if !stream.got_response => {
                // Informational responses are skipped; the final one follows.
                if (100..200).contains(&status) && !end_stream {
                    return Ok(());
                }
                stream.got_response = true;
                H2Event::Response {
                    stream_id,
                    status,
                    headers,
                    end_stream,
                }
            }
            None if stream.got_response => {
                if !end_stream {
                    return Err(H2Error::ProtocolError(
                        "trailers without END_STREAM".into(),
                    ));
                }
                H2Event::Trailers { stream_id, headers }
            }
            Some(_) => {
                return Err(H2Error::ProtocolError("duplicate response headers".into()));
            }
            None => {
                return Err(H2Error::ProtocolError("response without :status".into()));
            }
        };

        if end_stream {
            stream.state = stream.state.remote_end();
        }
        self.events.push_back(event);

        if end_stream {
            self.check_finished();
        } else {
            self.state = ConnState::StreamingBody;
        }
        Ok(())
    }

    fn handle_data(
        &mut self,
        stream_id: u32,
        payload: Vec<u8>,
        end_stream: bool,
        flow_len: usize,
    ) -> Result<(), H2Error> {
        // Padding counts against flow control, so use the full frame length.
        let flow_len = u32::try_from(flow_len).map_err(|_| H2Error::FrameSizeError)?;
        self.conn_recv_window.consume(flow_len)?;

        let stream = self.streams.get_mut(&stream_id).ok_or_else(|| {
            H2Error::ProtocolError(format!("DATA on unknown stream {stream_id}"))
        })?;
        if !stream.state.recv_open() {
            return Err(H2Error::StreamError(stream_id, ErrorCode::StreamClosed));
        }
        if !stream.got_response {
            return Err(H2Error::ProtocolError("DATA before response headers".into()));
        }
        stream.recv_window.consume(flow_len)?;

        if end_stream {
            stream.state = stream.state.remote_end();
        } else if let Some(increment) = stream.recv_window.replenish(self.stream_recv_target) {
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
            .encode(&mut self.send_buf)?;
        }

        if let Some(increment) = self.conn_recv_window.replenish(self.conn_recv_target) {
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            }
            .encode(&mut self.send_buf)?;
        }

        self.events.push_back(H2Event::Data {
            stream_id,
            data: payload,
            end_stream,
        });
        if end_stream {
            self.check_finished();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FLAG_ACK, FLAG_END_HEADERS, FLAG_END_STREAM, FRAME_SETTINGS, FrameHeader};

    fn encode(frame: Frame) -> Vec<u8> {
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        buf
    }

    fn server_settings(params: Vec<Setting>) -> Vec<u8> {
        encode(Frame::Settings { ack: false, params })
    }

    fn settings_ack() -> Vec<u8> {
        encode(Frame::Settings {
            ack: true,
            params: Vec::new(),
        })
    }

    fn header_block(fields: &[HeaderField]) -> Vec<u8> {
        let mut buf = Vec::new();
        block::encode(fields, &mut buf).unwrap();
        buf
    }

    fn response_headers(stream_id: u32, fields: &[HeaderField], end_stream: bool) -> Vec<u8> {
        encode(Frame::Headers {
            stream_id,
            block: header_block(fields),
            end_stream,
            end_headers: true,
            priority: None,
        })
    }

    fn data(stream_id: u32, payload: &[u8], end_stream: bool) -> Vec<u8> {
        encode(Frame::Data {
            stream_id,
            payload: payload.to_vec(),
            end_stream,
        })
    }

    fn decode_all(mut buf: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some((frame, consumed)) = frame::decode_frame(buf, 1 << 20).unwrap() {
            frames.push(frame);
            buf = &buf[consumed..];
        }
        assert!(buf.is_empty());
        frames
    }

    fn get_request() -> Vec<HeaderField> {
        vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new(":path", "/"),
            HeaderField::new(":scheme", "http"),
            HeaderField::new(":authority", "example.com"),
        ]
    }

    fn ready_conn() -> H2Connection {
        let mut conn = H2Connection::new(Settings::client_default()).unwrap();
        conn.take_pending_send();
        conn.recv(&server_settings(Vec::new())).unwrap();
        conn.recv(&settings_ack()).unwrap();
        conn.take_pending_send();
        while conn.poll_event().is_some() {}
        conn
    }

    fn status_200() -> Vec<HeaderField> {
        vec![HeaderField::new(":status", "200")]
    }

    #[test]
    fn preface_carries_client_settings() {
        let mut conn = H2Connection::new(Settings::client_default()).unwrap();
        let send = conn.take_pending_send();
        assert!(send.starts_with(CLIENT_PREFACE));

        let frames = decode_all(&send[CLIENT_PREFACE.len()..]);
        match &frames[0] {
            Frame::Settings { ack, params } => {
                assert!(!ack);
                assert!(params.contains(&Setting::EnablePush(false)));
            }
            other => panic!("expected SETTINGS, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnState::PrefaceSent);
    }

    #[test]
    fn handshake_needs_both_directions() {
        let mut conn = H2Connection::new(Settings::client_default()).unwrap();
        conn.take_pending_send();

        conn.recv(&server_settings(Vec::new())).unwrap();
        assert!(!conn.is_ready());
        let send = conn.take_pending_send();
        let header = FrameHeader::decode(&send).unwrap();
        assert_eq!(header.frame_type, FRAME_SETTINGS);
        assert_eq!(header.flags, FLAG_ACK);

        conn.recv(&settings_ack()).unwrap();
        assert!(conn.is_ready());
        assert_eq!(conn.state(), ConnState::SettingsExchanged);
        assert!(matches!(
            conn.poll_event(),
            Some(H2Event::SettingsAcknowledged)
        ));
    }

    #[test]
    fn request_before_handshake_rejected() {
        let mut conn = H2Connection::new(Settings::client_default()).unwrap();
        assert!(matches!(
            conn.send_request(&get_request(), true),
            Err(H2Error::InvalidState(_))
        ));
    }

    #[test]
    fn first_frame_must_be_settings() {
        let mut conn = H2Connection::new(Settings::client_default()).unwrap();
        let ping = encode(Frame::Ping {
            ack: false,
            opaque_data: [0; 8],
        });
        assert!(matches!(
            conn.recv(&ping),
            Err(H2Error::ProtocolError(_))
        ));
    }

    #[test]
    fn request_and_response() {
        let mut conn = ready_conn();
        let stream_id = conn.send_request(&get_request(), true).unwrap();
        assert_eq!(stream_id, 1);
        assert_eq!(conn.state(), ConnState::HeadersSent);

        let send = conn.take_pending_send();
        let header = FrameHeader::decode(&send).unwrap();
        assert_eq!(header.stream_id, 1);
        assert_ne!(header.flags & FLAG_END_STREAM, 0);
        assert_ne!(header.flags & FLAG_END_HEADERS, 0);
        match &decode_all(&send)[0] {
            Frame::Headers { block: b, .. } => {
                assert_eq!(block::decode(b, None).unwrap(), get_request());
            }
            other => panic!("expected HEADERS, got {other:?}"),
        }

        let mut reply = response_headers(1, &status_200(), false);
        reply.extend_from_slice(&data(1, b"hel", false));
        conn.recv(&reply).unwrap();
        assert_eq!(conn.state(), ConnState::StreamingBody);
        conn.recv(&data(1, b"lo", true)).unwrap();
        assert!(conn.is_closed());

        match conn.poll_event() {
            Some(H2Event::Response {
                status, end_stream, ..
            }) => {
                assert_eq!(status, 200);
                assert!(!end_stream);
            }
            other => panic!("expected Response, got {other:?}"),
        }
        let mut body = Vec::new();
        let mut finals = 0;
        while let Some(event) = conn.poll_event() {
            if let H2Event::Data {
                data, end_stream, ..
            } = event
            {
                body.extend_from_slice(&data);
                finals += usize::from(end_stream);
            }
        }
        assert_eq!(body, b"hello");
        assert_eq!(finals, 1);
    }

    #[test]
    fn one_request_per_connection() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();
        assert!(conn.send_request(&get_request(), true).is_err());
    }

    #[test]
    fn large_request_block_uses_continuation() {
        let mut conn = ready_conn();
        let mut fields = get_request();
        fields.push(HeaderField::new("x-big", vec![b'a'; 20_000]));
        conn.send_request(&fields, true).unwrap();

        let frames = decode_all(&conn.take_pending_send());
        assert_eq!(frames.len(), 2);
        let mut reassembled = Vec::new();
        match &frames[0] {
            Frame::Headers {
                block, end_headers, ..
            } => {
                assert!(!end_headers);
                reassembled.extend_from_slice(block);
            }
            other => panic!("expected HEADERS, got {other:?}"),
        }
        match &frames[1] {
            Frame::Continuation {
                block, end_headers, ..
            } => {
                assert!(end_headers);
                reassembled.extend_from_slice(block);
            }
            other => panic!("expected CONTINUATION, got {other:?}"),
        }
        assert_eq!(block::decode(&reassembled, None).unwrap(), fields);
    }

    #[test]
    fn continuation_reassembled() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();

        let encoded = header_block(&[
            HeaderField::new(":status", "200"),
            HeaderField::new("content-type", "text/plain"),
        ]);
        let (first, rest) = encoded.split_at(5);
        let mut buf = encode(Frame::Headers {
            stream_id: 1,
            block: first.to_vec(),
            end_stream: true,
            end_headers: false,
            priority: None,
        });
        buf.extend_from_slice(&encode(Frame::Continuation {
            stream_id: 1,
            block: rest.to_vec(),
            end_headers: true,
        }));
        conn.recv(&buf).unwrap();

        match conn.poll_event() {
            Some(H2Event::Response {
                headers,
                end_stream,
                ..
            }) => {
                assert!(end_stream);
                assert_eq!(headers[1].value, b"text/plain");
            }
            other => panic!("expected Response, got {other:?}"),
        }
        assert!(conn.is_closed());
    }

    #[test]
    fn interleaved_frame_during_header_block_rejected() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();
        let encoded = header_block(&status_200());
        let mut buf = encode(Frame::Headers {
            stream_id: 1,
            block: encoded[..3].to_vec(),
            end_stream: false,
            end_headers: false,
            priority: None,
        });
        buf.extend_from_slice(&encode(Frame::Ping {
            ack: false,
            opaque_data: [0; 8],
        }));
        assert!(conn.recv(&buf).is_err());
    }

    #[test]
    fn informational_response_skipped() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();
        let mut buf = response_headers(1, &[HeaderField::new(":status", "100")], false);
        buf.extend_from_slice(&response_headers(1, &status_200(), true));
        conn.recv(&buf).unwrap();
        match conn.poll_event() {
            Some(H2Event::Response { status, .. }) => assert_eq!(status, 200),
            other => panic!("expected Response, got {other:?}"),
        }
        assert!(conn.poll_event().is_none());
    }

    #[test]
    fn trailers_after_body() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();
        let mut buf = response_headers(1, &status_200(), false);
        buf.extend_from_slice(&data(1, b"x", false));
        buf.extend_from_slice(&response_headers(
            1,
            &[HeaderField::new("grpc-status", "0")],
            true,
        ));
        conn.recv(&buf).unwrap();

        let events: Vec<_> = std::iter::from_fn(|| conn.poll_event()).collect();
        assert!(matches!(events[0], H2Event::Response { .. }));
        assert!(matches!(events[1], H2Event::Data { .. }));
        match &events[2] {
            H2Event::Trailers { headers, .. } => assert_eq!(headers[0].name, b"grpc-status"),
            other => panic!("expected Trailers, got {other:?}"),
        }
        assert!(conn.is_closed());
    }

    #[test]
    fn data_before_headers_rejected() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();
        assert!(conn.recv(&data(1, b"x", false)).is_err());
    }

    #[test]
    fn ping_echoed_with_ack() {
        let mut conn = ready_conn();
        conn.recv(&encode(Frame::Ping {
            ack: false,
            opaque_data: [1, 2, 3, 4, 5, 6, 7, 8],
        }))
        .unwrap();
        match &decode_all(&conn.take_pending_send())[0] {
            Frame::Ping { ack, opaque_data } => {
                assert!(ack);
                assert_eq!(*opaque_data, [1, 2, 3, 4, 5, 6, 7, 8]);
            }
            other => panic!("expected PING ack, got {other:?}"),
        }
    }

    #[test]
    fn goaway_closes_connection() {
        let mut conn = ready_conn();
        conn.recv(&encode(Frame::GoAway {
            last_stream_id: 0,
            error_code: ErrorCode::NoError,
            debug_data: Vec::new(),
        }))
        .unwrap();
        assert!(conn.is_closed());
        assert!(matches!(
            conn.poll_event(),
            Some(H2Event::GoAway {
                error_code: ErrorCode::NoError,
                ..
            })
        ));
    }

    #[test]
    fn rst_stream_reported() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();
        conn.recv(&encode(Frame::RstStream {
            stream_id: 1,
            error_code: ErrorCode::RefusedStream,
        }))
        .unwrap();
        assert!(matches!(
            conn.poll_event(),
            Some(H2Event::StreamReset {
                stream_id: 1,
                error_code: ErrorCode::RefusedStream,
            })
        ));
        assert!(conn.is_closed());
    }

    #[test]
    fn push_promise_rejected() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();
        let promise = encode(Frame::PushPromise {
            stream_id: 1,
            promised_stream_id: 2,
            block: header_block(&get_request()),
            end_headers: true,
        });
        assert!(matches!(
            conn.recv(&promise),
            Err(H2Error::ProtocolError(_))
        ));
    }

    #[test]
    fn initial_window_change_adjusts_open_streams() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();
        conn.recv(&server_settings(vec![Setting::InitialWindowSize(100_000)]))
            .unwrap();
        assert_eq!(conn.streams[&1].send_window.window(), 100_000);
        assert_eq!(conn.remote_settings().initial_window_size, 100_000);
    }

    #[test]
    fn priority_recorded() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();
        let priority = frame::Priority {
            exclusive: false,
            dependency: 0,
            weight: 42,
        };
        conn.recv(&encode(Frame::Priority {
            stream_id: 1,
            priority,
        }))
        .unwrap();
        assert_eq!(conn.streams[&1].priority, Some(priority));
    }

    #[test]
    fn window_update_sent_below_half() {
        let mut conn = ready_conn();
        conn.send_request(&get_request(), true).unwrap();
        conn.recv(&response_headers(1, &status_200(), false)).unwrap();
        conn.take_pending_send();

        let mut buf = Vec::new();
        for _ in 0..3 {
            buf.extend_from_slice(&data(1, &[0; 10_000], false));
        }
        conn.recv(&buf).unwrap();
        assert!(!conn.has_pending_send());

        conn.recv(&data(1, &[0; 10_000], false)).unwrap();
        let frames = decode_all(&conn.take_pending_send());
        assert!(frames.contains(&Frame::WindowUpdate {
            stream_id: 1,
            increment: 40_000
        }));
        assert!(frames.contains(&Frame::WindowUpdate {
            stream_id: 0,
            increment: 40_000
        }));
    }

    #[test]
    fn flow_control_violation_is_error() {
        let settings = Settings {
            initial_window_size: 20_000,
            ..Settings::client_default()
        };
        let mut conn = H2Connection::new(settings).unwrap();
        conn.recv(&server_settings(Vec::new())).unwrap();
        conn.recv(&settings_ack()).unwrap();
        conn.send_request(&get_request(), true).unwrap();
        conn.recv(&response_headers(1, &status_200(), false)).unwrap();
        conn.recv(&data(1, &[0; 9_000], false)).unwrap();
        assert!(matches!(
            conn.recv(&data(1, &[0; 15_000], false)),
            Err(H2Error::FlowControlError)
        ));
    }

    #[test]
    fn cleartext_downgrade_keeps_prefetched_bytes() {
        let mut conn = H2Connection::cleartext(Settings::client_default()).unwrap();
        conn.recv(b"HTT").unwrap();
        assert!(conn.poll_event().is_none());
        assert_eq!(conn.state(), ConnState::PrefaceSent);

        conn.recv(b"P/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(conn.state(), ConnState::Downgraded);
        match conn.poll_event() {
            Some(H2Event::Downgrade { prefetched }) => {
                assert_eq!(prefetched, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
            }
            other => panic!("expected Downgrade, got {other:?}"),
        }
        assert!(conn.recv(b"more").is_err());
    }

    #[test]
    fn secure_connection_rejects_http1_peer() {
        let mut conn = H2Connection::new(Settings::client_default()).unwrap();
        assert!(matches!(
            conn.recv(b"HTTP/1.1 400 Bad Request\r\n\r\n"),
            Err(H2Error::Http1Peer)
        ));
    }
}
