//! HTTP/2 frame encoding/decoding (RFC 7540 Section 4).
//!
//! Every frame starts with a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```
//!
//! Encoding and decoding are pure functions of their inputs.

use bytes::BufMut;

use crate::error::{ErrorCode, H2Error};
use crate::settings::{self, Setting};

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

/// Largest payload a 24-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = (1 << 24) - 1;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

// Frame type constants (RFC 7540 Section 6).
pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

// Flag constants.
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// An HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// DATA (0x0): response or request body bytes.
    Data {
        stream_id: u32,
        payload: Vec<u8>,
        end_stream: bool,
    },
    /// HEADERS (0x1): a header block fragment.
    Headers {
        stream_id: u32,
        block: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    /// PRIORITY (0x2): advisory stream dependency and weight.
    Priority { stream_id: u32, priority: Priority },
    /// RST_STREAM (0x3): abnormal stream termination.
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    /// SETTINGS (0x4): the parameters being changed, or an ack.
    Settings { ack: bool, params: Vec<Setting> },
    /// PUSH_PROMISE (0x5): decoded only so it can be rejected.
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        block: Vec<u8>,
        end_headers: bool,
    },
    /// PING (0x6): liveness check, echoed back with ACK.
    Ping { ack: bool, opaque_data: [u8; 8] },
    /// GOAWAY (0x7): connection shutdown.
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    /// WINDOW_UPDATE (0x8): flow-control credit.
    WindowUpdate { stream_id: u32, increment: u32 },
    /// CONTINUATION (0x9): further header block fragment.
    Continuation {
        stream_id: u32,
        block: Vec<u8>,
        end_headers: bool,
    },
    /// Unknown type, ignored by the connection.
    Unknown {
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: Vec<u8>,
    },
}

/// Stream priority information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

impl Priority {
    fn put(&self, buf: &mut impl BufMut) {
        let exclusive = if self.exclusive { 0x8000_0000 } else { 0 };
        buf.put_u32((self.dependency & STREAM_ID_MASK) | exclusive);
        buf.put_u8(self.weight);
    }

    fn parse(bytes: &[u8]) -> Self {
        let raw = be_u32(bytes);
        Self {
            exclusive: raw & 0x8000_0000 != 0,
            dependency: raw & STREAM_ID_MASK,
            weight: bytes[4],
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Write the 9-byte header. The reserved bit is always sent as zero.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_uint(u64::from(self.length), 3);
        buf.put_u8(self.frame_type);
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & STREAM_ID_MASK);
    }

    /// Read a header from the start of `buf`, or `None` if fewer than 9
    /// bytes are available. The reserved bit is ignored.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let head = buf.get(..FRAME_HEADER_LEN)?;
        Some(Self {
            length: u32::from_be_bytes([0, head[0], head[1], head[2]]),
            frame_type: head[3],
            flags: head[4],
            stream_id: be_u32(&head[5..]) & STREAM_ID_MASK,
        })
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl Frame {
    /// Stream the frame belongs to (0 for connection-level frames).
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Encode this frame (header + payload) into `buf`.
    ///
    /// Fails with [`H2Error::FrameSizeError`] if the payload cannot be
    /// described by the 24-bit length field; `buf` is untouched in that case.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), H2Error> {
        let mut payload = Vec::new();
        let (frame_type, flags, stream_id) = match self {
            Frame::Data {
                stream_id,
                payload: data,
                end_stream,
            } => {
                payload.extend_from_slice(data);
                (FRAME_DATA, flag(*end_stream, FLAG_END_STREAM), *stream_id)
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                let mut flags =
                    flag(*end_stream, FLAG_END_STREAM) | flag(*end_headers, FLAG_END_HEADERS);
                if let Some(pri) = priority {
                    flags |= FLAG_PRIORITY;
                    pri.put(&mut payload);
                }
                payload.extend_from_slice(block);
                (FRAME_HEADERS, flags, *stream_id)
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                priority.put(&mut payload);
                (FRAME_PRIORITY, 0, *stream_id)
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                payload.put_u32(*error_code as u32);
                (FRAME_RST_STREAM, 0, *stream_id)
            }
            Frame::Settings { ack, params } => {
                if !*ack {
                    settings::encode_params(params, &mut payload);
                }
                (FRAME_SETTINGS, flag(*ack, FLAG_ACK), 0)
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                block,
                end_headers,
            } => {
                payload.put_u32(*promised_stream_id & STREAM_ID_MASK);
                payload.extend_from_slice(block);
                (
                    FRAME_PUSH_PROMISE,
                    flag(*end_headers, FLAG_END_HEADERS),
                    *stream_id,
                )
            }
            Frame::Ping { ack, opaque_data } => {
                payload.extend_from_slice(opaque_data);
                (FRAME_PING, flag(*ack, FLAG_ACK), 0)
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                payload.put_u32(*last_stream_id & STREAM_ID_MASK);
                payload.put_u32(*error_code as u32);
                payload.extend_from_slice(debug_data);
                (FRAME_GOAWAY, 0, 0)
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                payload.put_u32(*increment & STREAM_ID_MASK);
                (FRAME_WINDOW_UPDATE, 0, *stream_id)
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                payload.extend_from_slice(block);
                (
                    FRAME_CONTINUATION,
                    flag(*end_headers, FLAG_END_HEADERS),
                    *stream_id,
                )
            }
            Frame::Unknown {
                frame_type,
                flags,
                stream_id,
                payload: data,
            } => {
                payload.extend_from_slice(data);
                (*frame_type, *flags, *stream_id)
            }
        };

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(H2Error::FrameSizeError);
        }
        let header = FrameHeader {
            length: payload.len() as u32,
            frame_type,
            flags,
            stream_id,
        };
        buf.reserve(FRAME_HEADER_LEN + payload.len());
        header.encode(buf);
        buf.extend_from_slice(&payload);
        Ok(())
    }
}

fn flag(set: bool, bit: u8) -> u8 {
    if set { bit } else { 0 }
}

/// Decode one frame from the start of `buf`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` on success, `Ok(None)` if the
/// buffer does not yet hold a whole frame, or `Err` on a protocol violation.
pub fn decode_frame(buf: &[u8], max_frame_size: u32) -> Result<Option<(Frame, usize)>, H2Error> {
    let Some(header) = FrameHeader::decode(buf) else {
        return Ok(None);
    };

    // SETTINGS may legitimately arrive before the peer knows our limit.
    if header.length > max_frame_size && header.frame_type != FRAME_SETTINGS {
        return Err(H2Error::FrameSizeError);
    }

    let total_len = FRAME_HEADER_LEN + header.length as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    let payload = &buf[FRAME_HEADER_LEN..total_len];
    let frame = decode_payload(&header, payload)?;
    Ok(Some((frame, total_len)))
}

fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Frame, H2Error> {
    let FrameHeader {
        frame_type,
        flags,
        stream_id,
        ..
    } = *header;

    let frame = match frame_type {
        FRAME_DATA => {
            require_stream(stream_id, "DATA")?;
            Frame::Data {
                stream_id,
                payload: strip_padding(payload, flags)?.to_vec(),
                end_stream: flags & FLAG_END_STREAM != 0,
            }
        }
        FRAME_HEADERS => {
            require_stream(stream_id, "HEADERS")?;
            let data = strip_padding(payload, flags)?;
            let (priority, block) = if flags & FLAG_PRIORITY != 0 {
                if data.len() < 5 {
                    return Err(H2Error::FrameSizeError);
                }
                (Some(Priority::parse(data)), &data[5..])
            } else {
                (None, data)
            };
            Frame::Headers {
                stream_id,
                block: block.to_vec(),
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
                priority,
            }
        }
        FRAME_PRIORITY => {
            require_stream(stream_id, "PRIORITY")?;
            if payload.len() != 5 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::Priority {
                stream_id,
                priority: Priority::parse(payload),
            }
        }
        FRAME_RST_STREAM => {
            require_stream(stream_id, "RST_STREAM")?;
            if payload.len() != 4 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::RstStream {
                stream_id,
                error_code: ErrorCode::from_u32(be_u32(payload)),
            }
        }
        FRAME_SETTINGS => {
            require_connection(stream_id, "SETTINGS")?;
            let ack = flags & FLAG_ACK != 0;
            if ack && !payload.is_empty() {
                return Err(H2Error::FrameSizeError);
            }
            Frame::Settings {
                ack,
                params: settings::decode_params(payload)?,
            }
        }
        FRAME_PUSH_PROMISE => {
            require_stream(stream_id, "PUSH_PROMISE")?;
            let data = strip_padding(payload, flags)?;
            if data.len() < 4 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id: be_u32(data) & STREAM_ID_MASK,
                block: data[4..].to_vec(),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FRAME_PING => {
            require_connection(stream_id, "PING")?;
            let opaque_data: [u8; 8] = payload.try_into().map_err(|_| H2Error::FrameSizeError)?;
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                opaque_data,
            }
        }
        FRAME_GOAWAY => {
            require_connection(stream_id, "GOAWAY")?;
            if payload.len() < 8 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::GoAway {
                last_stream_id: be_u32(payload) & STREAM_ID_MASK,
                error_code: ErrorCode::from_u32(be_u32(&payload[4..])),
                debug_data: payload[8..].to_vec(),
            }
        }
        FRAME_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(H2Error::FrameSizeError);
            }
            let increment = be_u32(payload) & STREAM_ID_MASK;
            if increment == 0 {
                if stream_id != 0 {
                    return Err(H2Error::StreamError(stream_id, ErrorCode::ProtocolError));
                }
                return Err(H2Error::ProtocolError(
                    "WINDOW_UPDATE with 0 increment".into(),
                ));
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        FRAME_CONTINUATION => {
            require_stream(stream_id, "CONTINUATION")?;
            Frame::Continuation {
                stream_id,
                block: payload.to_vec(),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        _ => Frame::Unknown {
            frame_type,
            flags,
            stream_id,
            payload: payload.to_vec(),
        },
    };
    Ok(frame)
}

fn require_stream(stream_id: u32, kind: &str) -> Result<(), H2Error> {
    if stream_id == 0 {
        return Err(H2Error::ProtocolError(format!("{kind} on stream 0")));
    }
    Ok(())
}

fn require_connection(stream_id: u32, kind: &str) -> Result<(), H2Error> {
    if stream_id != 0 {
        return Err(H2Error::ProtocolError(format!("{kind} on non-zero stream")));
    }
    Ok(())
}

/// Strip padding from a payload when the PADDED flag is set.
fn strip_padding(payload: &[u8], flags: u8) -> Result<&[u8], H2Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    let (&pad_len, rest) = payload.split_first().ok_or(H2Error::FrameSizeError)?;
    let pad_len = usize::from(pad_len);
    if pad_len > rest.len() {
        return Err(H2Error::ProtocolError("padding exceeds payload".into()));
    }
    Ok(&rest[..rest.len() - pad_len])
}
