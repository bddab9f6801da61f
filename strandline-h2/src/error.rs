use thiserror::Error;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Map a wire value to a code. Unknown values are treated as
    /// INTERNAL_ERROR (RFC 7540 Section 7).
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Errors produced by the HTTP/2 framing layer.
#[derive(Debug, Error)]
pub enum H2Error {
    /// Frame payload does not match its declared type.
    #[error("frame error")]
    FrameError,

    /// Frame length exceeds the negotiated or absolute maximum.
    #[error("frame size error")]
    FrameSizeError,

    /// Received a frame that violates the protocol.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Header block could not be encoded or decoded.
    #[error("header block error: {0}")]
    HeaderBlock(&'static str),

    /// Flow control window violated.
    #[error("flow control error")]
    FlowControlError,

    /// The peer answered the connection preface with an HTTP/1.x status line.
    #[error("peer answered with HTTP/1.x")]
    Http1Peer,

    /// Connection-level error with an error code.
    #[error("connection error: {0:?}")]
    ConnectionError(ErrorCode),

    /// Stream-level error with an error code.
    #[error("stream {0} error: {1:?}")]
    StreamError(u32, ErrorCode),

    /// Operation not valid in the current connection state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}
