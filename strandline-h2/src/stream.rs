//! Per-stream state for HTTP/2 (RFC 7540 Section 5.1).

use crate::flowcontrol::FlowControl;
use crate::frame::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    /// HEADERS sent, request body still open.
    Open,
    /// We sent END_STREAM.
    HalfClosedLocal,
    /// Peer sent END_STREAM.
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// State after the peer ends the stream.
    pub fn remote_end(self) -> Self {
        match self {
            Self::Open => Self::HalfClosedRemote,
            _ => Self::Closed,
        }
    }

    pub fn recv_open(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedLocal)
    }
}

pub(crate) struct H2Stream {
    pub state: StreamState,
    pub recv_window: FlowControl,
    pub send_window: FlowControl,
    /// Header block fragments collected from HEADERS + CONTINUATION.
    pub header_buf: Vec<u8>,
    /// END_STREAM flag of the HEADERS frame that opened the current block.
    pub headers_end_stream: bool,
    /// A final (non-1xx) response header block has been delivered.
    pub got_response: bool,
    /// Last priority the peer announced. Advisory only.
    pub priority: Option<Priority>,
}

impl H2Stream {
    pub fn new(initial_recv_window: i64, initial_send_window: i64) -> Self {
        Self {
            state: StreamState::Open,
            recv_window: FlowControl::new(initial_recv_window),
            send_window: FlowControl::new(initial_send_window),
            header_buf: Vec::new(),
            headers_end_stream: false,
            got_response: false,
            priority: None,
        }
    }
}
