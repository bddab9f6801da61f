use std::io;

use strandline_h2::H2Error;

/// Why a host name could not be turned into socket addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveFailure {
    /// The lookup succeeded but returned nothing.
    NoAddresses,
    /// The resolver itself failed.
    Lookup,
}

/// Coarse classification used by the retry loop and callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Configuration,
    ConnectFailed,
    SendFailed,
    /// Includes timeouts.
    ReceiveFailed,
    ProtocolMismatch,
    MalformedFraming,
    Unsupported,
    OutOfMemory,
    ResolveFailed(ResolveFailure),
}

/// Errors produced by the HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Caller-supplied request data is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Client or retry configuration is out of range.
    #[error("configuration error: {0}")]
    Config(String),

    /// TCP connect failed.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// The peer actively refused the connection.
    #[error("connection refused")]
    ConnectRefused,

    /// The per-target circuit breaker rejected the attempt without I/O.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),

    /// A connect, send or receive deadline elapsed.
    #[error("timed out")]
    Timeout,

    /// The peer closed the connection before any response bytes arrived.
    #[error("connection closed before response")]
    ConnectionClosed,

    /// The peer does not speak the protocol we expected.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The response violates HTTP/1.1 message framing.
    #[error("malformed framing: {0}")]
    Framing(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A buffer limit was exceeded.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("failed to resolve {host}: {failure:?}")]
    Resolve {
        host: String,
        failure: ResolveFailure,
    },

    /// HTTP/2 framing error.
    #[error("h2 error: {0}")]
    H2(#[from] H2Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The streaming sink asked to stop.
    #[error("aborted by response sink")]
    SinkAborted,

    /// A JSON payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HttpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::Serialization(_) => ErrorKind::InvalidArgument,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Connect(_) | Self::ConnectRefused | Self::CircuitOpen(_) | Self::Tls(_) => {
                ErrorKind::ConnectFailed
            }
            Self::Send(_) => ErrorKind::SendFailed,
            Self::Recv(_) | Self::Timeout | Self::ConnectionClosed | Self::SinkAborted => {
                ErrorKind::ReceiveFailed
            }
            Self::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            Self::Framing(_) => ErrorKind::MalformedFraming,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Self::Resolve { failure, .. } => ErrorKind::ResolveFailed(*failure),
            Self::H2(e) => match e {
                H2Error::Http1Peer | H2Error::InvalidState(_) => ErrorKind::ProtocolMismatch,
                H2Error::ConnectionError(_) | H2Error::StreamError(..) => ErrorKind::ReceiveFailed,
                H2Error::FrameError
                | H2Error::FrameSizeError
                | H2Error::ProtocolError(_)
                | H2Error::HeaderBlock(_)
                | H2Error::FlowControlError => ErrorKind::MalformedFraming,
            },
        }
    }

    /// Whether another attempt may succeed: connect, send, receive and
    /// protocol-mismatch failures. Breaker rejections, sink aborts and TLS
    /// handshake rejections are final.
    pub fn is_retryable(&self) -> bool {
        if matches!(self, Self::CircuitOpen(_) | Self::SinkAborted | Self::Tls(_)) {
            return false;
        }
        matches!(
            self.kind(),
            ErrorKind::ConnectFailed
                | ErrorKind::SendFailed
                | ErrorKind::ReceiveFailed
                | ErrorKind::ProtocolMismatch
        )
    }

    /// Map a socket error from a blocking read or write, folding deadline
    /// expiry into [`HttpError::Timeout`].
    pub(crate) fn from_recv(e: io::Error) -> Self {
        if is_timeout(&e) {
            Self::Timeout
        } else {
            Self::Recv(e)
        }
    }

    pub(crate) fn from_send(e: io::Error) -> Self {
        if is_timeout(&e) {
            Self::Timeout
        } else {
            Self::Send(e)
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
