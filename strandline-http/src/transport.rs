//! Byte channels and the connection handle.
//!
//! A [`Connection`] owns at most one TCP channel and at most one secure
//! session. It is moved linearly: opened or taken from the pool, used for
//! one request attempt, then either handed back to the pool or closed.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::{HttpError, ResolveFailure};
use crate::metrics;
use crate::target::Target;
use crate::tls::{Alpn, SecureChannelProvider, SecureSession};

/// Result of probing an idle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Nothing to read, connection open.
    Alive,
    /// The peer closed the connection.
    Closed,
    /// Bytes arrived while idle; the stream is out of sync.
    Unexpected,
}

/// A connected TCP socket with deadlines.
pub struct TcpChannel {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpChannel {
    /// Resolve `target` and connect to the first address that accepts.
    pub fn connect(target: &Target, timeout: Option<Duration>) -> Result<Self, HttpError> {
        let addrs = resolve(target)?;
        let mut last_err = None;
        for addr in addrs {
            let result = match timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match result {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(HttpError::Connect)?;
                    return Ok(Self { stream, peer: addr });
                }
                Err(e) => {
                    trace!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) if e.kind() == io::ErrorKind::ConnectionRefused => HttpError::ConnectRefused,
            Some(e) => HttpError::Connect(e),
            None => HttpError::Resolve {
                host: target.host().to_string(),
                failure: ResolveFailure::NoAddresses,
            },
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Apply the same deadline to every read and write.
    pub fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.stream.set_nonblocking(nonblocking)
    }

    pub fn send_all(&mut self, data: &[u8]) -> Result<(), HttpError> {
        self.stream.write_all(data).map_err(HttpError::from_send)
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        self.stream.read(buf).map_err(HttpError::from_recv)
    }

    /// Wait up to `timeout` for the socket to become readable.
    /// `Duration::ZERO` checks without blocking.
    pub fn poll(&self, timeout: Duration) -> io::Result<Liveness> {
        let mut byte = [0u8; 1];
        let peeked = if timeout.is_zero() {
            self.stream.set_nonblocking(true)?;
            let peeked = self.stream.peek(&mut byte);
            self.stream.set_nonblocking(false)?;
            peeked
        } else {
            let previous = self.stream.read_timeout()?;
            self.stream.set_read_timeout(Some(timeout))?;
            let peeked = self.stream.peek(&mut byte);
            self.stream.set_read_timeout(previous)?;
            peeked
        };
        match peeked {
            Ok(0) => Ok(Liveness::Closed),
            Ok(_) => Ok(Liveness::Unexpected),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(Liveness::Alive)
            }
            Err(e) => Err(e),
        }
    }

    /// Shut down both directions and release the socket.
    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

fn resolve(target: &Target) -> Result<Vec<SocketAddr>, HttpError> {
    let addrs: Vec<SocketAddr> = (target.host(), target.port())
        .to_socket_addrs()
        .map_err(|e| {
            debug!(host = target.host(), error = %e, "name resolution failed");
            HttpError::Resolve {
                host: target.host().to_string(),
                failure: ResolveFailure::Lookup,
            }
        })?
        .collect();
    if addrs.is_empty() {
        return Err(HttpError::Resolve {
            host: target.host().to_string(),
            failure: ResolveFailure::NoAddresses,
        });
    }
    Ok(addrs)
}

enum Channel {
    Empty,
    Plain(TcpChannel),
    Secure(TcpChannel, Box<dyn SecureSession>),
}

/// One outbound connection and its reuse bookkeeping.
pub struct Connection {
    target: Target,
    channel: Channel,
    /// Taken from the idle pool rather than freshly connected.
    pub(crate) from_pool: bool,
    /// The last exchange left the connection reusable.
    pub(crate) should_store: bool,
    /// ALPN selected `h2` on this secure connection.
    pub(crate) negotiated_http2: bool,
    /// Passed a liveness probe since leaving the pool.
    pub(crate) validated: bool,
    /// An I/O deadline expired; never reuse.
    pub(crate) timed_out: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("open", &self.is_open())
            .field("from_pool", &self.from_pool)
            .field("should_store", &self.should_store)
            .field("negotiated_http2", &self.negotiated_http2)
            .finish()
    }
}

impl Connection {
    /// Connect to `target`, running the TLS handshake for secure targets.
    ///
    /// `timeout`, when set, replaces both configured deadlines.
    pub(crate) fn open(
        target: &Target,
        config: &ClientConfig,
        tls: &dyn SecureChannelProvider,
        alpn: Alpn,
        timeout: Option<Duration>,
    ) -> Result<Self, HttpError> {
        let channel = TcpChannel::connect(target, timeout.or(config.connect_timeout()))?;
        channel
            .set_io_timeout(timeout.or(config.io_timeout()))
            .map_err(|e| HttpError::Config(format!("socket timeouts: {e}")))?;
        metrics::CONNECTIONS_OPENED.increment();

        let (channel, negotiated_http2) = if target.is_secure() {
            let mut channel = channel;
            let session = tls.establish(&mut channel, target, alpn)?;
            let h2 = session.alpn_protocol() == Some(b"h2".as_slice());
            (Channel::Secure(channel, session), h2)
        } else {
            (Channel::Plain(channel), false)
        };
        debug!(%target, negotiated_http2, "connected");

        Ok(Self {
            target: target.clone(),
            channel,
            from_pool: false,
            should_store: false,
            negotiated_http2,
            validated: false,
            timed_out: false,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.channel, Channel::Empty)
    }

    fn tcp(&self) -> Option<&TcpChannel> {
        match &self.channel {
            Channel::Empty => None,
            Channel::Plain(channel) | Channel::Secure(channel, _) => Some(channel),
        }
    }

    /// Replace the read and write deadline, e.g. for one call on a pooled
    /// connection.
    pub(crate) fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<(), HttpError> {
        let channel = self
            .tcp()
            .ok_or_else(|| HttpError::Send(io::ErrorKind::NotConnected.into()))?;
        channel
            .set_io_timeout(timeout)
            .map_err(|e| HttpError::Config(format!("socket timeouts: {e}")))
    }

    #[cfg(test)]
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp().and_then(|channel| channel.local_addr().ok())
    }

    pub(crate) fn send_all(&mut self, data: &[u8]) -> Result<(), HttpError> {
        let result = match &mut self.channel {
            Channel::Empty => return Err(HttpError::Send(io::ErrorKind::NotConnected.into())),
            Channel::Plain(channel) => channel.send_all(data),
            Channel::Secure(channel, session) => session
                .write_all(channel, data)
                .map_err(HttpError::from_send),
        };
        self.note_timeout(result)
    }

    /// Read available bytes. `Ok(0)` means the peer closed the connection.
    pub(crate) fn recv(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        let result = match &mut self.channel {
            Channel::Empty => return Err(HttpError::Recv(io::ErrorKind::NotConnected.into())),
            Channel::Plain(channel) => channel.recv(buf),
            Channel::Secure(channel, session) => {
                session.read(channel, buf).map_err(HttpError::from_recv)
            }
        };
        self.note_timeout(result)
    }

    fn note_timeout<T>(&mut self, result: Result<T, HttpError>) -> Result<T, HttpError> {
        if matches!(result, Err(HttpError::Timeout)) {
            self.timed_out = true;
            self.should_store = false;
        }
        result
    }

    /// Non-blocking liveness probe for a connection leaving the pool.
    pub(crate) fn probe(&mut self) -> Liveness {
        let result = match &mut self.channel {
            Channel::Empty => return Liveness::Closed,
            Channel::Plain(channel) => channel.poll(Duration::ZERO),
            Channel::Secure(channel, session) => session.probe(channel),
        };
        let liveness = result.unwrap_or(Liveness::Closed);
        self.validated = liveness == Liveness::Alive;
        liveness
    }

    /// Single teardown path: close_notify for secure sessions, then the
    /// socket. Idempotent.
    pub(crate) fn close(&mut self) {
        match std::mem::replace(&mut self.channel, Channel::Empty) {
            Channel::Empty => return,
            Channel::Plain(channel) => channel.close(),
            Channel::Secure(mut channel, mut session) => {
                session.close(&mut channel);
                channel.close();
            }
        }
        trace!(target = %self.target, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::tls::RustlsProvider;

    fn listener() -> (TcpListener, Target) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Target::plain("127.0.0.1", port))
    }

    fn open(target: &Target) -> Connection {
        Connection::open(
            target,
            &ClientConfig::default(),
            &RustlsProvider::new(),
            Alpn::Http11,
            None,
        )
        .unwrap()
    }

    #[test]
    fn refused_connect_is_distinguished() {
        let (listener, target) = listener();
        drop(listener);
        assert!(matches!(
            TcpChannel::connect(&target, Some(Duration::from_secs(1))),
            Err(HttpError::ConnectRefused)
        ));
    }

    #[test]
    fn unresolvable_host() {
        let target = Target::plain("strandline-does-not-exist.invalid", 80);
        assert!(matches!(
            TcpChannel::connect(&target, None),
            Err(HttpError::Resolve { .. })
        ));
    }

    #[test]
    fn probe_reports_idle_closed_and_unexpected() {
        let (listener, target) = listener();

        let mut idle = open(&target);
        let (_server_idle, _) = listener.accept().unwrap();
        assert_eq!(idle.probe(), Liveness::Alive);
        assert!(idle.validated);

        let mut closed = open(&target);
        let (server_closed, _) = listener.accept().unwrap();
        drop(server_closed);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(closed.probe(), Liveness::Closed);
        assert!(!closed.validated);

        let mut chatty = open(&target);
        let (mut server_chatty, _) = listener.accept().unwrap();
        server_chatty.write_all(b"x").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(chatty.probe(), Liveness::Unexpected);
    }

    #[test]
    fn read_timeout_marks_connection() {
        let (listener, target) = listener();
        let config = ClientConfig {
            io_timeout_ms: 50,
            ..ClientConfig::default()
        };
        let mut conn =
            Connection::open(&target, &config, &RustlsProvider::new(), Alpn::Http11, None).unwrap();
        let (_server, _) = listener.accept().unwrap();
        conn.should_store = true;

        let mut buf = [0u8; 16];
        assert!(matches!(conn.recv(&mut buf), Err(HttpError::Timeout)));
        assert!(conn.timed_out);
        assert!(!conn.should_store);
    }

    #[test]
    fn per_call_timeout_overrides_config() {
        let (listener, target) = listener();
        let config = ClientConfig {
            io_timeout_ms: 30_000,
            ..ClientConfig::default()
        };
        let mut conn = Connection::open(
            &target,
            &config,
            &RustlsProvider::new(),
            Alpn::Http11,
            Some(Duration::from_millis(50)),
        )
        .unwrap();
        let (_server, _) = listener.accept().unwrap();

        let started = std::time::Instant::now();
        let mut buf = [0u8; 16];
        assert!(matches!(conn.recv(&mut buf), Err(HttpError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn io_timeout_can_be_replaced() {
        let (listener, target) = listener();
        let mut conn = open(&target);
        let (_server, _) = listener.accept().unwrap();
        conn.set_io_timeout(Some(Duration::from_millis(50))).unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(conn.recv(&mut buf), Err(HttpError::Timeout)));

        conn.close();
        assert!(conn.set_io_timeout(None).is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let (listener, target) = listener();
        let mut conn = open(&target);
        let (mut server, _) = listener.accept().unwrap();
        conn.close();
        conn.close();
        assert!(!conn.is_open());
        assert!(conn.send_all(b"x").is_err());

        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).unwrap(), 0);
    }
}
