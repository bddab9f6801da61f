//! Top-level HTTP client: pooling, retries, circuit breaking and protocol
//! selection.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::breaker::{BreakerRegistry, BreakerState};
use crate::config::{ClientConfig, RetryPolicy};
use crate::error::{ErrorKind, HttpError};
use crate::h1_conn;
use crate::h2_conn;
use crate::metrics;
use crate::negotiate::{self, Fallback, Negotiated};
use crate::pool::ConnectionPool;
use crate::request::{Request, RequestBuilder};
use crate::response::{Response, Version};
use crate::retry::Backoff;
use crate::sink::{CollectSink, Delivery, StreamSink};
use crate::target::Target;
use crate::tls::{Alpn, RustlsProvider, SecureChannelProvider};
use crate::transport::Connection;

struct Inner {
    config: ClientConfig,
    pool: ConnectionPool,
    breakers: BreakerRegistry,
    tls: Arc<dyn SecureChannelProvider>,
}

/// Blocking HTTP client with a shared connection pool and per-target
/// circuit breakers.
///
/// Cloning is cheap; clones share the pool and breakers.
///
/// # Example
///
/// ```rust,ignore
/// let client = HttpClient::new();
/// let target = Target::secure("example.com", 443);
/// let resp = client.get(&target, "/api/data").header("authorization", "Bearer tok").send()?;
/// assert_eq!(resp.status(), 200);
/// ```
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Http1,
    PreferH2,
}

/// Where an attempt delivers its response.
enum Receiver<'s> {
    /// Buffered call. Cleared before every attempt, so a retry after a
    /// partial response is safe.
    Collect(&'s mut CollectSink),
    /// Caller's sink. Nothing is retried once it has seen a head.
    Stream(&'s mut dyn StreamSink),
}

impl Receiver<'_> {
    fn delivery(&mut self) -> Delivery<'_> {
        match self {
            Receiver::Collect(sink) => {
                sink.reset();
                Delivery::new(&mut **sink)
            }
            Receiver::Stream(sink) => Delivery::new(&mut **sink),
        }
    }

    fn is_buffered(&self) -> bool {
        matches!(self, Receiver::Collect(_))
    }
}

impl HttpClient {
    /// Client with the default configuration and the rustls provider.
    pub fn new() -> Self {
        Self::from_parts(ClientConfig::default(), Arc::new(RustlsProvider::new()))
    }

    pub fn with_config(config: ClientConfig) -> Result<Self, HttpError> {
        Self::with_tls_provider(config, Arc::new(RustlsProvider::new()))
    }

    /// Client using a custom secure channel provider.
    pub fn with_tls_provider(
        config: ClientConfig,
        tls: Arc<dyn SecureChannelProvider>,
    ) -> Result<Self, HttpError> {
        config.validate()?;
        Ok(Self::from_parts(config, tls))
    }

    fn from_parts(config: ClientConfig, tls: Arc<dyn SecureChannelProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool: ConnectionPool::new(config.pool.clone()),
                breakers: BreakerRegistry::new(),
                config,
                tls,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Build a GET request.
    pub fn get(&self, target: &Target, path: &str) -> RequestBuilder<'_> {
        self.request("GET", target, path)
    }

    /// Build a POST request.
    pub fn post(&self, target: &Target, path: &str) -> RequestBuilder<'_> {
        self.request("POST", target, path)
    }

    /// Build a PUT request.
    pub fn put(&self, target: &Target, path: &str) -> RequestBuilder<'_> {
        self.request("PUT", target, path)
    }

    /// Build a DELETE request.
    pub fn delete(&self, target: &Target, path: &str) -> RequestBuilder<'_> {
        self.request("DELETE", target, path)
    }

    /// Build a HEAD request.
    pub fn head(&self, target: &Target, path: &str) -> RequestBuilder<'_> {
        self.request("HEAD", target, path)
    }

    pub fn request(&self, method: &str, target: &Target, path: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, target, path)
    }

    /// Send over HTTP/1.1 and buffer the whole response.
    pub fn execute(&self, request: &Request) -> Result<Response, HttpError> {
        let mut collect = CollectSink::new();
        self.run(request, Receiver::Collect(&mut collect), Mode::Http1)?;
        collect.into_response()
    }

    /// Send over HTTP/1.1, delivering the response to `sink` as it
    /// arrives.
    pub fn execute_streaming(
        &self,
        request: &Request,
        sink: &mut dyn StreamSink,
    ) -> Result<Version, HttpError> {
        self.run(request, Receiver::Stream(sink), Mode::Http1)
    }

    /// Try HTTP/2 first. Falls back to HTTP/1.1 when the peer refuses,
    /// does not negotiate `h2`, or answers the preface with HTTP/1.x.
    pub fn execute_prefer_h2(&self, request: &Request) -> Result<Response, HttpError> {
        let mut collect = CollectSink::new();
        self.run(request, Receiver::Collect(&mut collect), Mode::PreferH2)?;
        collect.into_response()
    }

    /// Streaming form of [`HttpClient::execute_prefer_h2`]. Returns the
    /// protocol version that carried the response.
    pub fn execute_streaming_prefer_h2(
        &self,
        request: &Request,
        sink: &mut dyn StreamSink,
    ) -> Result<Version, HttpError> {
        self.run(request, Receiver::Stream(sink), Mode::PreferH2)
    }

    /// Run [`HttpClient::execute`] on a worker thread. `callback` is
    /// invoked exactly once with the outcome.
    pub fn spawn_execute<F>(&self, request: Request, callback: F) -> Result<JoinHandle<()>, HttpError>
    where
        F: FnOnce(Result<Response, HttpError>) + Send + 'static,
    {
        let client = self.clone();
        spawn_worker("strandline-exec", move || {
            callback(client.execute(&request));
        })
    }

    /// Run [`HttpClient::execute_streaming`] on a worker thread. The sink
    /// is handed back to `callback` together with the outcome.
    pub fn spawn_streaming<S, F>(
        &self,
        request: Request,
        mut sink: S,
        callback: F,
    ) -> Result<JoinHandle<()>, HttpError>
    where
        S: StreamSink + Send + 'static,
        F: FnOnce(S, Result<Version, HttpError>) + Send + 'static,
    {
        let client = self.clone();
        spawn_worker("strandline-stream", move || {
            let result = client.execute_streaming(&request, &mut sink);
            callback(sink, result);
        })
    }

    pub fn spawn_prefer_h2<F>(&self, request: Request, callback: F) -> Result<JoinHandle<()>, HttpError>
    where
        F: FnOnce(Result<Response, HttpError>) + Send + 'static,
    {
        let client = self.clone();
        spawn_worker("strandline-h2", move || {
            callback(client.execute_prefer_h2(&request));
        })
    }

    /// Close every idle pooled connection.
    pub fn clear_pool(&self) {
        self.inner.pool.clear();
    }

    /// Forget all circuit breaker state. Sockets are untouched.
    pub fn reset_breakers(&self) {
        self.inner.breakers.reset();
    }

    pub fn idle_connections(&self, target: &Target) -> usize {
        self.inner.pool.idle_count(target)
    }

    pub fn breaker_state(&self, target: &Target) -> BreakerState {
        self.inner.breakers.state(target)
    }

    fn policy_for(&self, request: &Request, buffered: bool) -> RetryPolicy {
        if let Some(policy) = request.policy() {
            return policy.clone();
        }
        let mut policy = RetryPolicy::default();
        // Plain streaming calls get one implicit retry.
        if !buffered && !request.target().is_secure() {
            policy.max_attempts = policy.max_attempts.max(2);
        }
        policy
    }

    fn run(
        &self,
        request: &Request,
        mut receiver: Receiver<'_>,
        mode: Mode,
    ) -> Result<Version, HttpError> {
        request.validate()?;
        let target = request.target();
        let policy = self.policy_for(request, receiver.is_buffered());
        let breakers = &self.inner.breakers;
        let mut backoff = Backoff::new(&policy);

        let mut attempt = 1;
        loop {
            if !breakers.allow(target, &policy) {
                return Err(HttpError::CircuitOpen(target.to_string()));
            }

            let mut delivery = receiver.delivery();
            let result = match mode {
                Mode::Http1 => self.attempt_h1(request, &mut delivery),
                Mode::PreferH2 => self.attempt_prefer_h2(request, &mut delivery, attempt),
            };
            let headers_delivered = delivery.headers_delivered();

            let err = match result {
                Ok(version) => {
                    breakers.record_success(target, &policy);
                    return Ok(version);
                }
                Err(e) => e,
            };
            if counts_against_breaker(&err) {
                breakers.record_failure(target, &policy);
            } else {
                breakers.record_success(target, &policy);
            }

            let may_retry = err.is_retryable()
                && attempt < policy.max_attempts
                && (receiver.is_buffered() || !headers_delivered);
            if !may_retry {
                debug!(%target, attempt, error = %err, "request failed");
                return Err(err);
            }

            let delay = backoff.next_delay();
            metrics::RETRIES.increment();
            debug!(%target, attempt, ?delay, error = %err, "retrying request");
            thread::sleep(delay);
            attempt += 1;
        }
    }

    /// One HTTP/1.1 attempt. A pooled connection that turns out to be dead
    /// before any response byte gets one immediate replacement.
    fn attempt_h1(&self, request: &Request, delivery: &mut Delivery<'_>) -> Result<Version, HttpError> {
        if let Some(result) = self.exchange_pooled(request, delivery) {
            return result;
        }
        let conn = self.open(request, Alpn::Http11)?;
        self.exchange_h1(conn, request, delivery)
    }

    /// Run `request` on an idle pooled connection. `None` when the pool
    /// has nothing for the target or the connection was stale.
    fn exchange_pooled(
        &self,
        request: &Request,
        delivery: &mut Delivery<'_>,
    ) -> Option<Result<Version, HttpError>> {
        let target = request.target();
        let mut conn = self.inner.pool.acquire(target)?;
        if let Some(timeout) = request.timeout() {
            if let Err(e) = conn.set_io_timeout(Some(timeout)) {
                debug!(%target, error = %e, "cannot apply call timeout to pooled connection");
                self.inner.pool.evict(conn);
                return None;
            }
        }
        metrics::CONNECTIONS_REUSED.increment();
        match self.exchange_h1(conn, request, delivery) {
            Err(e) if is_stale(&e) && !delivery.headers_delivered() => {
                debug!(%target, error = %e, "pooled connection was stale, reconnecting");
                None
            }
            result => Some(result),
        }
    }

    fn exchange_h1(
        &self,
        mut conn: Connection,
        request: &Request,
        delivery: &mut Delivery<'_>,
    ) -> Result<Version, HttpError> {
        let config = &self.inner.config;
        let result = h1_conn::exchange(
            &mut conn,
            request,
            &config.user_agent,
            config.max_header_bytes,
            delivery,
        );
        match result {
            Ok(exchange) => {
                conn.should_store = exchange.reusable;
                // Parked connections carry the client deadline.
                if exchange.reusable
                    && request.timeout().is_some()
                    && conn.set_io_timeout(config.io_timeout()).is_err()
                {
                    conn.should_store = false;
                }
                self.inner.pool.release_idle(conn);
                Ok(exchange.version)
            }
            Err(e) => {
                self.inner.pool.evict(conn);
                Err(e)
            }
        }
    }

    fn attempt_prefer_h2(
        &self,
        request: &Request,
        delivery: &mut Delivery<'_>,
        attempt: u32,
    ) -> Result<Version, HttpError> {
        let target = request.target();
        let config = &self.inner.config;

        // Only HTTP/1.1 connections are ever parked.
        if target.is_secure() {
            if let Some(result) = self.exchange_pooled(request, delivery) {
                return result;
            }
        }

        let mut conn = match self.open(request, Alpn::H2OrHttp11) {
            Ok(conn) => conn,
            Err(HttpError::ConnectRefused) if attempt == 1 => {
                metrics::H2_FALLBACKS.increment();
                debug!(%target, "connect refused, falling back to HTTP/1.1");
                return self.attempt_h1(request, delivery);
            }
            Err(e) => return Err(e),
        };

        if target.is_secure() && !conn.negotiated_http2 {
            debug!(%target, "ALPN did not select h2, using HTTP/1.1");
            return self.exchange_h1(conn, request, delivery);
        }

        let negotiated =
            match negotiate::handshake(&mut conn, &config.h2, request, config.max_header_bytes) {
                Ok(negotiated) => negotiated,
                Err(e) if !target.is_secure() && e.kind() == ErrorKind::ProtocolMismatch => {
                    self.inner.pool.evict(conn);
                    metrics::H2_FALLBACKS.increment();
                    debug!(%target, error = %e, "h2c unavailable, falling back to HTTP/1.1");
                    return self.attempt_h1(request, delivery);
                }
                Err(e) => {
                    self.inner.pool.evict(conn);
                    return Err(e);
                }
            };

        let max = config.max_header_bytes;
        let result = match negotiated {
            Negotiated::H2(h2) => {
                h2_conn::exchange(&mut conn, h2, request, &config.user_agent, delivery)
                    .map(|()| Version::H2)
            }
            Negotiated::Downgraded(Fallback::Buffered(prefetched)) => {
                negotiate::fallback_buffered(prefetched, request, max, delivery)
                    .map(|exchange| exchange.version)
            }
            Negotiated::Downgraded(Fallback::Replayed(prefetched)) => {
                negotiate::fallback_replayed(&mut conn, prefetched, request, max, delivery)
                    .map(|exchange| exchange.version)
            }
        };
        self.inner.pool.evict(conn);
        result
    }

    fn open(&self, request: &Request, alpn: Alpn) -> Result<Connection, HttpError> {
        Connection::open(
            request.target(),
            &self.inner.config,
            self.inner.tls.as_ref(),
            alpn,
            request.timeout(),
        )
    }
}

/// Transport-level failures feed the breaker. Everything else, including
/// a sink abort, says nothing about the target's health.
fn counts_against_breaker(err: &HttpError) -> bool {
    if matches!(err, HttpError::SinkAborted) {
        return false;
    }
    matches!(
        err.kind(),
        ErrorKind::ConnectFailed
            | ErrorKind::SendFailed
            | ErrorKind::ReceiveFailed
            | ErrorKind::ProtocolMismatch
            | ErrorKind::MalformedFraming
            | ErrorKind::ResolveFailed(_)
            | ErrorKind::OutOfMemory
    )
}

/// The peer closed an idle connection while it sat in the pool.
fn is_stale(err: &HttpError) -> bool {
    match err {
        HttpError::ConnectionClosed | HttpError::Send(_) => true,
        HttpError::Recv(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

fn spawn_worker<F>(name: &str, f: F) -> Result<JoinHandle<()>, HttpError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| HttpError::OutOfMemory(format!("failed to spawn worker thread: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolveFailure;

    #[test]
    fn invalid_config_rejected() {
        let config = ClientConfig {
            max_header_bytes: 1,
            ..ClientConfig::default()
        };
        assert!(matches!(
            HttpClient::with_config(config),
            Err(HttpError::Config(_))
        ));
    }

    #[test]
    fn implicit_retry_only_for_plain_streaming() {
        let client = HttpClient::new();
        let plain = Request::new("GET", Target::plain("a", 80), "/");
        let secure = Request::new("GET", Target::secure("a", 443), "/");
        assert_eq!(client.policy_for(&plain, false).max_attempts, 2);
        assert_eq!(client.policy_for(&plain, true).max_attempts, 1);
        assert_eq!(client.policy_for(&secure, false).max_attempts, 1);

        let mut explicit = plain.clone();
        explicit.set_policy(RetryPolicy::attempts(1));
        assert_eq!(client.policy_for(&explicit, false).max_attempts, 1);
    }

    #[test]
    fn breaker_accounting() {
        assert!(counts_against_breaker(&HttpError::ConnectRefused));
        assert!(counts_against_breaker(&HttpError::Timeout));
        assert!(counts_against_breaker(&HttpError::Framing("x".into())));
        assert!(counts_against_breaker(&HttpError::Resolve {
            host: "x".into(),
            failure: ResolveFailure::NoAddresses,
        }));
        assert!(!counts_against_breaker(&HttpError::SinkAborted));
        assert!(!counts_against_breaker(&HttpError::InvalidArgument("x".into())));
        assert!(!counts_against_breaker(&HttpError::Unsupported("x")));
    }

    #[test]
    fn stale_connection_errors() {
        assert!(is_stale(&HttpError::ConnectionClosed));
        assert!(is_stale(&HttpError::Recv(io::ErrorKind::ConnectionReset.into())));
        assert!(!is_stale(&HttpError::Recv(io::ErrorKind::InvalidData.into())));
        assert!(!is_stale(&HttpError::Timeout));
    }

    #[test]
    fn invalid_request_fails_before_io() {
        let client = HttpClient::new();
        let req = Request::new("GET", Target::plain("127.0.0.1", 1), "relative");
        assert!(matches!(
            client.execute(&req),
            Err(HttpError::InvalidArgument(_))
        ));
        assert_eq!(client.breaker_state(req.target()), BreakerState::Closed);
    }
}
