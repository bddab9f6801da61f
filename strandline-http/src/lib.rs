//! Blocking HTTP client transport.
//!
//! Sends requests to a [`Target`] over HTTP/1.1 or HTTP/2, in cleartext or
//! over TLS, with a keep-alive connection pool, capped exponential backoff
//! and per-target circuit breakers.
//!
//! # Architecture
//!
//! ```text
//!   HttpClient ── RequestBuilder / Request
//!      │
//!      ├─ BreakerRegistry ── allow / record_success / record_failure
//!      ├─ ConnectionPool  ── acquire / release_idle / evict
//!      │
//!      ├─ h1_conn   HTTP/1.1 request encoding, framing, chunked decoding
//!      ├─ negotiate h2c / ALPN, downgrade to HTTP/1.1
//!      └─ h2_conn   pump loop over strandline_h2::H2Connection
//!           │
//!      Connection ── TcpChannel (+ SecureSession)
//! ```
//!
//! Responses are either buffered into a [`Response`] or pushed through a
//! [`StreamSink`] as they arrive. Each call runs on the caller's thread;
//! the `spawn_*` variants run it on a worker thread and report through a
//! callback.
//!
//! # Example
//!
//! ```rust,ignore
//! use strandline_http::{HttpClient, RetryPolicy, Target};
//!
//! fn example() -> Result<(), strandline_http::HttpError> {
//!     let client = HttpClient::new();
//!     let target = Target::secure("example.com", 443);
//!
//!     let resp = client
//!         .get(&target, "/api/data")
//!         .header("authorization", "Bearer tok")
//!         .retry(RetryPolicy::attempts(3))
//!         .send()?;
//!
//!     assert_eq!(resp.status(), 200);
//!     let body = resp.bytes();
//!     Ok(())
//! }
//! ```
//!
//! # Streaming
//!
//! ```rust,ignore
//! struct Print;
//!
//! impl StreamSink for Print {
//!     fn on_headers(&mut self, head: &ResponseHead) -> bool {
//!         println!("{}", head.status());
//!         true
//!     }
//!
//!     fn on_body(&mut self, chunk: &[u8], is_final: bool) -> bool {
//!         print!("{}", String::from_utf8_lossy(chunk));
//!         true
//!     }
//! }
//!
//! let version = client.get(&target, "/events").send_streaming_prefer_h2(&mut Print)?;
//! ```

pub mod body;
pub mod breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
mod h1_conn;
mod h2_conn;
pub mod metrics;
mod negotiate;
pub mod pool;
pub mod request;
pub mod response;
pub mod retry;
pub mod sink;
pub mod target;
pub mod tls;
pub mod transport;

pub use body::Payload;
pub use breaker::{BreakerRegistry, BreakerState};
pub use client::HttpClient;
pub use config::{ClientConfig, PoolConfig, RetryPolicy};
pub use error::{ErrorKind, HttpError, ResolveFailure};
pub use framing::{BodyFraming, ResponseHead};
pub use request::{Request, RequestBuilder, parse_header_block};
pub use response::{Response, Version};
pub use sink::StreamSink;
pub use target::{Security, Target};
pub use tls::{Alpn, RustlsProvider, SecureChannelProvider, SecureSession};
pub use transport::{Liveness, TcpChannel};
