//! Sans-IO HTTP/2 client framing layer.
//!
//! The caller feeds bytes in via `recv()` and pulls bytes out via
//! `take_pending_send()`; no sockets or timers live in this crate.
//!
//! # Architecture
//!
//! ```text
//!   TCP / TLS bytes
//!        |
//!   +----v-------------+
//!   | strandline-h2    |  frames + length-prefixed header blocks
//!   | H2Connection     |  H2Event: Response, Data, Trailers, Downgrade, ...
//!   +------------------+
//! ```
//!
//! Header blocks use the literal encoding in [`block`], not HPACK, so this
//! crate only interoperates with peers that speak the same block format.
//!
//! # Example
//!
//! ```rust,ignore
//! use strandline_h2::{H2Connection, H2Event, HeaderField, Settings};
//!
//! let mut h2 = H2Connection::cleartext(Settings::client_default())?;
//! transport_send(&h2.take_pending_send());
//!
//! while !h2.is_ready() {
//!     h2.recv(&transport_recv())?;
//!     transport_send(&h2.take_pending_send());
//! }
//!
//! let stream_id = h2.send_request(&[
//!     HeaderField::new(":method", "GET"),
//!     HeaderField::new(":path", "/"),
//!     HeaderField::new(":scheme", "http"),
//!     HeaderField::new(":authority", "example.com"),
//! ], true)?;
//! transport_send(&h2.take_pending_send());
//!
//! h2.recv(&transport_recv())?;
//! while let Some(event) = h2.poll_event() {
//!     match event {
//!         H2Event::Response { status, headers, end_stream, .. } => { /* ... */ }
//!         H2Event::Data { data, end_stream, .. } => { /* ... */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod block;
pub mod connection;
pub mod error;
pub mod flowcontrol;
pub mod frame;
pub mod settings;
mod stream;

pub use block::HeaderField;
pub use connection::{CLIENT_PREFACE, ConnState, H2Connection, H2Event};
pub use error::{ErrorCode, H2Error};
pub use frame::Frame;
pub use settings::{Setting, Settings};
