//! HTTP/2 negotiation and the cleartext downgrade path.
//!
//! Each phase returns a tagged result and the client composes them in
//! order. The request is never sent twice: a peer that answered the
//! preface with HTTP/1.x has already produced the response.

use strandline_h2::{H2Connection, Settings};
use tracing::debug;

use crate::error::HttpError;
use crate::framing;
use crate::h1_conn::{Exchange, ResponseReader};
use crate::h2_conn::{self, Handshake};
use crate::metrics;
use crate::request::Request;
use crate::sink::Delivery;
use crate::transport::Connection;

/// How an HTTP/1.x answer to the preface is recovered.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Fallback {
    /// The buffered bytes already hold the whole response.
    Buffered(Vec<u8>),
    /// The buffered bytes are a prefix; keep reading the same connection.
    Replayed(Vec<u8>),
}

pub(crate) enum Negotiated {
    H2(H2Connection),
    Downgraded(Fallback),
}

/// Run the SETTINGS exchange and classify a downgrade.
pub(crate) fn handshake(
    conn: &mut Connection,
    settings: &Settings,
    request: &Request,
    max_header_bytes: usize,
) -> Result<Negotiated, HttpError> {
    match h2_conn::handshake(conn, settings)? {
        Handshake::Ready(h2) => Ok(Negotiated::H2(h2)),
        Handshake::Downgraded(prefetched) => {
            metrics::H2_DOWNGRADES.increment();
            let fallback = classify(prefetched, request, max_header_bytes)?;
            debug!(
                target = %conn.target(),
                buffered = matches!(fallback, Fallback::Buffered(_)),
                "downgrading to HTTP/1.1"
            );
            Ok(Negotiated::Downgraded(fallback))
        }
    }
}

fn classify(
    prefetched: Vec<u8>,
    request: &Request,
    max_header_bytes: usize,
) -> Result<Fallback, HttpError> {
    if framing::is_complete_response(&prefetched, max_header_bytes, request.is_head())? {
        Ok(Fallback::Buffered(prefetched))
    } else {
        Ok(Fallback::Replayed(prefetched))
    }
}

/// Decode a response held entirely in `prefetched`.
pub(crate) fn fallback_buffered(
    prefetched: Vec<u8>,
    request: &Request,
    max_header_bytes: usize,
    delivery: &mut Delivery<'_>,
) -> Result<Exchange, HttpError> {
    ResponseReader::new(request, max_header_bytes)
        .with_prefetched(prefetched)
        .finish_buffered(delivery)
}

/// Continue the HTTP/1.1 receive path on `conn`, seeded with `prefetched`.
pub(crate) fn fallback_replayed(
    conn: &mut Connection,
    prefetched: Vec<u8>,
    request: &Request,
    max_header_bytes: usize,
    delivery: &mut Delivery<'_>,
) -> Result<Exchange, HttpError> {
    ResponseReader::new(request, max_header_bytes)
        .with_prefetched(prefetched)
        .run(conn, delivery)
}
