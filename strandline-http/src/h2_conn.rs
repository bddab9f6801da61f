//! Blocking driver for the sans-IO [`H2Connection`].
//!
//! Pump loop: flush pending frames, read from the connection, feed the
//! state machine, dispatch events. One request per connection; the
//! connection is never pooled afterwards.

use strandline_h2::{ErrorCode, H2Connection, H2Error, H2Event, HeaderField, Settings};
use tracing::{debug, trace};

use crate::error::HttpError;
use crate::framing::ResponseHead;
use crate::h1_conn::READ_BUF_SIZE;
use crate::request::Request;
use crate::response::Version;
use crate::sink::Delivery;
use crate::transport::Connection;

/// Request headers that have no meaning on an HTTP/2 stream.
const CONNECTION_SPECIFIC: [&str; 6] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Outcome of the SETTINGS exchange.
pub(crate) enum Handshake {
    Ready(H2Connection),
    /// A cleartext peer answered with HTTP/1.x. Holds every byte read so
    /// far, starting with the status line.
    Downgraded(Vec<u8>),
}

fn flush(conn: &mut Connection, h2: &mut H2Connection) -> Result<(), HttpError> {
    if h2.has_pending_send() {
        let pending = h2.take_pending_send();
        trace!(bytes = pending.len(), "h2 flush");
        conn.send_all(&pending)?;
    }
    Ok(())
}

/// Send the preface and wait until both SETTINGS frames are exchanged.
pub(crate) fn handshake(conn: &mut Connection, settings: &Settings) -> Result<Handshake, HttpError> {
    let mut h2 = if conn.target().is_secure() {
        H2Connection::new(settings.clone())?
    } else {
        H2Connection::cleartext(settings.clone())?
    };
    flush(conn, &mut h2)?;

    let mut buf = vec![0u8; READ_BUF_SIZE];
    while !h2.is_ready() {
        let n = conn.recv(&mut buf)?;
        if n == 0 {
            return Err(HttpError::ProtocolMismatch(
                "peer closed the connection during the HTTP/2 handshake".into(),
            ));
        }
        h2.recv(&buf[..n])?;
        while let Some(event) = h2.poll_event() {
            match event {
                H2Event::Downgrade { prefetched } => {
                    debug!(target = %conn.target(), "peer answered HTTP/2 preface with HTTP/1.x");
                    return Ok(Handshake::Downgraded(prefetched));
                }
                H2Event::GoAway { error_code, .. } => {
                    return Err(H2Error::ConnectionError(error_code).into());
                }
                _ => {}
            }
        }
        flush(conn, &mut h2)?;
    }

    debug!(
        target = %conn.target(),
        max_frame_size = h2.remote_settings().max_frame_size,
        "h2 handshake complete"
    );
    Ok(Handshake::Ready(h2))
}

fn request_fields(request: &Request, user_agent: &str) -> Vec<HeaderField> {
    let target = request.target();
    let mut fields = vec![
        HeaderField::new(":method", request.method()),
        HeaderField::new(":path", request.path()),
        HeaderField::new(":scheme", target.scheme()),
        HeaderField::new(":authority", target.authority()),
    ];
    if !user_agent.is_empty() && request.header("user-agent").is_none() {
        fields.push(HeaderField::new("user-agent", user_agent));
    }
    for (name, value) in request.headers() {
        let name = name.to_ascii_lowercase();
        if CONNECTION_SPECIFIC.contains(&name.as_str()) {
            continue;
        }
        fields.push(HeaderField::new(name, value.as_str()));
    }
    fields
}

fn response_head(status: u16, fields: Vec<HeaderField>) -> ResponseHead {
    let headers = fields
        .into_iter()
        .filter(|f| !f.is_pseudo())
        .map(|f| {
            (
                String::from_utf8_lossy(&f.name).into_owned(),
                String::from_utf8_lossy(&f.value).into_owned(),
            )
        })
        .collect();
    ResponseHead::new(status, Version::H2, headers)
}

/// Send `request` on a fresh stream and deliver the response.
///
/// Request payloads are not supported over HTTP/2.
pub(crate) fn exchange(
    conn: &mut Connection,
    mut h2: H2Connection,
    request: &Request,
    user_agent: &str,
    delivery: &mut Delivery<'_>,
) -> Result<(), HttpError> {
    if !request.payload().is_empty() {
        return Err(HttpError::Unsupported("request payload over HTTP/2"));
    }

    let stream_id = h2.send_request(&request_fields(request, user_agent), true)?;
    trace!(stream_id, method = request.method(), path = request.path(), "h2 request sent");
    flush(conn, &mut h2)?;

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        while let Some(event) = h2.poll_event() {
            match event {
                H2Event::Response {
                    status,
                    headers,
                    end_stream,
                    ..
                } => {
                    delivery.headers(&response_head(status, headers))?;
                    if end_stream {
                        return delivery.finish(&[]);
                    }
                }
                H2Event::Data {
                    data, end_stream, ..
                } => {
                    if end_stream {
                        return delivery.finish(&data);
                    }
                    delivery.body(&data)?;
                }
                H2Event::Trailers { .. } => return delivery.finish(&[]),
                H2Event::StreamReset {
                    stream_id,
                    error_code,
                } => return Err(H2Error::StreamError(stream_id, error_code).into()),
                // A graceful GOAWAY covering our stream lets it finish.
                H2Event::GoAway {
                    last_stream_id,
                    error_code,
                    ..
                } => {
                    if error_code != ErrorCode::NoError || last_stream_id < stream_id {
                        return Err(H2Error::ConnectionError(error_code).into());
                    }
                    debug!(stream_id, last_stream_id, "graceful GOAWAY");
                }
                H2Event::SettingsAcknowledged | H2Event::Downgrade { .. } => {}
            }
        }
        // PING and SETTINGS acks, WINDOW_UPDATEs.
        flush(conn, &mut h2)?;

        let n = conn.recv(&mut buf)?;
        if n == 0 {
            if delivery.headers_delivered() {
                debug!(stream_id, "connection closed before END_STREAM");
                return delivery.finish(&[]);
            }
            return Err(HttpError::ConnectionClosed);
        }
        h2.recv(&buf[..n])?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    #[test]
    fn pseudo_headers_first_and_connection_headers_dropped() {
        let mut req = Request::new("GET", Target::plain("example.com", 8080), "/q");
        req.add_header("Accept", "text/plain");
        req.add_header("Connection", "keep-alive");
        req.add_header("Host", "other");

        let fields = request_fields(&req, "ua/1");
        let pairs: Vec<(String, String)> = fields
            .iter()
            .map(|f| {
                (
                    String::from_utf8_lossy(&f.name).into_owned(),
                    String::from_utf8_lossy(&f.value).into_owned(),
                )
            })
            .collect();
        let expected: Vec<(String, String)> = [
            (":method", "GET"),
            (":path", "/q"),
            (":scheme", "http"),
            (":authority", "example.com:8080"),
            ("user-agent", "ua/1"),
            ("accept", "text/plain"),
        ]
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();
        assert_eq!(pairs, expected);
    }

    #[test]
    fn response_head_strips_pseudo_headers() {
        let head = response_head(
            200,
            vec![
                HeaderField::new(":status", "200"),
                HeaderField::new("content-type", "text/plain"),
            ],
        );
        assert_eq!(head.status(), 200);
        assert_eq!(head.version(), Version::H2);
        assert_eq!(
            head.headers(),
            &[("content-type".to_string(), "text/plain".to_string())]
        );
    }
}
