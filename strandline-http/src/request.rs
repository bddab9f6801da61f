//! Requests and the builder used to send them.

use std::time::Duration;

use crate::body::Payload;
use crate::client::HttpClient;
use crate::config::RetryPolicy;
use crate::error::HttpError;
use crate::response::{Response, Version};
use crate::sink::StreamSink;
use crate::target::Target;

/// An owned request. Cheap enough to clone for async dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    target: Target,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    payload: Payload,
    policy: Option<RetryPolicy>,
    /// Overrides the client's connect and I/O deadlines.
    timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: impl Into<String>, target: Target, path: impl Into<String>) -> Self {
        Self {
            target,
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            payload: Payload::Empty,
            policy: None,
            timeout: None,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn policy(&self) -> Option<&RetryPolicy> {
        self.policy.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn set_payload(&mut self, payload: impl Into<Payload>) {
        self.payload = payload.into();
    }

    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = Some(policy);
    }

    /// Deadline for connecting and for each read or write of this call.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub(crate) fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    pub(crate) fn validate(&self) -> Result<(), HttpError> {
        self.target.validate()?;
        if self.method.is_empty() || !self.method.bytes().all(is_token_byte) {
            return Err(HttpError::InvalidArgument(format!(
                "invalid method {:?}",
                self.method
            )));
        }
        let path_ok = (self.path.starts_with('/') || self.path == "*")
            && !self
                .path
                .bytes()
                .any(|b| b.is_ascii_whitespace() || b.is_ascii_control());
        if !path_ok {
            return Err(HttpError::InvalidArgument(format!(
                "invalid path {:?}",
                self.path
            )));
        }
        for (name, value) in &self.headers {
            validate_header(name, value)?;
        }
        if let Some(policy) = &self.policy {
            policy.validate()?;
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(HttpError::InvalidArgument("zero request timeout".into()));
        }
        Ok(())
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn validate_header(name: &str, value: &str) -> Result<(), HttpError> {
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(HttpError::InvalidArgument(format!(
            "invalid header name {name:?}"
        )));
    }
    if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(HttpError::InvalidArgument(format!(
            "invalid value for header {name}"
        )));
    }
    Ok(())
}

/// Parse a raw header block of `Name: value` lines separated by CRLF or
/// LF. Blank lines are skipped.
pub fn parse_header_block(raw: &str) -> Result<Vec<(String, String)>, HttpError> {
    let mut headers = Vec::new();
    for line in raw.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            HttpError::InvalidArgument(format!("header line without colon: {line:?}"))
        })?;
        let name = name.trim();
        let value = value.trim();
        validate_header(name, value)?;
        headers.push((name.to_string(), value.to_string()));
    }
    Ok(headers)
}

/// Builder for an HTTP request.
///
/// ```rust,ignore
/// let resp = client
///     .post(&target, "/v1/items")
///     .header("authorization", "Bearer tok")
///     .json(&item)
///     .send()?;
/// ```
pub struct RequestBuilder<'a> {
    client: &'a HttpClient,
    request: Request,
    error: Option<HttpError>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a HttpClient, method: &str, target: &Target, path: &str) -> Self {
        Self {
            client,
            request: Request::new(method, target.clone(), path),
            error: None,
        }
    }

    /// Add a header to the request.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.request.add_header(name, value);
        self
    }

    /// Add every header of a raw `Name: value` block.
    pub fn headers_raw(mut self, raw: &str) -> Self {
        match parse_header_block(raw) {
            Ok(headers) => self.request.headers.extend(headers),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Set the request payload.
    pub fn body(mut self, payload: impl Into<Payload>) -> Self {
        self.request.set_payload(payload);
        self
    }

    /// Serialize `value` as the JSON payload.
    pub fn json<T: serde::Serialize + ?Sized>(mut self, value: &T) -> Self {
        match Payload::json(value) {
            Ok(payload) => self.request.payload = payload,
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Retry and circuit breaker policy for this request.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.request.set_policy(policy);
        self
    }

    /// Connect and I/O deadline for this call only. The client's
    /// configured timeouts apply otherwise.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.set_timeout(timeout);
        self
    }

    /// Finish building without sending.
    pub fn build(self) -> Result<Request, HttpError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.request),
        }
    }

    /// Send over HTTP/1.1 and buffer the response.
    pub fn send(self) -> Result<Response, HttpError> {
        let client = self.client;
        client.execute(&self.build()?)
    }

    /// Send over HTTP/1.1, streaming the response into `sink`.
    pub fn send_streaming(self, sink: &mut dyn StreamSink) -> Result<Version, HttpError> {
        let client = self.client;
        client.execute_streaming(&self.build()?, sink)
    }

    /// Try HTTP/2 first, falling back to HTTP/1.1.
    pub fn send_prefer_h2(self) -> Result<Response, HttpError> {
        let client = self.client;
        client.execute_prefer_h2(&self.build()?)
    }

    pub fn send_streaming_prefer_h2(self, sink: &mut dyn StreamSink) -> Result<Version, HttpError> {
        let client = self.client;
        client.execute_streaming_prefer_h2(&self.build()?, sink)
    }
}
