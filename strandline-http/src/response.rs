use std::fmt;

use bytes::Bytes;

use crate::error::HttpError;

/// Protocol version a response arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
    H2,
}

impl Version {
    pub fn is_h2(self) -> bool {
        self == Version::H2
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::H2 => "HTTP/2",
        })
    }
}

/// A fully buffered HTTP response.
#[derive(Debug)]
pub struct Response {
    status: u16,
    version: Version,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Response {
    pub(crate) fn new(
        status: u16,
        version: Version,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Self {
        Self {
            status,
            version,
            headers,
            body,
        }
    }

    /// HTTP status code (e.g. 200, 404).
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Response headers as (name, value) pairs.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Get the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Reference to the body bytes without consuming.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body bytes.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Consume the response and return the body as UTF-8 text.
    pub fn text(self) -> Result<String, HttpError> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| HttpError::InvalidArgument(format!("body is not UTF-8: {e}")))
    }

    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}
