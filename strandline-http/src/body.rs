use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::error::HttpError;

type ChunkSource = Arc<dyn Fn() -> Box<dyn Iterator<Item = Bytes> + Send> + Send + Sync>;

/// Request payload. Sent with `Content-Type: application/json` and a
/// `Content-Length` header.
#[derive(Clone, Default)]
pub enum Payload {
    /// No payload.
    #[default]
    Empty,
    /// In-memory bytes.
    Bytes(Bytes),
    /// Chunks produced on demand and written one at a time. The source is
    /// invoked again for every attempt, so it must yield the same bytes.
    Stream { length: u64, source: ChunkSource },
}

impl Payload {
    /// Serialize `value` as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, HttpError> {
        Ok(Payload::from(serde_json::to_vec(value)?))
    }

    /// Payload of exactly `length` bytes produced by `source`. A source
    /// yielding a different total fails the request with an
    /// invalid-argument error.
    pub fn stream<F, I>(length: u64, source: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Payload::Stream {
            length,
            source: Arc::new(move || -> Box<dyn Iterator<Item = Bytes> + Send> {
                Box::new(source().into_iter())
            }),
        }
    }

    /// Returns true if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Payload::Empty => 0,
            Payload::Bytes(b) => b.len() as u64,
            Payload::Stream { length, .. } => *length,
        }
    }

    /// Hand each piece to `write`, checking the total against the declared
    /// length.
    pub(crate) fn write_chunks(
        &self,
        mut write: impl FnMut(&[u8]) -> Result<(), HttpError>,
    ) -> Result<(), HttpError> {
        match self {
            Payload::Empty => Ok(()),
            Payload::Bytes(b) => write(b),
            Payload::Stream { length, source } => {
                let mut written = 0u64;
                for chunk in source() {
                    if chunk.is_empty() {
                        continue;
                    }
                    written += chunk.len() as u64;
                    if written > *length {
                        return Err(length_mismatch(*length, written));
                    }
                    write(&chunk)?;
                }
                if written != *length {
                    return Err(length_mismatch(*length, written));
                }
                Ok(())
            }
        }
    }
}

fn length_mismatch(declared: u64, actual: u64) -> HttpError {
    HttpError::InvalidArgument(format!(
        "payload declared {declared} bytes but produced at least {actual}"
    ))
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => f.write_str("Empty"),
            Payload::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Payload::Stream { length, .. } => {
                f.debug_struct("Stream").field("length", length).finish()
            }
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::from(Bytes::from(v))
    }
}

impl From<&[u8]> for Payload {
    fn from(s: &[u8]) -> Self {
        Payload::from(Bytes::copy_from_slice(s))
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            Payload::Empty
        } else {
            Payload::Bytes(b)
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::from(s.as_bytes())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::from(s.into_bytes())
    }
}
