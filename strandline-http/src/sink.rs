//! Streaming response delivery.

use bytes::BytesMut;

use crate::error::HttpError;
use crate::framing::ResponseHead;
use crate::response::Response;

/// Receives a response as it arrives.
///
/// `on_headers` is called once, before any body call. `on_body` is then
/// called for each decoded piece, and exactly once with `is_final` set,
/// possibly with an empty slice. Returning `false` from either method
/// aborts the transfer with [`HttpError::SinkAborted`].
pub trait StreamSink {
    fn on_headers(&mut self, head: &ResponseHead) -> bool;

    fn on_body(&mut self, chunk: &[u8], is_final: bool) -> bool;
}

impl<S: StreamSink + ?Sized> StreamSink for &mut S {
    fn on_headers(&mut self, head: &ResponseHead) -> bool {
        (**self).on_headers(head)
    }

    fn on_body(&mut self, chunk: &[u8], is_final: bool) -> bool {
        (**self).on_body(chunk, is_final)
    }
}

impl<S: StreamSink + ?Sized> StreamSink for Box<S> {
    fn on_headers(&mut self, head: &ResponseHead) -> bool {
        (**self).on_headers(head)
    }

    fn on_body(&mut self, chunk: &[u8], is_final: bool) -> bool {
        (**self).on_body(chunk, is_final)
    }
}

/// Enforces the sink contract for one call, across attempts.
///
/// The sink is released on the final body call; nothing reaches it
/// afterwards.
pub(crate) struct Delivery<'a> {
    sink: Option<&'a mut dyn StreamSink>,
    headers_delivered: bool,
}

impl<'a> Delivery<'a> {
    pub(crate) fn new(sink: &'a mut dyn StreamSink) -> Self {
        Self {
            sink: Some(sink),
            headers_delivered: false,
        }
    }

    /// Whether the sink has seen a response head. Once it has, the call
    /// can no longer be retried.
    pub(crate) fn headers_delivered(&self) -> bool {
        self.headers_delivered
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.sink.is_none()
    }

    pub(crate) fn headers(&mut self, head: &ResponseHead) -> Result<(), HttpError> {
        if self.headers_delivered {
            return Err(HttpError::Framing("second response head".into()));
        }
        let sink = self.sink.as_mut().ok_or(HttpError::SinkAborted)?;
        self.headers_delivered = true;
        if sink.on_headers(head) {
            Ok(())
        } else {
            self.sink = None;
            Err(HttpError::SinkAborted)
        }
    }

    /// Deliver a non-final piece. Empty pieces are skipped.
    pub(crate) fn body(&mut self, chunk: &[u8]) -> Result<(), HttpError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let sink = self.active_sink()?;
        if sink.on_body(chunk, false) {
            Ok(())
        } else {
            self.sink = None;
            Err(HttpError::SinkAborted)
        }
    }

    /// Deliver the final piece and release the sink.
    pub(crate) fn finish(&mut self, chunk: &[u8]) -> Result<(), HttpError> {
        self.active_sink()?;
        let sink = self.sink.take().ok_or(HttpError::SinkAborted)?;
        if sink.on_body(chunk, true) {
            Ok(())
        } else {
            Err(HttpError::SinkAborted)
        }
    }

    fn active_sink(&mut self) -> Result<&mut &'a mut dyn StreamSink, HttpError> {
        if !self.headers_delivered {
            return Err(HttpError::Framing("body before response head".into()));
        }
        self.sink.as_mut().ok_or(HttpError::SinkAborted)
    }
}

/// Buffers a whole response. Backs the non-streaming entry points.
#[derive(Debug, Default)]
pub(crate) struct CollectSink {
    head: Option<ResponseHead>,
    body: BytesMut,
    complete: bool,
}

impl CollectSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Clear a partial response left by a failed attempt.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn into_response(self) -> Result<Response, HttpError> {
        match self.head {
            Some(head) if self.complete => {
                let (status, version, headers) = head.into_parts();
                Ok(Response::new(status, version, headers, self.body.freeze()))
            }
            _ => Err(HttpError::ConnectionClosed),
        }
    }

    #[cfg(test)]
    pub(crate) fn body(&self) -> &[u8] {
        &self.body
    }
}

impl StreamSink for CollectSink {
    fn on_headers(&mut self, head: &ResponseHead) -> bool {
        self.head = Some(head.clone());
        true
    }

    fn on_body(&mut self, chunk: &[u8], is_final: bool) -> bool {
        self.body.extend_from_slice(chunk);
        self.complete = is_final;
        true
    }
}
