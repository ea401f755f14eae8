//! Logged response writer
//!
//! Decorates an outbound response writer so the status code and the exact
//! byte chunks sent to the client are also captured for cache storage and
//! access logging, without changing what the client receives.

use bytes::Bytes;

/// Outbound response writer as seen by connection handlers.
pub trait ResponseWriter {
    /// Send the response status code.
    fn write_header(&mut self, status: u16);

    /// Send one chunk of body bytes, returning how many were written.
    fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<usize>;
}

/// Decorator that records everything written through it.
///
/// The recorded status starts at `0` (nothing sent yet) and the chunk
/// sequence preserves write order, one entry per `write_chunk` call.
pub struct LoggedResponseWriter<W: ResponseWriter> {
    inner: W,
    status: u16,
    chunks: Vec<Bytes>,
}

impl<W: ResponseWriter> LoggedResponseWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            status: 0,
            chunks: Vec::new(),
        }
    }

    /// Recorded status code (`0` until a header has been written).
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Recorded body chunks, in write order.
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Total number of recorded body bytes.
    pub fn body_len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    /// Unwrap the decorator, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: ResponseWriter> ResponseWriter for LoggedResponseWriter<W> {
    fn write_header(&mut self, status: u16) {
        self.status = status;
        self.inner.write_header(status);
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        self.chunks.push(Bytes::copy_from_slice(chunk));
        self.inner.write_chunk(chunk)
    }
}
