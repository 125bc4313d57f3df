use crate::error::ProtocolError;
use bytes::{Buf, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest line accepted without a CRLF before the link is declared broken.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Per-connection receive buffer that splits the byte stream into lines.
///
/// The framer is owned by the transport of a single connection and is only
/// reachable through `&mut`, so at most one reader consumes lines at a time.
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Append bytes that arrived outside of `fill`.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Read whatever the socket has into the buffer. Returns 0 on EOF.
    pub async fn fill<R>(&mut self, reader: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        reader.read_buf(&mut self.buf).await
    }

    /// A cursor over the complete lines currently buffered. Nothing is
    /// consumed until `consume` is called with the cursor position.
    pub fn cursor(&self) -> LineCursor<'_> {
        LineCursor::new(&self.buf)
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks CRLF-terminated lines of a byte slice.
#[derive(Debug, Clone)]
pub struct LineCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    needed: usize,
}

impl<'a> LineCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        LineCursor {
            buf,
            pos: 0,
            needed: 0,
        }
    }

    /// Next line without its terminator, `Ok(None)` if no full line is
    /// buffered yet.
    pub fn next_line(&mut self) -> Result<Option<&'a [u8]>, ProtocolError> {
        let rest = &self.buf[self.pos..];
        match find_crlf(rest) {
            Some(end) => {
                self.pos += end + 2;
                Ok(Some(&rest[..end]))
            }
            None if rest.len() > MAX_LINE_LENGTH => {
                Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH))
            }
            None => Ok(None),
        }
    }

    /// Bytes consumed so far, including terminators.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Bytes after the current position.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Record that decoding cannot finish before `end` bytes are buffered.
    ///
    /// The hint never asks for more than one line cap past what is already
    /// buffered, so an overlong line is still caught before the buffer grows
    /// without bound.
    pub fn require(&mut self, end: usize) {
        let end = end.min(self.buf.len() + MAX_LINE_LENGTH + 1);
        self.needed = self.needed.max(end);
    }

    /// Smallest buffer length worth decoding again after an incomplete
    /// result. Always past the current buffer.
    pub fn needed(&self) -> usize {
        self.needed.max(self.buf.len() + 1)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    (0..buf.len() - 1).find(|&i| buf[i] == b'\r' && buf[i + 1] == b'\n')
}
