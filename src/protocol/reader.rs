//! Frame reading: pull-style opcode and field decoding.
//!
//! Uses `bytes::BytesMut` for buffer management. Unlike a push parser the
//! protocol is strictly sequential, so the reader exposes blocking-style
//! `async` primitives the session state machines drive directly:
//!
//! - [`FrameReader::read_opcode`]: next opcode, `None` on clean EOF
//! - [`FrameReader::read_field`]: 16-bit length + payload
//! - [`FrameReader::skip_field`]: the forward-compatibility rule for
//!   unknown opcodes (read the length, discard the payload)
//!
//! EOF in the middle of a packet is never clean: it surfaces as
//! [`HmuxError::Disconnect`].

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{HmuxError, Result};

use super::opcode;

/// Read buffer capacity. One full DATA chunk plus framing slack.
const READ_BUF_CAPACITY: usize = 48 * 1024;

/// Buffered frame reader over an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default buffer capacity.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
        }
    }

    /// Ensure at least `need` bytes are buffered.
    ///
    /// Returns `false` on EOF before the first byte; EOF after a partial
    /// fill is a [`HmuxError::Disconnect`] because it can only happen in
    /// the middle of a packet.
    async fn fill(&mut self, need: usize) -> Result<bool> {
        while self.buf.len() < need {
            let n = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .map_err(HmuxError::from_io)?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                return Err(HmuxError::Disconnect);
            }
        }
        Ok(true)
    }

    /// Read the next opcode, skipping inter-packet filler bytes.
    ///
    /// Returns `Ok(None)` on a clean end of stream (EOF at a packet
    /// boundary with nothing buffered).
    pub async fn read_opcode(&mut self) -> Result<Option<u8>> {
        loop {
            if !self.fill(1).await? {
                return Ok(None);
            }
            let code = self.buf.get_u8();
            if !opcode::is_filler(code) {
                return Ok(Some(code));
            }
        }
    }

    /// Read a 16-bit big-endian length.
    pub async fn read_len(&mut self) -> Result<usize> {
        if !self.fill(2).await? {
            return Err(HmuxError::Disconnect);
        }
        Ok(self.buf.get_u16() as usize)
    }

    /// Read the 2-byte channel id that follows a CHANNEL opcode.
    pub async fn read_channel(&mut self) -> Result<u16> {
        if !self.fill(2).await? {
            return Err(HmuxError::Disconnect);
        }
        Ok(self.buf.get_u16())
    }

    /// Read a length-prefixed field as owned bytes.
    pub async fn read_field(&mut self) -> Result<Bytes> {
        let len = self.read_len().await?;
        if !self.fill(len).await? {
            return Err(HmuxError::Disconnect);
        }
        Ok(self.buf.split_to(len).freeze())
    }

    /// Read a length-prefixed field, appending into a caller-owned scratch
    /// buffer. Returns the field length.
    pub async fn read_field_into(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let len = self.read_len().await?;
        if !self.fill(len).await? {
            return Err(HmuxError::Disconnect);
        }
        out.extend_from_slice(&self.buf[..len]);
        self.buf.advance(len);
        Ok(len)
    }

    /// Read a length-prefixed field as a string (lossy UTF-8).
    pub async fn read_text(&mut self) -> Result<String> {
        let field = self.read_field().await?;
        Ok(String::from_utf8_lossy(&field).into_owned())
    }

    /// Read the fixed PROTOCOL payload: length must be exactly 4, followed
    /// by a big-endian sub-protocol id.
    pub async fn read_protocol_id(&mut self) -> Result<u32> {
        let len = self.read_len().await?;
        if len != 4 {
            return Err(HmuxError::Framing("sub-protocol id length must be 4"));
        }
        if !self.fill(4).await? {
            return Err(HmuxError::Disconnect);
        }
        Ok(self.buf.get_u32())
    }

    /// The generic skip rule for unrecognized opcodes: read the 16-bit
    /// length and discard that many bytes. Returns the skipped length.
    pub async fn skip_field(&mut self) -> Result<usize> {
        let len = self.read_len().await?;
        self.skip(len).await?;
        Ok(len)
    }

    /// Discard exactly `n` bytes from the stream.
    pub async fn skip(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            if self.buf.is_empty() && !self.fill(1).await? {
                return Err(HmuxError::Disconnect);
            }
            let take = n.min(self.buf.len());
            self.buf.advance(take);
            n -= take;
        }
        Ok(())
    }

    /// Read up to `out.len()` payload bytes, at least one. Used by the body
    /// flow control once credit is known to be available.
    pub async fn read_some(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buf.is_empty() && !self.fill(1).await? {
            return Err(HmuxError::Disconnect);
        }
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(n)
    }

    /// Surrender the transport together with any read-ahead bytes.
    ///
    /// Used by the connection hand-off so no buffered data belonging to the
    /// next protocol is lost.
    pub fn into_parts(self) -> (R, Bytes) {
        (self.inner, self.buf.freeze())
    }
}
