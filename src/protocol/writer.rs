//! Frame writing: buffered field encoding and the DATA reservation.
//!
//! All output accumulates in a single `BytesMut` and reaches the socket
//! only on [`FrameWriter::flush`]. Body bytes use a reservation scheme to
//! avoid a copy: a DATA frame needs a 3-byte prefix (opcode + length) whose
//! length is unknown until the chunk is complete, so [`FrameWriter::begin_data`]
//! reserves 3 placeholder bytes, payload accumulates directly behind them,
//! and [`FrameWriter::seal_data`] backfills the prefix at the chunk
//! boundary.
//!
//! The reservation must be sealed before the buffer reaches the socket.
//! Every non-body write seals an open chunk itself; calling `flush` with
//! payload behind an unsealed reservation is an internal-consistency error.

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{HmuxError, Result};

use super::opcode::{self, DATA_CHUNK_MAX, MAX_FIELD_LEN};

/// Buffered output past this size is pushed to the socket on the next
/// body write.
const FLUSH_THRESHOLD: usize = 48 * 1024;

/// Buffered frame writer over an async byte stream.
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
    /// Offset of the first payload byte of an open DATA chunk; the 3-byte
    /// prefix sits directly before it.
    data_start: Option<usize>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(FLUSH_THRESHOLD),
            data_start: None,
        }
    }

    /// Write a bare control code (QUIT, EXIT, YIELD).
    pub fn write_code(&mut self, code: u8) {
        self.seal_data();
        self.buf.extend_from_slice(&[code]);
        trace!(code = %(code as char), "frame code");
    }

    /// Write a CHANNEL frame with its literal 2-byte channel id.
    pub fn write_channel(&mut self, channel: u16) {
        self.seal_data();
        self.buf
            .extend_from_slice(&[opcode::CHANNEL, (channel >> 8) as u8, channel as u8]);
    }

    /// Write an ACK frame (opcode plus two zero bytes).
    pub fn write_ack(&mut self) {
        self.seal_data();
        self.buf.extend_from_slice(&[opcode::ACK, 0, 0]);
    }

    /// Write a length-prefixed field.
    pub fn write_field(&mut self, code: u8, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FIELD_LEN {
            return Err(HmuxError::Protocol(format!(
                "field {} exceeds 16-bit length: {} bytes",
                code as char,
                payload.len()
            )));
        }
        self.seal_data();
        self.buf
            .extend_from_slice(&[code, (payload.len() >> 8) as u8, payload.len() as u8]);
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    /// Write a length-prefixed text field.
    pub fn write_text(&mut self, code: u8, value: &str) -> Result<()> {
        self.write_field(code, value.as_bytes())
    }

    /// Open a DATA chunk: reserve the 3-byte prefix and remember where the
    /// payload begins. No-op if a chunk is already open.
    pub fn begin_data(&mut self) {
        if self.data_start.is_none() {
            self.buf.extend_from_slice(&[0, 0, 0]);
            self.data_start = Some(self.buf.len());
        }
    }

    /// Close the open DATA chunk by backfilling its prefix. An empty chunk
    /// is retracted entirely so no zero-length DATA frame is emitted.
    pub fn seal_data(&mut self) {
        let Some(start) = self.data_start.take() else {
            return;
        };
        let len = self.buf.len() - start;
        if len == 0 {
            self.buf.truncate(start - 3);
            return;
        }
        self.buf[start - 3] = opcode::DATA;
        self.buf[start - 2] = (len >> 8) as u8;
        self.buf[start - 1] = len as u8;
        trace!(len, "frame data sealed");
    }

    /// Stream body bytes as DATA chunks of at most [`DATA_CHUNK_MAX`],
    /// sealing on every chunk boundary and flushing on buffer rollover.
    pub async fn write_body(&mut self, mut body: &[u8]) -> Result<()> {
        while !body.is_empty() {
            self.begin_data();
            let start = self.data_start.expect("data chunk open");
            let room = DATA_CHUNK_MAX - (self.buf.len() - start);
            let take = room.min(body.len());
            self.buf.extend_from_slice(&body[..take]);
            body = &body[take..];

            if self.buf.len() - start == DATA_CHUNK_MAX {
                self.seal_data();
            }
            if self.buf.len() >= FLUSH_THRESHOLD {
                self.seal_data();
                self.flush().await?;
            }
        }
        Ok(())
    }

    /// Number of bytes buffered and not yet flushed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Push all buffered frames to the socket and flush it.
    ///
    /// An open reservation with payload behind it means a seal was missed;
    /// that is a bug in the caller, not a peer-visible condition.
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(start) = self.data_start {
            if self.buf.len() == start {
                // Empty reservation: retract silently.
                self.buf.truncate(start - 3);
                self.data_start = None;
            } else {
                return Err(HmuxError::Internal("unsealed data reservation at flush"));
            }
        }
        if !self.buf.is_empty() {
            self.inner
                .write_all(&self.buf)
                .await
                .map_err(HmuxError::from_io)?;
            self.buf.clear();
        }
        self.inner.flush().await.map_err(HmuxError::from_io)?;
        Ok(())
    }

    /// Seal any open chunk, then flush. The safe variant used before the
    /// connection blocks on a read.
    pub async fn flush_sealed(&mut self) -> Result<()> {
        self.seal_data();
        self.flush().await
    }

    /// Shut down the write side after a final flush.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush_sealed().await?;
        self.inner.shutdown().await.map_err(HmuxError::from_io)?;
        Ok(())
    }

    /// Surrender the transport. Any unflushed output is dropped.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Append pre-encoded bytes for test scripts.
    #[cfg(test)]
    pub(crate) fn write_raw(&mut self, bytes: &[u8]) {
        self.seal_data();
        self.buf.extend_from_slice(bytes);
    }
}
