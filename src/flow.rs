//! Credit-based body flow control.
//!
//! Inbound bodies are announced, not streamed blindly: a DATA opcode's
//! length is a byte *credit* the reader may consume before it must go back
//! to the wire for the next control opcode. The control vocabulary at a
//! zero-credit point:
//!
//! - `DATA`: credit replenished, keep reading
//! - `QUIT`: end of body, connection may be kept alive
//! - `EXIT`: end of body, connection must close
//! - `YIELD`: the peer's own downstream is full; answer with exactly one
//!   ACK and keep waiting. This is the deadlock-avoidance handshake.
//! - `CHANNEL`: 2-byte channel id, read and ignored
//! - anything else: the generic skip rule
//!
//! Outbound bodies need no handshake; backpressure there is plain socket
//! blocking, bounded by the 32 KiB chunk limit.

use tracing::trace;

use crate::error::{HmuxError, Result};
use crate::protocol::{opcode, Connection};

/// Default ceiling when draining unread body bytes.
pub const DRAIN_LIMIT: usize = 256 * 1024;

/// Per-body flow-control state: remaining credit and whether the peer has
/// terminated the stream.
#[derive(Debug)]
pub struct BodyFlow {
    credit: usize,
    ended: bool,
}

impl BodyFlow {
    /// A body that starts with announced credit (first DATA already seen).
    pub fn with_credit(credit: usize) -> Self {
        Self {
            credit,
            ended: false,
        }
    }

    /// A body whose end was already observed (bodyless request).
    pub fn ended() -> Self {
        Self {
            credit: 0,
            ended: true,
        }
    }

    #[inline]
    pub fn credit(&self) -> usize {
        self.credit
    }

    #[inline]
    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

impl Connection {
    /// Read body bytes under flow control.
    ///
    /// Delivers up to `buf.len()` bytes and returns the count; `Ok(0)`
    /// means end of stream, reported only after QUIT or EXIT. Pending
    /// output is flushed before any wire read so the peer is never left
    /// waiting on bytes sitting in our buffer.
    pub async fn read_body(&mut self, flow: &mut BodyFlow, buf: &mut [u8]) -> Result<usize> {
        if flow.ended || buf.is_empty() {
            return Ok(0);
        }

        while flow.credit == 0 {
            self.writer.flush_sealed().await?;

            let code = match self.reader.read_opcode().await? {
                Some(code) => code,
                None => {
                    self.keepalive.kill();
                    return Err(HmuxError::Disconnect);
                }
            };

            match code {
                opcode::DATA => {
                    let len = self.reader.read_len().await?;
                    trace!(len, "body credit");
                    flow.credit = len;
                }
                opcode::QUIT => {
                    trace!("body end, quit");
                    flow.ended = true;
                    return Ok(0);
                }
                opcode::EXIT => {
                    trace!("body end, exit");
                    flow.ended = true;
                    self.keepalive.kill();
                    return Ok(0);
                }
                opcode::YIELD => {
                    // Peer is alive but blocked; one ACK lets it catch up.
                    self.writer.write_ack();
                    self.writer.flush_sealed().await?;
                }
                opcode::CHANNEL => {
                    self.reader.read_channel().await?;
                }
                other => {
                    let skipped = self.reader.skip_field().await?;
                    trace!(code = %(other as char), skipped, "unknown opcode in body");
                }
            }
        }

        let want = flow.credit.min(buf.len());
        let got = self.reader.read_some(&mut buf[..want]).await.map_err(|e| {
            self.keepalive.kill();
            e
        })?;
        flow.credit -= got;
        Ok(got)
    }

    /// Discard any unread body bytes, bounded by `limit`.
    ///
    /// Returns `true` if the stream end was reached within the bound.
    /// Runs before a kept-alive connection scans its next request and
    /// before a client connection is cached.
    pub async fn drain_body(&mut self, flow: &mut BodyFlow, limit: usize) -> Result<bool> {
        let mut scratch = [0u8; 512];
        let mut total = 0usize;

        while !flow.ended {
            if total >= limit {
                return Ok(false);
            }
            let n = self.read_body(flow, &mut scratch).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn data_frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![
            opcode::DATA,
            (payload.len() >> 8) as u8,
            payload.len() as u8,
        ];
        out.extend_from_slice(payload);
        out
    }

    async fn read_all(conn: &mut Connection, flow: &mut BodyFlow) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 7]; // odd size to exercise partial credit reads
        loop {
            let n = conn.read_body(flow, &mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_delivers_announced_bytes_in_order() {
        let (local, mut peer) = tokio::io::duplex(4 * 1024);
        let mut conn = Connection::new(local);

        let mut script = data_frame(b"hello ");
        script.extend_from_slice(&data_frame(b"world"));
        script.push(opcode::QUIT);
        peer.write_all(&script).await.unwrap();

        let mut flow = BodyFlow::with_credit(0);
        let got = read_all(&mut conn, &mut flow).await;
        assert_eq!(got, b"hello world");
        assert!(flow.is_ended());
        assert!(conn.keepalive());
    }

    #[tokio::test]
    async fn test_initial_credit_then_quit() {
        // The header scan already consumed the first DATA announcement;
        // the flow starts with that credit and only the payload follows.
        let (local, mut peer) = tokio::io::duplex(4 * 1024);
        let mut conn = Connection::new(local);

        let mut script = b"abc".to_vec();
        script.push(opcode::QUIT);
        peer.write_all(&script).await.unwrap();

        let mut flow = BodyFlow::with_credit(3);
        let mut buf = [0u8; 8];
        assert_eq!(conn.read_body(&mut flow, &mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(conn.read_body(&mut flow, &mut buf).await.unwrap(), 0);
        assert!(flow.is_ended());
    }

    #[tokio::test]
    async fn test_exit_kills_keepalive() {
        let (local, mut peer) = tokio::io::duplex(4 * 1024);
        let mut conn = Connection::new(local);

        let mut script = data_frame(b"xy");
        script.push(opcode::EXIT);
        peer.write_all(&script).await.unwrap();

        let mut flow = BodyFlow::with_credit(0);
        let got = read_all(&mut conn, &mut flow).await;
        assert_eq!(got, b"xy");
        assert!(!conn.keepalive());
    }

    #[tokio::test]
    async fn test_yield_produces_exactly_one_ack() {
        let (local, mut peer) = tokio::io::duplex(4 * 1024);
        let mut conn = Connection::new(local);

        let mut script = vec![opcode::YIELD];
        script.extend_from_slice(&data_frame(b"late"));
        script.push(opcode::QUIT);
        peer.write_all(&script).await.unwrap();

        let mut flow = BodyFlow::with_credit(0);
        let got = read_all(&mut conn, &mut flow).await;
        assert_eq!(got, b"late");

        // The ACK must be on the wire before the payload was consumed.
        let mut ack = [0u8; 3];
        peer.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [opcode::ACK, 0, 0]);
    }

    #[tokio::test]
    async fn test_channel_and_unknown_opcodes_skipped() {
        let (local, mut peer) = tokio::io::duplex(4 * 1024);
        let mut conn = Connection::new(local);

        let mut script = vec![opcode::CHANNEL, 0x00, 0x07];
        script.extend_from_slice(&[b'z', 0x00, 0x02, 0xFF, 0xFE]); // unknown, skipped
        script.extend_from_slice(&data_frame(b"ok"));
        script.push(opcode::QUIT);
        peer.write_all(&script).await.unwrap();

        let mut flow = BodyFlow::with_credit(0);
        let got = read_all(&mut conn, &mut flow).await;
        assert_eq!(got, b"ok");
    }

    #[tokio::test]
    async fn test_eof_before_quit_is_disconnect() {
        let (local, mut peer) = tokio::io::duplex(4 * 1024);
        let mut conn = Connection::new(local);

        peer.write_all(&data_frame(b"abc")).await.unwrap();
        drop(peer); // no QUIT ever arrives

        let mut flow = BodyFlow::with_credit(0);
        let mut buf = [0u8; 16];
        assert_eq!(conn.read_body(&mut flow, &mut buf).await.unwrap(), 3);
        assert!(matches!(
            conn.read_body(&mut flow, &mut buf).await,
            Err(HmuxError::Disconnect)
        ));
        assert!(!conn.keepalive());
    }

    #[tokio::test]
    async fn test_zero_length_data_does_not_end_stream() {
        let (local, mut peer) = tokio::io::duplex(4 * 1024);
        let mut conn = Connection::new(local);

        let mut script = data_frame(b""); // zero credit, stream continues
        script.extend_from_slice(&data_frame(b"tail"));
        script.push(opcode::QUIT);
        peer.write_all(&script).await.unwrap();

        let mut flow = BodyFlow::with_credit(0);
        let got = read_all(&mut conn, &mut flow).await;
        assert_eq!(got, b"tail");
    }

    #[tokio::test]
    async fn test_drain_bounded() {
        let (local, mut peer) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(local);

        let chunk = vec![0u8; 1024];
        let mut script = Vec::new();
        for _ in 0..8 {
            script.extend_from_slice(&data_frame(&chunk));
        }
        script.push(opcode::QUIT);
        peer.write_all(&script).await.unwrap();

        // Bound below the body size: drain reports failure.
        let mut flow = BodyFlow::with_credit(0);
        assert!(!conn.drain_body(&mut flow, 4 * 1024).await.unwrap());

        // Unbounded enough: drains to the end.
        assert!(conn.drain_body(&mut flow, DRAIN_LIMIT).await.unwrap());
        assert!(flow.is_ended());
    }

    #[tokio::test]
    async fn test_drain_on_ended_body_is_noop() {
        let (local, _peer) = tokio::io::duplex(1024);
        let mut conn = Connection::new(local);

        let mut flow = BodyFlow::ended();
        assert!(conn.drain_body(&mut flow, DRAIN_LIMIT).await.unwrap());
    }
}
