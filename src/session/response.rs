//! Response serialization for one request.
//!
//! [`Exchange`] is the concrete [`RequestIo`] a handler receives: it pulls
//! the request body through the flow-control discipline and pushes the
//! response back out in wire order:
//!
//! ```text
//! STATUS "200 OK"
//! HEADER "cpu-load" / STRING <gauge>
//! HEADER k / STRING v ...        (content-length, cookies included)
//! SEND_HEADER ""                 (headers complete)
//! DATA ...                       (reservation-backfilled chunks)
//! ```
//!
//! The phase machine (status → headers → body) only moves forward; writing
//! a header after body bytes is a protocol error, not a panic.

use async_trait::async_trait;

use crate::error::{HmuxError, Result};
use crate::flow::BodyFlow;
use crate::protocol::{opcode, Connection};

use super::handler::RequestIo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Status,
    Headers,
    Body,
}

/// Body source plus response sink for one in-flight request.
pub struct Exchange<'c> {
    conn: &'c mut Connection,
    flow: BodyFlow,
    phase: Phase,
    cpu_load: String,
}

impl<'c> Exchange<'c> {
    pub(crate) fn new(conn: &'c mut Connection, flow: BodyFlow, cpu_load: String) -> Self {
        Self {
            conn,
            flow,
            phase: Phase::Status,
            cpu_load,
        }
    }

    fn write_status_line(&mut self, status: &str) -> Result<()> {
        self.conn.write_text(opcode::STATUS, status)?;
        self.conn.write_pair("cpu-load", &self.cpu_load)?;
        self.phase = Phase::Headers;
        Ok(())
    }

    /// Default the status if the handler never set one.
    fn ensure_status(&mut self) -> Result<()> {
        if self.phase == Phase::Status {
            self.write_status_line("200 OK")?;
        }
        Ok(())
    }

    /// Close the header section, emitting the headers-complete marker.
    fn ensure_body(&mut self) -> Result<()> {
        self.ensure_status()?;
        if self.phase == Phase::Headers {
            self.conn.write_text(opcode::SEND_HEADER, "")?;
            self.phase = Phase::Body;
        }
        Ok(())
    }

    /// Complete the response framing: emit any missing status/header
    /// section and seal the open body chunk. The terminal opcode is the
    /// session's job. Returns the body flow for the leftover drain.
    pub(crate) fn finish(mut self) -> Result<BodyFlow> {
        self.ensure_body()?;
        self.conn.writer.seal_data();
        Ok(self.flow)
    }
}

#[async_trait]
impl RequestIo for Exchange<'_> {
    async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.conn.read_body(&mut self.flow, buf).await
    }

    async fn write_status(&mut self, status: &str) -> Result<()> {
        if self.phase != Phase::Status {
            return Err(HmuxError::Protocol(
                "status line after headers were written".into(),
            ));
        }
        self.write_status_line(status)
    }

    async fn write_header(&mut self, key: &str, value: &str) -> Result<()> {
        self.ensure_status()?;
        if self.phase == Phase::Body {
            return Err(HmuxError::Protocol(format!(
                "header {key:?} after response body began"
            )));
        }
        self.conn.write_pair(key, value)
    }

    async fn write_body(&mut self, buf: &[u8]) -> Result<()> {
        self.ensure_body()?;
        self.conn.write_body(buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        if self.phase == Phase::Body {
            // Tell the front end to push what it has downstream.
            self.conn.write_field(opcode::FLUSH, b"")?;
        }
        self.conn.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::handler::RequestIo as _;

    async fn collect(peer: &mut Connection) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(code) = peer.read_opcode().await.unwrap() {
            let payload = peer.read_field().await.unwrap().to_vec();
            out.push((code, payload));
        }
        out
    }

    #[tokio::test]
    async fn test_full_response_ordering() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let mut conn = Connection::new(a);
        let mut peer = Connection::new(b);

        let mut ex = Exchange::new(&mut conn, BodyFlow::ended(), "0.50".into());
        ex.write_status("404 Not Found").await.unwrap();
        ex.write_header("Content-Length", "9").await.unwrap();
        ex.write_body(b"not found").await.unwrap();
        ex.finish().unwrap();
        conn.flush().await.unwrap();
        drop(conn);

        let frames = collect(&mut peer).await;
        let codes: Vec<u8> = frames.iter().map(|(c, _)| *c).collect();
        assert_eq!(
            codes,
            [
                opcode::STATUS,
                opcode::HEADER,
                opcode::STRING,
                opcode::HEADER,
                opcode::STRING,
                opcode::SEND_HEADER,
                opcode::DATA,
            ]
        );
        assert_eq!(frames[0].1, b"404 Not Found");
        assert_eq!(frames[1].1, b"cpu-load");
        assert_eq!(frames[2].1, b"0.50");
        assert_eq!(frames[3].1, b"Content-Length");
        assert_eq!(frames[6].1, b"not found");
    }

    #[tokio::test]
    async fn test_defaults_when_handler_writes_nothing() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let mut conn = Connection::new(a);
        let mut peer = Connection::new(b);

        let ex = Exchange::new(&mut conn, BodyFlow::ended(), "0.00".into());
        ex.finish().unwrap();
        conn.flush().await.unwrap();
        drop(conn);

        let frames = collect(&mut peer).await;
        assert_eq!(frames[0], (opcode::STATUS, b"200 OK".to_vec()));
        assert_eq!(frames.last().unwrap().0, opcode::SEND_HEADER);
        // No DATA frame for an empty body.
        assert!(frames.iter().all(|(c, _)| *c != opcode::DATA));
    }

    #[tokio::test]
    async fn test_status_after_headers_rejected() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut conn = Connection::new(a);

        let mut ex = Exchange::new(&mut conn, BodyFlow::ended(), "0.00".into());
        ex.write_header("A", "1").await.unwrap();
        assert!(matches!(
            ex.write_status("500 Oops").await,
            Err(HmuxError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_header_after_body_rejected() {
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(a);

        let mut ex = Exchange::new(&mut conn, BodyFlow::ended(), "0.00".into());
        ex.write_body(b"x").await.unwrap();
        assert!(matches!(
            ex.write_header("Late", "1").await,
            Err(HmuxError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_mid_body_emits_flush_frame() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(a);
        let mut peer = Connection::new(b);

        let mut ex = Exchange::new(&mut conn, BodyFlow::ended(), "0.00".into());
        ex.write_body(b"part").await.unwrap();
        ex.flush().await.unwrap();
        drop(conn);

        let frames = collect(&mut peer).await;
        let codes: Vec<u8> = frames.iter().map(|(c, _)| *c).collect();
        // ... SEND_HEADER, DATA "part", FLUSH
        assert_eq!(codes[codes.len() - 2], opcode::DATA);
        assert_eq!(frames[codes.len() - 2].1, b"part");
        assert_eq!(codes[codes.len() - 1], opcode::FLUSH);
        assert!(frames[codes.len() - 1].1.is_empty());
    }
}
