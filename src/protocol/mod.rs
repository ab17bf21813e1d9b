//! Wire protocol layer: opcodes, frame reader/writer, connection pairing.

pub mod opcode;
mod reader;
mod writer;

pub use reader::FrameReader;
pub use writer::FrameWriter;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Boxed read half of a connection transport.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a connection transport.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-connection keepalive state.
///
/// A monotonic one-way flag: any failure branch may kill it, nothing turns
/// it back on for the lifetime of the connection.
#[derive(Debug)]
pub struct Keepalive(bool);

impl Keepalive {
    fn new() -> Self {
        Keepalive(true)
    }

    /// Disable keepalive for this connection. Idempotent.
    #[inline]
    pub fn kill(&mut self) {
        self.0 = false;
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.0
    }
}

/// One HMUX connection: paired frame reader and writer plus the
/// connection-scoped keepalive flag.
///
/// The halves are boxed so sessions, sub-protocol handlers and extensions
/// all see one concrete connection type regardless of the underlying
/// transport.
pub struct Connection {
    pub(crate) reader: FrameReader<BoxedRead>,
    pub(crate) writer: FrameWriter<BoxedWrite>,
    pub(crate) keepalive: Keepalive,
}

/// A connection surrendered to another protocol: the transport halves plus
/// any bytes the frame reader had already pulled off the socket.
pub struct TakenStream {
    pub buffered: Bytes,
    pub read: BoxedRead,
    pub write: BoxedWrite,
}

impl Connection {
    /// Wrap a bidirectional transport.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(Box::new(read)),
            writer: FrameWriter::new(Box::new(write)),
            keepalive: Keepalive::new(),
        }
    }

    /// Whether keepalive is still permitted on this connection.
    #[inline]
    pub fn keepalive(&self) -> bool {
        self.keepalive.is_alive()
    }

    /// Disable keepalive. Idempotent, never reversed.
    #[inline]
    pub fn kill_keepalive(&mut self) {
        self.keepalive.kill();
    }

    // Read facade.

    pub async fn read_opcode(&mut self) -> Result<Option<u8>> {
        self.reader.read_opcode().await
    }

    pub async fn read_field(&mut self) -> Result<Bytes> {
        self.reader.read_field().await
    }

    pub async fn read_text(&mut self) -> Result<String> {
        self.reader.read_text().await
    }

    pub async fn read_channel(&mut self) -> Result<u16> {
        self.reader.read_channel().await
    }

    pub async fn read_protocol_id(&mut self) -> Result<u32> {
        self.reader.read_protocol_id().await
    }

    pub async fn skip_field(&mut self) -> Result<usize> {
        self.reader.skip_field().await
    }

    // Write facade.

    pub fn write_code(&mut self, code: u8) {
        self.writer.write_code(code);
    }

    pub fn write_channel(&mut self, channel: u16) {
        self.writer.write_channel(channel);
    }

    pub fn write_ack(&mut self) {
        self.writer.write_ack();
    }

    pub fn write_field(&mut self, code: u8, payload: &[u8]) -> Result<()> {
        self.writer.write_field(code, payload)
    }

    pub fn write_text(&mut self, code: u8, value: &str) -> Result<()> {
        self.writer.write_text(code, value)
    }

    /// Write a HEADER/STRING compound pair.
    pub fn write_pair(&mut self, key: &str, value: &str) -> Result<()> {
        self.writer.write_text(opcode::HEADER, key)?;
        self.writer.write_text(opcode::STRING, value)
    }

    pub async fn write_body(&mut self, body: &[u8]) -> Result<()> {
        self.writer.write_body(body).await
    }

    /// Seal any open body chunk and push buffered output to the socket.
    /// Must be called before the connection blocks on a read.
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush_sealed().await
    }

    /// Final flush plus write-side shutdown.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }

    /// Surrender the transport for a one-way protocol hand-off.
    pub fn into_taken(self) -> TakenStream {
        let (read, buffered) = self.reader.into_parts();
        TakenStream {
            buffered,
            read,
            write: self.writer.into_inner(),
        }
    }
}
