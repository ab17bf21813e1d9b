//! Capability traits between the protocol engine and its host.
//!
//! The engine does not know about servlet containers or HTTP object
//! models. It hands a parsed [`RequestState`](super::RequestState) to a
//! [`RequestHandler`] together with a [`RequestIo`]: a body source the
//! handler pulls from and a response sink it pushes into. Nothing wider
//! crosses the boundary.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::TakenStream;
use crate::session::RequestState;

/// How a handled request ends, from the engine's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Normal completion; keepalive permitted if nothing else forbids it.
    Complete,
    /// The handler wants the connection gone (fatal response, resource
    /// pressure). Forces EXIT.
    CloseConnection,
}

/// The external request handler: the application side of the engine.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &RequestState, io: &mut dyn RequestIo) -> Result<Outcome>;
}

/// Body source and response sink for one request.
///
/// Reads are flow-controlled (see [`crate::flow`]); writes follow the
/// status → headers → body ordering and fail with a protocol error when
/// violated. The headers-complete marker is emitted automatically on the
/// first body write.
#[async_trait]
pub trait RequestIo: Send {
    /// Pull request body bytes. `Ok(0)` is end of body.
    async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write the status line ("200 OK"). Must come before headers. Called
    /// implicitly with "200 OK" if the handler skips it.
    async fn write_status(&mut self, status: &str) -> Result<()>;

    /// Write one response header pair. Duplicates allowed.
    async fn write_header(&mut self, key: &str, value: &str) -> Result<()>;

    /// Write response body bytes, closing the header section if open.
    async fn write_body(&mut self, buf: &[u8]) -> Result<()>;

    /// Force buffered response bytes to the peer mid-body.
    async fn flush(&mut self) -> Result<()>;
}

/// Receiver of a one-way connection hand-off.
///
/// Once invoked, the connection never returns to HMUX; the taken stream
/// includes any bytes the engine had already read ahead.
#[async_trait]
pub trait ConnectionTakeover: Send + Sync {
    async fn take_over(&self, stream: TakenStream) -> Result<()>;
}
