//! # hmux
//!
//! Protocol engine for HMUX, the binary protocol between a front-end
//! reverse proxy (a native web-server plugin) and backend worker
//! processes. One TCP connection carries HTTP-like requests with
//! flow-controlled bodies, plus a configuration-synchronization
//! sub-protocol that lets the front end cache this node's virtual-host
//! and cluster topology until it changes.
//!
//! ## Architecture
//!
//! - **Wire layer** ([`protocol`]): opcode framing over a byte stream.
//! - **Flow control** ([`flow`]): the credit/ACK discipline for inbound
//!   bodies, including the YIELD deadlock-avoidance handshake.
//! - **Server session** ([`session`]): the inbound request state machine;
//!   hands parsed requests to an external [`RequestHandler`].
//! - **Dispatch** ([`dispatch`]): the topology/config sub-protocol with
//!   ETag-based cache validation.
//! - **Extensions** ([`extension`]): pluggable sub-protocol handlers
//!   reached through the PROTOCOL hand-off.
//! - **Client** ([`client`]): the mirror role, for forwarding a request
//!   to a peer node, with a single-slot idle-connection cache.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hmux::{DispatchPolicy, DispatchService, ServerConfig, ServerSession};
//!
//! let dispatch = Arc::new(DispatchService::new(DispatchPolicy::default(), hosts));
//! let config = Arc::new(ServerConfig::new(dispatch));
//!
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     let session = ServerSession::new(socket, config.clone());
//!     let handler = handler.clone();
//!     tokio::spawn(async move {
//!         if let Err(e) = session.run(handler.as_ref()).await {
//!             tracing::debug!("connection ended: {e}");
//!         }
//!     });
//! }
//! ```

pub mod client;
pub mod dispatch;
pub mod error;
pub mod extension;
pub mod flow;
pub mod protocol;
pub mod session;

pub use client::{ClientConfig, ClientRequest, ClientResponse, HmuxClient};
pub use dispatch::{DispatchPolicy, DispatchService, HostDescriptor, HostRegistry};
pub use error::{HmuxError, Result};
pub use extension::{Extension, ExtensionRegistry, ProtocolResult};
pub use protocol::{Connection, TakenStream};
pub use session::{
    ConnectionTakeover, CpuLoadGauge, Outcome, RequestHandler, RequestIo, RequestState,
    ServerConfig, ServerSession, SessionEnd,
};
