//! Inbound server session: the HMUX request state machine.
//!
//! One session owns one accepted connection and drives it until the peer
//! is done: scan opcodes into a [`RequestState`], hand the request to the
//! external [`RequestHandler`], emit the terminal QUIT/EXIT, repeat while
//! keepalive holds. A PROTOCOL opcode ends the state machine for the
//! current exchange and delegates to a sub-protocol handler instead.
//!
//! ```text
//! Idle → HeaderScan → (BodyReady | Dispatched) → Terminating
//! ```
//!
//! There is no intra-connection parallelism: everything below runs on the
//! connection's task, in arrival order.

mod handler;
mod request;
mod response;

pub use handler::{ConnectionTakeover, Outcome, RequestHandler, RequestIo};
pub use request::{HeaderTable, RequestState};
pub use response::Exchange;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use crate::dispatch::DispatchService;
use crate::error::{HmuxError, Result};
use crate::extension::{Extension, ExtensionRegistry, ProtocolResult};
use crate::flow::{BodyFlow, DRAIN_LIMIT};
use crate::protocol::{opcode, Connection};

/// Process-level load gauge reported to the front end with every response.
/// The surrounding tooling updates it; the engine only reads it.
#[derive(Clone, Debug, Default)]
pub struct CpuLoadGauge(Arc<AtomicU64>);

impl CpuLoadGauge {
    pub fn set(&self, load: f64) {
        self.0.store(load.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn format(&self) -> String {
        format!("{:.2}", self.get())
    }
}

/// Shared configuration for every inbound session on this node.
pub struct ServerConfig {
    /// Global keepalive policy switch; shutdown/maintenance flips it off.
    pub keepalive_enabled: Arc<AtomicBool>,
    pub cpu_load: CpuLoadGauge,
    /// The built-in config-sync sub-protocol.
    pub dispatch: Arc<DispatchService>,
    /// Dynamically registered sub-protocol handlers.
    pub extensions: Arc<ExtensionRegistry>,
    /// Built-in slot for the cluster-membership protocol; the engine routes
    /// the id but does not implement the protocol itself.
    pub cluster: Option<Arc<dyn Extension>>,
    /// Receiver for the one-way messaging hand-off, if this node offers it.
    pub takeover: Option<Arc<dyn ConnectionTakeover>>,
}

impl ServerConfig {
    pub fn new(dispatch: Arc<DispatchService>) -> Self {
        Self {
            keepalive_enabled: Arc::new(AtomicBool::new(true)),
            cpu_load: CpuLoadGauge::default(),
            dispatch,
            extensions: Arc::new(ExtensionRegistry::new()),
            cluster: None,
            takeover: None,
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn Extension>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_takeover(mut self, takeover: Arc<dyn ConnectionTakeover>) -> Self {
        self.takeover = Some(takeover);
        self
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The connection was closed (or returned for closing) normally.
    Closed,
    /// The connection was surrendered to another protocol.
    TakenOver,
}

/// What the header scan produced.
enum ScanOutcome {
    /// Benign end of the connection's lifetime.
    Closed,
    /// A complete request; `ended` means its body terminator was already
    /// consumed during the scan.
    Request { credit: usize, ended: bool },
    /// PROTOCOL hand-off to a sub-protocol.
    Handoff(u32),
}

/// Control flow after a handled request or sub-protocol exchange.
enum SessionFlow {
    Next,
    Close,
    Messaging,
}

/// One inbound connection's session.
pub struct ServerSession {
    conn: Connection,
    request: RequestState,
    config: Arc<ServerConfig>,
    requests_handled: usize,
}

impl ServerSession {
    pub fn new<S>(stream: S, config: Arc<ServerConfig>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_connection(Connection::new(stream), config)
    }

    pub fn from_connection(conn: Connection, config: Arc<ServerConfig>) -> Self {
        Self {
            conn,
            request: RequestState::new(),
            config,
            requests_handled: 0,
        }
    }

    /// Drive the connection until it closes or is handed off.
    ///
    /// Peer disconnects, timeouts and framing violations propagate to the
    /// caller after the socket has been closed and keepalive killed; they
    /// are never retried here.
    pub async fn run(mut self, handler: &dyn RequestHandler) -> Result<SessionEnd> {
        debug!("hmux session start");

        loop {
            self.request.reset();

            let scan = match self.scan_headers().await {
                Ok(scan) => scan,
                Err(e) => {
                    self.fail().await;
                    return Err(e);
                }
            };

            let flow = match scan {
                ScanOutcome::Closed => {
                    debug!("hmux session end");
                    return Ok(SessionEnd::Closed);
                }
                ScanOutcome::Request { credit, ended } => {
                    let flow = if ended {
                        BodyFlow::ended()
                    } else {
                        BodyFlow::with_credit(credit)
                    };
                    match self.serve(handler, flow).await {
                        Ok(true) => SessionFlow::Next,
                        Ok(false) => SessionFlow::Close,
                        Err(e) => {
                            self.fail().await;
                            return Err(e);
                        }
                    }
                }
                ScanOutcome::Handoff(id) => match self.sub_protocol(id).await {
                    Ok(flow) => flow,
                    Err(e) => {
                        self.fail().await;
                        return Err(e);
                    }
                },
            };

            match flow {
                SessionFlow::Next => continue,
                SessionFlow::Close => return Ok(SessionEnd::Closed),
                SessionFlow::Messaging => break,
            }
        }

        self.hand_off_messaging().await
    }

    /// Scan control opcodes until a request is assembled, the connection
    /// ends, or a sub-protocol takes over.
    async fn scan_headers(&mut self) -> Result<ScanOutcome> {
        let conn = &mut self.conn;
        let req = &mut self.request;

        loop {
            // Never block on a read with response bytes still buffered.
            conn.writer.flush_sealed().await?;

            let code = match conn.reader.read_opcode().await? {
                Some(code) => code,
                None => {
                    conn.keepalive.kill();
                    if req.has_request {
                        return Err(HmuxError::Disconnect);
                    }
                    trace!("end of stream before request");
                    return Ok(ScanOutcome::Closed);
                }
            };

            match code {
                opcode::CHANNEL => {
                    let channel = conn.reader.read_channel().await?;
                    trace!(channel, "channel select ignored");
                }
                opcode::YIELD => {
                    conn.writer.write_ack();
                    conn.writer.flush_sealed().await?;
                }
                opcode::QUIT => {
                    return if req.has_request {
                        Ok(ScanOutcome::Request {
                            credit: 0,
                            ended: true,
                        })
                    } else {
                        trace!("quit before request");
                        Ok(ScanOutcome::Closed)
                    };
                }
                opcode::EXIT => {
                    conn.keepalive.kill();
                    return if req.has_request {
                        Ok(ScanOutcome::Request {
                            credit: 0,
                            ended: true,
                        })
                    } else {
                        trace!("exit before request");
                        Ok(ScanOutcome::Closed)
                    };
                }
                opcode::PROTOCOL => {
                    let id = conn.reader.read_protocol_id().await?;
                    return Ok(ScanOutcome::Handoff(id));
                }
                opcode::DATA => {
                    let len = conn.reader.read_len().await?;
                    trace!(len, "request body announced");
                    if len == 0 {
                        continue;
                    }
                    if !req.has_request {
                        // Body bytes without request fields; discard them
                        // and keep scanning.
                        conn.reader.skip(len).await?;
                        continue;
                    }
                    return Ok(ScanOutcome::Request {
                        credit: len,
                        ended: false,
                    });
                }
                opcode::URI => {
                    conn.reader.read_field_into(&mut req.uri).await?;
                    req.has_request = true;
                }
                opcode::METHOD => {
                    req.method.clear();
                    conn.reader.read_field_into(&mut req.method).await?;
                }
                opcode::PROTOCOL_VERSION => {
                    req.protocol.clear();
                    conn.reader.read_field_into(&mut req.protocol).await?;
                    req.parse_version();
                }
                opcode::QUERY_STRING => {
                    let query = conn.reader.read_field().await?;
                    if !query.is_empty() {
                        req.uri.push(b'?');
                        req.uri.extend_from_slice(&query);
                    }
                }
                opcode::SERVER_NAME => {
                    conn.reader.read_field_into(&mut req.server_name).await?;
                }
                opcode::SERVER_PORT => {
                    conn.reader.read_field_into(&mut req.server_port).await?;
                }
                opcode::REMOTE_HOST => {
                    conn.reader.read_field_into(&mut req.remote_host).await?;
                }
                opcode::REMOTE_ADDR => {
                    conn.reader.read_field_into(&mut req.remote_addr).await?;
                }
                opcode::REMOTE_PORT => {
                    conn.reader.read_field_into(&mut req.remote_port).await?;
                }
                opcode::REMOTE_USER => {
                    conn.reader.read_field_into(&mut req.remote_user).await?;
                }
                opcode::HEADER => {
                    let (key, value) = req.headers.next_slot();
                    conn.reader.read_field_into(key).await?;

                    let next = conn
                        .reader
                        .read_opcode()
                        .await?
                        .ok_or(HmuxError::Disconnect)?;
                    if next != opcode::STRING {
                        return Err(HmuxError::Framing("HEADER must be followed by STRING"));
                    }
                    conn.reader.read_field_into(value).await?;
                }
                opcode::CONTENT_LENGTH => {
                    let (key, value) = req.headers.next_slot();
                    key.extend_from_slice(b"Content-Length");
                    conn.reader.read_field_into(value).await?;
                    req.content_length = std::str::from_utf8(value)
                        .ok()
                        .and_then(|v| v.trim().parse().ok());
                }
                opcode::CONTENT_TYPE => {
                    let (key, value) = req.headers.next_slot();
                    key.extend_from_slice(b"Content-Type");
                    conn.reader.read_field_into(value).await?;
                }
                opcode::IS_SECURE => {
                    req.secure = true;
                    conn.reader.skip_field().await?;
                }
                opcode::CLIENT_CERT => {
                    req.client_cert.clear();
                    conn.reader.read_field_into(&mut req.client_cert).await?;
                }
                opcode::SERVER_TYPE => {
                    let tag = conn.reader.read_field().await?;
                    req.server_type = tag.first().copied().unwrap_or(0);
                }
                other => {
                    let skipped = conn.reader.skip_field().await?;
                    trace!(code = %(other as char), skipped, "unknown opcode skipped");
                }
            }
        }
    }

    /// Hand one assembled request to the handler, then emit the terminal
    /// opcode. Returns whether the connection continues.
    async fn serve(&mut self, handler: &dyn RequestHandler, flow: BodyFlow) -> Result<bool> {
        self.requests_handled += 1;
        trace!(
            method = %self.request.method(),
            uri = %self.request.uri_str(),
            "request"
        );

        let cpu_load = self.config.cpu_load.format();
        let mut exchange = Exchange::new(&mut self.conn, flow, cpu_load);
        let result = handler.handle(&self.request, &mut exchange).await;

        match result {
            Ok(outcome) => {
                let mut flow = exchange.finish()?;
                if outcome == Outcome::CloseConnection {
                    self.conn.kill_keepalive();
                }
                // Unread body bytes must not leak into the next request's
                // header scan.
                if !self.conn.drain_body(&mut flow, DRAIN_LIMIT).await? {
                    warn!("leftover request body exceeded drain bound");
                    self.conn.kill_keepalive();
                }
            }
            Err(e) => {
                drop(exchange);
                self.conn.kill_keepalive();
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(error = %e, "request handler failed");
            }
        }

        self.terminate().await
    }

    /// Write QUIT or EXIT depending on connection state and global policy.
    async fn terminate(&mut self) -> Result<bool> {
        let keep = self.conn.keepalive() && self.config.keepalive_enabled.load(Ordering::Relaxed);

        if keep {
            trace!("quit, keepalive");
            self.conn.write_code(opcode::QUIT);
            self.conn.flush().await?;
            Ok(true)
        } else {
            trace!("exit, closing");
            self.conn.kill_keepalive();
            self.conn.write_code(opcode::EXIT);
            let _ = self.conn.shutdown().await;
            Ok(false)
        }
    }

    /// Route a PROTOCOL hand-off to its sub-protocol handler.
    async fn sub_protocol(&mut self, id: u32) -> Result<SessionFlow> {
        debug!("sub-protocol hand-off: {id:#x}");

        let result = match id {
            opcode::PROTO_DISPATCH => {
                if self.config.dispatch.handle(&mut self.conn).await? {
                    ProtocolResult::Quit
                } else {
                    ProtocolResult::Exit
                }
            }
            opcode::PROTO_MESSAGING => {
                if self.requests_handled > 0 || self.request.has_request() {
                    return Err(HmuxError::HandoffRejected);
                }
                return Ok(SessionFlow::Messaging);
            }
            opcode::PROTO_CLUSTER => match self.config.cluster.clone() {
                Some(ext) => ext.handle(&mut self.conn).await?,
                None => {
                    warn!("cluster protocol requested but no handler installed");
                    ProtocolResult::Exit
                }
            },
            other => match self.config.extensions.lookup(other) {
                Some(ext) => ext.handle(&mut self.conn).await?,
                None => {
                    warn!("unknown sub-protocol: {other:#x}");
                    ProtocolResult::Exit
                }
            },
        };

        match result {
            ProtocolResult::Yield => {
                self.conn.write_ack();
                self.conn.flush().await?;
                Ok(SessionFlow::Next)
            }
            ProtocolResult::Quit
                if self.conn.keepalive()
                    && self.config.keepalive_enabled.load(Ordering::Relaxed) =>
            {
                self.conn.write_code(opcode::QUIT);
                self.conn.flush().await?;
                Ok(SessionFlow::Next)
            }
            ProtocolResult::Quit | ProtocolResult::Exit => {
                self.conn.kill_keepalive();
                self.conn.write_code(opcode::EXIT);
                let _ = self.conn.shutdown().await;
                Ok(SessionFlow::Close)
            }
        }
    }

    /// Surrender the connection to the messaging protocol.
    async fn hand_off_messaging(mut self) -> Result<SessionEnd> {
        let Some(takeover) = self.config.takeover.clone() else {
            warn!("messaging hand-off requested but no takeover installed");
            self.conn.kill_keepalive();
            self.conn.write_code(opcode::EXIT);
            let _ = self.conn.shutdown().await;
            return Ok(SessionEnd::Closed);
        };

        debug!("connection switched to messaging");
        takeover.take_over(self.conn.into_taken()).await?;
        Ok(SessionEnd::TakenOver)
    }

    /// Best-effort EXIT before surfacing a fatal error.
    async fn fail(&mut self) {
        self.conn.kill_keepalive();
        self.conn.write_code(opcode::EXIT);
        let _ = self.conn.shutdown().await;
    }
}
