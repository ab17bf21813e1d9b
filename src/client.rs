//! Outbound client session: originating a request to a peer node.
//!
//! The client speaks the same opcode vocabulary as the server side and
//! reads the response under the mirror of the inbound flow-control
//! discipline. It keeps at most one idle connection cached per
//! (host, port); asking for a different destination evicts and closes
//! whatever was cached. The cache lock guards only the slot swap, never
//! any I/O.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::error::{HmuxError, Result};
use crate::flow::BodyFlow;
use crate::protocol::{opcode, Connection};

/// Headers the engine manages itself; never forwarded to the peer.
/// This is the known minimum set, not proven exhaustive.
pub const RESERVED_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "content-encoding",
    "connection",
    "user-agent",
];

/// Bound on trailing response bytes drained before a connection may be
/// cached; past this it is cheaper to reconnect.
const CACHE_DRAIN_LIMIT: usize = 64 * 1024;

fn is_reserved(header: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|r| header.eq_ignore_ascii_case(r))
}

/// Client-side socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    /// A cached connection idle longer than this is discarded, not reused.
    pub idle_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(300),
            idle_window: Duration::from_secs(5),
        }
    }
}

/// One outbound request.
pub struct ClientRequest<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub query: Option<&'a str>,
    /// Virtual host to route on; defaults to the peer host.
    pub virtual_host: Option<&'a str>,
    pub headers: &'a [(String, String)],
    pub body: Option<&'a [u8]>,
}

impl<'a> ClientRequest<'a> {
    pub fn new(method: &'a str, uri: &'a str) -> Self {
        Self {
            method,
            uri,
            query: None,
            virtual_host: None,
            headers: &[],
            body: None,
        }
    }

    pub fn get(uri: &'a str) -> Self {
        Self::new("GET", uri)
    }

    pub fn post(uri: &'a str, body: &'a [u8]) -> Self {
        let mut req = Self::new("POST", uri);
        req.body = Some(body);
        req
    }
}

struct CachedConn {
    host: String,
    port: u16,
    conn: Connection,
    saved_at: Instant,
}

/// Outbound HMUX client with the single-slot idle-connection cache.
pub struct HmuxClient {
    config: ClientConfig,
    cache: Mutex<Option<CachedConn>>,
}

impl HmuxClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(None),
        }
    }

    /// Send a request to `host:port` and read the response status and
    /// headers. Body bytes are pulled from the returned response; pass it
    /// to [`HmuxClient::release`] afterwards to recycle the connection.
    pub async fn request(
        &self,
        host: &str,
        port: u16,
        req: &ClientRequest<'_>,
    ) -> Result<ClientResponse> {
        let mut conn = self.checkout(host, port).await?;

        if let Err(e) = self.send_request(&mut conn, host, port, req).await {
            conn.kill_keepalive();
            return Err(e);
        }

        self.read_response(conn, host, port).await
    }

    /// Take the cached connection if it matches and is fresh; otherwise
    /// dial. The lock covers only the slot swap.
    async fn checkout(&self, host: &str, port: u16) -> Result<Connection> {
        let cached = self.cache.lock().take();

        if let Some(cached) = cached {
            if cached.host == host
                && cached.port == port
                && cached.saved_at.elapsed() < self.config.idle_window
            {
                trace!(host, port, "reusing cached connection");
                return Ok(cached.conn);
            }
            // Wrong destination or gone stale: dropping closes the socket.
            debug!(
                cached = %cached.host,
                "discarding cached connection"
            );
        }

        let stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| HmuxError::Timeout)?
        .map_err(HmuxError::from_io)?;
        let _ = stream.set_nodelay(true);

        trace!(host, port, "connected");
        Ok(Connection::new(stream))
    }

    async fn send_request(
        &self,
        conn: &mut Connection,
        host: &str,
        port: u16,
        req: &ClientRequest<'_>,
    ) -> Result<()> {
        conn.write_channel(0);
        conn.write_text(opcode::METHOD, req.method)?;

        match req.virtual_host {
            Some(virtual_host) => conn.write_text(opcode::SERVER_NAME, virtual_host)?,
            None => {
                conn.write_text(opcode::SERVER_NAME, host)?;
                if port != 80 {
                    conn.write_text(opcode::SERVER_PORT, &port.to_string())?;
                }
            }
        }

        conn.write_text(opcode::URI, req.uri)?;
        if let Some(query) = req.query {
            conn.write_text(opcode::QUERY_STRING, query)?;
        }

        for (key, value) in req.headers {
            if is_reserved(key) {
                continue;
            }
            conn.write_pair(key, value)?;
        }

        if let Some(body) = req.body {
            conn.write_body(body).await?;
        }

        conn.write_code(opcode::QUIT);
        conn.flush().await
    }

    /// Block for the status and headers, mirroring the inbound scan.
    async fn read_response(
        &self,
        mut conn: Connection,
        host: &str,
        port: u16,
    ) -> Result<ClientResponse> {
        let mut status = String::new();
        let mut headers: Vec<(String, String)> = Vec::new();

        let flow = loop {
            let next = timeout(self.config.socket_timeout, conn.read_opcode())
                .await
                .map_err(|_| HmuxError::Timeout)??;
            let Some(code) = next else {
                return Err(HmuxError::Disconnect);
            };

            match code {
                opcode::CHANNEL => {
                    conn.read_channel().await?;
                }
                opcode::STATUS => {
                    status = conn.read_text().await?;
                    trace!(status = %status, "response status");
                }
                opcode::HEADER => {
                    let key = conn.read_text().await?;
                    let next = conn
                        .read_opcode()
                        .await?
                        .ok_or(HmuxError::Disconnect)?;
                    if next != opcode::STRING {
                        return Err(HmuxError::Framing("HEADER must be followed by STRING"));
                    }
                    headers.push((key, conn.read_text().await?));
                }
                opcode::DATA => {
                    let credit = conn.reader.read_len().await?;
                    break BodyFlow::with_credit(credit);
                }
                opcode::QUIT => break BodyFlow::ended(),
                opcode::EXIT => {
                    conn.kill_keepalive();
                    break BodyFlow::ended();
                }
                opcode::YIELD => {}
                _ => {
                    conn.skip_field().await?;
                }
            }
        };

        Ok(ClientResponse {
            status,
            headers,
            flow,
            conn: Some(conn),
            host: host.to_string(),
            port,
            socket_timeout: self.config.socket_timeout,
        })
    }

    /// Recycle a finished response's connection: drain trailing bytes
    /// (bounded) and park it in the cache slot if keepalive survived.
    /// Whatever was cached before is closed by the swap.
    pub async fn release(&self, mut response: ClientResponse) {
        let Some(mut conn) = response.conn.take() else {
            return;
        };

        let drained = timeout(
            self.config.socket_timeout,
            conn.drain_body(&mut response.flow, CACHE_DRAIN_LIMIT),
        )
        .await;

        let cacheable = matches!(drained, Ok(Ok(true))) && conn.keepalive();
        if !cacheable {
            debug!("closing connection instead of caching");
            return;
        }

        let evicted = self.cache.lock().replace(CachedConn {
            host: response.host.clone(),
            port: response.port,
            conn,
            saved_at: Instant::now(),
        });
        if evicted.is_some() {
            debug!("evicted previously cached connection");
        }
    }
}

/// A response being read: status, headers, and the flow-controlled body.
/// Dropping it without [`HmuxClient::release`] closes the connection.
pub struct ClientResponse {
    pub status: String,
    pub headers: Vec<(String, String)>,
    flow: BodyFlow,
    conn: Option<Connection>,
    host: String,
    port: u16,
    socket_timeout: Duration,
}

impl ClientResponse {
    /// Numeric status code: the leading three digits of the status line.
    pub fn status_code(&self) -> Option<u16> {
        self.status.get(..3)?.parse().ok()
    }

    /// First header value for a key, case-insensitive.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Pull response body bytes; `Ok(0)` is end of body.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(0);
        };
        match timeout(self.socket_timeout, conn.read_body(&mut self.flow, buf)).await {
            Ok(result) => result,
            Err(_) => {
                conn.kill_keepalive();
                Err(HmuxError::Timeout)
            }
        }
    }

    /// Collect the whole body.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8 * 1024];
        loop {
            let n = self.read_body(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve one scripted request on an accepted socket; returns the
    /// request fields seen, or `None` when the peer closed first.
    /// Responds 200 with the given body.
    async fn serve_one(conn: &mut Connection, body: &[u8]) -> Option<Vec<(u8, Vec<u8>)>> {
        let mut fields = Vec::new();
        loop {
            let code = conn.read_opcode().await.unwrap()?;
            match code {
                opcode::CHANNEL => {
                    conn.read_channel().await.unwrap();
                }
                opcode::QUIT | opcode::EXIT => break,
                _ => {
                    let payload = conn.read_field().await.unwrap();
                    fields.push((code, payload.to_vec()));
                }
            }
        }

        conn.write_text(opcode::STATUS, "200 OK").unwrap();
        conn.write_pair("Content-Type", "text/plain").unwrap();
        conn.write_text(opcode::SEND_HEADER, "").unwrap();
        conn.write_body(body).await.unwrap();
        conn.write_code(opcode::QUIT);
        conn.flush().await.unwrap();

        Some(fields)
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(sock);
            serve_one(&mut conn, b"hello from peer").await.unwrap()
        });

        let client = HmuxClient::new(ClientConfig::default());
        let headers = vec![
            ("X-Forwarded-For".to_string(), "10.1.2.3".to_string()),
            ("Host".to_string(), "should-be-dropped".to_string()),
        ];
        let mut req = ClientRequest::get("/resource");
        req.query = Some("a=1");
        req.headers = &headers;

        let mut response = client.request(&addr.ip().to_string(), addr.port(), &req).await.unwrap();
        assert_eq!(response.status_code(), Some(200));
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.read_to_end().await.unwrap(), b"hello from peer");

        let fields = server.await.unwrap();
        let get = |c: u8| -> Vec<Vec<u8>> {
            fields
                .iter()
                .filter(|(fc, _)| *fc == c)
                .map(|(_, p)| p.clone())
                .collect()
        };
        assert_eq!(get(opcode::METHOD), [b"GET".to_vec()]);
        assert_eq!(get(opcode::URI), [b"/resource".to_vec()]);
        assert_eq!(get(opcode::QUERY_STRING), [b"a=1".to_vec()]);

        // The reserved Host header never reached the wire.
        let header_keys = get(opcode::HEADER);
        assert!(header_keys.contains(&b"X-Forwarded-For".to_vec()));
        assert!(!header_keys.iter().any(|k| k.eq_ignore_ascii_case(b"host")));
    }

    #[tokio::test]
    async fn test_post_body_sent_as_data_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(sock);
            serve_one(&mut conn, b"ok").await.unwrap()
        });

        let client = HmuxClient::new(ClientConfig::default());
        let req = ClientRequest::post("/submit", b"name=value");
        let mut response = client.request(&addr.ip().to_string(), addr.port(), &req).await.unwrap();
        response.read_to_end().await.unwrap();

        let fields = server.await.unwrap();
        let body: Vec<u8> = fields
            .iter()
            .filter(|(c, _)| *c == opcode::DATA)
            .flat_map(|(_, p)| p.clone())
            .collect();
        assert_eq!(body, b"name=value");
    }

    #[tokio::test]
    async fn test_keepalive_reuses_cached_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let server_accepts = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                server_accepts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut conn = Connection::new(sock);
                    while serve_one(&mut conn, b"again").await.is_some() {}
                });
            }
        });

        let client = HmuxClient::new(ClientConfig::default());
        let host = addr.ip().to_string();

        for _ in 0..2 {
            let mut response = client
                .request(&host, addr.port(), &ClientRequest::get("/ka"))
                .await
                .unwrap();
            response.read_to_end().await.unwrap();
            client.release(response).await;
        }

        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_evicted_on_destination_change() {
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        // Destination A serves one request, then watches for EOF.
        let a_task = tokio::spawn(async move {
            let (sock, _) = listener_a.accept().await.unwrap();
            let mut conn = Connection::new(sock);
            serve_one(&mut conn, b"from-a").await.unwrap();

            // The client must close this socket when it switches to B.
            let taken = conn.into_taken();
            let mut read = taken.read;
            let mut scratch = [0u8; 64];
            read.read(&mut scratch).await.unwrap()
        });

        let b_task = tokio::spawn(async move {
            let (sock, _) = listener_b.accept().await.unwrap();
            let mut conn = Connection::new(sock);
            serve_one(&mut conn, b"from-b").await.unwrap();
        });

        let client = HmuxClient::new(ClientConfig::default());
        let host = addr_a.ip().to_string();

        let mut ra = client
            .request(&host, addr_a.port(), &ClientRequest::get("/a"))
            .await
            .unwrap();
        ra.read_to_end().await.unwrap();
        client.release(ra).await;

        let mut rb = client
            .request(&host, addr_b.port(), &ClientRequest::get("/b"))
            .await
            .unwrap();
        assert_eq!(rb.read_to_end().await.unwrap(), b"from-b");

        // A's connection saw EOF: evicted and closed, never returned.
        assert_eq!(a_task.await.unwrap(), 0);
        b_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_cached_connection_discarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let server_accepts = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                server_accepts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut conn = Connection::new(sock);
                    while serve_one(&mut conn, b"x").await.is_some() {}
                });
            }
        });

        let config = ClientConfig {
            idle_window: Duration::from_millis(0),
            ..ClientConfig::default()
        };
        let client = HmuxClient::new(config);
        let host = addr.ip().to_string();

        for _ in 0..2 {
            let mut response = client
                .request(&host, addr.port(), &ClientRequest::get("/"))
                .await
                .unwrap();
            response.read_to_end().await.unwrap();
            client.release(response).await;
        }

        // Zero freshness window: every request dials anew.
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exit_response_not_cached() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let server_accepts = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                server_accepts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut conn = Connection::new(sock);
                    // Respond then force the connection closed.
                    loop {
                        let Some(code) = conn.read_opcode().await.unwrap() else {
                            return;
                        };
                        match code {
                            opcode::CHANNEL => {
                                conn.read_channel().await.unwrap();
                            }
                            opcode::QUIT => break,
                            _ => {
                                conn.read_field().await.unwrap();
                            }
                        }
                    }
                    conn.write_text(opcode::STATUS, "200 OK").unwrap();
                    conn.write_code(opcode::EXIT);
                    conn.flush().await.unwrap();
                });
            }
        });

        let client = HmuxClient::new(ClientConfig::default());
        let host = addr.ip().to_string();

        for _ in 0..2 {
            let mut response = client
                .request(&host, addr.port(), &ClientRequest::get("/"))
                .await
                .unwrap();
            assert_eq!(response.read_to_end().await.unwrap(), b"");
            client.release(response).await;
        }

        // EXIT kills keepalive; nothing was cached, so two dials happened.
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
