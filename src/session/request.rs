//! Per-connection request state and header scratch buffers.
//!
//! A kept-alive connection serves many requests; everything here is
//! reusable. [`RequestState::reset`] clears values but keeps every
//! allocation, so a busy connection stops allocating once its buffers have
//! grown to fit its traffic.

use std::borrow::Cow;

/// Initial number of header slots. Doubles on overflow.
const HEADER_CAPACITY: usize = 64;

/// Parallel scratch buffers for header keys and values, indexed by ordinal
/// slot. Cleared, never reallocated, between requests.
pub struct HeaderTable {
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
    len: usize,
}

impl HeaderTable {
    pub fn new() -> Self {
        Self {
            keys: (0..HEADER_CAPACITY).map(|_| Vec::new()).collect(),
            values: (0..HEADER_CAPACITY).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    /// Claim the next slot, returning cleared key and value buffers for the
    /// caller to fill in place.
    pub fn next_slot(&mut self) -> (&mut Vec<u8>, &mut Vec<u8>) {
        if self.len == self.keys.len() {
            self.grow();
        }
        let i = self.len;
        self.len += 1;
        self.keys[i].clear();
        self.values[i].clear();
        (&mut self.keys[i], &mut self.values[i])
    }

    fn grow(&mut self) {
        let target = self.keys.len() * 2;
        self.keys.resize_with(target, Vec::new);
        self.values.resize_with(target, Vec::new);
    }

    /// Append a header with a known key and value.
    pub fn push(&mut self, key: &str, value: &[u8]) {
        let (k, v) = self.next_slot();
        k.extend_from_slice(key.as_bytes());
        v.extend_from_slice(value);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Forget all slots, retaining their allocations.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// First value for a key, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key.as_bytes()))
            .map(|(_, v)| String::from_utf8_lossy(v))
    }

    /// All (key, value) pairs in insertion order, duplicates included.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.keys[..self.len]
            .iter()
            .zip(self.values[..self.len].iter())
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

impl Default for HeaderTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the header scan assembles about one request.
///
/// Mutated only by the server session during the scan; the request handler
/// sees it read-only.
pub struct RequestState {
    pub(crate) method: Vec<u8>,
    pub(crate) uri: Vec<u8>,
    pub(crate) protocol: Vec<u8>,
    pub(crate) version: u16,
    pub(crate) server_name: Vec<u8>,
    pub(crate) server_port: Vec<u8>,
    pub(crate) remote_host: Vec<u8>,
    pub(crate) remote_addr: Vec<u8>,
    pub(crate) remote_port: Vec<u8>,
    pub(crate) remote_user: Vec<u8>,
    pub(crate) secure: bool,
    pub(crate) client_cert: Vec<u8>,
    pub(crate) server_type: u8,
    pub(crate) content_length: Option<u64>,
    pub(crate) headers: HeaderTable,
    pub(crate) has_request: bool,
    // Lazily computed lowercase host, reused across calls.
    host: std::sync::OnceLock<String>,
}

impl RequestState {
    pub fn new() -> Self {
        Self {
            method: Vec::new(),
            uri: Vec::new(),
            protocol: Vec::new(),
            version: 0,
            server_name: Vec::new(),
            server_port: Vec::new(),
            remote_host: Vec::new(),
            remote_addr: Vec::new(),
            remote_port: Vec::new(),
            remote_user: Vec::new(),
            secure: false,
            client_cert: Vec::new(),
            server_type: 0,
            content_length: None,
            headers: HeaderTable::new(),
            has_request: false,
            host: std::sync::OnceLock::new(),
        }
    }

    /// Clear all values at the start of a new request, keeping capacity.
    pub fn reset(&mut self) {
        self.method.clear();
        self.uri.clear();
        self.protocol.clear();
        self.version = 0;
        self.server_name.clear();
        self.server_port.clear();
        self.remote_host.clear();
        self.remote_addr.clear();
        self.remote_port.clear();
        self.remote_user.clear();
        self.secure = false;
        self.client_cert.clear();
        self.server_type = 0;
        self.content_length = None;
        self.headers.clear();
        self.has_request = false;
        self.host.take();
    }

    /// The HTTP method; defaults to GET when the front end sent none.
    pub fn method(&self) -> Cow<'_, str> {
        if self.method.is_empty() {
            Cow::Borrowed("GET")
        } else {
            String::from_utf8_lossy(&self.method)
        }
    }

    /// Raw URI bytes, query string already appended after `'?'`.
    pub fn uri(&self) -> &[u8] {
        &self.uri
    }

    pub fn uri_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.uri)
    }

    /// The virtual host, lowercased, taken from the routed server name.
    pub fn host(&self) -> &str {
        self.host.get_or_init(|| {
            String::from_utf8_lossy(&self.server_name).to_lowercase()
        })
    }

    /// Protocol string as sent ("HTTP/1.1").
    pub fn protocol(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.protocol)
    }

    /// Protocol version packed as nibbles: HTTP/1.1 is `0x0101`.
    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn remote_host(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.remote_host)
    }

    pub fn remote_addr(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.remote_addr)
    }

    pub fn remote_user(&self) -> Option<Cow<'_, str>> {
        if self.remote_user.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.remote_user))
        }
    }

    pub fn remote_port(&self) -> u16 {
        parse_decimal(&self.remote_port)
    }

    pub fn server_port(&self) -> u16 {
        parse_decimal(&self.server_port)
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Raw client certificate bytes; empty when none was forwarded.
    pub fn client_cert(&self) -> &[u8] {
        &self.client_cert
    }

    /// One-character front-end type tag (`'R'` for the native plugin), or 0.
    pub fn server_type(&self) -> u8 {
        self.server_type
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn headers(&self) -> &HeaderTable {
        &self.headers
    }

    /// Shorthand for a single header lookup.
    pub fn header(&self, key: &str) -> Option<Cow<'_, str>> {
        self.headers.get(key)
    }

    /// Whether request fields have been scanned (URI seen).
    pub fn has_request(&self) -> bool {
        self.has_request
    }

    /// Fold the protocol string into the packed version number: digits are
    /// hex nibbles, a dot shifts. "HTTP/1.1" -> 0x0101.
    pub(crate) fn parse_version(&mut self) {
        let mut version: u16 = 0;
        for &b in &self.protocol {
            match b {
                b'0'..=b'9' => version = version.wrapping_mul(16) + (b - b'0') as u16,
                b'.' => version = version.wrapping_mul(16),
                _ => {}
            }
        }
        self.version = version;
    }
}

impl Default for RequestState {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_decimal(bytes: &[u8]) -> u16 {
    let mut out: u16 = 0;
    for &b in bytes {
        if b.is_ascii_digit() {
            out = out.wrapping_mul(10).wrapping_add((b - b'0') as u16);
        }
    }
    out
}
