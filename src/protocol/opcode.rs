//! HMUX wire format: opcodes, categories and limits.
//!
//! Packets are straightforward:
//! ```text
//! ┌────────┬───────────┬──────────┐
//! │ Opcode │ Length    │ Payload  │
//! │ 1 byte │ 2 bytes BE│ N bytes  │
//! └────────┴───────────┴──────────┘
//! ```
//! Most opcodes carry a 16-bit big-endian length and that many payload
//! bytes. The exceptions:
//!
//! - bare control codes ([`QUIT`], [`EXIT`], [`YIELD`]) carry nothing;
//! - [`CHANNEL`] consumes a literal 2-byte channel id, not a length;
//! - [`ACK`] is the opcode plus two zero bytes;
//! - [`PROTOCOL`] requires length == 4 followed by a 4-byte big-endian
//!   sub-protocol id.
//!
//! Opcodes a reader does not recognize are forward-compatible: read the
//! 16-bit length and discard that many bytes. Only the structurally fixed
//! opcodes above are hard errors when malformed.
//!
//! The byte values are the interop contract with the front-end plugin and
//! must not change.

/// Maximum payload length a single field can carry.
pub const MAX_FIELD_LEN: usize = 0xffff;

/// Maximum size of one outbound DATA chunk.
pub const DATA_CHUNK_MAX: usize = 32 * 1024;

// Channel control codes.

/// Channel select. Followed by a literal 2-byte channel id.
pub const CHANNEL: u8 = b'C';
/// Flow-control acknowledgment. Followed by two zero bytes.
pub const ACK: u8 = b'A';
/// Error report from the peer. Length-prefixed.
pub const ERROR: u8 = b'E';
/// Peer is blocked on its own downstream and wants an ACK. Bare.
pub const YIELD: u8 = b'Y';
/// End of request, connection may be kept alive. Bare.
pub const QUIT: u8 = b'Q';
/// End of request, connection must close. Bare.
pub const EXIT: u8 = b'X';

// Length-prefixed request/response codes.

/// Body chunk announcement; the length is a byte credit.
pub const DATA: u8 = b'D';
/// Request URI.
pub const URI: u8 = b'U';
/// Second half of a compound field (HEADER value, etc.).
pub const STRING: u8 = b'S';
/// Header key; must be immediately followed by a [`STRING`] value.
pub const HEADER: u8 = b'H';
/// Opaque binary field.
pub const BINARY: u8 = b'B';
/// Sub-protocol hand-off; length must be 4, payload is the id.
pub const PROTOCOL: u8 = b'P';
/// Engine-level metadata header.
pub const META_HEADER: u8 = b'M';

// HTTP-ish field codes (lower-case block).

/// HTTP method.
pub const METHOD: u8 = b'm';
/// Response status line ("200 OK").
pub const STATUS: u8 = b's';
/// Protocol name and version ("HTTP/1.1").
pub const PROTOCOL_VERSION: u8 = b'c';
/// Pre-authenticated remote user.
pub const REMOTE_USER: u8 = b'd';
/// Query string, appended to the URI after '?'.
pub const QUERY_STRING: u8 = b'e';
/// Mid-response flush marker; written with a zero length.
pub const FLUSH: u8 = b'f';
/// Server port, decimal string.
pub const SERVER_PORT: u8 = b'g';
/// Remote (client) host name.
pub const REMOTE_HOST: u8 = b'h';
/// Remote (client) address.
pub const REMOTE_ADDR: u8 = b'i';
/// Remote (client) port, decimal string.
pub const REMOTE_PORT: u8 = b'j';
/// Content-Length header value.
pub const CONTENT_LENGTH: u8 = b'p';
/// Content-Type header value.
pub const CONTENT_TYPE: u8 = b'q';
/// Secure-transport marker; payload skipped.
pub const IS_SECURE: u8 = b'r';
/// Client certificate bytes.
pub const CLIENT_CERT: u8 = b't';
/// One-character front-end type tag.
pub const SERVER_TYPE: u8 = b'u';
/// Virtual host name the front end routed on.
pub const SERVER_NAME: u8 = b'v';

/// Headers-complete marker on the response side.
pub const SEND_HEADER: u8 = b'G';

// Dispatch (config-sync) sub-protocol codes. Some byte values collide with
// the request codes above; they are only valid inside a dispatch exchange.

/// Queried host name.
pub const DISPATCH_HOST: u8 = b'h';
/// Query for the full host configuration.
pub const DISPATCH_QUERY_ALL: u8 = b'q';
/// Web-app context path.
pub const DISPATCH_WEB_APP: u8 = b'a';
/// Servlet match pattern.
pub const DISPATCH_MATCH: u8 = b'm';
/// Servlet ignore pattern.
pub const DISPATCH_IGNORE: u8 = b'i';
/// Cache-validation token (request: supplied, response: new value).
pub const DISPATCH_ETAG: u8 = b'e';
/// Supplied ETag still valid; nothing follows.
pub const DISPATCH_NO_CHANGE: u8 = b'n';
/// Cluster id.
pub const DISPATCH_CLUSTER: u8 = b'c';
/// Cluster member endpoint, plain.
pub const DISPATCH_SRUN: u8 = b's';
/// Cluster member endpoint, TLS.
pub const DISPATCH_SRUN_SSL: u8 = b'e';
/// Host resolved but not active.
pub const DISPATCH_UNAVAILABLE: u8 = b'u';
/// Web-app resolved but not active.
pub const DISPATCH_WEB_APP_UNAVAILABLE: u8 = b'U';

// Sub-protocol ids carried by PROTOCOL.

/// Cluster-membership protocol.
pub const PROTO_CLUSTER: u32 = 0x101;
/// Topology/config dispatch protocol.
pub const PROTO_DISPATCH: u32 = 0x102;
/// One-way hand-off to the message-bus protocol.
pub const PROTO_MESSAGING: u32 = 0x103;

/// Whether a byte is inter-packet debug filler the reader silently skips.
#[inline]
pub fn is_filler(code: u8) -> bool {
    code == b' ' || code == b'\n'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_code_values() {
        // The contract with the front-end plugin, byte for byte.
        assert_eq!(CHANNEL, 0x43);
        assert_eq!(ACK, 0x41);
        assert_eq!(YIELD, 0x59);
        assert_eq!(QUIT, 0x51);
        assert_eq!(EXIT, 0x58);
        assert_eq!(DATA, 0x44);
        assert_eq!(URI, 0x55);
        assert_eq!(STRING, 0x53);
        assert_eq!(HEADER, 0x48);
        assert_eq!(PROTOCOL, 0x50);
    }

    #[test]
    fn test_dispatch_codes_share_bytes_with_request_codes() {
        // Same byte, different exchange; both constants must exist.
        assert_eq!(DISPATCH_ETAG, QUERY_STRING);
        assert_eq!(DISPATCH_SRUN, STATUS);
        assert_eq!(DISPATCH_HOST, REMOTE_HOST);
    }

    #[test]
    fn test_sub_protocol_ids() {
        assert_eq!(PROTO_CLUSTER, 0x101);
        assert_eq!(PROTO_DISPATCH, 0x102);
        assert_eq!(PROTO_MESSAGING, 0x103);
    }

    #[test]
    fn test_filler() {
        assert!(is_filler(b' '));
        assert!(is_filler(b'\n'));
        assert!(!is_filler(b'Q'));
    }
}
