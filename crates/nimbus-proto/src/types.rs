//! Shared protocol types and edge constants.

/// ALPN identifier the edge expects on the QUIC handshake.
pub const EDGE_ALPN: &str = "argotunnel";

/// TLS server name presented to the edge.
pub const EDGE_SNI: &str = "quic.cftunnel.com";

/// Default edge hostname when discovery is not used.
pub const DEFAULT_EDGE_HOST: &str = "region1.v2.argotunnel.com";

/// Default edge UDP port.
pub const DEFAULT_EDGE_PORT: u16 = 7844;

/// Interface identifier of the edge's registration service.
pub const TUNNEL_SERVER_INTERFACE_ID: u64 = 0xF716_95EC_7FE8_5497;

/// Upper bound on metadata entries per request or response.
pub const MAX_METADATA_ENTRIES: usize = 32;

/// Upper bound on a metadata key, in bytes.
pub const MAX_METADATA_KEY_LEN: usize = 128;

/// Upper bound on a metadata value, in bytes.
pub const MAX_METADATA_VALUE_LEN: usize = 512;

/// One `(key, value)` entry in a request or response metadata list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub key: String,
    pub value: String,
}

impl Metadata {
    /// Builds an entry, truncating key and value to the protocol limits.
    /// Returns the entry and whether anything was cut.
    pub fn bounded(key: &str, value: &str) -> (Self, bool) {
        let truncated = key.len() > MAX_METADATA_KEY_LEN || value.len() > MAX_METADATA_VALUE_LEN;
        (
            Self {
                key: truncate_utf8(key, MAX_METADATA_KEY_LEN),
                value: truncate_utf8(value, MAX_METADATA_VALUE_LEN),
            },
            truncated,
        )
    }
}

fn truncate_utf8(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Kind of connection the edge is asking the client to establish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Http,
    Websocket,
    Tcp,
}

impl ConnectionType {
    /// Maps the wire enum value. Unknown values fall back to `Http`, which is
    /// the only kind this client serves.
    pub fn from_wire(value: u16) -> Self {
        match value {
            1 => ConnectionType::Websocket,
            2 => ConnectionType::Tcp,
            _ => ConnectionType::Http,
        }
    }
}

/// Credentials presented in the registration call.
#[derive(Debug, Clone)]
pub struct TunnelAuth {
    pub account_tag: String,
    pub tunnel_secret: Vec<u8>,
}

/// Per-connection knobs carried in the registration call.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// 16-byte v4 UUID identifying this client instance.
    pub client_id: [u8; 16],
    pub version: String,
    pub arch: String,
    pub replace_existing: bool,
    pub compression_quality: u8,
    pub num_previous_attempts: u8,
}

/// Successful registration result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDetails {
    /// Raw connection UUID bytes as sent by the edge.
    pub uuid: Vec<u8>,
    /// Edge location tag, e.g. an airport code.
    pub location: String,
    pub remotely_managed: bool,
}

impl ConnectionDetails {
    pub fn uuid_string(&self) -> String {
        format_connection_uuid(&self.uuid)
    }
}

/// Failed registration result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationError {
    pub cause: String,
    pub retry_after_ns: i64,
    pub should_retry: bool,
}

/// Outcome of the registration call's Return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Connected(ConnectionDetails),
    Refused(RegistrationError),
}

/// Formats a connection identifier. Exactly 16 bytes produce the canonical
/// `8-4-4-4-12` lowercase form; any other length yields a plain hex dump.
pub fn format_connection_uuid(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(36);
    if bytes.len() == 16 {
        for (i, b) in bytes.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                out.push('-');
            }
            out.push_str(&format!("{b:02x}"));
        }
    } else {
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
    }
    out
}
