//! Tunnel client configuration.

use nimbus_proto::{ConnectionOptions, TunnelAuth, DEFAULT_EDGE_HOST, DEFAULT_EDGE_PORT};
use nimbus_transport::EdgeConfig;
use std::time::Duration;

/// Highest accepted compression quality knob.
const MAX_COMPRESSION_QUALITY: u8 = 11;

/// Everything the tunnel needs for one session: credentials, the edge to
/// dial, the origin to serve, and the identity advertised at registration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub edge_host: String,
    pub edge_port: u16,
    pub edge: EdgeConfig,

    /// Local origin URL, e.g. `http://localhost:8080`.
    pub origin_url: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,

    pub tunnel_id: [u8; 16],
    pub account_tag: String,
    pub tunnel_secret: Vec<u8>,

    pub client_id: [u8; 16],
    pub client_version: String,
    pub client_arch: String,
    pub replace_existing: bool,
    pub compression_quality: u8,
    pub num_previous_attempts: u8,
}

impl TunnelConfig {
    /// Builds a configuration with the given credentials and defaults for
    /// everything else. The client id is a fresh v4 UUID per process.
    pub fn new(tunnel_id: [u8; 16], account_tag: String, tunnel_secret: Vec<u8>) -> Self {
        Self {
            edge_host: DEFAULT_EDGE_HOST.to_string(),
            edge_port: DEFAULT_EDGE_PORT,
            edge: EdgeConfig::client_default(),
            origin_url: "http://localhost:8080".to_string(),
            connect_timeout: Duration::from_millis(5_000),
            read_timeout: Duration::from_millis(30_000),
            tunnel_id,
            account_tag,
            tunnel_secret,
            client_id: *uuid::Uuid::new_v4().as_bytes(),
            client_version: format!("nimbus/{}", env!("CARGO_PKG_VERSION")),
            client_arch: format!("{}_{}", std::env::consts::OS, std::env::consts::ARCH),
            replace_existing: false,
            compression_quality: 0,
            num_previous_attempts: 0,
        }
    }

    pub fn with_edge(mut self, host: String, port: u16) -> Self {
        self.edge_host = host;
        self.edge_port = port;
        self
    }

    pub fn with_edge_config(mut self, edge: EdgeConfig) -> Self {
        self.edge = edge;
        self
    }

    pub fn with_origin(mut self, origin_url: String) -> Self {
        self.origin_url = origin_url;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn with_replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.account_tag.is_empty() {
            return Err("account_tag is required".to_string());
        }
        if self.tunnel_secret.is_empty() {
            return Err("tunnel_secret is required".to_string());
        }
        if self.compression_quality > MAX_COMPRESSION_QUALITY {
            return Err(format!(
                "compression_quality must be 0..={MAX_COMPRESSION_QUALITY}"
            ));
        }
        Ok(())
    }

    pub(crate) fn auth(&self) -> TunnelAuth {
        TunnelAuth {
            account_tag: self.account_tag.clone(),
            tunnel_secret: self.tunnel_secret.clone(),
        }
    }

    pub(crate) fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            client_id: self.client_id,
            version: self.client_version.clone(),
            arch: self.client_arch.clone(),
            replace_existing: self.replace_existing,
            compression_quality: self.compression_quality,
            num_previous_attempts: self.num_previous_attempts,
        }
    }
}
