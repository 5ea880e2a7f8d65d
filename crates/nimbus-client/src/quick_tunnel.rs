//! Quick-tunnel bootstrap.
//!
//! Requests ephemeral tunnel credentials from the quick-tunnel service:
//! one POST returning a JSON envelope with the tunnel id, a base64 secret,
//! the account tag, and the public hostname. The request is plain HTTP/1.1
//! over TLS, hand-rolled to keep the dependency surface small.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::sync::Once;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};
use url::Url;

/// Default quick-tunnel service.
pub const DEFAULT_QUICK_TUNNEL_URL: &str = "https://api.trycloudflare.com";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid service URL '{0}'")]
    InvalidUrl(String),

    #[error("connection to quick-tunnel service failed: {0}")]
    ConnectionFailed(String),

    #[error("quick-tunnel request failed: {0}")]
    RequestFailed(String),

    #[error("invalid quick-tunnel response: {0}")]
    InvalidResponse(String),

    #[error("quick-tunnel request timed out")]
    Timeout,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    result: Option<EnvelopeResult>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeResult {
    id: String,
    secret: String,
    account_tag: String,
    hostname: String,
}

/// Credentials minted by the quick-tunnel service.
#[derive(Debug, Clone)]
pub struct QuickTunnelCredentials {
    pub tunnel_id: [u8; 16],
    pub tunnel_secret: Vec<u8>,
    pub account_tag: String,
    /// Public hostname serving the tunnel, e.g. `xxx.trycloudflare.com`.
    pub hostname: String,
}

/// Client for the quick-tunnel bootstrap endpoint.
pub struct QuickTunnelClient {
    service_url: String,
    timeout: Duration,
}

impl QuickTunnelClient {
    pub fn new() -> Self {
        Self {
            service_url: DEFAULT_QUICK_TUNNEL_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_service_url(mut self, url: &str) -> Self {
        self.service_url = url.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Requests a new ephemeral tunnel.
    pub async fn request_tunnel(&self) -> Result<QuickTunnelCredentials, BootstrapError> {
        let url = Url::parse(&self.service_url)
            .map_err(|_| BootstrapError::InvalidUrl(self.service_url.clone()))?;
        let host = url
            .host_str()
            .ok_or_else(|| BootstrapError::InvalidUrl(self.service_url.clone()))?
            .to_string();
        let use_tls = match url.scheme() {
            "https" => true,
            "http" => false,
            _ => return Err(BootstrapError::InvalidUrl(self.service_url.clone())),
        };
        let port = url.port().unwrap_or(if use_tls { 443 } else { 80 });
        let path = format!("{}/tunnel", url.path().trim_end_matches('/'));

        debug!(host = %host, port, path = %path, tls = use_tls, "requesting quick tunnel");

        let stream = timeout(self.timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| BootstrapError::Timeout)?
            .map_err(|e| BootstrapError::ConnectionFailed(e.to_string()))?;

        let body = if use_tls {
            let connector = build_tls_connector();
            let dns_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| BootstrapError::ConnectionFailed(e.to_string()))?;
            let tls_stream = connector
                .connect(dns_name, stream)
                .await
                .map_err(|e| BootstrapError::ConnectionFailed(e.to_string()))?;
            self.post(tls_stream, &host, &path).await?
        } else {
            self.post(stream, &host, &path).await?
        };

        let credentials = parse_envelope(&body)?;
        info!(hostname = %credentials.hostname, "quick tunnel created");
        Ok(credentials)
    }

    /// Sends the POST and reads the response body. The service responds with
    /// `Connection: close` semantics, so the body ends with the stream when
    /// no Content-Length is present.
    async fn post<S>(&self, stream: S, host: &str, path: &str) -> Result<String, BootstrapError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);

        let request = format!(
            "POST {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Connection: close\r\n\
             Accept: application/json\r\n\
             Content-Type: application/json\r\n\
             Content-Length: 0\r\n\
             User-Agent: nimbus/{}\r\n\r\n",
            env!("CARGO_PKG_VERSION")
        );

        timeout(self.timeout, write_half.write_all(request.as_bytes()))
            .await
            .map_err(|_| BootstrapError::Timeout)?
            .map_err(|e| BootstrapError::RequestFailed(e.to_string()))?;

        let mut reader = BufReader::new(read_half);
        let mut status_line = String::new();
        let mut content_length: Option<usize> = None;

        timeout(self.timeout, async {
            reader.read_line(&mut status_line).await?;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await?;
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(value) = line
                    .to_ascii_lowercase()
                    .strip_prefix("content-length:")
                    .map(str::trim)
                {
                    content_length = value.parse().ok();
                }
            }
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|_| BootstrapError::Timeout)?
        .map_err(|e| BootstrapError::RequestFailed(e.to_string()))?;

        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| {
                BootstrapError::InvalidResponse(format!("bad status line: {status_line:?}"))
            })?;
        if !(200..300).contains(&status) {
            return Err(BootstrapError::RequestFailed(format!(
                "service returned status {status}"
            )));
        }

        let body = timeout(self.timeout, async {
            match content_length {
                Some(len) => {
                    let mut buf = vec![0u8; len];
                    reader.read_exact(&mut buf).await?;
                    Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
                }
                None => {
                    let mut body = String::new();
                    reader.read_to_string(&mut body).await?;
                    Ok(body)
                }
            }
        })
        .await
        .map_err(|_| BootstrapError::Timeout)?
        .map_err(|e| BootstrapError::RequestFailed(e.to_string()))?;

        Ok(body)
    }
}

impl Default for QuickTunnelClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the JSON envelope and decodes the binary fields.
fn parse_envelope(body: &str) -> Result<QuickTunnelCredentials, BootstrapError> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| BootstrapError::InvalidResponse(e.to_string()))?;
    if !envelope.success {
        return Err(BootstrapError::InvalidResponse(
            "service reported success=false".to_string(),
        ));
    }
    let result = envelope
        .result
        .ok_or_else(|| BootstrapError::InvalidResponse("missing result object".to_string()))?;

    let tunnel_id = uuid::Uuid::parse_str(&result.id)
        .map_err(|e| BootstrapError::InvalidResponse(format!("bad tunnel id: {e}")))?
        .into_bytes();
    let tunnel_secret = BASE64
        .decode(result.secret.trim())
        .map_err(|e| BootstrapError::InvalidResponse(format!("bad secret encoding: {e}")))?;

    Ok(QuickTunnelCredentials {
        tunnel_id,
        tunnel_secret,
        account_tag: result.account_tag,
        hostname: result.hostname,
    })
}

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn build_tls_connector() -> tokio_rustls::TlsConnector {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(std::sync::Arc::new(config))
}
