//! Origin bridge: forwards one parsed request to the local origin server.
//!
//! The bridge speaks deliberately minimal HTTP/1.1: one TCP connection per
//! request with `Connection: close`, a hand-built request, and a response
//! read bounded by `Content-Length` or the peer closing. Every failure maps
//! to a deterministic 502 response record; nothing here is fatal to the
//! tunnel session.

use nimbus_proto::ConnectRequest;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

/// Hard cap on the buffered origin response (headers + body).
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Initial response buffer allocation.
const RECV_BUF_INIT: usize = 4096;

/// Maximum parsed response headers.
const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("invalid origin URL '{0}'")]
    InvalidUrl(String),

    #[error("unsupported origin scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("connection to origin failed: {0}")]
    ConnectFailed(String),

    #[error("connection to origin timed out")]
    ConnectTimeout,

    #[error("failed to send request to origin: {0}")]
    SendFailed(String),

    #[error("failed to read response from origin: {0}")]
    RecvFailed(String),

    #[error("origin read timed out")]
    ReadTimeout,

    #[error("origin response exceeds {MAX_RESPONSE_BYTES} bytes")]
    ResponseTooLarge,

    #[error("malformed origin response: {0}")]
    MalformedResponse(String),
}

/// Parsed origin target.
#[derive(Debug, Clone)]
pub struct OriginConfig {
    pub host: String,
    pub port: u16,
    /// Prepended to every request path; empty or "/" means none.
    pub path_prefix: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl OriginConfig {
    /// Parses an origin URL. `https` is accepted but served as plain http,
    /// with a warning — TLS to the origin is not implemented.
    pub fn parse(
        origin_url: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, OriginError> {
        let url =
            Url::parse(origin_url).map_err(|_| OriginError::InvalidUrl(origin_url.to_string()))?;
        match url.scheme() {
            "http" => {}
            "https" => {
                warn!(origin = origin_url, "https origins are served as plain http");
            }
            other => return Err(OriginError::UnsupportedScheme(other.to_string())),
        }
        let host = url
            .host_str()
            .ok_or_else(|| OriginError::InvalidUrl(origin_url.to_string()))?
            .to_string();
        let port = url.port().unwrap_or(80);
        // A root path trims to the empty prefix.
        let path_prefix = url.path().trim_end_matches('/').to_string();
        Ok(Self {
            host,
            port,
            path_prefix,
            connect_timeout,
            read_timeout,
        })
    }
}

/// Response record handed back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Forwards requests to the configured origin.
#[derive(Debug)]
pub struct OriginBridge {
    config: OriginConfig,
}

impl OriginBridge {
    pub fn new(config: OriginConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OriginConfig {
        &self.config
    }

    /// Forwards one request. Failures become a 502 response record; the
    /// caller never sees an error.
    pub async fn forward(&self, request: &ConnectRequest, body: &[u8]) -> OriginResponse {
        match self.try_forward(request, body).await {
            Ok(response) => {
                debug!(
                    status = response.status,
                    body_len = response.body.len(),
                    "origin responded"
                );
                response
            }
            Err(e) => {
                warn!(error = %e, "origin request failed");
                bad_gateway(&e.to_string())
            }
        }
    }

    async fn try_forward(
        &self,
        request: &ConnectRequest,
        body: &[u8],
    ) -> Result<OriginResponse, OriginError> {
        let method = request.method().unwrap_or("GET");
        let dest = if request.dest.is_empty() {
            "/"
        } else {
            request.dest.as_str()
        };
        let path = format!("{}{}", self.config.path_prefix, dest);

        debug!(
            method,
            path = %path,
            headers = request.forwarded_headers().count(),
            body_len = body.len(),
            "forwarding to origin"
        );

        let mut stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        .map_err(|_| OriginError::ConnectTimeout)?
        .map_err(|e| OriginError::ConnectFailed(e.to_string()))?;

        let wire = self.build_request(method, &path, request, body);
        timeout(self.config.read_timeout, stream.write_all(&wire))
            .await
            .map_err(|_| OriginError::ReadTimeout)?
            .map_err(|e| OriginError::SendFailed(e.to_string()))?;

        self.read_response(&mut stream).await
    }

    /// Builds the HTTP/1.1 request: request line, `Host` from the configured
    /// origin (never the peer-provided one), `Connection: close`, forwarded
    /// headers minus Host/Connection, and `Content-Length` when a body is
    /// present.
    fn build_request(
        &self,
        method: &str,
        path: &str,
        request: &ConnectRequest,
        body: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(512 + body.len());
        out.extend_from_slice(format!("{method} {path} HTTP/1.1\r\n").as_bytes());
        out.extend_from_slice(format!("Host: {}\r\n", self.config.host).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n");
        for (name, value) in request.forwarded_headers() {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !body.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        out
    }

    /// Reads and parses the response: status line + headers, then a body
    /// sized by `Content-Length` or delimited by the origin closing.
    async fn read_response(&self, stream: &mut TcpStream) -> Result<OriginResponse, OriginError> {
        let mut buf: Vec<u8> = Vec::with_capacity(RECV_BUF_INIT);
        let mut chunk = [0u8; RECV_BUF_INIT];

        // Accumulate until the header terminator shows up.
        let header_len = loop {
            if let Some(end) = find_header_end(&buf) {
                break end;
            }
            if buf.len() > MAX_RESPONSE_BYTES {
                return Err(OriginError::ResponseTooLarge);
            }
            let n = timeout(self.config.read_timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| OriginError::ReadTimeout)?
                .map_err(|e| OriginError::RecvFailed(e.to_string()))?;
            if n == 0 {
                return Err(OriginError::MalformedResponse(
                    "connection closed before headers completed".to_string(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let (status, headers) = parse_head(&buf[..header_len])?;

        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok());

        if let Some(len) = content_length {
            if len > MAX_RESPONSE_BYTES {
                return Err(OriginError::ResponseTooLarge);
            }
            while buf.len() - header_len < len {
                let n = timeout(self.config.read_timeout, stream.read(&mut chunk))
                    .await
                    .map_err(|_| OriginError::ReadTimeout)?
                    .map_err(|e| OriginError::RecvFailed(e.to_string()))?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let end = (header_len + len).min(buf.len());
            Ok(OriginResponse {
                status,
                headers,
                body: buf[header_len..end].to_vec(),
            })
        } else {
            // Close-delimited body: read until EOF. A timeout with data
            // already buffered counts as end-of-body.
            loop {
                if buf.len() > MAX_RESPONSE_BYTES {
                    return Err(OriginError::ResponseTooLarge);
                }
                match timeout(self.config.read_timeout, stream.read(&mut chunk)).await {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                    Ok(Err(e)) => return Err(OriginError::RecvFailed(e.to_string())),
                    Err(_) if buf.len() > header_len => break,
                    Err(_) => return Err(OriginError::ReadTimeout),
                }
            }
            Ok(OriginResponse {
                status,
                headers,
                body: buf[header_len..].to_vec(),
            })
        }
    }
}

/// Deterministic 502 record used for every bridge failure.
fn bad_gateway(reason: &str) -> OriginResponse {
    OriginResponse {
        status: 502,
        headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
        body: format!("502 Bad Gateway: {reason}").into_bytes(),
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parses the status line and header block with httparse.
fn parse_head(head: &[u8]) -> Result<(u16, Vec<(String, String)>), OriginError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => {
            let status = response
                .code
                .ok_or_else(|| OriginError::MalformedResponse("missing status code".to_string()))?;
            let parsed = response
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            Ok((status, parsed))
        }
        Ok(httparse::Status::Partial) => Err(OriginError::MalformedResponse(
            "incomplete header block".to_string(),
        )),
        Err(e) => Err(OriginError::MalformedResponse(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_proto::{ConnectionType, Metadata};
    use tokio::net::TcpListener;

    fn request(dest: &str, metadata: &[(&str, &str)]) -> ConnectRequest {
        ConnectRequest {
            conn_type: ConnectionType::Http,
            dest: dest.to_string(),
            metadata: metadata
                .iter()
                .map(|(k, v)| Metadata {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
        }
    }

    fn bridge(port: u16) -> OriginBridge {
        let config = OriginConfig::parse(
            &format!("http://127.0.0.1:{port}"),
            Duration::from_millis(1_000),
            Duration::from_millis(2_000),
        )
        .unwrap();
        OriginBridge::new(config)
    }

    /// Serves one scripted response, returning the raw request it received.
    async fn scripted_origin(response: &'static [u8]) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 4096];
            // Read until the request (headers + any body) stops arriving;
            // the client holds the connection open for the response, so a
            // short read timeout marks the end of the request.
            loop {
                match timeout(Duration::from_millis(200), socket.read(&mut chunk)).await {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => received.extend_from_slice(&chunk[..n]),
                    _ => break,
                }
            }
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
            received
        });
        (port, handle)
    }

    #[test]
    fn test_parse_origin_url() {
        let c = OriginConfig::parse(
            "http://localhost:3000/api/",
            Duration::from_secs(5),
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(c.host, "localhost");
        assert_eq!(c.port, 3000);
        assert_eq!(c.path_prefix, "/api");

        let c = OriginConfig::parse(
            "http://origin.internal",
            Duration::from_secs(5),
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(c.port, 80);
        assert_eq!(c.path_prefix, "");
    }

    #[test]
    fn test_https_origin_downgrades() {
        let c = OriginConfig::parse(
            "https://localhost:8443",
            Duration::from_secs(5),
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(c.host, "localhost");
        assert_eq!(c.port, 8443);
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        assert!(matches!(
            OriginConfig::parse("ftp://x", Duration::from_secs(5), Duration::from_secs(30)),
            Err(OriginError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_get_with_content_length_body() {
        let (port, origin) = scripted_origin(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\n\r\nhello",
        )
        .await;

        let req = request(
            "/hello",
            &[("HttpMethod", "GET"), ("HttpHost", "example.invalid")],
        );
        let resp = bridge(port).forward(&req, &[]).await;

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");
        assert!(resp
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "text/plain"));

        let raw = origin.await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("GET /hello HTTP/1.1\r\n"));
        assert!(text.contains("Host: 127.0.0.1\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn test_post_forwards_body_and_headers() {
        let (port, origin) = scripted_origin(b"HTTP/1.1 204 No Content\r\n\r\n").await;

        let req = request(
            "/submit",
            &[
                ("HttpMethod", "POST"),
                ("HttpHost", "x.invalid"),
                ("HttpHeader:X-Trace", "abc123"),
                // Forwarded Host and Connection are dropped in favour of ours.
                ("HttpHeader:Host", "evil.invalid"),
                ("HttpHeader:Connection", "keep-alive"),
            ],
        );
        let resp = bridge(port).forward(&req, b"abcd").await;

        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());

        let raw = origin.await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("X-Trace: abc123\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(!text.contains("evil.invalid"));
        assert!(!text.contains("keep-alive"));
        assert!(text.ends_with("\r\n\r\nabcd"));
    }

    #[tokio::test]
    async fn test_close_delimited_body() {
        let (port, _origin) =
            scripted_origin(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nstream until close").await;

        let req = request("/", &[("HttpMethod", "GET")]);
        let resp = bridge(port).forward(&req, &[]).await;

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"stream until close");
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_502() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let req = request("/hello", &[("HttpMethod", "GET")]);
        let resp = bridge(port).forward(&req, &[]).await;

        assert_eq!(resp.status, 502);
        assert_eq!(
            resp.headers,
            vec![("Content-Type".to_string(), "text/plain".to_string())]
        );
        assert!(resp.body.starts_with(b"502 Bad Gateway: "));
    }

    #[tokio::test]
    async fn test_502_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let req = request("/", &[("HttpMethod", "GET")]);
        let bridge = bridge(port);
        let first = bridge.forward(&req, &[]).await;
        let second = bridge.forward(&req, &[]).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_dest_becomes_root() {
        let (port, origin) = scripted_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;

        let req = request("", &[("HttpMethod", "GET")]);
        let resp = bridge(port).forward(&req, &[]).await;
        assert_eq!(resp.status, 200);

        let raw = origin.await.unwrap();
        assert!(String::from_utf8_lossy(&raw).starts_with("GET / HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_oversized_content_length_is_502() {
        let (port, _origin) = scripted_origin(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10485760\r\n\r\n",
        )
        .await;

        let req = request("/", &[("HttpMethod", "GET")]);
        let resp = bridge(port).forward(&req, &[]).await;
        assert_eq!(resp.status, 502);
        assert!(resp.body.starts_with(b"502 Bad Gateway: "));
    }
}
