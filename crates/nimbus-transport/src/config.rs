//! Edge transport configuration.

use crate::{TransportError, TransportResult};
use nimbus_proto::{EDGE_ALPN, EDGE_SNI};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the QUIC session to the edge.
///
/// The defaults carry the contract-fixed interoperability parameters: the
/// `argotunnel` ALPN, the edge SNI, and a BBR congestion controller.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// ALPN identifier offered during the handshake.
    pub alpn: String,

    /// TLS server name. Fixed by the edge contract, independent of the
    /// address actually dialed.
    pub server_name: String,

    /// Keep-alive interval.
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout before the connection is considered dead.
    pub max_idle_timeout: Duration,

    /// Extra DER root certificates. Empty means the webpki root store.
    pub root_certs: Vec<Vec<u8>>,
}

impl EdgeConfig {
    /// Client configuration with the edge defaults.
    pub fn client_default() -> Self {
        Self {
            alpn: EDGE_ALPN.to_string(),
            server_name: EDGE_SNI.to_string(),
            keep_alive_interval: Duration::from_secs(5),
            max_idle_timeout: Duration::from_secs(30),
            root_certs: Vec::new(),
        }
    }

    /// Override the TLS server name (tests dial local mock edges).
    pub fn with_server_name(mut self, name: &str) -> Self {
        self.server_name = name.to_string();
        self
    }

    /// Trust an additional DER-encoded root certificate instead of the
    /// webpki roots.
    pub fn with_root_certificate(mut self, der: Vec<u8>) -> Self {
        self.root_certs.push(der);
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.alpn.is_empty() {
            return Err(TransportError::Configuration(
                "ALPN must not be empty".to_string(),
            ));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::Configuration(
                "keep-alive interval must be > 0".to_string(),
            ));
        }
        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::Configuration(
                "idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the quinn client configuration: rustls with the configured
    /// roots and ALPN, BBR congestion control, keep-alive and idle timeout.
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        let mut roots = quinn::rustls::RootCertStore::empty();
        if self.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for der in &self.root_certs {
                roots
                    .add(quinn::rustls::pki_types::CertificateDer::from(der.clone()))
                    .map_err(|e| {
                        TransportError::Configuration(format!("invalid root cert: {e}"))
                    })?;
            }
        }

        let mut crypto = quinn::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        crypto.alpn_protocols = vec![self.alpn.as_bytes().to_vec()];

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(self.max_idle_timeout.try_into().map_err(|_| {
            TransportError::Configuration("idle timeout out of range".to_string())
        })?));
        transport.congestion_controller_factory(Arc::new(quinn::congestion::BbrConfig::default()));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }
}
