//! Tunnel orchestrator: registration and per-request dispatch.
//!
//! The orchestrator is a pure event handler over the transport session.
//! After the handshake it opens the control stream, writes the Bootstrap and
//! Call frames back-to-back, and parses the control stream incrementally
//! until the registration answer arrives. In the ready state every
//! remote-initiated stream carries one request: preamble + ConnectRequest +
//! body bytes in, preamble + ConnectResponse + body + final marker out.

use crate::config::TunnelConfig;
use crate::origin::{OriginBridge, OriginConfig, OriginError};
use nimbus_proto::{
    frame, rpc, ConnectRequest, ConnectResponse, ConnectionDetails, RegistrationError,
    RegistrationOutcome,
};
use nimbus_transport::{SessionEvent, StreamKind, TransportError, TransportSession};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Init,
    Connecting,
    Registering,
    Ready,
    Draining,
    Closed,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Origin(#[from] OriginError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("registration refused: {}", .0.cause)]
    Registration(RegistrationError),

    #[error("disconnected: {0}")]
    Disconnected(String),
}

/// Triggers a graceful drain of a running [`Tunnel`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle(mpsc::Sender<()>);

impl ShutdownHandle {
    pub async fn shutdown(&self) {
        let _ = self.0.send(()).await;
    }
}

/// One tunnel session: transport, registration state, and origin bridge.
#[derive(Debug)]
pub struct Tunnel {
    config: TunnelConfig,
    session: TransportSession,
    origin: OriginBridge,
    state: TunnelState,
    control_stream: Option<u64>,
    /// Bytes of the control stream's receive buffer already consumed.
    ctrl_parsed: usize,
    details: Option<ConnectionDetails>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Tunnel {
    /// Validates the configuration and dials the edge.
    pub async fn connect(config: TunnelConfig) -> Result<Self, TunnelError> {
        config.validate().map_err(TunnelError::Config)?;
        let origin = OriginBridge::new(OriginConfig::parse(
            &config.origin_url,
            config.connect_timeout,
            config.read_timeout,
        )?);

        info!(
            edge = %config.edge_host,
            port = config.edge_port,
            origin = %config.origin_url,
            "connecting tunnel"
        );
        let session =
            TransportSession::connect(&config.edge, &config.edge_host, config.edge_port).await?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok(Self {
            config,
            session,
            origin,
            state: TunnelState::Connecting,
            control_stream: None,
            ctrl_parsed: 0,
            details: None,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Registration result, available once the state reaches `Ready`.
    pub fn connection_details(&self) -> Option<&ConnectionDetails> {
        self.details.as_ref()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Drives the session to completion. Returns `Ok(())` on a clean
    /// (drained) shutdown and an error on transport failure or a fatal
    /// registration result.
    pub async fn run(mut self) -> Result<(), TunnelError> {
        loop {
            let draining = self.state == TunnelState::Draining;
            tokio::select! {
                event = self.session.next_event() => {
                    if let Some(result) = self.handle_event(event).await {
                        if result.is_err() {
                            self.session.close();
                            self.state = TunnelState::Closed;
                        }
                        return result;
                    }
                }
                _ = self.shutdown_rx.recv(), if !draining => {
                    info!("shutdown requested, draining session");
                    self.state = TunnelState::Draining;
                    self.session.close();
                }
            }
        }
    }

    /// Handles one session event; `Some(result)` ends the run loop.
    async fn handle_event(&mut self, event: SessionEvent) -> Option<Result<(), TunnelError>> {
        match event {
            SessionEvent::Connected => match self.register().await {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            },
            SessionEvent::Disconnected { reason } => {
                debug!(reason = %reason, "transport disconnected");
                let was_draining = self.state == TunnelState::Draining;
                self.state = TunnelState::Closed;
                if was_draining {
                    Some(Ok(()))
                } else {
                    Some(Err(TunnelError::Disconnected(reason)))
                }
            }
            SessionEvent::StreamOpenedRemote(stream_id) => {
                debug!(stream_id, "edge opened data stream");
                None
            }
            SessionEvent::StreamData { stream_id, .. } | SessionEvent::StreamFin(stream_id) => {
                if Some(stream_id) == self.control_stream {
                    match self.parse_control() {
                        Ok(()) => None,
                        Err(e) => Some(Err(e)),
                    }
                } else {
                    self.try_handle_data_stream(stream_id).await;
                    None
                }
            }
            SessionEvent::StreamReset(stream_id) => {
                if Some(stream_id) == self.control_stream {
                    Some(Err(TunnelError::Protocol(
                        "control stream reset".to_string(),
                    )))
                } else {
                    debug!(stream_id, "data stream reset");
                    None
                }
            }
        }
    }

    /// Opens the control stream and sends the Bootstrap + Call frames in one
    /// write. The stream stays open for the whole session, so no final
    /// marker is set.
    async fn register(&mut self) -> Result<(), TunnelError> {
        let stream_id = self.session.open_stream(true).await?;
        self.control_stream = Some(stream_id);

        let frames = rpc::encode_registration(
            &self.config.auth(),
            &self.config.tunnel_id,
            0,
            &self.config.connection_options(),
        )
        .map_err(|e| TunnelError::Protocol(format!("failed to encode registration: {e}")))?;

        debug!(stream_id, len = frames.len(), "sending registration");
        self.session.send(stream_id, &frames, false).await?;
        self.state = TunnelState::Registering;
        Ok(())
    }

    /// Pulls complete RPC messages out of the control stream buffer. The
    /// stream never carries a final marker, so parsing is driven purely by
    /// the size probe against `ctrl_parsed`.
    fn parse_control(&mut self) -> Result<(), TunnelError> {
        let Some(control_id) = self.control_stream else {
            return Ok(());
        };
        loop {
            let decoded = {
                let Some(entry) = self.session.stream(control_id) else {
                    return Ok(());
                };
                let pending = &entry.recv_buffer()[self.ctrl_parsed..];
                match frame::probe_message_size(pending) {
                    Ok(None) => break,
                    Ok(Some(size)) => {
                        let result = rpc::decode_registration_return(&pending[..size]);
                        (size, result)
                    }
                    Err(e) => {
                        return Err(TunnelError::Protocol(format!(
                            "control stream framing: {e}"
                        )));
                    }
                }
            };
            let (size, result) = decoded;
            self.ctrl_parsed += size;

            match result {
                Ok(Some(RegistrationOutcome::Connected(details))) => {
                    info!(
                        uuid = %details.uuid_string(),
                        location = %details.location,
                        remotely_managed = details.remotely_managed,
                        "tunnel registered"
                    );
                    self.details = Some(details);
                    self.state = TunnelState::Ready;
                }
                Ok(Some(RegistrationOutcome::Refused(refusal))) => {
                    error!(
                        cause = %refusal.cause,
                        should_retry = refusal.should_retry,
                        retry_after_ns = refusal.retry_after_ns,
                        "registration refused"
                    );
                    return Err(TunnelError::Registration(refusal));
                }
                Ok(None) => {
                    debug!("skipping control message that is not the registration answer");
                }
                Err(e) => {
                    return Err(TunnelError::Protocol(format!(
                        "invalid control message: {e}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Attempts to serve a data stream. Called on every delivery for the
    /// stream until one complete request has been parsed; afterwards the
    /// stream only accumulates body bytes that were already consumed.
    async fn try_handle_data_stream(&mut self, stream_id: u64) {
        // Streams racing ahead of the registration answer are still served;
        // once the session is draining or closed they are not.
        if !matches!(self.state, TunnelState::Ready | TunnelState::Registering) {
            return;
        }

        enum Parsed {
            NotYet,
            Abandon(String),
            Complete(ConnectRequest, Vec<u8>),
        }

        let parsed = {
            let Some(entry) = self.session.stream(stream_id) else {
                return;
            };
            if entry.request_handled() || entry.kind() == StreamKind::Control {
                return;
            }
            let buf = entry.recv_buffer();
            if buf.len() < frame::PREAMBLE_LEN {
                Parsed::NotYet
            } else {
                match frame::strip_preamble(buf) {
                    Err(e) => Parsed::Abandon(e.to_string()),
                    Ok(rest) => match frame::probe_message_size(rest) {
                        Ok(None) => Parsed::NotYet,
                        Err(e) => Parsed::Abandon(e.to_string()),
                        Ok(Some(size)) => match ConnectRequest::decode(&rest[..size]) {
                            Err(e) => Parsed::Abandon(e.to_string()),
                            Ok(request) => {
                                let body = &rest[size..];
                                // A declared Content-Length bounds the body;
                                // hold off until those bytes are buffered
                                // (the edge sends no final marker here).
                                let announced = request
                                    .forwarded_headers()
                                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                                    .and_then(|(_, v)| v.trim().parse::<usize>().ok());
                                match announced {
                                    Some(len) if body.len() < len && !entry.received_final() => {
                                        Parsed::NotYet
                                    }
                                    _ => Parsed::Complete(request, body.to_vec()),
                                }
                            }
                        },
                    },
                }
            }
        };

        match parsed {
            Parsed::NotYet => {}
            Parsed::Abandon(reason) => {
                // No response; the peer's request times out on its side.
                warn!(stream_id, reason = %reason, "abandoning malformed data stream");
                if let Some(entry) = self.session.stream_mut(stream_id) {
                    entry.mark_request_handled();
                }
            }
            Parsed::Complete(request, body) => {
                if let Some(entry) = self.session.stream_mut(stream_id) {
                    entry.mark_request_handled();
                }
                info!(
                    stream_id,
                    method = request.method().unwrap_or("?"),
                    dest = %request.dest,
                    host = request.host().unwrap_or("?"),
                    body_len = body.len(),
                    "handling request"
                );
                self.serve_request(stream_id, &request, &body).await;
            }
        }
    }

    /// Proxies one request to the origin and writes the response back with
    /// the final marker. Transport errors are logged, not fatal; the session
    /// will surface them as `Disconnected` if the connection is gone.
    async fn serve_request(&mut self, stream_id: u64, request: &ConnectRequest, body: &[u8]) {
        let origin_response = self.origin.forward(request, body).await;

        let response = ConnectResponse::from_origin(origin_response.status, &origin_response.headers);
        let head = match response.encode() {
            Ok(head) => head,
            Err(e) => {
                warn!(stream_id, error = %e, "failed to encode response, abandoning stream");
                return;
            }
        };

        if let Err(e) = self.session.send(stream_id, &head, false).await {
            warn!(stream_id, error = %e, "failed to send response head");
            return;
        }
        if let Err(e) = self
            .session
            .send(stream_id, &origin_response.body, true)
            .await
        {
            warn!(stream_id, error = %e, "failed to send response body");
        }
        debug!(
            stream_id,
            status = origin_response.status,
            body_len = origin_response.body.len(),
            "response written"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_bad_config() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut config = TunnelConfig::new([0u8; 16], String::new(), b"secret".to_vec());
        config.origin_url = "http://localhost:8080".to_string();
        let err = rt.block_on(Tunnel::connect(config)).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[test]
    fn test_connect_rejects_bad_origin() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut config = TunnelConfig::new([0u8; 16], "acct".to_string(), b"secret".to_vec());
        config.origin_url = "ftp://nope".to_string();
        let err = rt.block_on(Tunnel::connect(config)).unwrap_err();
        assert!(matches!(err, TunnelError::Origin(_)));
    }
}
