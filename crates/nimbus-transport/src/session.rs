//! Transport session: one QUIC connection, its streams, and their events.
//!
//! The session owns a `stream_id -> StreamEntry` table. Stream entries never
//! reference the session; helper tasks (the acceptor and per-stream readers)
//! identify streams by id and feed an internal channel that `next_event`
//! drains, so the orchestrator observes a single ordered event feed and all
//! table mutation happens on its task.

use crate::{EdgeConfig, TransportError, TransportResult};
use bytes::{Bytes, BytesMut};
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Receive buffer cap for the control stream.
pub const CONTROL_RECV_CAP: usize = 64 * 1024;

/// Receive buffer cap for data streams.
pub const DATA_RECV_CAP: usize = 1024 * 1024;

/// Initial receive buffer allocation; grows by doubling up to the cap.
const INITIAL_RECV_CAPACITY: usize = 4096;

/// Chunk size for stream reads.
const RECV_CHUNK: usize = 8192;

/// Role of a stream within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Control,
    Data,
}

/// Events delivered to the orchestrator.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake complete; local streams may be opened.
    Connected,
    /// Peer close, reset, or transport failure. Terminal.
    Disconnected { reason: String },
    /// The peer opened a bidirectional stream.
    StreamOpenedRemote(u64),
    /// Bytes arrived on a stream. They are already appended to the stream's
    /// receive buffer when the event is delivered.
    StreamData { stream_id: u64, bytes: Bytes },
    /// The peer sent its final marker; the receive buffer is complete.
    StreamFin(u64),
    /// The stream was reset (by the peer, or locally on a buffer overrun)
    /// and its state discarded.
    StreamReset(u64),
}

/// Raw notifications from the acceptor and reader tasks.
enum RawEvent {
    Opened { stream_id: u64, send: SendStream },
    Data { stream_id: u64, bytes: Bytes },
    Fin { stream_id: u64 },
    Reset { stream_id: u64 },
    Closed { reason: String },
}

/// Per-stream state owned by the session.
#[derive(Debug)]
pub struct StreamEntry {
    kind: StreamKind,
    send: Option<SendStream>,
    recv_buf: BytesMut,
    received_final: bool,
    sent_final: bool,
    request_handled: bool,
}

impl StreamEntry {
    fn new(kind: StreamKind, send: Option<SendStream>) -> Self {
        Self {
            kind,
            send,
            recv_buf: BytesMut::with_capacity(INITIAL_RECV_CAPACITY),
            received_final: false,
            sent_final: false,
            request_handled: false,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Everything received on this stream so far, in network order.
    pub fn recv_buffer(&self) -> &[u8] {
        &self.recv_buf
    }

    pub fn received_final(&self) -> bool {
        self.received_final
    }

    pub fn request_handled(&self) -> bool {
        self.request_handled
    }

    /// Marks the stream's request as consumed; no further parsing happens.
    pub fn mark_request_handled(&mut self) {
        self.request_handled = true;
    }

    fn recv_cap(&self) -> usize {
        match self.kind {
            StreamKind::Control => CONTROL_RECV_CAP,
            StreamKind::Data => DATA_RECV_CAP,
        }
    }
}

/// One QUIC session to the edge and all of its streams.
#[derive(Debug)]
pub struct TransportSession {
    endpoint: Endpoint,
    connection: Connection,
    streams: HashMap<u64, StreamEntry>,
    raw_tx: mpsc::Sender<RawEvent>,
    raw_rx: mpsc::Receiver<RawEvent>,
    connected_delivered: bool,
    disconnected: bool,
}

impl TransportSession {
    /// Dials the edge and completes the QUIC handshake.
    pub async fn connect(
        config: &EdgeConfig,
        edge_host: &str,
        edge_port: u16,
    ) -> TransportResult<Self> {
        config.validate()?;

        let addr = resolve_edge(edge_host, edge_port).await?;
        debug!(%addr, host = edge_host, "connecting to edge");

        let bind: SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().expect("literal bind address")
        } else {
            "0.0.0.0:0".parse().expect("literal bind address")
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(config.build_client_config()?);

        let connection = endpoint
            .connect(addr, &config.server_name)
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        debug!(%addr, "QUIC handshake completed");

        let (raw_tx, raw_rx) = mpsc::channel(64);
        tokio::spawn(accept_streams(connection.clone(), raw_tx.clone()));

        Ok(Self {
            endpoint,
            connection,
            streams: HashMap::new(),
            raw_tx,
            raw_rx,
            connected_delivered: false,
            disconnected: false,
        })
    }

    /// Opens a locally-initiated bidirectional stream and returns its id.
    pub async fn open_stream(&mut self, is_control: bool) -> TransportResult<u64> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let stream_id = local_stream_id(send.id());

        let kind = if is_control {
            StreamKind::Control
        } else {
            StreamKind::Data
        };
        self.streams.insert(stream_id, StreamEntry::new(kind, Some(send)));
        tokio::spawn(read_stream(recv, stream_id, self.raw_tx.clone()));

        debug!(stream_id, control = is_control, "opened stream");
        Ok(stream_id)
    }

    /// Queues `bytes` on the stream's send side, in order with any earlier
    /// sends. With `fin` set the final marker follows the bytes and no
    /// further send is allowed on the stream.
    pub async fn send(&mut self, stream_id: u64, bytes: &[u8], fin: bool) -> TransportResult<()> {
        let entry = self
            .streams
            .get_mut(&stream_id)
            .ok_or(TransportError::StreamNotFound(stream_id))?;
        if entry.sent_final {
            return Err(TransportError::StreamFinished(stream_id));
        }
        let send = entry
            .send
            .as_mut()
            .ok_or(TransportError::StreamFinished(stream_id))?;

        if !bytes.is_empty() {
            send.write_all(bytes)
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
        }
        if fin {
            send.finish()
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            entry.sent_final = true;
        }

        trace!(stream_id, len = bytes.len(), fin, "queued stream bytes");
        Ok(())
    }

    /// Initiates a graceful close with reason code 0.
    pub fn close(&self) {
        debug!("closing transport session");
        self.connection.close(VarInt::from_u32(0), b"");
    }

    /// Looks up a stream entry for incremental parsing.
    pub fn stream(&self, stream_id: u64) -> Option<&StreamEntry> {
        self.streams.get(&stream_id)
    }

    pub fn stream_mut(&mut self, stream_id: u64) -> Option<&mut StreamEntry> {
        self.streams.get_mut(&stream_id)
    }

    /// Delivers the next session event. The first call yields `Connected`;
    /// after `Disconnected` the session only repeats it.
    pub async fn next_event(&mut self) -> SessionEvent {
        if !self.connected_delivered {
            self.connected_delivered = true;
            return SessionEvent::Connected;
        }
        if self.disconnected {
            return SessionEvent::Disconnected {
                reason: "session closed".to_string(),
            };
        }

        loop {
            let raw = match self.raw_rx.recv().await {
                Some(raw) => raw,
                None => {
                    self.disconnected = true;
                    self.streams.clear();
                    return SessionEvent::Disconnected {
                        reason: "event channel closed".to_string(),
                    };
                }
            };

            match raw {
                RawEvent::Opened { stream_id, send } => {
                    self.streams
                        .insert(stream_id, StreamEntry::new(StreamKind::Data, Some(send)));
                    return SessionEvent::StreamOpenedRemote(stream_id);
                }
                RawEvent::Data { stream_id, bytes } => {
                    let Some(entry) = self.streams.get_mut(&stream_id) else {
                        trace!(stream_id, "data for unknown stream, dropping");
                        continue;
                    };
                    if entry.recv_buf.len() + bytes.len() > entry.recv_cap() {
                        warn!(
                            stream_id,
                            cap = entry.recv_cap(),
                            "receive buffer cap exceeded, resetting stream"
                        );
                        if let Some(mut send) = entry.send.take() {
                            let _ = send.reset(VarInt::from_u32(0));
                        }
                        self.streams.remove(&stream_id);
                        return SessionEvent::StreamReset(stream_id);
                    }
                    entry.recv_buf.extend_from_slice(&bytes);
                    return SessionEvent::StreamData { stream_id, bytes };
                }
                RawEvent::Fin { stream_id } => {
                    if let Some(entry) = self.streams.get_mut(&stream_id) {
                        entry.received_final = true;
                    }
                    return SessionEvent::StreamFin(stream_id);
                }
                RawEvent::Reset { stream_id } => {
                    self.streams.remove(&stream_id);
                    return SessionEvent::StreamReset(stream_id);
                }
                RawEvent::Closed { reason } => {
                    self.disconnected = true;
                    self.streams.clear();
                    return SessionEvent::Disconnected { reason };
                }
            }
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        // Releases sockets promptly even when the caller skips close().
        self.endpoint.close(VarInt::from_u32(0), b"");
    }
}

/// Accepts peer-initiated bidirectional streams until the connection ends.
async fn accept_streams(connection: Connection, tx: mpsc::Sender<RawEvent>) {
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let stream_id = remote_stream_id(send.id());
                trace!(stream_id, "peer opened stream");
                if tx.send(RawEvent::Opened { stream_id, send }).await.is_err() {
                    return;
                }
                tokio::spawn(read_stream(recv, stream_id, tx.clone()));
            }
            Err(e) => {
                let _ = tx
                    .send(RawEvent::Closed {
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }
}

/// Reads one stream to its end, forwarding chunks in network order.
async fn read_stream(mut recv: RecvStream, stream_id: u64, tx: mpsc::Sender<RawEvent>) {
    loop {
        match recv.read_chunk(RECV_CHUNK, true).await {
            Ok(Some(chunk)) => {
                if tx
                    .send(RawEvent::Data {
                        stream_id,
                        bytes: chunk.bytes,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(RawEvent::Fin { stream_id }).await;
                return;
            }
            Err(quinn::ReadError::Reset(_)) => {
                let _ = tx.send(RawEvent::Reset { stream_id }).await;
                return;
            }
            Err(e) => {
                // Connection-level failures surface through the acceptor.
                trace!(stream_id, error = %e, "stream read ended");
                return;
            }
        }
    }
}

/// Wire id of a locally-initiated bidirectional stream. This endpoint is
/// always the client, so the id is `index * 4`; the first such stream (the
/// control stream) is id 0.
fn local_stream_id(id: quinn::StreamId) -> u64 {
    id.index() * 4
}

/// Wire id of a peer-initiated bidirectional stream (`index * 4 + 1`).
fn remote_stream_id(id: quinn::StreamId) -> u64 {
    id.index() * 4 + 1
}

/// Resolves the edge host, preferring IPv4 addresses.
async fn resolve_edge(host: &str, port: u16) -> TransportResult<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::Connection(format!("failed to resolve {host}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::Connection(format!("no addresses found for {host}")))
}
