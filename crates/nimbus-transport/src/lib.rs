//! QUIC transport session for the nimbus tunnel client.
//!
//! Wraps quinn's connection and stream handling behind a session object that
//! owns all per-stream state and delivers an ordered event feed
//! ([`SessionEvent`]) to the tunnel orchestrator, which is written as a pure
//! event handler. Client mode only; the edge initiates every data stream.

pub mod config;
pub mod session;

pub use config::EdgeConfig;
pub use session::{SessionEvent, StreamKind, TransportSession};

use thiserror::Error;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("stream {0} not found")]
    StreamNotFound(u64),

    #[error("stream {0} already carries a final marker")]
    StreamFinished(u64),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
