//! Tunnel client: owns the session lifecycle once credentials are known.
//!
//! [`Tunnel`] drives the whole exchange: it dials the edge over
//! `nimbus-transport`, registers on the control stream, and serves each
//! remote-initiated stream by proxying the request to a local origin through
//! [`origin::OriginBridge`]. [`quick_tunnel`] covers the bootstrap that
//! produces credentials for users who have none.

pub mod config;
pub mod origin;
pub mod quick_tunnel;
pub mod tunnel;

pub use config::TunnelConfig;
pub use origin::{OriginBridge, OriginConfig, OriginResponse};
pub use quick_tunnel::{QuickTunnelClient, QuickTunnelCredentials};
pub use tunnel::{ShutdownHandle, Tunnel, TunnelError, TunnelState};
