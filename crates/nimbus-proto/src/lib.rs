//! Wire protocol for the nimbus tunnel client.
//!
//! This crate implements the subset of the edge protocol the client speaks:
//!
//! - a hand-written single-segment Cap'n Proto encoder/decoder ([`codec`]),
//! - the signature + version preamble around data-stream messages and the
//!   incremental message-size probe ([`frame`]),
//! - the registration RPC sequence on the control stream ([`rpc`]),
//! - the per-stream `ConnectRequest`/`ConnectResponse` exchange ([`connect`]).
//!
//! Nothing here performs I/O; every function operates on byte slices so the
//! transport layer can feed partially received buffers through the decoders.

pub mod codec;
pub mod connect;
pub mod frame;
pub mod rpc;
mod types;

pub use codec::{Builder, CodecError, Reader};
pub use connect::{ConnectRequest, ConnectResponse};
pub use frame::FrameError;
pub use rpc::RpcError;
pub use types::*;
