//! gRPC transport for quorum-raft peer RPCs.
//!
//! - [`GrpcTransport`]: the client side, one cached channel per peer
//! - [`GrpcRpcServer`]: the server side, feeding a node's RPC inbox
//!
//! Both ends raise tonic's message size limits to [`MAX_MESSAGE_BYTES`] so
//! a full AppendEntries batch or snapshot chunk fits in one call.

pub mod client;
pub mod proto;
pub mod server;

pub use client::GrpcTransport;
pub use server::{GrpcRpcServer, PeerService};

/// Largest message either end will encode or decode.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
