//! Shared primitives for every flarust protocol driver.
//!
//! - [`buffer`]: the scatter-list zero-copy buffer (§4.1) everything else is
//!   built on.
//! - [`compression`]: codec-agnostic streaming compress/decompress over that
//!   buffer (§4.2).
//! - [`meta`]: the protocol-agnostic RPC envelope (`RpcMeta` and friends)
//!   every wire-protocol driver translates its native header into.
//! - [`status`]: the framework status-code space `meta::Status` lives in,
//!   plus the reserved/user-code boundary.
//! - [`error`]: error types for the above.

pub mod buffer;
pub mod compression;
pub mod error;
pub mod status;

/// Generated from `proto/rpc_meta.proto`.
pub mod meta {
    include!(concat!(env!("OUT_DIR"), "/flarust.rpc.rs"));
}

pub use error::{CompressionError, CoreError};
