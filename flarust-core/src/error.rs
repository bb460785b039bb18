//! Crate-level error type.

use thiserror::Error;

/// Errors produced by the compression framing layer (`compression` module).
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snappy error: {0}")]
    Snappy(#[from] snap::Error),

    #[error("malformed compressed data: {0}")]
    Malformed(String),

    #[error("unknown compression algorithm: {0}")]
    UnknownAlgorithm(String),
}

/// Errors shared across `flarust-core` consumers: meta (de)serialization and
/// compression framing.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error("failed to decode rpc meta: {0}")]
    MetaDecode(#[from] prost::DecodeError),

    #[error("failed to encode rpc meta: {0}")]
    MetaEncode(#[from] prost::EncodeError),
}
