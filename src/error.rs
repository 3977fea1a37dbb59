use std::io;
use thiserror::Error;

/// Errors surfaced by the DHT.
///
/// Transport-level failures on a single RPC are handled internally by
/// recording a failure against the contact; the variants here are the ones
/// that terminate an exchange or a connection.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported wire format version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown rpc type {0}")]
    UnknownRpcType(u8),

    #[error("expected {expected:?} response, got {actual:?}")]
    UnexpectedRpc {
        expected: crate::protocol::RpcKind,
        actual: crate::protocol::RpcKind,
    },

    #[error("list of {0} entries does not fit a single length byte")]
    ListTooLong(usize),

    #[error("packet is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unexpected stream type byte {0:#04x}")]
    UnexpectedStreamType(u8),
}
