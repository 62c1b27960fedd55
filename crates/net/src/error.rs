//! Network error types

use std::io;

use crate::protocol::PeerAddress;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: PeerAddress,
        #[source]
        source: io::Error,
    },

    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: PeerAddress,
        #[source]
        source: io::Error,
    },

    #[error("Send failed: {0}")]
    Send(#[from] SendError),

    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Serialization failed: {0}")]
    Encode(serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Refusing to dial own address")]
    SelfDial,

    #[error("Node is shut down")]
    ShutDown,

    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),
}

/// A single frame could not be turned into a message.
///
/// The frame is dropped; the connection it arrived on stays open.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Empty frame")]
    Empty,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

/// Queuing a frame on a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Connection closed")]
    Closed,

    #[error("Send queue stayed full past the timeout")]
    Timeout,
}
