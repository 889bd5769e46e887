use std::{io, time::Duration};

use thiserror::Error;

use crate::protocol::{EncodeError, PoolError, TransportError};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("expected session start, received {0}")]
    Unexpected(String),

    #[error("no session start within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before session start: {0}")]
    Closed(String),
}

/// Errors surfaced to callers of [`Client`](crate::Client).
#[derive(Debug, Error)]
pub enum Error {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no invoke id available: {0}")]
    Exhausted(#[from] PoolError),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("command cancelled")]
    Cancelled,

    #[error("{keyword} rejected by server: {code}")]
    Rejected { keyword: String, code: String },

    #[error("invalid command: {0}")]
    Encode(#[from] EncodeError),

    #[error("connection error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Encode(e) => Error::Encode(e),
            TransportError::Io(e) => Error::Io(e),
        }
    }
}
