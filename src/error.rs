use thiserror::Error;

/// Errors surfaced by the transport.
#[derive(Debug, Error)]
pub enum TrestleError {
    /// A codec operation ran out of buffer room. Either an internal defect
    /// or hostile input; fatal for the connection it occurs on.
    #[error("short buffer [{needed} > {available}]")]
    ShortBuffer { needed: usize, available: usize },

    /// The peer sent a message type this end cannot handle at this point.
    #[error("unexpected message type [{0}]")]
    UnexpectedMessageType(u8),

    /// The HELLO exchange failed: bad ack, wrong type, or timeout.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch [{0}]")]
    VersionMismatch(u8),

    /// The stream (or listener) has been shut down.
    #[error("closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TrestleError {
    pub(crate) fn short(needed: usize, available: usize) -> Self {
        TrestleError::ShortBuffer { needed, available }
    }
}

pub type Result<T> = std::result::Result<T, TrestleError>;
