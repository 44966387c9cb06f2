use std::time::Duration;

use thiserror::Error;

/// Errors produced by the codec and by `Session` operations.
#[derive(Error, Debug)]
pub enum StompError {
    /// Underlying read/write failure or EOF. The session is closed once one
    /// of these surfaces from the transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The decoder rejected an inbound frame (no command line, truncated
    /// header block, header line without a colon).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// An unexpected frame for the current state, e.g. a non-CONNECTED frame
    /// during the handshake or a DISCONNECT receipt that does not match.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A builder rejected caller input (unknown ack mode, empty required
    /// field, NUL in an un-length-delimited body).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted after DISCONNECT or after the transport reached
    /// EOF.
    #[error("session closed")]
    SessionClosed,

    /// No frame (not even a heart-beat pulse) arrived within the negotiated
    /// receive interval.
    #[error("heart-beat timeout: no frame within {0:?}")]
    HeartBeatTimeout(Duration),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StompError>;
