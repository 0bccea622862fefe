//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while framing or decoding messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame header names a message type outside the protocol.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u32),

    /// Frame header announces a payload larger than the protocol allows.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Datagram shorter than a frame header.
    #[error("truncated frame: {0} bytes")]
    Truncated(usize),

    /// Datagram length disagrees with the length in its header.
    #[error("length mismatch: header says {declared} bytes, datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Payload failed to decode.
    #[error("failed to decode {kind} payload: {source}")]
    Decode {
        kind: &'static str,
        source: postcard::Error,
    },

    /// Payload failed to encode.
    #[error("failed to encode {kind} payload: {source}")]
    Encode {
        kind: &'static str,
        source: postcard::Error,
    },
}

impl WireError {
    /// Returns true if the peer went away (EOF, reset, broken pipe).
    ///
    /// Closed connections are a liveness signal, not a protocol violation.
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}
