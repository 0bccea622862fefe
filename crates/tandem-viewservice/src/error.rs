//! Error types for the view service and its client.

use std::net::SocketAddr;

use tandem_wire::WireError;
use thiserror::Error;

/// Result type for view-service operations.
pub type ViewServiceResult<T> = Result<T, ViewServiceError>;

/// Errors raised by the view-service server and client.
#[derive(Debug, Error)]
pub enum ViewServiceError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// No View reply after every resend.
    #[error("view service at {addr} did not answer after {attempts} attempts")]
    Unavailable { addr: SocketAddr, attempts: u32 },
}

impl ViewServiceError {
    /// Returns true if the view service simply did not answer in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
