//! Node error types.

use std::net::SocketAddr;

use tandem_app::AppError;
use tandem_types::{ParticipantId, Role};
use tandem_viewservice::ViewServiceError;
use tandem_wire::WireError;
use thiserror::Error;

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors that can occur while running a replication node.
///
/// Peer failures never show up here: a dead primary, backup or client is
/// turned into a failure report by the loop that notices it. Anything that
/// does escape [`Node::run`](crate::Node::run) is fatal to the node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// View service error.
    #[error("view service error: {0}")]
    ViewService(#[from] ViewServiceError),

    /// Application state error.
    #[error("application error: {0}")]
    App(#[from] AppError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// A participant worker panicked or hit an unrecoverable error.
    #[error("worker for {participant} failed: {reason}")]
    WorkerFailed {
        participant: ParticipantId,
        reason: String,
    },

    /// The mutation lock was poisoned by a panicking worker.
    #[error("application state lock poisoned")]
    Poisoned,

    /// A worker inbox is full.
    #[error("worker queue full for {0}")]
    Backpressure(ParticipantId),

    /// Operation requires the primary role.
    #[error("not the primary (role: {0})")]
    NotPrimary(Role),

    /// Operation requires a replica (primary or synchronized backup).
    #[error("no replica on this node (role: {0})")]
    NoReplica(Role),

    /// The mutation was dropped before it ran (view change or shutdown).
    #[error("mutation for {0} was dropped before completion")]
    MutationDropped(ParticipantId),

    /// Node is shutting down.
    #[error("node shutdown")]
    Shutdown,
}

impl NodeError {
    /// Returns true if the caller may retry once the view settles.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotPrimary(_) | Self::Backpressure(_) | Self::MutationDropped(_)
        )
    }
}
