//! # tandem-app: Replicated application state
//!
//! The replication node treats application state as opaque: it creates and
//! removes participants, runs mutations under its mutation lock, and ships
//! full snapshots to the backup. [`Application`] is that interface.
//!
//! [`Roster`] is the reference application: a participant table with a
//! per-participant move counter.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tandem_types::{ParticipantId, ReplicationParams, Snapshot};
use thiserror::Error;

/// Result type for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Errors raised by application state.
#[derive(Debug, Error)]
pub enum AppError {
    /// Snapshot bytes could not be decoded.
    #[error("failed to restore snapshot: {0}")]
    Restore(#[source] postcard::Error),

    /// Mutation named a participant that is not in the application.
    #[error("unknown participant: {0}")]
    UnknownParticipant(ParticipantId),
}

/// State replicated from the primary to the backup.
///
/// Implementations must be deterministic: equal states produce byte-equal
/// snapshots, and `restore(snapshot())` reproduces the state exactly.
pub trait Application: Default + Send + 'static {
    /// Applies the parameters distributed with the first view.
    ///
    /// Only called on a freshly created instance.
    fn configure(&mut self, _params: ReplicationParams) {}

    /// Adds `id` if it is not already present. Returns true if added.
    fn create_participant(&mut self, id: &ParticipantId) -> bool;

    /// Removes `id`. Returns true if it was present.
    fn remove_participant(&mut self, id: &ParticipantId) -> bool;

    fn participants(&self) -> BTreeSet<ParticipantId>;

    /// Serializes the full state.
    fn snapshot(&self) -> Snapshot;

    /// Replaces the full state with a snapshot.
    fn restore(&mut self, snapshot: &Snapshot) -> AppResult<()>;
}

// ============================================================================
// Roster
// ============================================================================

/// Reference application: the set of participants and how many moves each
/// has made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    params: Option<ReplicationParams>,
    moves: BTreeMap<ParticipantId, u64>,
    /// Bumped on every mutation.
    revision: u64,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn params(&self) -> Option<ReplicationParams> {
        self.params
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn moves(&self, id: &ParticipantId) -> Option<u64> {
        self.moves.get(id).copied()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.moves.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Records one move by `id` and returns its new move count.
    pub fn record_move(&mut self, id: &ParticipantId) -> AppResult<u64> {
        let count = self
            .moves
            .get_mut(id)
            .ok_or_else(|| AppError::UnknownParticipant(id.clone()))?;
        *count += 1;
        let count = *count;
        self.revision += 1;
        Ok(count)
    }
}

impl Application for Roster {
    fn configure(&mut self, params: ReplicationParams) {
        self.params = Some(params);
    }

    fn create_participant(&mut self, id: &ParticipantId) -> bool {
        if self.moves.contains_key(id) {
            return false;
        }
        self.moves.insert(id.clone(), 0);
        self.revision += 1;
        true
    }

    fn remove_participant(&mut self, id: &ParticipantId) -> bool {
        let removed = self.moves.remove(id).is_some();
        if removed {
            self.revision += 1;
        }
        removed
    }

    fn participants(&self) -> BTreeSet<ParticipantId> {
        self.moves.keys().cloned().collect()
    }

    fn snapshot(&self) -> Snapshot {
        match postcard::to_allocvec(self) {
            Ok(bytes) => Snapshot::from(bytes),
            // Unreachable for these field types; an empty snapshot fails restore.
            Err(e) => {
                tracing::error!(error = %e, "failed to encode roster snapshot");
                Snapshot::default()
            }
        }
    }

    fn restore(&mut self, snapshot: &Snapshot) -> AppResult<()> {
        *self = postcard::from_bytes(snapshot.as_bytes()).map_err(AppError::Restore)?;
        Ok(())
    }
}
