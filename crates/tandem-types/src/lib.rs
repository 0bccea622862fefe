//! # tandem-types: Core types for `tandem`
//!
//! This crate contains the value types shared by every `tandem` crate:
//! - Participant identity ([`ParticipantId`])
//! - View ordering ([`Generation`])
//! - Role assignment ([`View`], [`Role`])
//! - Application parameters distributed with every view ([`ReplicationParams`])
//! - Opaque replicated state ([`Snapshot`])

use std::{
    fmt::{Debug, Display},
    net::SocketAddr,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Participant Identity - Clone (short validated string)
// ============================================================================

/// Maximum length of a participant name in bytes.
pub const MAX_PARTICIPANT_NAME_LEN: usize = 64;

/// Error returned when a participant name fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidParticipantId {
    #[error("participant name is empty")]
    Empty,

    #[error("participant name is {0} bytes, maximum is {MAX_PARTICIPANT_NAME_LEN}")]
    TooLong(usize),

    #[error("participant name contains a control character")]
    ControlCharacter,
}

/// Name of a participant in the replication group.
///
/// Names are chosen by the participants themselves and are the only
/// identity the view service knows about. Validation happens on
/// construction and on deserialization, so a decoded message can never
/// carry an empty or oversized name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Creates a participant id, validating the name.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidParticipantId> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidParticipantId::Empty);
        }
        if name.len() > MAX_PARTICIPANT_NAME_LEN {
            return Err(InvalidParticipantId::TooLong(name.len()));
        }
        if name.chars().any(char::is_control) {
            return Err(InvalidParticipantId::ControlCharacter);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = InvalidParticipantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ParticipantId {
    type Error = InvalidParticipantId;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ParticipantId {
    type Err = InvalidParticipantId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// Generation - Copy (8-byte monotonic counter)
// ============================================================================

/// Monotonically increasing view generation.
///
/// The view service assigns generation 1 to the first view and bumps it by
/// one on every reconfiguration. Generations are the sole ordering
/// authority: a node never applies a view whose generation is not strictly
/// greater than the last one it applied.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Generation(u64);

impl Generation {
    /// "No view applied yet". Never carried by an emitted view.
    pub const ZERO: Generation = Generation(0);

    /// Generation of the first view.
    pub const FIRST: Generation = Generation(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next generation (incremented by 1).
    pub fn next(&self) -> Self {
        Generation(self.0.saturating_add(1))
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gen:{}", self.0)
    }
}

impl From<u64> for Generation {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Generation> for u64 {
    fn from(generation: Generation) -> Self {
        generation.0
    }
}

// ============================================================================
// View - Clone (role assignment for one generation)
// ============================================================================

/// Role a participant plays under a given view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// No view applied yet.
    Uninitialized,
    /// Connected to the primary, holds no replica.
    Client,
    /// Receives synchronous replication from the primary.
    Backup,
    /// Serves every participant connection and owns the authoritative state.
    Primary,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Uninitialized => "uninitialized",
            Role::Client => "client",
            Role::Backup => "backup",
            Role::Primary => "primary",
        };
        f.write_str(name)
    }
}

/// Assignment of primary and backup for one generation.
///
/// Views are created by the view service, immutable once emitted, and
/// superseded only by a view with a higher generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct View {
    pub generation: Generation,
    pub primary: ParticipantId,
    pub backup: Option<ParticipantId>,
    /// Address participants connect to in order to reach the primary.
    pub primary_address: SocketAddr,
}

impl View {
    /// Creates the first view: `name` is primary, nobody is backup.
    pub fn initial(primary: ParticipantId, primary_address: SocketAddr) -> Self {
        Self {
            generation: Generation::FIRST,
            primary,
            backup: None,
            primary_address,
        }
    }

    pub fn is_primary(&self, id: &ParticipantId) -> bool {
        &self.primary == id
    }

    pub fn is_backup(&self, id: &ParticipantId) -> bool {
        self.backup.as_ref() == Some(id)
    }

    /// Returns the role `id` plays under this view.
    pub fn role_of(&self, id: &ParticipantId) -> Role {
        if self.is_primary(id) {
            Role::Primary
        } else if self.is_backup(id) {
            Role::Backup
        } else {
            Role::Client
        }
    }

    /// Returns true if this view replaces `other` (strictly newer generation).
    pub fn supersedes(&self, other: &View) -> bool {
        self.generation > other.generation
    }
}

impl Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backup {
            Some(backup) => write!(
                f,
                "{}: primary={}@{} backup={}",
                self.generation, self.primary, self.primary_address, backup
            ),
            None => write!(
                f,
                "{}: primary={}@{} backup=none",
                self.generation, self.primary, self.primary_address
            ),
        }
    }
}

// ============================================================================
// Replication Parameters - Copy
// ============================================================================

/// Application parameters the view service hands out with every view.
///
/// The replication protocol does not interpret them; they let every
/// participant construct the same application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationParams {
    pub n: u32,
    pub k: u32,
}

impl Default for ReplicationParams {
    fn default() -> Self {
        Self { n: 15, k: 10 }
    }
}

// ============================================================================
// Snapshot - Clone (cheap, reference-counted bytes)
// ============================================================================

/// Full replicated application state as an opaque blob.
///
/// Two snapshots are equal iff their bytes are equal; a synchronized backup
/// holds a snapshot byte-for-byte equal to the primary's at the sync point.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Snapshot(Bytes);

impl Snapshot {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Snapshot({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Snapshot {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for Snapshot {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}
