//! # tandem-node: primary-backup replication participant
//!
//! A node joins the view service, then plays whatever role each view
//! assigns it: primary, backup, or client.
//!
//! ## Architecture
//!
//! The primary runs a `mio` poll loop without an async runtime. Mutations
//! run on a fixed worker pool, one worker per participant hash, and each
//! one blocks on a sync barrier until the backup acknowledges the new
//! snapshot.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          tandem-node                          │
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────────┐  │
//! │  │ Listener   │ → │ PrimaryLoop  │ ← │ WorkerPool         │  │
//! │  │ (TCP)      │   │ (mio poll)   │   │ (mutation + sync)  │  │
//! │  └────────────┘   └──────┬───────┘   └────────────────────┘  │
//! │                          │ Sync / HeartbeatOk                 │
//! │  ┌────────────┐   ┌──────▼───────┐                           │
//! │  │ ViewService│ ← │ Follower     │  backup / client side      │
//! │  │ client     │   │ (heartbeats) │                           │
//! │  └────────────┘   └──────────────┘                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tandem_app::Roster;
//! use tandem_node::{Node, NodeConfig};
//!
//! let config = NodeConfig::new(name, "0.0.0.0:7400".parse()?, view_service);
//! let mut node: Node<Roster> = Node::new(config)?;
//! let handle = node.handle();
//! std::thread::spawn(move || node.run());
//!
//! let moved = handle.mutate(&participant, |roster| roster.record_move(&participant))?;
//! ```

mod config;
mod connection;
mod error;
mod follower;
mod node;
mod primary;
mod sync;
pub mod worker_pool;

pub use config::{NodeConfig, Timing, WorkerConfig};
pub use error::{NodeError, NodeResult};
pub use node::{Mutated, Node, NodeHandle};
pub use sync::SyncOutcome;
pub use worker_pool::{Mutation, ParticipantRouter, Task, WorkerPool};
