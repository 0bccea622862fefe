//! Sync barrier between mutators and the primary event loop.
//!
//! A mutator holding the mutation lock hands the loop a full snapshot
//! together with a one-shot completion sender, then blocks on the matching
//! receiver. The loop forwards the snapshot to the backup and completes the
//! token when `SyncOk` arrives, when the backup goes away, or when the
//! deadline passes. Exactly one token is ever outstanding because mutators
//! serialize on the mutation lock.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use mio::Waker;
use tandem_types::{ParticipantId, Snapshot};
use tracing::{debug, warn};

/// How a sync request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOutcome {
    /// The backup acknowledged the snapshot.
    Replicated,
    /// No backup was connected; nothing to replicate to.
    Skipped,
    /// The backup did not acknowledge in time and has been dropped.
    TimedOut,
    /// The backup connection closed while the sync was in flight.
    BackupLost,
    /// The primary left the view (or shut down) before an answer arrived.
    Abandoned,
    /// The snapshot does not fit in a frame and was never sent.
    TooLarge,
}

impl SyncOutcome {
    /// Returns true if a backup holds the snapshot.
    pub fn is_replicated(self) -> bool {
        self == SyncOutcome::Replicated
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncOutcome::Replicated => "replicated",
            SyncOutcome::Skipped => "skipped",
            SyncOutcome::TimedOut => "timed out",
            SyncOutcome::BackupLost => "backup lost",
            SyncOutcome::Abandoned => "abandoned",
            SyncOutcome::TooLarge => "too large",
        };
        f.write_str(name)
    }
}

/// Requests from worker threads to the primary event loop.
pub(crate) enum LoopCommand {
    Sync {
        snapshot: Snapshot,
        completion: Sender<SyncOutcome>,
    },
    WorkerFailed {
        participant: ParticipantId,
        reason: String,
    },
}

/// Creates the loop command channel; the sender half wakes the poll.
pub(crate) fn command_channel(waker: Arc<Waker>) -> (LoopSender, Receiver<LoopCommand>) {
    let (tx, rx) = unbounded();
    (LoopSender { tx, waker }, rx)
}

/// Sending half of the loop command channel.
#[derive(Clone)]
pub(crate) struct LoopSender {
    tx: Sender<LoopCommand>,
    waker: Arc<Waker>,
}

impl LoopSender {
    /// Queues a command and wakes the loop. Returns false if the loop is gone.
    pub(crate) fn send(&self, command: LoopCommand) -> bool {
        if self.tx.send(command).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake primary loop");
        }
        true
    }

    /// Replicates `snapshot` and blocks until the loop answers.
    ///
    /// The loop bounds the backup's answer by `sync_timeout`; this side
    /// waits twice as long so it also returns when the loop is between
    /// views and not draining commands.
    pub(crate) fn replicate(&self, snapshot: Snapshot, sync_timeout: Duration) -> SyncOutcome {
        let (completion, done) = bounded(1);
        if !self.send(LoopCommand::Sync {
            snapshot,
            completion,
        }) {
            return SyncOutcome::Abandoned;
        }

        match done.recv_timeout(sync_timeout * 2) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                warn!("sync barrier wait expired without an answer");
                SyncOutcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => SyncOutcome::Abandoned,
        }
    }

    /// Reports a fatal worker failure.
    pub(crate) fn worker_failed(&self, participant: ParticipantId, reason: String) {
        if !self.send(LoopCommand::WorkerFailed {
            participant,
            reason,
        }) {
            debug!("primary loop gone; dropping worker failure report");
        }
    }
}

/// The single outstanding sync, owned by the loop.
pub(crate) struct PendingSync {
    completion: Sender<SyncOutcome>,
    deadline: Instant,
}

impl PendingSync {
    pub(crate) fn new(completion: Sender<SyncOutcome>, timeout: Duration) -> Self {
        Self {
            completion,
            deadline: Instant::now() + timeout,
        }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Releases the waiting mutator. A mutator that already gave up is fine.
    pub(crate) fn complete(self, outcome: SyncOutcome) {
        complete(&self.completion, outcome);
    }
}

pub(crate) fn complete(completion: &Sender<SyncOutcome>, outcome: SyncOutcome) {
    if completion.send(outcome).is_err() {
        debug!(%outcome, "sync waiter already gone");
    }
}
