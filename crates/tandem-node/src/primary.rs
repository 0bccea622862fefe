//! Primary event loop.
//!
//! One `mio` poll owns the listener, every participant connection, and a
//! waker fed by the worker command channel. The loop is the only code that
//! touches the connection table, the heartbeat set or the backup
//! connection, so none of them need a lock.
//!
//! ```text
//!   participants ──▶ Listener ─▶ Connections ──┐
//!                                              ├─▶ PrimaryLoop ─▶ heartbeat check
//!   workers ──▶ LoopCommand channel + Waker ───┘        │
//!                                                       ▼
//!                                          Sync ─▶ backup ─▶ SyncOk
//! ```
//!
//! The listener and connections persist across generations for as long as
//! this node stays primary; each [`PrimaryLoop::run`] serves one view.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tandem_app::Application;
use tandem_types::{Generation, ParticipantId, Snapshot, View};
use tandem_wire::{Heartbeat, HeartbeatOk, Hello, InitBackupReply, InitBackupRequest, Message};
use tracing::{debug, info, trace, warn};

use crate::config::{NodeConfig, Timing};
use crate::connection::Connection;
use crate::error::{NodeError, NodeResult};
use crate::node::NodeShared;
use crate::sync::{self, LoopCommand, PendingSync, SyncOutcome, command_channel};
use crate::worker_pool::{Task, WorkerPool};

/// Token for the listening socket.
const LISTENER_TOKEN: Token = Token(0);
/// Token for the command-channel waker.
const WAKER_TOKEN: Token = Token(1);
/// First token handed to an accepted connection.
const FIRST_CONNECTION_TOKEN: usize = 2;
/// Consecutive silent check windows before a participant is evicted.
const EVICT_AFTER_SILENT_WINDOWS: u32 = 2;

/// Why a primary run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PrimaryExit {
    /// The backup missed a heartbeat window; `candidate` should replace it.
    ReportBackupFailure {
        failed: ParticipantId,
        candidate: ParticipantId,
    },
    /// A participant is ahead of us; fetch the newer view.
    Requery,
    Shutdown,
}

pub(crate) struct PrimaryLoop<A: Application> {
    name: ParticipantId,
    timing: Timing,
    evict_silent: bool,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    commands: Receiver<LoopCommand>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    /// Connection adopted through `InitBackupRequest`.
    backup: Option<Token>,
    /// Backup lost its connection or timed out a sync since the last check.
    backup_suspect: bool,
    /// Backup is dead and no candidate has heartbeated yet.
    pending_switch: bool,
    pending_sync: Option<PendingSync>,
    /// Most recent snapshot handed to the loop; served to new backups.
    latest_snapshot: Snapshot,
    /// Participants with state in the application.
    tracked: BTreeSet<ParticipantId>,
    /// Participants heard from (Hello or Heartbeat) in the current window.
    heartbeats: BTreeSet<ParticipantId>,
    /// Consecutive silent windows per tracked participant, this view only.
    silent_windows: BTreeMap<ParticipantId, u32>,
    pool: Arc<WorkerPool<A>>,
    shared: Arc<NodeShared<A>>,
}

impl<A: Application> PrimaryLoop<A> {
    /// Takes over `listener` and starts the worker pool.
    pub(crate) fn start(
        config: &NodeConfig,
        listener: std::net::TcpListener,
        shared: Arc<NodeShared<A>>,
    ) -> NodeResult<Self> {
        let (latest_snapshot, tracked) = {
            let app = shared.app().lock().map_err(|_| NodeError::Poisoned)?;
            (app.snapshot(), app.participants())
        };

        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let (loop_tx, commands) = command_channel(Arc::clone(&waker));
        let pool = Arc::new(WorkerPool::start(
            config.workers,
            Arc::clone(shared.app()),
            loop_tx,
            config.timing.sync_timeout,
        )?);
        shared.install_primary(Arc::clone(&pool), waker);

        info!(
            addr = %listener.local_addr()?,
            participants = tracked.len(),
            "primary listener ready"
        );

        Ok(Self {
            name: config.name.clone(),
            timing: config.timing,
            evict_silent: config.evict_silent_participants,
            poll,
            events: Events::with_capacity(256),
            listener,
            commands,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            backup: None,
            backup_suspect: false,
            pending_switch: false,
            pending_sync: None,
            latest_snapshot,
            tracked,
            heartbeats: BTreeSet::new(),
            silent_windows: BTreeMap::new(),
            pool,
            shared,
        })
    }

    /// Serves `view` until the backup fails, a newer view appears, or the
    /// node shuts down. Any in-flight sync is abandoned on the way out.
    pub(crate) fn run(&mut self, view: &View) -> NodeResult<PrimaryExit> {
        let result = self.serve(view);
        if let Some(pending) = self.pending_sync.take() {
            pending.complete(SyncOutcome::Abandoned);
        }
        result
    }

    /// Stops the workers and drops every connection and the listener.
    pub(crate) fn shutdown(mut self) {
        if let Some(pending) = self.pending_sync.take() {
            pending.complete(SyncOutcome::Abandoned);
        }
        self.shared.clear_primary();

        let PrimaryLoop {
            commands,
            pool,
            connections,
            ..
        } = self;
        // Queued syncs are discarded with the channel, releasing their waiters.
        drop(commands);
        pool.shutdown();
        for connection in connections.values() {
            connection.close();
        }
        info!("primary stepped down");
    }

    fn serve(&mut self, view: &View) -> NodeResult<PrimaryExit> {
        self.heartbeats.clear();
        // Followers reconnect at their own pace after a view change.
        self.silent_windows.clear();
        self.retain_backup(view);
        let mut next_check = Instant::now() + self.timing.check_grace;

        // Frames that arrived after the previous run decided to exit.
        let buffered: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.has_pending_data())
            .map(|(token, _)| *token)
            .collect();
        for token in buffered {
            if let Some(exit) = self.process_frames(token, view)? {
                return Ok(exit);
            }
        }

        loop {
            if self.shared.is_shutdown() {
                return Ok(PrimaryExit::Shutdown);
            }

            let now = Instant::now();
            let check_deadline = (!self.pending_switch).then_some(next_check);
            let sync_deadline = self.pending_sync.as_ref().map(PendingSync::deadline);
            let deadline = match (check_deadline, sync_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let timeout = deadline.map(|d| d.saturating_duration_since(now));

            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_read_closed() || event.is_error(),
                        event.is_writable(),
                    )
                })
                .collect();

            for (token, readable, writable) in ready {
                match token {
                    LISTENER_TOKEN => self.accept(),
                    WAKER_TOKEN => {}
                    token => {
                        if let Some(exit) = self.connection_ready(token, readable, writable, view)? {
                            return Ok(exit);
                        }
                    }
                }
            }

            self.drain_commands()?;
            self.expire_sync(Instant::now());

            if !self.pending_switch && Instant::now() >= next_check {
                if let Some(exit) = self.check_heartbeats(view) {
                    return Ok(exit);
                }
                next_check = Instant::now() + self.timing.check_interval;
            }
        }
    }

    /// Keeps the backup connection only if it still belongs to the view's backup.
    fn retain_backup(&mut self, view: &View) {
        if let Some(token) = self.backup {
            let keep = self
                .connections
                .get(&token)
                .and_then(|conn| conn.participant.as_ref())
                .is_some_and(|participant| view.is_backup(participant));
            if !keep {
                self.close_connection(token, "no longer the backup");
            }
        }
        self.backup_suspect = false;
        self.pending_switch = false;
    }

    // ========================================================================
    // Connections
    // ========================================================================

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(%peer, error = %e, "failed to register connection");
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    debug!(%peer, ?token, "accepted connection");
                    self.connections
                        .insert(token, Connection::new(token, stream, peer));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn connection_ready(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        view: &View,
    ) -> NodeResult<Option<PrimaryExit>> {
        if writable {
            self.flush(token);
        }
        if !readable {
            return Ok(None);
        }

        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(None);
        };
        let open = match conn.read() {
            Ok(open) => open,
            Err(e) => {
                debug!(peer = %conn.label(), error = %e, "read failed");
                false
            }
        };

        // Handle whatever arrived before the close.
        if let Some(exit) = self.process_frames(token, view)? {
            return Ok(Some(exit));
        }
        if !open {
            self.close_connection(token, "closed by peer");
        }
        Ok(None)
    }

    fn process_frames(&mut self, token: Token, view: &View) -> NodeResult<Option<PrimaryExit>> {
        loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return Ok(None);
            };
            let message = match conn.try_decode_message() {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!(peer = %conn.label(), error = %e, "anomaly: undecodable frame");
                    self.close_connection(token, "protocol violation");
                    return Ok(None);
                }
            };

            if let Some(exit) = self.handle_message(token, message, view) {
                return Ok(Some(exit));
            }
        }
    }

    /// Queues `message` on a connection and tries to write it out.
    fn send(&mut self, token: Token, message: &Message) {
        if self.queue(token, message).is_ok() {
            self.flush(token);
        }
    }

    /// Encodes `message` into a connection's write buffer without flushing.
    fn queue(&mut self, token: Token, message: &Message) -> NodeResult<()> {
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };
        conn.queue_message(message).inspect_err(|e| {
            warn!(peer = %conn.label(), kind = message.name(), error = %e, "failed to encode message");
        })
    }

    fn flush(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if let Err(e) = conn.write() {
            debug!(peer = %conn.label(), error = %e, "write failed");
            self.close_connection(token, "write failed");
            return;
        }

        let interest = conn.interest();
        if interest != conn.registered {
            match self
                .poll
                .registry()
                .reregister(&mut conn.stream, token, interest)
            {
                Ok(()) => conn.registered = interest,
                Err(e) => {
                    warn!(peer = %conn.label(), error = %e, "failed to reregister connection");
                    self.close_connection(token, "reregister failed");
                }
            }
        }
    }

    fn close_connection(&mut self, token: Token, reason: &str) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            trace!(peer = %conn.label(), error = %e, "deregister failed");
        }
        conn.close();
        debug!(peer = %conn.label(), reason, "connection dropped");

        if self.backup == Some(token) {
            warn!(backup = %conn.label(), reason, "backup connection lost");
            self.backup = None;
            self.backup_suspect = true;
            if let Some(pending) = self.pending_sync.take() {
                pending.complete(SyncOutcome::BackupLost);
            }
        }
    }

    // ========================================================================
    // Messages
    // ========================================================================

    fn handle_message(&mut self, token: Token, message: Message, view: &View) -> Option<PrimaryExit> {
        match message {
            Message::Hello(Hello { name }) => {
                self.on_hello(token, name);
                None
            }
            Message::Heartbeat(Heartbeat { name }) => self.on_heartbeat(token, name, view),
            Message::InitBackupRequest(InitBackupRequest { generation }) => {
                self.on_init_backup(token, generation, view)
            }
            Message::SyncOk => {
                self.on_sync_ok(token);
                None
            }
            other => {
                let peer = self.label(token);
                warn!(%peer, kind = other.name(), "anomaly: unexpected message at primary");
                self.close_connection(token, "protocol violation");
                None
            }
        }
    }

    fn on_hello(&mut self, token: Token, name: ParticipantId) {
        if name == self.name {
            warn!(peer = %self.label(token), "anomaly: peer claims this node's name");
            self.close_connection(token, "protocol violation");
            return;
        }
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        debug!(participant = %name, peer = %conn.peer, "hello");
        conn.participant = Some(name.clone());
        self.heartbeats.insert(name.clone());
        self.track(name);
    }

    fn on_heartbeat(&mut self, token: Token, name: ParticipantId, view: &View) -> Option<PrimaryExit> {
        trace!(participant = %name, "heartbeat");
        self.heartbeats.insert(name.clone());
        if name != self.name && !self.tracked.contains(&name) {
            info!(participant = %name, "silent participant is back");
            self.track(name.clone());
        }

        self.send(
            token,
            &Message::HeartbeatOk(HeartbeatOk {
                generation: view.generation,
            }),
        );

        if self.pending_switch {
            if let Some(failed) = view.backup.clone() {
                if name != failed && name != self.name {
                    info!(%failed, candidate = %name, "pending backup switch resolved");
                    return Some(PrimaryExit::ReportBackupFailure {
                        failed,
                        candidate: name,
                    });
                }
            }
        }
        None
    }

    fn on_init_backup(&mut self, token: Token, generation: Generation, view: &View) -> Option<PrimaryExit> {
        let Some(requester) = self
            .connections
            .get(&token)
            .and_then(|conn| conn.participant.clone())
        else {
            warn!(peer = %self.label(token), "anomaly: backup init before hello");
            self.close_connection(token, "protocol violation");
            return None;
        };

        if generation < view.generation {
            info!(%requester, requested = %generation, current = %view.generation, "ignoring stale backup init");
            return None;
        }

        if let Some(existing) = self.backup.filter(|existing| *existing != token) {
            let same_participant = self
                .connections
                .get(&existing)
                .and_then(|conn| conn.participant.as_ref())
                == Some(&requester);
            if same_participant {
                info!(backup = %requester, "backup reconnected; replacing old connection");
                self.close_connection(existing, "superseded by reconnect");
            } else {
                warn!(
                    existing = %self.label(existing),
                    %requester,
                    "anomaly: second backup init while a backup is connected"
                );
                self.close_connection(token, "protocol violation");
                return None;
            }
        }

        if generation == view.generation && !view.is_backup(&requester) {
            warn!(%requester, %generation, "anomaly: backup init from a non-backup");
            self.close_connection(token, "protocol violation");
            return None;
        }

        let reply = Message::InitBackupReply(InitBackupReply {
            snapshot: self.latest_snapshot.clone(),
        });
        if self.queue(token, &reply).is_err() {
            self.close_connection(token, "initial snapshot cannot be sent");
            return None;
        }
        self.flush(token);
        if !self.connections.contains_key(&token) {
            return None;
        }
        self.backup = Some(token);
        self.backup_suspect = false;
        info!(backup = %requester, %generation, bytes = self.latest_snapshot.len(), "backup initialized");

        if generation > view.generation {
            info!(requested = %generation, current = %view.generation, "backup is ahead; re-querying view");
            return Some(PrimaryExit::Requery);
        }
        None
    }

    fn on_sync_ok(&mut self, token: Token) {
        if self.backup != Some(token) {
            debug!(peer = %self.label(token), "ignoring SyncOk from a non-backup connection");
            return;
        }
        match self.pending_sync.take() {
            Some(pending) => pending.complete(SyncOutcome::Replicated),
            None => debug!("SyncOk with no sync outstanding"),
        }
    }

    /// Starts tracking a participant and creates it through its worker.
    fn track(&mut self, participant: ParticipantId) {
        if !self.tracked.insert(participant.clone()) {
            return;
        }
        if let Err(e) = self.pool.submit(Task::Join(participant.clone())) {
            // Retried on the participant's next heartbeat.
            warn!(%participant, error = %e, "failed to queue join");
            self.tracked.remove(&participant);
        }
    }

    fn label(&self, token: Token) -> String {
        self.connections
            .get(&token)
            .map_or_else(|| format!("{token:?}"), Connection::label)
    }

    // ========================================================================
    // Sync barrier
    // ========================================================================

    fn drain_commands(&mut self) -> NodeResult<()> {
        loop {
            match self.commands.try_recv() {
                Ok(LoopCommand::Sync {
                    snapshot,
                    completion,
                }) => self.on_sync(snapshot, completion),
                Ok(LoopCommand::WorkerFailed {
                    participant,
                    reason,
                }) => return Err(NodeError::WorkerFailed { participant, reason }),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn on_sync(&mut self, snapshot: Snapshot, completion: Sender<SyncOutcome>) {
        self.latest_snapshot = snapshot.clone();
        if let Some(previous) = self.pending_sync.take() {
            previous.complete(SyncOutcome::Abandoned);
        }

        let Some(token) = self.backup else {
            sync::complete(&completion, SyncOutcome::Skipped);
            return;
        };

        trace!(bytes = snapshot.len(), "syncing backup");
        if self
            .queue(token, &Message::Sync(tandem_wire::Sync { snapshot }))
            .is_err()
        {
            // The backup keeps its previous state and its connection.
            sync::complete(&completion, SyncOutcome::TooLarge);
            return;
        }
        self.flush(token);
        if self.backup == Some(token) {
            self.pending_sync = Some(PendingSync::new(completion, self.timing.sync_timeout));
        } else {
            sync::complete(&completion, SyncOutcome::BackupLost);
        }
    }

    fn expire_sync(&mut self, now: Instant) {
        if !self
            .pending_sync
            .as_ref()
            .is_some_and(|pending| pending.is_expired(now))
        {
            return;
        }
        if let Some(pending) = self.pending_sync.take() {
            pending.complete(SyncOutcome::TimedOut);
        }
        warn!(timeout = ?self.timing.sync_timeout, "backup did not acknowledge sync");
        if let Some(token) = self.backup {
            self.close_connection(token, "sync timed out");
        }
        self.backup_suspect = true;
    }

    // ========================================================================
    // Failure detection
    // ========================================================================

    /// Runs one heartbeat window check and starts the next window.
    fn check_heartbeats(&mut self, view: &View) -> Option<PrimaryExit> {
        debug!(generation = %view.generation, heartbeats = ?self.heartbeats, "heartbeat check");

        let failed_backup = view
            .backup
            .as_ref()
            .filter(|backup| self.backup_suspect || !self.heartbeats.contains(*backup))
            .cloned();

        if failed_backup.is_some() {
            if let Some(token) = self.backup {
                self.close_connection(token, "missed heartbeat window");
            }
        }
        if self.evict_silent {
            self.evict_silent_participants();
        }

        let exit = failed_backup.and_then(|failed| {
            let candidate = self
                .heartbeats
                .iter()
                .find(|p| **p != failed && **p != self.name)
                .cloned();
            if let Some(candidate) = candidate {
                warn!(%failed, %candidate, "backup failed");
                Some(PrimaryExit::ReportBackupFailure { failed, candidate })
            } else {
                warn!(%failed, "backup failed with no candidate; waiting for the next heartbeat");
                self.pending_switch = true;
                None
            }
        });

        self.heartbeats.clear();
        exit
    }

    /// Evicts participants silent for [`EVICT_AFTER_SILENT_WINDOWS`] windows in a row.
    fn evict_silent_participants(&mut self) {
        let heartbeats = &self.heartbeats;
        self.silent_windows
            .retain(|participant, _| !heartbeats.contains(participant));

        let mut evicted = Vec::new();
        for participant in &self.tracked {
            if *participant == self.name || self.heartbeats.contains(participant) {
                continue;
            }
            let windows = self.silent_windows.entry(participant.clone()).or_insert(0);
            *windows += 1;
            debug!(%participant, windows = *windows, "participant silent this window");
            if *windows >= EVICT_AFTER_SILENT_WINDOWS {
                evicted.push(participant.clone());
            }
        }

        for participant in evicted {
            info!(%participant, "evicting silent participant");
            self.silent_windows.remove(&participant);
            self.tracked.remove(&participant);
            if let Err(e) = self.pool.submit(Task::Leave(participant.clone())) {
                warn!(%participant, error = %e, "failed to queue leave");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, TcpStream};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use crossbeam_channel::bounded;
    use tandem_app::Roster;
    use tandem_types::Role;
    use tandem_wire::{read_message, write_message};

    use super::*;
    use crate::config::WorkerConfig;
    use crate::node::NodeHandle;
    use crate::tests::{SETTLE, id, test_timing, wait_until};

    /// Timing with heartbeat checks pushed far beyond the test.
    fn quiet_timing() -> Timing {
        Timing {
            check_grace: Duration::from_secs(60),
            check_interval: Duration::from_secs(60),
            sync_timeout: Duration::from_secs(2),
            ..test_timing()
        }
    }

    fn checking_timing(window: Duration) -> Timing {
        Timing {
            check_grace: window,
            check_interval: window,
            ..test_timing()
        }
    }

    fn view(generation: u64, backup: Option<&str>) -> View {
        View {
            generation: Generation::new(generation),
            primary: id("p"),
            backup: backup.map(id),
            primary_address: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    /// A primary loop serving one view on its own thread.
    struct Primary {
        handle: NodeHandle<Roster>,
        address: SocketAddr,
        started: Instant,
        thread: Option<JoinHandle<NodeResult<PrimaryExit>>>,
    }

    impl Primary {
        /// Starts serving `view`; `members` already have state in the application.
        fn start(view: View, timing: Timing, members: &[&str]) -> Self {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let address = listener.local_addr().unwrap();
            let view = View {
                primary_address: address,
                ..view
            };
            let config = NodeConfig::new(id("p"), address, "127.0.0.1:9".parse().unwrap())
                .with_timing(timing)
                .with_workers(WorkerConfig {
                    worker_count: 2,
                    queue_capacity: 16,
                });

            let shared = Arc::new(NodeShared::<Roster>::new(id("p")));
            {
                let mut app = shared.app().lock().unwrap();
                app.create_participant(&id("p"));
                for member in members {
                    app.create_participant(&id(member));
                }
            }
            shared.publish(&view, Role::Primary, true);
            let handle = NodeHandle::new(Arc::clone(&shared));

            let (ready_tx, ready_rx) = bounded(1);
            let thread = thread::spawn(move || {
                let mut primary = PrimaryLoop::start(&config, listener, shared)?;
                let _ = ready_tx.send(());
                let exit = primary.run(&view);
                primary.shutdown();
                exit
            });
            ready_rx.recv_timeout(SETTLE).unwrap();

            Self {
                handle,
                address,
                started: Instant::now(),
                thread: Some(thread),
            }
        }

        fn is_running(&self) -> bool {
            self.thread.as_ref().is_some_and(|t| !t.is_finished())
        }

        /// Waits for the loop to leave the view on its own.
        fn exit(&mut self) -> PrimaryExit {
            wait_until("primary loop exit", || !self.is_running());
            self.thread.take().unwrap().join().unwrap().unwrap()
        }

        /// Records a move for `participant` on a separate thread.
        fn mutate_in_background(&self, participant: &str) -> JoinHandle<SyncOutcome> {
            let handle = self.handle.clone();
            let participant = id(participant);
            thread::spawn(move || {
                let moved = participant.clone();
                handle
                    .mutate(&participant, move |roster: &mut Roster| {
                        roster.record_move(&moved)
                    })
                    .unwrap()
                    .sync
            })
        }

        fn contains(&self, participant: &str) -> bool {
            self.handle
                .read(|roster| roster.contains(&id(participant)))
                .unwrap()
        }
    }

    impl Drop for Primary {
        fn drop(&mut self) {
            self.handle.shutdown();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    /// Participant side of one connection, driven by the test.
    struct Peer {
        name: ParticipantId,
        stream: TcpStream,
    }

    impl Peer {
        fn join(address: SocketAddr, name: &str) -> Self {
            let stream = TcpStream::connect(address).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut peer = Self {
                name: id(name),
                stream,
            };
            peer.send(&Message::Hello(Hello { name: id(name) }));
            peer
        }

        fn send(&mut self, message: &Message) {
            write_message(&mut self.stream, message).unwrap();
        }

        fn recv(&mut self) -> Message {
            read_message(&mut self.stream).unwrap()
        }

        /// Sends a heartbeat and returns the acknowledged generation.
        fn heartbeat(&mut self) -> Generation {
            self.send(&Message::Heartbeat(Heartbeat {
                name: self.name.clone(),
            }));
            match self.recv() {
                Message::HeartbeatOk(ack) => ack.generation,
                other => panic!("expected HeartbeatOk, got {other:?}"),
            }
        }

        /// Heartbeats without caring whether the primary is still there.
        fn heartbeat_quietly(&mut self) {
            let heartbeat = Message::Heartbeat(Heartbeat {
                name: self.name.clone(),
            });
            if write_message(&mut self.stream, &heartbeat).is_ok() {
                let _ = read_message(&mut self.stream);
            }
        }

        fn init_backup(&mut self, generation: u64) -> Snapshot {
            self.send(&Message::InitBackupRequest(InitBackupRequest {
                generation: Generation::new(generation),
            }));
            match self.recv() {
                Message::InitBackupReply(reply) => reply.snapshot,
                other => panic!("expected InitBackupReply, got {other:?}"),
            }
        }

        /// True once the primary has dropped this connection.
        fn is_closed(&mut self) -> bool {
            match read_message(&mut self.stream) {
                Ok(message) => panic!("expected a closed connection, got {message:?}"),
                Err(e) => e.is_disconnect(),
            }
        }
    }

    // ========================================================================
    // Backup replacement
    // ========================================================================

    #[test]
    fn silent_backup_is_replaced_by_smallest_live_participant() {
        let mut primary = Primary::start(
            view(2, Some("b")),
            checking_timing(Duration::from_millis(200)),
            &["b", "c", "d"],
        );
        let mut d = Peer::join(primary.address, "d");
        let mut c = Peer::join(primary.address, "c");

        while primary.is_running() {
            d.heartbeat_quietly();
            c.heartbeat_quietly();
            thread::sleep(Duration::from_millis(30));
        }

        assert_eq!(
            primary.exit(),
            PrimaryExit::ReportBackupFailure {
                failed: id("b"),
                candidate: id("c"),
            }
        );
    }

    #[test]
    fn pending_backup_switch_waits_for_the_next_heartbeat() {
        let mut primary = Primary::start(
            view(2, Some("b")),
            checking_timing(Duration::from_millis(150)),
            &["b", "c"],
        );

        // Several windows pass with nobody to promote.
        thread::sleep(Duration::from_millis(700));
        assert!(primary.is_running());

        let mut c = Peer::join(primary.address, "c");
        assert_eq!(c.heartbeat(), Generation::new(2));
        assert_eq!(
            primary.exit(),
            PrimaryExit::ReportBackupFailure {
                failed: id("b"),
                candidate: id("c"),
            }
        );
    }

    // ========================================================================
    // Backup initialization
    // ========================================================================

    #[test]
    fn second_backup_init_is_rejected_while_backup_connected() {
        let primary = Primary::start(view(2, Some("b")), quiet_timing(), &["b", "c"]);
        let mut b = Peer::join(primary.address, "b");
        let snapshot = b.init_backup(2);

        let mut initial = Roster::default();
        initial.restore(&snapshot).unwrap();
        assert!(initial.contains(&id("c")));

        // A newer generation would otherwise be answered and trigger a re-query.
        let mut c = Peer::join(primary.address, "c");
        c.send(&Message::InitBackupRequest(InitBackupRequest {
            generation: Generation::new(3),
        }));
        assert!(c.is_closed());
        assert!(primary.is_running());

        // b is still the sync target.
        let mutation = primary.mutate_in_background("c");
        assert!(matches!(b.recv(), Message::Sync(_)));
        b.send(&Message::SyncOk);
        assert_eq!(mutation.join().unwrap(), SyncOutcome::Replicated);
    }

    #[test]
    fn backup_ahead_of_the_view_triggers_requery() {
        let mut primary = Primary::start(view(2, Some("b")), quiet_timing(), &["b"]);
        let mut b = Peer::join(primary.address, "b");
        b.init_backup(3);
        assert_eq!(primary.exit(), PrimaryExit::Requery);
    }

    #[test]
    fn stale_backup_init_is_ignored() {
        let primary = Primary::start(view(3, Some("b")), quiet_timing(), &["b"]);
        let mut b = Peer::join(primary.address, "b");
        b.send(&Message::InitBackupRequest(InitBackupRequest {
            generation: Generation::new(2),
        }));

        // No reply to the stale request; the connection stays usable.
        assert_eq!(b.heartbeat(), Generation::new(3));
        assert_eq!(
            primary.mutate_in_background("b").join().unwrap(),
            SyncOutcome::Skipped
        );
    }

    // ========================================================================
    // Sync barrier
    // ========================================================================

    #[test]
    fn backup_dropping_mid_sync_loses_the_sync() {
        let primary = Primary::start(view(2, Some("b")), quiet_timing(), &["b"]);
        let mut b = Peer::join(primary.address, "b");
        b.init_backup(2);

        let mutation = primary.mutate_in_background("b");
        assert!(matches!(b.recv(), Message::Sync(_)));
        drop(b);

        assert_eq!(mutation.join().unwrap(), SyncOutcome::BackupLost);
        assert!(primary.is_running());
    }

    #[test]
    fn unacknowledged_sync_times_out_and_drops_backup() {
        let timing = Timing {
            sync_timeout: Duration::from_millis(200),
            ..quiet_timing()
        };
        let primary = Primary::start(view(2, Some("b")), timing, &["b"]);
        let mut b = Peer::join(primary.address, "b");
        b.init_backup(2);

        let mutation = primary.mutate_in_background("b");
        assert!(matches!(b.recv(), Message::Sync(_)));
        assert_eq!(mutation.join().unwrap(), SyncOutcome::TimedOut);
        assert!(b.is_closed());

        // Nothing left to replicate to.
        assert_eq!(
            primary.mutate_in_background("b").join().unwrap(),
            SyncOutcome::Skipped
        );
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    #[test]
    fn silent_participant_survives_one_window_and_rejoins_after_eviction() {
        let window = Duration::from_millis(400);
        let primary = Primary::start(view(1, None), checking_timing(window), &[]);
        let mut c = Peer::join(primary.address, "c");
        wait_until("c joins", || primary.contains("c"));

        // Windows close at 400ms (hello seen), 800ms (first silent window)
        // and 1200ms (second silent window).
        let between = window * 5 / 2;
        thread::sleep(between.saturating_sub(primary.started.elapsed()));
        assert!(primary.contains("c"));

        wait_until("c evicted", || !primary.contains("c"));
        assert_eq!(c.heartbeat(), Generation::FIRST);
        wait_until("c rejoins", || primary.contains("c"));
    }
}
