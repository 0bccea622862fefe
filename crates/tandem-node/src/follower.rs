//! Client and backup side: the link to the primary and the heartbeat loop.
//!
//! A reader thread decodes frames from the primary into a channel. The
//! follower loop selects over that channel, a heartbeat ticker and the
//! node's shutdown signal, so every wait can be interrupted.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, at, never, select, tick, unbounded};
use tandem_app::Application;
use tandem_types::{Generation, ParticipantId, Role, Snapshot, View};
use tandem_wire::{Heartbeat, HeartbeatOk, Message, WireResult, read_message, write_message};
use tracing::{debug, info, trace, warn};

use crate::config::Timing;

/// Traffic from the reader thread.
pub(crate) enum Inbound {
    Message(Message),
    /// EOF, reset, or an undecodable frame.
    Closed,
}

/// Outcome of waiting for `InitBackupReply`.
pub(crate) enum InitBackup {
    Snapshot(Snapshot),
    Failed,
    Shutdown,
}

/// Why the follower loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FollowerExit {
    /// `missed_heartbeat_limit` heartbeats in a row went unacknowledged.
    PrimaryFailed,
    /// The primary is serving a newer generation than ours.
    NewerView(Generation),
    Shutdown,
}

/// Persistent connection to the primary.
pub(crate) struct PrimaryLink {
    stream: TcpStream,
    peer: SocketAddr,
    inbound: Receiver<Inbound>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl PrimaryLink {
    /// Connects with `connect_attempts` tries, `connect_backoff` apart.
    ///
    /// Returns `Interrupted` if the node shuts down while backing off.
    pub(crate) fn connect(
        addr: SocketAddr,
        timing: &Timing,
        shutdown: &Receiver<()>,
    ) -> io::Result<Self> {
        let attempts = timing.connect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match TcpStream::connect_timeout(&addr, timing.connect_timeout) {
                Ok(stream) => return Self::from_stream(stream, addr),
                Err(e) => {
                    debug!(%addr, attempt, error = %e, "connect to primary failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts && interrupted(shutdown, timing.connect_backoff) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "node shutting down"));
            }
        }

        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connect attempt")))
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let mut reader_stream = stream.try_clone()?;
        let (tx, inbound) = unbounded();

        let reader = thread::Builder::new()
            .name("tandem-link-reader".to_string())
            .spawn(move || {
                loop {
                    match read_message(&mut reader_stream) {
                        Ok(message) => {
                            if tx.send(Inbound::Message(message)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            if e.is_disconnect() {
                                trace!(%peer, "primary closed the connection");
                            } else {
                                warn!(%peer, error = %e, "anomaly: bad frame from primary");
                            }
                            let _ = tx.send(Inbound::Closed);
                            break;
                        }
                    }
                }
            })?;

        debug!(%peer, "connected to primary");
        Ok(Self {
            stream,
            peer,
            inbound,
            reader: Some(reader),
            closed: false,
        })
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn send(&mut self, message: &Message) -> WireResult<()> {
        let result = write_message(&mut self.stream, message);
        if result.is_err() {
            self.closed = true;
        }
        result
    }

    /// Blocks for the primary's `InitBackupReply`.
    pub(crate) fn await_init_backup(
        &mut self,
        timing: &Timing,
        shutdown: &Receiver<()>,
    ) -> InitBackup {
        let deadline = at(Instant::now() + timing.init_backup_timeout);
        loop {
            select! {
                recv(shutdown) -> _ => return InitBackup::Shutdown,
                recv(deadline) -> _ => return InitBackup::Failed,
                recv(self.inbound) -> inbound => match inbound {
                    Ok(Inbound::Message(Message::InitBackupReply(reply))) => {
                        return InitBackup::Snapshot(reply.snapshot);
                    }
                    Ok(Inbound::Message(other)) => {
                        debug!(kind = other.name(), "ignoring message before backup init");
                    }
                    Ok(Inbound::Closed) | Err(_) => {
                        self.closed = true;
                        return InitBackup::Failed;
                    }
                },
            }
        }
    }
}

impl Drop for PrimaryLink {
    fn drop(&mut self) {
        // Unblocks the reader thread.
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Waits `duration` unless the node shuts down first. Returns true on shutdown.
pub(crate) fn interrupted(shutdown: &Receiver<()>, duration: std::time::Duration) -> bool {
    !matches!(shutdown.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
}

/// Heartbeat sender and receive loop for one view.
pub(crate) struct Follower<'a, A: Application> {
    pub(crate) name: &'a ParticipantId,
    pub(crate) view: &'a View,
    pub(crate) role: Role,
    pub(crate) timing: &'a Timing,
    pub(crate) app: &'a Arc<Mutex<A>>,
    pub(crate) shutdown: &'a Receiver<()>,
}

impl<A: Application> Follower<'_, A> {
    pub(crate) fn run(&self, link: &mut PrimaryLink) -> FollowerExit {
        let ticker = tick(self.timing.heartbeat_interval);
        let limit = self.timing.missed_heartbeat_limit.max(1);
        let mut acked = false;
        let mut misses = 0u32;

        self.heartbeat(link);
        loop {
            let inbound = if link.closed {
                never()
            } else {
                link.inbound.clone()
            };

            select! {
                recv(self.shutdown) -> _ => return FollowerExit::Shutdown,
                recv(inbound) -> message => match message {
                    Ok(Inbound::Message(message)) => {
                        if let Some(exit) = self.handle(link, message, &mut acked) {
                            return exit;
                        }
                    }
                    Ok(Inbound::Closed) | Err(_) => {
                        if !link.closed {
                            info!(primary = %self.view.primary, "connection to primary closed");
                            link.closed = true;
                        }
                    }
                },
                recv(ticker) -> _ => {
                    if acked {
                        misses = 0;
                    } else {
                        misses += 1;
                        debug!(primary = %self.view.primary, misses, "heartbeat not acknowledged");
                    }
                    acked = false;

                    if misses >= limit {
                        warn!(
                            primary = %self.view.primary,
                            generation = %self.view.generation,
                            misses,
                            "primary failed"
                        );
                        return FollowerExit::PrimaryFailed;
                    }
                    self.heartbeat(link);
                }
            }
        }
    }

    fn heartbeat(&self, link: &mut PrimaryLink) {
        if link.closed {
            return;
        }
        let heartbeat = Message::Heartbeat(Heartbeat {
            name: self.name.clone(),
        });
        if let Err(e) = link.send(&heartbeat) {
            debug!(error = %e, "failed to send heartbeat");
        }
    }

    fn handle(
        &self,
        link: &mut PrimaryLink,
        message: Message,
        acked: &mut bool,
    ) -> Option<FollowerExit> {
        match message {
            Message::HeartbeatOk(HeartbeatOk { generation }) => {
                *acked = true;
                if generation > self.view.generation {
                    info!(
                        current = %self.view.generation,
                        primary_generation = %generation,
                        "primary is ahead; re-querying view"
                    );
                    return Some(FollowerExit::NewerView(generation));
                }
            }
            Message::Sync(sync) => {
                if self.role == Role::Backup {
                    self.apply_sync(link, &sync.snapshot);
                } else {
                    warn!(role = %self.role, "anomaly: sync sent to a non-backup");
                }
            }
            other => {
                warn!(kind = other.name(), "anomaly: unexpected message from primary");
            }
        }
        None
    }

    /// Restores the snapshot and acknowledges it.
    fn apply_sync(&self, link: &mut PrimaryLink, snapshot: &Snapshot) {
        let restored = match self.app.lock() {
            Ok(mut app) => app.restore(snapshot),
            Err(_) => {
                warn!("application state lock poisoned; not acknowledging sync");
                return;
            }
        };

        match restored {
            Ok(()) => {
                trace!(bytes = snapshot.len(), "sync applied");
                if let Err(e) = link.send(&Message::SyncOk) {
                    debug!(error = %e, "failed to acknowledge sync");
                }
            }
            Err(e) => warn!(error = %e, "anomaly: undecodable snapshot; not acknowledging"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Duration;

    use crossbeam_channel::{Sender, bounded};
    use tandem_app::Roster;
    use tandem_types::ReplicationParams;
    use tandem_wire::InitBackupReply;

    use super::*;

    fn id(name: &str) -> ParticipantId {
        ParticipantId::new(name).unwrap()
    }

    fn fast_timing() -> Timing {
        Timing {
            heartbeat_interval: Duration::from_millis(20),
            connect_backoff: Duration::from_millis(5),
            connect_timeout: Duration::from_millis(200),
            init_backup_timeout: Duration::from_millis(200),
            ..Timing::default()
        }
    }

    fn view(primary_address: SocketAddr) -> View {
        View {
            generation: Generation::new(2),
            primary: id("a"),
            backup: Some(id("b")),
            primary_address,
        }
    }

    fn shutdown_channel() -> (Sender<()>, Receiver<()>) {
        bounded(0)
    }

    #[test]
    fn connect_to_nothing_fails_after_attempts() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let (_tx, shutdown) = shutdown_channel();
        assert!(PrimaryLink::connect(addr, &fast_timing(), &shutdown).is_err());
    }

    #[test]
    fn backup_applies_sync_and_acknowledges() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let timing = fast_timing();
        let (shutdown_tx, shutdown) = shutdown_channel();

        let mut primary_state = Roster::new();
        primary_state.configure(ReplicationParams::default());
        primary_state.create_participant(&id("a"));
        let snapshot = primary_state.snapshot();
        let expected = snapshot.clone();

        let primary = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            write_message(
                &mut stream,
                &Message::InitBackupReply(InitBackupReply {
                    snapshot: Snapshot::default(),
                }),
            )
            .unwrap();
            write_message(&mut stream, &Message::Sync(tandem_wire::Sync { snapshot })).unwrap();
            loop {
                match read_message(&mut stream).unwrap() {
                    Message::SyncOk => break,
                    Message::Heartbeat(_) => {
                        let ack = Message::HeartbeatOk(HeartbeatOk {
                            generation: Generation::new(2),
                        });
                        write_message(&mut stream, &ack).unwrap();
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            drop(shutdown_tx);
        });

        let mut link = PrimaryLink::connect(addr, &timing, &shutdown).unwrap();
        assert!(matches!(
            link.await_init_backup(&timing, &shutdown),
            InitBackup::Snapshot(_)
        ));

        let app = Arc::new(Mutex::new(Roster::new()));
        let name = id("b");
        let v = view(addr);
        let follower = Follower {
            name: &name,
            view: &v,
            role: Role::Backup,
            timing: &timing,
            app: &app,
            shutdown: &shutdown,
        };
        // Returns once the fake primary hangs up the shutdown channel.
        assert_eq!(follower.run(&mut link), FollowerExit::Shutdown);
        primary.join().unwrap();
        assert_eq!(app.lock().unwrap().snapshot(), expected);
    }

    #[test]
    fn silent_primary_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let timing = fast_timing();
        let (_shutdown_tx, shutdown) = shutdown_channel();

        // Accepts and never answers.
        let _primary = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(stream);
        });

        let mut link = PrimaryLink::connect(addr, &timing, &shutdown).unwrap();
        let app = Arc::new(Mutex::new(Roster::new()));
        let name = id("c");
        let v = view(addr);
        let follower = Follower {
            name: &name,
            view: &v,
            role: Role::Client,
            timing: &timing,
            app: &app,
            shutdown: &shutdown,
        };
        assert_eq!(follower.run(&mut link), FollowerExit::PrimaryFailed);
    }

    #[test]
    fn newer_generation_in_ack_stops_the_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let timing = fast_timing();
        let (_shutdown_tx, shutdown) = shutdown_channel();

        let _primary = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            while let Ok(Message::Heartbeat(_)) = read_message(&mut stream) {
                let ack = Message::HeartbeatOk(HeartbeatOk {
                    generation: Generation::new(5),
                });
                if write_message(&mut stream, &ack).is_err() {
                    break;
                }
            }
        });

        let mut link = PrimaryLink::connect(addr, &timing, &shutdown).unwrap();
        let app = Arc::new(Mutex::new(Roster::new()));
        let name = id("c");
        let v = view(addr);
        let follower = Follower {
            name: &name,
            view: &v,
            role: Role::Client,
            timing: &timing,
            app: &app,
            shutdown: &shutdown,
        };
        assert_eq!(
            follower.run(&mut link),
            FollowerExit::NewerView(Generation::new(5))
        );
        assert!(!link.is_closed());
    }

    #[test]
    fn interrupted_reports_shutdown() {
        let (tx, shutdown) = shutdown_channel();
        assert!(!interrupted(&shutdown, Duration::from_millis(1)));
        drop(tx);
        assert!(interrupted(&shutdown, Duration::from_secs(10)));
    }
}
