//! Participant node: view handling and role transitions.
//!
//! [`Node::run`] drives one participant through the view sequence. Each
//! view reply is compared with the view this node last applied:
//!
//! | received generation | action                                      |
//! |---------------------|---------------------------------------------|
//! | newer               | apply it: become primary, backup, or client |
//! | equal               | resume the current role                     |
//! | older               | ignore, wait, query again                   |
//!
//! A primary serves until its loop asks for a view change; a follower
//! heartbeats the primary until the primary fails or is seen to be ahead.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use mio::Waker;
use tandem_app::Application;
use tandem_types::{Generation, ParticipantId, ReplicationParams, Role, Snapshot, View};
use tandem_viewservice::{ViewServiceClient, ViewServiceResult};
use tandem_wire::{Hello, InitBackupRequest, Message, ViewReply};
use tracing::{debug, info, instrument, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::follower::{self, Follower, FollowerExit, InitBackup, PrimaryLink};
use crate::primary::{PrimaryExit, PrimaryLoop};
use crate::sync::SyncOutcome;
use crate::worker_pool::{Task, WorkerPool};

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Clone)]
struct Published {
    view: Option<View>,
    role: Role,
    /// The application holds a usable replica.
    replica: bool,
}

struct PrimaryHooks<A: Application> {
    pool: Arc<WorkerPool<A>>,
    waker: Arc<Waker>,
}

/// State shared between the node thread and its handles.
pub(crate) struct NodeShared<A: Application> {
    name: ParticipantId,
    app: Arc<Mutex<A>>,
    published: RwLock<Published>,
    primary: Mutex<Option<PrimaryHooks<A>>>,
    shutdown: AtomicBool,
    /// Dropped on shutdown; every clone of `shutdown_rx` then disconnects.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl<A: Application> NodeShared<A> {
    pub(crate) fn new(name: ParticipantId) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            name,
            app: Arc::new(Mutex::new(A::default())),
            published: RwLock::new(Published {
                view: None,
                role: Role::Uninitialized,
                replica: false,
            }),
            primary: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    pub(crate) fn app(&self) -> &Arc<Mutex<A>> {
        &self.app
    }

    pub(crate) fn install_primary(&self, pool: Arc<WorkerPool<A>>, waker: Arc<Waker>) {
        if let Ok(mut primary) = self.primary.lock() {
            *primary = Some(PrimaryHooks { pool, waker });
        }
    }

    pub(crate) fn clear_primary(&self) {
        if let Ok(mut primary) = self.primary.lock() {
            *primary = None;
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn workers(&self) -> Option<Arc<WorkerPool<A>>> {
        self.primary
            .lock()
            .ok()
            .and_then(|primary| primary.as_ref().map(|hooks| Arc::clone(&hooks.pool)))
    }

    fn published(&self) -> Published {
        match self.published.read() {
            Ok(published) => published.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn publish(&self, view: &View, role: Role, replica: bool) {
        let mut published = match self.published.write() {
            Ok(published) => published,
            Err(poisoned) => poisoned.into_inner(),
        };
        *published = Published {
            view: Some(view.clone()),
            role,
            replica,
        };
    }

    fn trigger_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut tx) = self.shutdown_tx.lock() {
            tx.take();
        }
        if let Ok(primary) = self.primary.lock() {
            if let Some(hooks) = primary.as_ref() {
                if let Err(e) = hooks.waker.wake() {
                    warn!(error = %e, "failed to wake primary loop");
                }
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Result of a mutation applied through [`NodeHandle::mutate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutated<R> {
    /// What the mutation closure returned.
    pub value: R,
    /// How the post-mutation sync ended.
    pub sync: SyncOutcome,
}

/// Thread-safe handle to a running node.
pub struct NodeHandle<A: Application> {
    shared: Arc<NodeShared<A>>,
}

impl<A: Application> Clone for NodeHandle<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A: Application> NodeHandle<A> {
    pub(crate) fn new(shared: Arc<NodeShared<A>>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &ParticipantId {
        &self.shared.name
    }

    /// Most recently applied view.
    pub fn current_view(&self) -> Option<View> {
        self.shared.published().view
    }

    pub fn role(&self) -> Role {
        self.shared.published().role
    }

    /// Snapshot of the local replica.
    ///
    /// Fails with [`NodeError::NoReplica`] on clients and on a backup that
    /// has not finished initialization.
    pub fn snapshot(&self) -> NodeResult<Snapshot> {
        self.read(A::snapshot)
    }

    /// Runs `f` against the local replica under the mutation lock.
    pub fn read<R>(&self, f: impl FnOnce(&A) -> R) -> NodeResult<R> {
        let published = self.shared.published();
        if !published.replica || !matches!(published.role, Role::Primary | Role::Backup) {
            return Err(NodeError::NoReplica(published.role));
        }
        let app = self.shared.app.lock().map_err(|_| NodeError::Poisoned)?;
        Ok(f(&*app))
    }

    /// Applies `op` on the worker that owns `participant` and waits for the
    /// backup sync that follows it.
    pub fn mutate<R, F>(&self, participant: &ParticipantId, op: F) -> NodeResult<Mutated<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut A) -> R + Send + 'static,
    {
        let role = self.role();
        if role != Role::Primary {
            return Err(NodeError::NotPrimary(role));
        }
        let pool = self.shared.workers().ok_or(NodeError::NotPrimary(role))?;

        let (value_tx, value_rx) = bounded(1);
        let (completion, done) = bounded(1);
        pool.submit(Task::Mutate {
            participant: participant.clone(),
            op: Box::new(move |app: &mut A| {
                let _ = value_tx.send(op(app));
            }),
            completion: Some(completion),
        })?;
        // The pool must not outlive a step-down because of this handle.
        drop(pool);

        let sync = done
            .recv()
            .map_err(|_| NodeError::MutationDropped(participant.clone()))?;
        let value = value_rx
            .try_recv()
            .map_err(|_| NodeError::MutationDropped(participant.clone()))?;
        Ok(Mutated { value, sync })
    }

    /// Asks the node to stop. [`Node::run`] returns soon after.
    pub fn shutdown(&self) {
        self.shared.trigger_shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }
}

// ============================================================================
// Node
// ============================================================================

/// What the driver does next.
enum Step {
    /// Serve the current role under the applied view.
    Serve,
    /// Consider a reply from the view service.
    Next(ViewReply),
    Shutdown,
}

/// A participant in the replication protocol.
pub struct Node<A: Application> {
    config: NodeConfig,
    client: ViewServiceClient,
    shared: Arc<NodeShared<A>>,
    /// Reserved listening socket, handed to the primary loop on promotion.
    listener: Option<TcpListener>,
    bound_address: SocketAddr,
    view: Option<View>,
    role: Role,
    replica: bool,
    primary: Option<PrimaryLoop<A>>,
    link: Option<PrimaryLink>,
}

impl<A: Application> Node<A> {
    /// Binds the participant listener and prepares the view-service client.
    ///
    /// The listener is bound up front so the advertised address is known
    /// before the first `Query`.
    pub fn new(config: NodeConfig) -> NodeResult<Self> {
        let listener = TcpListener::bind(config.listen_address).map_err(|source| {
            NodeError::BindFailed {
                addr: config.listen_address,
                source,
            }
        })?;
        let bound_address = listener.local_addr()?;
        let advertised = config.advertise_address.unwrap_or(bound_address);

        let client = ViewServiceClient::connect(
            config.view_service_address,
            config.name.clone(),
            advertised,
            config.timing.client_options(),
        )?;

        Ok(Self {
            shared: Arc::new(NodeShared::new(config.name.clone())),
            config,
            client,
            listener: Some(listener),
            bound_address,
            view: None,
            role: Role::Uninitialized,
            replica: false,
            primary: None,
            link: None,
        })
    }

    pub fn handle(&self) -> NodeHandle<A> {
        NodeHandle::new(Arc::clone(&self.shared))
    }

    pub fn name(&self) -> &ParticipantId {
        &self.config.name
    }

    /// Address other participants use to reach this node as primary.
    pub fn advertised_address(&self) -> SocketAddr {
        self.client.advertised_address()
    }

    /// Joins the view service and follows views until shutdown.
    ///
    /// Returns `Ok(())` after [`NodeHandle::shutdown`]; an error is fatal.
    pub fn run(&mut self) -> NodeResult<()> {
        info!(
            node = %self.config.name,
            advertised = %self.advertised_address(),
            view_service = %self.config.view_service_address,
            "node starting"
        );
        let result = self.drive();
        if let Err(e) = &result {
            warn!(node = %self.config.name, error = %e, "node failed");
        }
        self.teardown();
        result
    }

    fn drive(&mut self) -> NodeResult<()> {
        let mut step = self.request("join", ViewServiceClient::join);
        loop {
            step = match step {
                Step::Shutdown => return Ok(()),
                Step::Next(reply) => self.consider(reply)?,
                Step::Serve => self.serve()?,
            };
        }
    }

    fn teardown(&mut self) {
        self.shared.trigger_shutdown();
        self.link = None;
        if let Some(primary) = self.primary.take() {
            primary.shutdown();
        }
        info!(node = %self.config.name, "node stopped");
    }

    /// Sends a view-service request, retrying while the service is silent.
    fn request(
        &self,
        what: &'static str,
        op: impl Fn(&ViewServiceClient) -> ViewServiceResult<ViewReply>,
    ) -> Step {
        loop {
            if self.shared.is_shutdown() {
                return Step::Shutdown;
            }
            match op(&self.client) {
                Ok(reply) => return Step::Next(reply),
                Err(e) => {
                    warn!(request = what, error = %e, "view service request failed; retrying");
                    if self.wait(self.config.timing.view_poll_interval) {
                        return Step::Shutdown;
                    }
                }
            }
        }
    }

    /// Sleeps unless shut down first. Returns true on shutdown.
    fn wait(&self, duration: Duration) -> bool {
        follower::interrupted(&self.shared.shutdown_rx, duration)
    }

    fn applied_generation(&self) -> Generation {
        self.view.as_ref().map_or(Generation::ZERO, |view| view.generation)
    }

    fn consider(&mut self, reply: ViewReply) -> NodeResult<Step> {
        let applied = self.applied_generation();
        let received = reply.view.generation;

        if received > applied {
            return self.start_view(reply);
        }
        if received == applied {
            debug!(generation = %received, role = %self.role, "view unchanged; resuming");
            return self.resume();
        }

        debug!(%received, %applied, "ignoring stale view");
        if self.wait(self.config.timing.view_poll_interval) {
            return Ok(Step::Shutdown);
        }
        Ok(self.request("query", ViewServiceClient::query))
    }

    fn resume(&mut self) -> NodeResult<Step> {
        let Some(view) = self.view.clone() else {
            return Ok(self.request("query", ViewServiceClient::query));
        };
        match self.role {
            Role::Primary => Ok(Step::Serve),
            Role::Backup | Role::Client => {
                if self.link.as_ref().is_some_and(|link| !link.is_closed()) {
                    Ok(Step::Serve)
                } else {
                    self.follow(&view, self.role, self.config.timing.backup_change_guard)
                }
            }
            Role::Uninitialized => Ok(self.request("query", ViewServiceClient::query)),
        }
    }

    #[instrument(skip_all, fields(node = %self.config.name, generation = %reply.view.generation))]
    fn start_view(&mut self, reply: ViewReply) -> NodeResult<Step> {
        let ViewReply { view, params } = reply;
        let role = view.role_of(&self.config.name);
        let previous = self.view.replace(view.clone());
        info!(%view, %role, "applying view");

        if role == Role::Primary {
            return self.become_primary(&view, params);
        }

        if let Some(primary) = self.primary.take() {
            info!("no longer primary; stepping down");
            primary.shutdown();
            self.reserve_listener();
        }

        let primary_changed = previous
            .as_ref()
            .is_none_or(|previous| previous.primary != view.primary);
        let guard = if primary_changed {
            self.config.timing.primary_change_guard
        } else {
            self.config.timing.backup_change_guard
        };
        self.follow(&view, role, guard)
    }

    fn become_primary(&mut self, view: &View, params: ReplicationParams) -> NodeResult<Step> {
        if self.primary.is_none() {
            self.link = None;

            if view.generation == Generation::FIRST || !self.replica {
                if view.generation != Generation::FIRST {
                    warn!("promoted without a replica; starting from empty state");
                }
                let mut app = self.shared.app.lock().map_err(|_| NodeError::Poisoned)?;
                *app = A::default();
                app.configure(params);
                app.create_participant(&self.config.name);
            }

            let listener = match self.listener.take() {
                Some(listener) => listener,
                None => bind(self.bound_address)?,
            };
            self.primary = Some(PrimaryLoop::start(
                &self.config,
                listener,
                Arc::clone(&self.shared),
            )?);
            info!(backup = ?view.backup, "serving as primary");
        }

        self.role = Role::Primary;
        self.replica = true;
        self.shared.publish(view, Role::Primary, true);
        Ok(Step::Serve)
    }

    /// Holds the listening port while not primary so the advertised address stays ours.
    fn reserve_listener(&mut self) {
        match bind(self.bound_address) {
            Ok(listener) => self.listener = Some(listener),
            Err(e) => warn!(error = %e, "could not re-reserve listener; will bind on promotion"),
        }
    }

    /// Connects to `view`'s primary as a backup or client.
    fn follow(&mut self, view: &View, role: Role, guard: Duration) -> NodeResult<Step> {
        self.role = role;
        self.replica = false;
        self.shared.publish(view, role, false);

        if self.wait(guard) {
            return Ok(Step::Shutdown);
        }

        if self
            .link
            .as_ref()
            .is_some_and(|link| link.peer() != view.primary_address || link.is_closed())
        {
            self.link = None;
        }

        if self.link.is_none() {
            let mut link = match PrimaryLink::connect(
                view.primary_address,
                &self.config.timing,
                &self.shared.shutdown_rx,
            ) {
                Ok(link) => link,
                Err(e) => {
                    if self.shared.is_shutdown() {
                        return Ok(Step::Shutdown);
                    }
                    warn!(primary = %view.primary, addr = %view.primary_address, error = %e, "cannot reach primary");
                    return Ok(self.report_primary_failure(view));
                }
            };
            let hello = Message::Hello(Hello {
                name: self.config.name.clone(),
            });
            if let Err(e) = link.send(&hello) {
                warn!(primary = %view.primary, error = %e, "hello failed");
                return Ok(self.report_primary_failure(view));
            }
            self.link = Some(link);
        }

        if role == Role::Backup {
            match self.init_backup(view)? {
                Some(step) => return Ok(step),
                None => self.replica = true,
            }
        } else {
            let mut app = self.shared.app.lock().map_err(|_| NodeError::Poisoned)?;
            *app = A::default();
        }

        self.shared.publish(view, role, self.replica);
        info!(primary = %view.primary, %role, "following primary");
        Ok(Step::Serve)
    }

    /// Fetches the primary's state. Returns a step only when init did not succeed.
    fn init_backup(&mut self, view: &View) -> NodeResult<Option<Step>> {
        let Some(link) = self.link.as_mut() else {
            return Ok(Some(self.report_primary_failure(view)));
        };

        let request = Message::InitBackupRequest(InitBackupRequest {
            generation: view.generation,
        });
        if let Err(e) = link.send(&request) {
            warn!(primary = %view.primary, error = %e, "backup init request failed");
            return Ok(Some(self.report_primary_failure(view)));
        }

        let snapshot =
            match link.await_init_backup(&self.config.timing, &self.shared.shutdown_rx) {
                InitBackup::Snapshot(snapshot) => snapshot,
                InitBackup::Shutdown => return Ok(Some(Step::Shutdown)),
                InitBackup::Failed => {
                    warn!(primary = %view.primary, "no backup init reply");
                    return Ok(Some(self.report_primary_failure(view)));
                }
            };

        let restored = {
            let mut app = self.shared.app.lock().map_err(|_| NodeError::Poisoned)?;
            app.restore(&snapshot)
        };
        if let Err(e) = restored {
            warn!(error = %e, "anomaly: undecodable initial snapshot");
            return Ok(Some(self.report_primary_failure(view)));
        }

        info!(bytes = snapshot.len(), "backup initialized from primary");
        Ok(None)
    }

    /// Reports `view`'s primary as failed, proposing this node as the successor.
    fn report_primary_failure(&mut self, view: &View) -> Step {
        self.link = None;
        match self.client.report_failure(
            view.generation,
            view.primary.clone(),
            self.config.name.clone(),
        ) {
            Ok(reply) => Step::Next(reply),
            Err(e) => {
                warn!(error = %e, "failure report not answered");
                self.request("query", ViewServiceClient::query)
            }
        }
    }

    fn serve(&mut self) -> NodeResult<Step> {
        let Some(view) = self.view.clone() else {
            return Ok(self.request("query", ViewServiceClient::query));
        };

        match self.role {
            Role::Primary => self.serve_primary(&view),
            Role::Backup | Role::Client => self.serve_follower(&view),
            Role::Uninitialized => Ok(self.request("query", ViewServiceClient::query)),
        }
    }

    fn serve_primary(&mut self, view: &View) -> NodeResult<Step> {
        let Some(primary) = self.primary.as_mut() else {
            return Ok(self.request("query", ViewServiceClient::query));
        };

        let reply = match primary.run(view)? {
            PrimaryExit::Shutdown => return Ok(Step::Shutdown),
            PrimaryExit::ReportBackupFailure { failed, candidate } => {
                self.client
                    .report_failure(view.generation, failed, candidate)
            }
            PrimaryExit::Requery => self.client.query(),
        };

        match reply {
            Ok(reply) => Ok(Step::Next(reply)),
            Err(e) => {
                warn!(error = %e, "view service unavailable; resuming as primary");
                Ok(Step::Serve)
            }
        }
    }

    fn serve_follower(&mut self, view: &View) -> NodeResult<Step> {
        let Some(link) = self.link.as_mut() else {
            return self.follow(view, self.role, self.config.timing.backup_change_guard);
        };

        let exit = Follower {
            name: &self.config.name,
            view,
            role: self.role,
            timing: &self.config.timing,
            app: &self.shared.app,
            shutdown: &self.shared.shutdown_rx,
        }
        .run(link);

        match exit {
            FollowerExit::Shutdown => Ok(Step::Shutdown),
            FollowerExit::NewerView(_) => match self.client.query() {
                Ok(reply) => Ok(Step::Next(reply)),
                Err(e) => {
                    warn!(error = %e, "view service unavailable; staying with current primary");
                    Ok(Step::Serve)
                }
            },
            FollowerExit::PrimaryFailed => {
                self.link = None;
                if self.role == Role::Backup {
                    info!(primary = %view.primary, "primary failed; waiting for a newer view");
                    Ok(self.await_newer_view(view.generation))
                } else {
                    info!(primary = %view.primary, "primary failed; offering to take over as backup");
                    Ok(self.report_primary_failure(view))
                }
            }
        }
    }

    /// Polls until the view service moves past `generation`.
    fn await_newer_view(&self, generation: Generation) -> Step {
        loop {
            if self.wait(self.config.timing.view_poll_interval) {
                return Step::Shutdown;
            }
            match self.client.query() {
                Ok(reply) if reply.view.generation > generation => return Step::Next(reply),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "view poll failed"),
            }
        }
    }
}

fn bind(addr: SocketAddr) -> NodeResult<TcpListener> {
    TcpListener::bind(addr).map_err(|source| NodeError::BindFailed { addr, source })
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::thread;

    use tandem_app::Roster;
    use tandem_wire::{HeartbeatOk, read_message, write_message};

    use super::*;
    use crate::tests::{SETTLE, id, test_timing, wait_until};

    fn shared() -> NodeShared<Roster> {
        NodeShared::new(ParticipantId::new("a").unwrap())
    }

    fn view() -> View {
        View::initial(
            ParticipantId::new("a").unwrap(),
            "127.0.0.1:7000".parse().unwrap(),
        )
    }

    #[test]
    fn replica_access_requires_synchronized_role() {
        let handle = NodeHandle {
            shared: Arc::new(shared()),
        };
        assert!(matches!(
            handle.snapshot(),
            Err(NodeError::NoReplica(Role::Uninitialized))
        ));

        handle.shared.publish(&view(), Role::Backup, false);
        assert!(matches!(
            handle.snapshot(),
            Err(NodeError::NoReplica(Role::Backup))
        ));

        handle.shared.publish(&view(), Role::Backup, true);
        assert!(handle.snapshot().is_ok());
        assert_eq!(handle.current_view(), Some(view()));
    }

    #[test]
    fn mutate_requires_primary() {
        let handle = NodeHandle {
            shared: Arc::new(shared()),
        };
        handle.shared.publish(&view(), Role::Client, false);
        let participant = ParticipantId::new("c").unwrap();
        assert!(matches!(
            handle.mutate(&participant, |_| ()),
            Err(NodeError::NotPrimary(Role::Client))
        ));
    }

    #[test]
    fn shutdown_disconnects_signal() {
        let handle = NodeHandle {
            shared: Arc::new(shared()),
        };
        let signal = handle.shared.shutdown_rx.clone();
        assert!(!follower::interrupted(&signal, Duration::from_millis(1)));

        handle.shutdown();
        handle.shutdown();
        assert!(handle.is_shutdown());
        assert!(follower::interrupted(&signal, Duration::from_secs(10)));
    }

    /// Receives the next Query on a scripted view service.
    fn expect_query(service: &UdpSocket) -> SocketAddr {
        let mut buf = [0u8; 2048];
        let (len, from) = service.recv_from(&mut buf).unwrap();
        assert!(matches!(
            Message::from_datagram(&buf[..len]).unwrap(),
            Message::Query(_)
        ));
        from
    }

    fn reply_view(service: &UdpSocket, to: SocketAddr, generation: u64, primary: SocketAddr) {
        let reply = Message::ViewReply(ViewReply {
            view: View {
                generation: Generation::new(generation),
                primary: id("p"),
                backup: Some(id("b")),
                primary_address: primary,
            },
            params: ReplicationParams::default(),
        });
        service.send_to(&reply.to_datagram().unwrap(), to).unwrap();
    }

    fn generation_of(handle: &NodeHandle<Roster>) -> Generation {
        handle
            .current_view()
            .map_or(Generation::ZERO, |view| view.generation)
    }

    #[test]
    fn primary_ahead_triggers_requery_and_stale_views_are_ignored() {
        let service = UdpSocket::bind("127.0.0.1:0").unwrap();
        service.set_read_timeout(Some(SETTLE)).unwrap();
        let primary = TcpListener::bind("127.0.0.1:0").unwrap();
        let primary_address = primary.local_addr().unwrap();

        let config = NodeConfig::new(
            id("c"),
            "127.0.0.1:0".parse().unwrap(),
            service.local_addr().unwrap(),
        )
        .with_timing(test_timing());
        let mut node: Node<Roster> = Node::new(config).unwrap();
        let handle = node.handle();
        let runner = thread::spawn(move || node.run());

        let from = expect_query(&service);
        reply_view(&service, from, 2, primary_address);

        let (mut link, _) = primary.accept().unwrap();
        link.set_read_timeout(Some(SETTLE)).unwrap();
        assert!(matches!(read_message(&mut link).unwrap(), Message::Hello(_)));
        assert!(matches!(read_message(&mut link).unwrap(), Message::Heartbeat(_)));
        assert_eq!(handle.role(), Role::Client);
        assert_eq!(generation_of(&handle), Generation::new(2));

        // The primary has moved on; the node asks the view service again.
        write_message(
            &mut link,
            &Message::HeartbeatOk(HeartbeatOk {
                generation: Generation::new(3),
            }),
        )
        .unwrap();
        let from = expect_query(&service);
        reply_view(&service, from, 1, primary_address);

        // The stale answer is dropped and the node polls again.
        let from = expect_query(&service);
        assert_eq!(generation_of(&handle), Generation::new(2));
        assert_eq!(handle.role(), Role::Client);
        reply_view(&service, from, 3, primary_address);

        wait_until("generation 3 applied", || {
            generation_of(&handle) == Generation::new(3)
        });
        assert_eq!(handle.role(), Role::Client);

        handle.shutdown();
        runner.join().unwrap().unwrap();
    }
}
