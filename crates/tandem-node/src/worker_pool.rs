//! Participant worker pool.
//!
//! Routes participants to a fixed set of worker threads via a deterministic
//! hash of the `ParticipantId`. Each worker owns a bounded inbox and runs
//! its tasks one at a time, so every participant's tasks execute in
//! submission order without one OS thread per participant.
//!
//! Every task that changes application state holds the mutation lock across
//! the change and the backup sync that follows it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_channel::Sender;
use crossbeam_queue::ArrayQueue;
use tandem_app::Application;
use tandem_types::ParticipantId;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{NodeError, NodeResult};
use crate::sync::{LoopSender, SyncOutcome};

/// How long an idle worker parks before re-checking its inbox.
const IDLE_PARK: Duration = Duration::from_millis(100);

/// A mutation run under the mutation lock.
pub type Mutation<A> = Box<dyn FnOnce(&mut A) + Send>;

/// Routes participants to workers.
///
/// The routing is deterministic: a given participant always maps to the
/// same worker index.
#[derive(Debug, Clone, Copy)]
pub struct ParticipantRouter {
    worker_count: usize,
}

impl ParticipantRouter {
    /// # Panics
    ///
    /// Panics if `worker_count` is 0.
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be positive");
        Self { worker_count }
    }

    /// Returns the worker index that handles `participant`.
    pub fn route(&self, participant: &ParticipantId) -> usize {
        let mut hasher = DefaultHasher::new();
        participant.hash(&mut hasher);
        (hasher.finish() % self.worker_count as u64) as usize
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

/// Work for a participant's worker.
pub enum Task<A> {
    /// Create the participant if absent, then sync.
    Join(ParticipantId),
    /// Remove the participant, then sync.
    Leave(ParticipantId),
    /// Run `op` under the mutation lock, sync, and report the outcome.
    Mutate {
        participant: ParticipantId,
        op: Mutation<A>,
        completion: Option<Sender<SyncOutcome>>,
    },
    /// Stop the worker once everything queued before it has run.
    Shutdown,
}

impl<A> Task<A> {
    fn participant(&self) -> Option<&ParticipantId> {
        match self {
            Task::Join(p) | Task::Leave(p) | Task::Mutate { participant: p, .. } => Some(p),
            Task::Shutdown => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Task::Join(_) => "join",
            Task::Leave(_) => "leave",
            Task::Mutate { .. } => "mutate",
            Task::Shutdown => "shutdown",
        }
    }
}

/// Bounded inbox that wakes its parked worker on push.
struct Inbox<A> {
    queue: ArrayQueue<Task<A>>,
    worker: Mutex<Option<Thread>>,
}

impl<A> Inbox<A> {
    fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            worker: Mutex::new(None),
        }
    }

    /// Returns the task back if the inbox is full.
    fn push(&self, task: Task<A>) -> Result<(), Task<A>> {
        self.queue.push(task)?;
        self.wake();
        Ok(())
    }

    fn pop(&self) -> Option<Task<A>> {
        self.queue.pop()
    }

    fn wake(&self) {
        if let Ok(worker) = self.worker.lock() {
            if let Some(thread) = worker.as_ref() {
                thread.unpark();
            }
        }
    }
}

/// State every worker thread shares.
struct WorkerContext<A> {
    app: Arc<Mutex<A>>,
    loop_tx: LoopSender,
    sync_timeout: Duration,
}

/// Fixed pool of participant workers.
///
/// # Lifecycle
///
/// 1. `WorkerPool::start` spawns the worker threads.
/// 2. `submit` routes tasks to the owning worker.
/// 3. `shutdown` stops accepting tasks and joins every thread.
pub struct WorkerPool<A: Application> {
    router: ParticipantRouter,
    inboxes: Vec<Arc<Inbox<A>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl<A: Application> WorkerPool<A> {
    pub(crate) fn start(
        config: WorkerConfig,
        app: Arc<Mutex<A>>,
        loop_tx: LoopSender,
        sync_timeout: Duration,
    ) -> NodeResult<Self> {
        let worker_count = config.worker_count.max(1);
        let router = ParticipantRouter::new(worker_count);
        let stopping = Arc::new(AtomicBool::new(false));
        let context = Arc::new(WorkerContext {
            app,
            loop_tx,
            sync_timeout,
        });

        let mut inboxes = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let inbox = Arc::new(Inbox::new(config.queue_capacity.max(1)));
            let thread_inbox = Arc::clone(&inbox);
            let thread_context = Arc::clone(&context);
            let thread_stopping = Arc::clone(&stopping);

            let handle = thread::Builder::new()
                .name(format!("tandem-worker-{worker_id}"))
                .spawn(move || Self::worker_loop(&thread_inbox, &thread_context, &thread_stopping))?;

            if let Ok(mut worker) = inbox.worker.lock() {
                *worker = Some(handle.thread().clone());
            }
            inboxes.push(inbox);
            handles.push(handle);
        }

        debug!(worker_count, "worker pool started");
        Ok(Self {
            router,
            inboxes,
            handles: Mutex::new(handles),
            stopping,
        })
    }

    /// Routes a task to its participant's worker.
    pub fn submit(&self, task: Task<A>) -> NodeResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(NodeError::Shutdown);
        }
        let Some(participant) = task.participant().cloned() else {
            return Err(NodeError::Shutdown);
        };

        let worker = self.router.route(&participant);
        self.inboxes[worker]
            .push(task)
            .map_err(|_| NodeError::Backpressure(participant))
    }

    /// Stops every worker after its queued tasks and joins the threads.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for inbox in &self.inboxes {
            // A full inbox still drains; the stopping flag ends the loop.
            let _ = inbox.push(Task::Shutdown);
            inbox.wake();
        }

        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked outside a task");
            }
        }
    }

    pub fn router(&self) -> ParticipantRouter {
        self.router
    }

    fn worker_loop(inbox: &Inbox<A>, context: &WorkerContext<A>, stopping: &AtomicBool) {
        loop {
            match inbox.pop() {
                Some(Task::Shutdown) => break,
                Some(task) => {
                    let Some(participant) = task.participant().cloned() else {
                        continue;
                    };
                    let name = task.name();
                    let result = panic::catch_unwind(AssertUnwindSafe(|| run_task(task, context)));
                    let failure = match result {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e.to_string()),
                        Err(panic) => Some(panic_message(panic.as_ref())),
                    };

                    if let Some(reason) = failure {
                        error!(%participant, task = name, %reason, "worker task failed");
                        context.loop_tx.worker_failed(participant, reason);
                        break;
                    }
                }
                None => {
                    if stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::park_timeout(IDLE_PARK);
                }
            }
        }
    }
}

impl<A: Application> Drop for WorkerPool<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs one task. Errors are fatal to the node.
fn run_task<A: Application>(task: Task<A>, context: &WorkerContext<A>) -> NodeResult<()> {
    let mut app = context.app.lock().map_err(|_| NodeError::Poisoned)?;

    match task {
        Task::Join(participant) => {
            if app.create_participant(&participant) {
                let outcome = context.loop_tx.replicate(app.snapshot(), context.sync_timeout);
                info!(%participant, %outcome, "participant joined");
            } else {
                debug!(%participant, "participant already present");
            }
        }
        Task::Leave(participant) => {
            if app.remove_participant(&participant) {
                let outcome = context.loop_tx.replicate(app.snapshot(), context.sync_timeout);
                info!(%participant, %outcome, "participant removed");
            }
        }
        Task::Mutate {
            participant,
            op,
            completion,
        } => {
            op(&mut *app);
            let outcome = context.loop_tx.replicate(app.snapshot(), context.sync_timeout);
            drop(app);

            if !outcome.is_replicated() && outcome != SyncOutcome::Skipped {
                warn!(%participant, %outcome, "mutation not replicated");
            }
            if let Some(completion) = completion {
                crate::sync::complete(&completion, outcome);
            }
        }
        Task::Shutdown => {}
    }
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
