use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::DbError;
use crate::session::{Dispatch, Session};

/// How often an idle handler re-checks its sessions for cooperative
/// timeouts (lock waits, transaction timeouts, cancellation deadlines).
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// What one cooperative step produced. The command also reflects the step
/// into its session's status before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldStep {
    /// More work remains or the session is blocked; re-dispatch later.
    Yielded,
    /// The command is done (successfully or not); `finish` delivers it.
    Done,
}

/// A resumable unit of work. `run` must return promptly; blocking waits are
/// expressed by registering a waiter and yielding.
#[async_trait]
pub trait YieldableCommand: Send {
    fn packet_id(&self) -> i32;

    fn session_id(&self) -> u64;

    fn priority(&self) -> CommandPriority {
        CommandPriority::Normal
    }

    fn run(&mut self) -> YieldStep;

    /// Injects a failure decided outside `run` (lock timeout, cancel).
    fn fail(&mut self, error: DbError);

    /// Rewinds one step so the next `run` re-executes the statement.
    fn back(&mut self);

    fn stop(&mut self);

    /// Delivers the outcome: commits/rolls back per session mode and fires
    /// the registered async handler.
    async fn finish(self: Box<Self>);
}

/// Index of the smallest load. Ties keep the first handler scanned.
fn index_of_min(loads: &[usize]) -> usize {
    let mut best = 0;
    let mut min_load = loads[0];
    for (i, &load) in loads.iter().enumerate().skip(1) {
        if load < min_load {
            min_load = load;
            best = i;
        }
    }
    best
}

struct Handler {
    sender: UnboundedSender<Arc<Session>>,
    notify: Arc<Notify>,
    load: Arc<AtomicUsize>,
}

/// The cooperative dispatcher: a fixed pool of handler tasks, each owning a
/// queue of sessions. A session is always driven by exactly one handler.
pub struct Scheduler {
    handlers: Vec<Handler>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub num_handlers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { num_handlers: 4 }
    }
}

impl Scheduler {
    /// Spawns the handler tasks. Must run inside a tokio runtime.
    pub fn new(config: SchedulerConfig) -> Arc<Scheduler> {
        let cancel = CancellationToken::new();
        let mut handlers = Vec::with_capacity(config.num_handlers);
        let mut tasks = Vec::with_capacity(config.num_handlers);
        for i in 0..config.num_handlers.max(1) {
            let (sender, receiver) = mpsc::unbounded_channel();
            let notify = Arc::new(Notify::new());
            let load = Arc::new(AtomicUsize::new(0));
            tasks.push(Self::spawn_handler(
                i,
                receiver,
                notify.clone(),
                load.clone(),
                cancel.clone(),
            ));
            handlers.push(Handler {
                sender,
                notify,
                load,
            });
        }
        Arc::new(Scheduler {
            handlers,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Assigns `session` to the least-loaded handler.
    pub(crate) fn register(&self, session: &Arc<Session>) {
        let loads: Vec<usize> = self
            .handlers
            .iter()
            .map(|h| h.load.load(Ordering::SeqCst))
            .collect();
        let index = index_of_min(&loads);
        let handler = &self.handlers[index];
        handler.load.fetch_add(1, Ordering::SeqCst);
        session.set_handler_index(index);
        if handler.sender.send(session.clone()).is_ok() {
            handler.notify.notify_one();
        }
        tracing::trace!(session = session.id(), handler = index, "session registered");
    }

    /// Nudges the handler owning `handler_index`; a no-op for stale indexes.
    pub(crate) fn wake(&self, handler_index: usize) {
        if let Some(handler) = self.handlers.get(handler_index) {
            handler.notify.notify_one();
        }
    }

    pub fn handler_loads(&self) -> Vec<usize> {
        self.handlers
            .iter()
            .map(|h| h.load.load(Ordering::SeqCst))
            .collect()
    }

    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let tasks = { mem::take(&mut *self.tasks.lock()) };
        for task in tasks {
            let _ = task.await;
        }
    }

    fn spawn_handler(
        index: usize,
        mut receiver: UnboundedReceiver<Arc<Session>>,
        notify: Arc<Notify>,
        load: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sessions: Vec<Arc<Session>> = Vec::new();
            loop {
                select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    new_session = receiver.recv() => {
                        if let Some(new_session) = new_session {
                            sessions.push(new_session);
                        }
                    }
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }

                sessions.retain(|s| {
                    if s.is_closed() {
                        load.fetch_sub(1, Ordering::SeqCst);
                        tracing::trace!(session = s.id(), handler = index, "session removed");
                        false
                    } else {
                        true
                    }
                });

                for session in &sessions {
                    match session.poll_dispatch() {
                        Dispatch::Idle => {}
                        Dispatch::Run(mut command) => match command.run() {
                            YieldStep::Yielded => session.return_yieldable(command),
                            YieldStep::Done => command.finish().await,
                        },
                        Dispatch::Fail(mut command, error) => {
                            command.fail(error);
                            command.finish().await;
                        }
                    }
                }
            }
            tracing::trace!(handler = index, "shutdown handler task");
        })
    }
}
