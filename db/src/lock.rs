use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::session::Session;

/// Identity of a lockable catalog object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbObjectId {
    pub kind: DbObjectKind,
    pub name: String,
}

impl DbObjectId {
    pub fn table(name: &str) -> DbObjectId {
        DbObjectId {
            kind: DbObjectKind::Table,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbObjectKind {
    Table,
    Index,
    Constraint,
    Schema,
    Database,
}

/// Wakes a waiting session. Granting re-dispatches the session; timing out
/// makes the session fail its current statement.
pub trait TransactionListener: Send + Sync {
    fn on_granted(&self);
    fn on_timeout(&self);
}

struct Waiter {
    session: Weak<Session>,
    listener: Arc<dyn TransactionListener>,
    since: Instant,
}

#[derive(Default)]
struct LockState {
    holder: Option<Weak<Session>>,
    waiters: VecDeque<Waiter>,
}

/// A lock on one database object. At most one holder; the holder appears in
/// its session's `locks` list exactly once. Waiters queue FIFO and are woken
/// through their [`TransactionListener`]. Deadlock detection lives in the
/// storage engine; a victim surfaces here as an ordinary wait timeout.
pub struct DbObjectLock {
    object: DbObjectId,
    state: Mutex<LockState>,
    retry_replication_names: Mutex<Vec<String>>,
}

impl DbObjectLock {
    pub fn new(object: DbObjectId) -> Arc<DbObjectLock> {
        Arc::new(DbObjectLock {
            object,
            state: Mutex::new(LockState::default()),
            retry_replication_names: Mutex::new(Vec::new()),
        })
    }

    pub fn object(&self) -> &DbObjectId {
        &self.object
    }

    /// Attempts to take the lock. Reentry by the current holder succeeds
    /// without a second `locks`-list entry.
    pub fn try_lock(self: &Arc<Self>, session: &Arc<Session>) -> bool {
        let mut state = self.state.lock();
        match state.holder.as_ref().and_then(Weak::upgrade) {
            Some(holder) if holder.id() == session.id() => {
                Self::drop_waiter(&mut state, session.id());
                true
            }
            Some(_) => false,
            None => {
                state.holder = Some(Arc::downgrade(session));
                Self::drop_waiter(&mut state, session.id());
                drop(state);
                session.add_lock(self.clone());
                true
            }
        }
    }

    fn drop_waiter(state: &mut LockState, session_id: u64) {
        state
            .waiters
            .retain(|w| w.session.upgrade().is_some_and(|s| s.id() != session_id));
    }

    pub fn holder(&self) -> Option<Arc<Session>> {
        self.state.lock().holder.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Queues `session` behind the current holder.
    pub fn add_waiter(&self, session: &Arc<Session>, listener: Arc<dyn TransactionListener>) {
        let mut state = self.state.lock();
        if state
            .waiters
            .iter()
            .any(|w| w.session.upgrade().is_some_and(|s| s.id() == session.id()))
        {
            return;
        }
        tracing::trace!(
            session = session.id(),
            object = %self.object.name,
            "waiting for object lock"
        );
        state.waiters.push_back(Waiter {
            session: Arc::downgrade(session),
            listener,
            since: Instant::now(),
        });
    }

    pub fn remove_waiter(&self, session_id: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.waiters.len();
        state
            .waiters
            .retain(|w| w.session.upgrade().is_some_and(|s| s.id() != session_id));
        state.waiters.len() != before
    }

    /// How long the oldest waiter has been queued, for diagnostics.
    pub fn longest_wait(&self) -> Option<std::time::Duration> {
        self.state
            .lock()
            .waiters
            .front()
            .map(|w| w.since.elapsed())
    }

    /// Releases the lock held by `session`. With `new_owner` the ownership
    /// moves atomically (replication conflict resolution); otherwise the
    /// first live waiter is granted and woken. `succeeded` mirrors whether
    /// the holding statement committed; it only affects logging here, the
    /// data effects were already handled by the transaction.
    pub fn unlock(
        self: &Arc<Self>,
        session: &Arc<Session>,
        succeeded: bool,
        new_owner: Option<&Arc<Session>>,
    ) {
        let granted = {
            let mut state = self.state.lock();
            let held_by_us = state
                .holder
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|holder| holder.id() == session.id());
            if !held_by_us {
                return;
            }
            tracing::trace!(
                session = session.id(),
                object = %self.object.name,
                succeeded,
                "unlock"
            );
            if let Some(new_owner) = new_owner {
                state.holder = Some(Arc::downgrade(new_owner));
                Self::drop_waiter(&mut state, new_owner.id());
                Some((new_owner.clone(), None))
            } else {
                state.holder = None;
                loop {
                    match state.waiters.pop_front() {
                        None => break None,
                        Some(waiter) => {
                            if let Some(next) = waiter.session.upgrade() {
                                state.holder = Some(Arc::downgrade(&next));
                                break Some((next, Some(waiter.listener)));
                            }
                        }
                    }
                }
            }
        };
        if let Some((next, listener)) = granted {
            next.add_lock(self.clone());
            if let Some(listener) = listener {
                listener.on_granted();
            }
        }
    }

    pub fn retry_replication_names(&self) -> Vec<String> {
        self.retry_replication_names.lock().clone()
    }

    /// Replaces the whole retry list, regardless of which conflict put it
    /// there. Intentional: the negotiation applies its list to every lock
    /// the losing session holds.
    pub fn set_retry_replication_names(&self, names: Vec<String>) {
        *self.retry_replication_names.lock() = names;
    }
}

impl std::fmt::Debug for DbObjectLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbObjectLock")
            .field("object", &self.object)
            .field("locked", &self.is_locked())
            .field("waiting", &self.waiting_count())
            .finish()
    }
}
