use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::DbError;
use crate::session::Session;

/// The RPC surface a peer node exposes to a coordinating session. The wire
/// protocol behind it is not this crate's concern.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    async fn execute_update(&self, sql: &str) -> Result<i32, DbError>;

    /// Phase one: the peer prepares and logs a commit-ready record.
    async fn prepare_commit(&self, global_name: &str) -> Result<(), DbError>;

    /// Phase two: the peer finalizes after the coordinator's decision.
    async fn commit(&self, global_name: &str) -> Result<(), DbError>;

    async fn rollback(&self) -> Result<(), DbError>;

    async fn close(&self);
}

/// Opens remote sessions on peers, by peer URL.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn RemoteConnection>, DbError>;
}

/// A pooled session on a peer node, participating in the parent's
/// transaction. The parent link is weak and severed before the session
/// goes back to the pool.
pub struct RemoteSession {
    url: String,
    conn: Box<dyn RemoteConnection>,
    parent: Mutex<Weak<Session>>,
    valid: AtomicBool,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("url", &self.url)
            .field("valid", &self.valid.load(Ordering::Relaxed))
            .finish()
    }
}

impl RemoteSession {
    fn new(url: &str, conn: Box<dyn RemoteConnection>) -> Arc<RemoteSession> {
        Arc::new(RemoteSession {
            url: url.to_string(),
            conn,
            parent: Mutex::new(Weak::new()),
            valid: AtomicBool::new(true),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Session>) {
        *self.parent.lock() = Arc::downgrade(parent);
    }

    pub(crate) fn sever_parent(&self) {
        *self.parent.lock() = Weak::new();
    }

    pub fn parent(&self) -> Option<Arc<Session>> {
        self.parent.lock().upgrade()
    }

    /// Marks the session unusable; the pool discards it on recycle.
    fn invalidate_if_needed<T>(&self, result: Result<T, DbError>) -> Result<T, DbError> {
        if result.is_err() {
            self.valid.store(false, Ordering::SeqCst);
        }
        result
    }

    pub async fn execute_update(&self, sql: &str) -> Result<i32, DbError> {
        let result = self.conn.execute_update(sql).await;
        self.invalidate_if_needed(result)
    }

    pub async fn prepare_commit(&self, global_name: &str) -> Result<(), DbError> {
        let result = self.conn.prepare_commit(global_name).await;
        self.invalidate_if_needed(result)
    }

    pub async fn commit(&self, global_name: &str) -> Result<(), DbError> {
        let result = self.conn.commit(global_name).await;
        self.invalidate_if_needed(result)
    }

    pub async fn rollback(&self) -> Result<(), DbError> {
        let result = self.conn.rollback().await;
        self.invalidate_if_needed(result)
    }

    pub async fn close(&self) {
        self.valid.store(false, Ordering::SeqCst);
        self.conn.close().await;
    }
}

/// Pool limits. `acquire_timeout` bounds the wait when a peer is at
/// `max_per_peer`.
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    pub max_per_peer: usize,
    pub acquire_timeout: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        SessionPoolConfig {
            max_per_peer: 4,
            acquire_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct PeerSessions {
    available: VecDeque<Arc<RemoteSession>>,
    waiters: VecDeque<oneshot::Sender<()>>,
    num_inuse: usize,
}

impl PeerSessions {
    fn take(&mut self) -> Option<Arc<RemoteSession>> {
        let session = self.available.pop_front()?;
        self.num_inuse += 1;
        Some(session)
    }

    fn take_waiter(&mut self) -> Option<oneshot::Sender<()>> {
        while let Some(waiter) = self.waiters.pop_front() {
            // Waiters drop their receiver when acquisition times out.
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }
}

/// Pool of nested remote sessions, keyed by peer URL. Waiters are served
/// before fresh acquirers, and recycling prefers handing the session to a
/// waiter over parking it.
pub struct NestedSessionPool {
    transport: Arc<dyn PeerTransport>,
    config: SessionPoolConfig,
    peers: Mutex<HashMap<String, PeerSessions>>,
}

impl NestedSessionPool {
    pub fn new(transport: Arc<dyn PeerTransport>, config: SessionPoolConfig) -> NestedSessionPool {
        NestedSessionPool {
            transport,
            config,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, url: &str) -> Result<Arc<RemoteSession>, DbError> {
        loop {
            let wait_rx = {
                let mut peers = self.peers.lock();
                let peer = peers.entry(url.to_string()).or_default();

                // Prioritize waiters over new acquirers.
                if peer.waiters.is_empty() {
                    if let Some(session) = peer.take() {
                        return Ok(session);
                    }
                    if peer.num_inuse < self.config.max_per_peer {
                        peer.num_inuse += 1;
                        None
                    } else {
                        let (tx, rx) = oneshot::channel();
                        peer.waiters.push_back(tx);
                        Some(rx)
                    }
                } else {
                    let (tx, rx) = oneshot::channel();
                    peer.waiters.push_back(tx);
                    Some(rx)
                }
            };

            match wait_rx {
                None => {
                    // Reserved a slot; open outside the lock.
                    match self.transport.open(url).await {
                        Ok(conn) => return Ok(RemoteSession::new(url, conn)),
                        Err(e) => {
                            let mut peers = self.peers.lock();
                            if let Some(peer) = peers.get_mut(url) {
                                peer.num_inuse -= 1;
                            }
                            return Err(e);
                        }
                    }
                }
                Some(rx) => match timeout(self.config.acquire_timeout, rx).await {
                    Ok(Ok(())) => continue,
                    _ => {
                        tracing::debug!(url, "timeout acquiring nested session");
                        return Err(DbError::General(format!(
                            "nested session acquisition timed out for {url}"
                        )));
                    }
                },
            }
        }
    }

    /// Severs the parent link and returns the session to its peer queue, or
    /// discards it when it went invalid.
    pub fn recycle(&self, session: Arc<RemoteSession>) {
        session.sever_parent();
        let waiter = {
            let mut peers = self.peers.lock();
            let peer = peers.entry(session.url().to_string()).or_default();
            peer.num_inuse = peer.num_inuse.saturating_sub(1);
            if session.is_valid() {
                peer.available.push_back(session);
            } else {
                tracing::trace!("discarding invalid nested session");
            }
            peer.take_waiter()
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
    }

    pub async fn close(&self) {
        let drained: Vec<Arc<RemoteSession>> = {
            let mut peers = self.peers.lock();
            peers
                .values_mut()
                .flat_map(|peer| peer.available.drain(..))
                .collect()
        };
        for session in drained {
            session.close().await;
        }
    }

    pub fn idle_count(&self, url: &str) -> usize {
        self.peers
            .lock()
            .get(url)
            .map_or(0, |peer| peer.available.len())
    }
}
