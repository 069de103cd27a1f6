use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use basalt_engine::TransactionEngine;

use crate::connection::ConnectionInfo;
use crate::error::DbError;
use crate::process::{process_registry, InternalConnection};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::session::{Session, SessionStatus, User};
use crate::session_pool::{NestedSessionPool, PeerTransport, RemoteConnection, SessionPoolConfig};
use crate::statement::{Parser, ParserFactory};

/// Database-wide knobs. Field-wise overrides over `Default`, the same way
/// sessions override their own settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub name: String,
    /// Capacity of the per-session query cache; 0 disables it.
    pub query_cache_size: usize,
    pub default_lock_timeout: Duration,
    /// Upper bound for `QUERY_TIMEOUT`; zero means uncapped.
    pub max_query_timeout: Duration,
    /// Transaction lifetime bound, checked cooperatively; zero disables.
    pub transaction_timeout: Duration,
    /// Auto-commit statements commit through a spawned flush instead of
    /// inline on the handler.
    pub async_commit: bool,
    pub scheduler: SchedulerConfig,
    pub session_pool: SessionPoolConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            name: "test".to_string(),
            query_cache_size: 32,
            default_lock_timeout: Duration::from_secs(2),
            max_query_timeout: Duration::ZERO,
            transaction_timeout: Duration::ZERO,
            async_commit: true,
            scheduler: SchedulerConfig::default(),
            session_pool: SessionPoolConfig::default(),
        }
    }
}

/// A table in the shared catalog. Temp tables live in their session's
/// resource registry instead.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<String>,
    pub map_name: String,
}

struct NullTransport;

#[async_trait]
impl PeerTransport for NullTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn RemoteConnection>, DbError> {
        Err(DbError::General(format!(
            "no peer transport configured, cannot reach {url}"
        )))
    }
}

/// The database a session belongs to: catalog, session registry, engine
/// handle, scheduler and nested-session pool. Sessions resolve each other
/// through the registry, which keeps cross-references weak.
pub struct Database {
    config: DatabaseConfig,
    engine: Arc<TransactionEngine>,
    parser_factory: Arc<dyn ParserFactory>,
    scheduler: Arc<Scheduler>,
    session_pool: NestedSessionPool,
    sessions: Mutex<HashMap<u64, Weak<Session>>>,
    next_session_id: AtomicU64,
    modification_meta_id: AtomicI64,
    exclusive_session: Mutex<Option<u64>>,
    catalog: RwLock<HashMap<String, TableMeta>>,
    closed: AtomicBool,
}

impl Database {
    /// Opens a database. Must run inside a tokio runtime: the scheduler
    /// spawns its handler tasks here.
    pub fn open(
        config: DatabaseConfig,
        parser_factory: Arc<dyn ParserFactory>,
        peer_transport: Option<Arc<dyn PeerTransport>>,
    ) -> Arc<Database> {
        let transport = peer_transport.unwrap_or_else(|| Arc::new(NullTransport));
        let scheduler = Scheduler::new(config.scheduler.clone());
        let session_pool = NestedSessionPool::new(transport, config.session_pool.clone());
        tracing::debug!(name = %config.name, "database opened");
        Arc::new(Database {
            engine: TransactionEngine::new(),
            parser_factory,
            scheduler,
            session_pool,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            modification_meta_id: AtomicI64::new(0),
            exclusive_session: Mutex::new(None),
            catalog: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Opens a database named by an embedded connection URL.
    pub fn open_url(
        url: &str,
        parser_factory: Arc<dyn ParserFactory>,
        peer_transport: Option<Arc<dyn PeerTransport>>,
    ) -> Result<Arc<Database>, DbError> {
        let info = ConnectionInfo::parse(url)?;
        let config = DatabaseConfig {
            name: info.database_name().to_string(),
            ..DatabaseConfig::default()
        };
        Ok(Database::open(config, parser_factory, peer_transport))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn session_pool(&self) -> &NestedSessionPool {
        &self.session_pool
    }

    pub fn create_parser(self: &Arc<Self>) -> Box<dyn Parser> {
        self.parser_factory.create_parser(self)
    }

    // ----------------------------------------------------------- sessions

    pub fn create_session(self: &Arc<Self>, user: User) -> Result<Arc<Session>, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::ConnectionBroken(format!(
                "database {} is closed",
                self.config.name
            )));
        }
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = Session::new(self.clone(), user, id);
        self.sessions.lock().insert(id, Arc::downgrade(&session));
        self.scheduler.register(&session);
        tracing::debug!(session = id, "session created");
        Ok(session)
    }

    pub(crate) fn remove_session(&self, id: u64) {
        self.sessions.lock().remove(&id);
    }

    pub fn find_session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Resolves the session owning the engine transaction `tx_id`.
    pub fn find_session_by_tx(&self, tx_id: u64) -> Option<Arc<Session>> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        sessions
            .into_iter()
            .find(|s| s.transaction_id() == Some(tx_id))
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.upgrade().is_some())
            .count()
    }

    // ------------------------------------------------------------- catalog

    pub fn modification_meta_id(&self) -> i64 {
        self.modification_meta_id.load(Ordering::SeqCst)
    }

    /// Advances the catalog version; query caches snapshotted against the
    /// old id invalidate on next access.
    pub fn bump_modification_meta_id(&self) -> i64 {
        self.modification_meta_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add_table(&self, table: TableMeta) -> Result<(), DbError> {
        let mut catalog = self.catalog.write();
        if catalog.contains_key(&table.name) {
            return Err(DbError::TableOrViewAlreadyExists(table.name));
        }
        catalog.insert(table.name.clone(), table);
        Ok(())
    }

    pub fn find_table(&self, name: &str) -> Option<TableMeta> {
        self.catalog.read().get(name).cloned()
    }

    pub fn drop_table(&self, name: &str) -> bool {
        self.catalog.write().remove(name).is_some()
    }

    /// A full copy of the catalog; rollback of DDL restores from it.
    pub fn snapshot_catalog(&self) -> HashMap<String, TableMeta> {
        self.catalog.read().clone()
    }

    pub fn restore_catalog(&self, snapshot: HashMap<String, TableMeta>) {
        *self.catalog.write() = snapshot;
    }

    // ------------------------------------------------------ exclusive mode

    /// Claims the database for `session` alone. Reentrant for the session
    /// that already holds it.
    pub fn try_set_exclusive(&self, session: &Arc<Session>) -> bool {
        let mut exclusive = self.exclusive_session.lock();
        match *exclusive {
            Some(id) if id != session.id() => false,
            _ => {
                *exclusive = Some(session.id());
                true
            }
        }
    }

    pub fn release_exclusive(&self, session: &Session) {
        let released = {
            let mut exclusive = self.exclusive_session.lock();
            if *exclusive == Some(session.id()) {
                *exclusive = None;
                true
            } else {
                false
            }
        };
        if released {
            let parked: Vec<Arc<Session>> = self
                .sessions
                .lock()
                .values()
                .filter_map(Weak::upgrade)
                .filter(|s| s.status() == SessionStatus::ExclusiveMode)
                .collect();
            for session in parked {
                session.set_status(SessionStatus::Retrying);
                session.wake();
            }
        }
    }

    pub fn exclusive_session_id(&self) -> Option<u64> {
        *self.exclusive_session.lock()
    }

    // ------------------------------------------------------------ utilities

    /// Builds an engine-internal connection (triggers, user functions)
    /// through the process-wide factory.
    pub fn internal_connection(
        self: &Arc<Self>,
        session: &Arc<Session>,
        user: &str,
        url: &str,
    ) -> Result<InternalConnection, DbError> {
        process_registry().connect(session, user, url)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes every session, then the scheduler and the nested-session
    /// pool. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for session in sessions {
            session.close().await;
        }
        self.scheduler.close().await;
        self.session_pool.close().await;
        tracing::debug!(name = %self.config.name, "database closed");
    }
}
