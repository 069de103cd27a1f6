use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use basalt_engine::{IsolationLevel, Value};

use crate::connection::SessionSetting;
use crate::database::Database;
use crate::error::DbError;
use crate::lock::{DbObjectLock, TransactionListener};
use crate::process::process_registry;
use crate::replication::{ConflictType, ReplicationAckPacket, ReplicationConflict, ReplicationUpdateAck};
use crate::resource::ResourceRegistry;
use crate::scheduler::{YieldStep, YieldableCommand};
use crate::session_pool::RemoteSession;
use crate::statement::{PreparedStatement, StatementId, StatementOutcome, StatementResult};
use crate::transaction::Transaction;

/// Observable session state, driving the dispatch gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    TransactionNotStart = 0,
    TransactionNotCommit = 1,
    StatementRunning = 2,
    StatementCompleted = 3,
    Waiting = 4,
    TransactionCommitting = 5,
    Retrying = 6,
    RetryingReturnResult = 7,
    ExclusiveMode = 8,
}

impl SessionStatus {
    fn from_u8(value: u8) -> SessionStatus {
        match value {
            0 => SessionStatus::TransactionNotStart,
            1 => SessionStatus::TransactionNotCommit,
            2 => SessionStatus::StatementRunning,
            3 => SessionStatus::StatementCompleted,
            4 => SessionStatus::Waiting,
            5 => SessionStatus::TransactionCommitting,
            6 => SessionStatus::Retrying,
            7 => SessionStatus::RetryingReturnResult,
            _ => SessionStatus::ExclusiveMode,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    name: String,
    admin: bool,
}

impl User {
    pub fn new(name: &str) -> User {
        User {
            name: name.to_string(),
            admin: false,
        }
    }

    pub fn admin(name: &str) -> User {
        User {
            name: name.to_string(),
            admin: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }
}

pub type ResultCallback = Box<dyn FnOnce(Result<StatementResult, DbError>) + Send>;
pub type CommitCallback = Box<dyn FnOnce(Result<(), DbError>) + Send>;

/// Window of the statement currently (or most recently) running: the
/// savepoint and locks-list index recorded at statement start bound what a
/// statement-level rollback may undo.
pub(crate) struct CurrentStatement {
    pub(crate) statement: Arc<dyn PreparedStatement>,
    pub(crate) savepoint_id: i64,
    pub(crate) locks_index: usize,
}

pub(crate) struct RowWait {
    pub(crate) map: String,
    pub(crate) key: i64,
    pub(crate) deadline: Instant,
}

pub(crate) struct SessionCore {
    pub(crate) schema: String,
    pub(crate) schema_search_path: Option<Vec<String>>,
    pub(crate) lock_timeout: Duration,
    pub(crate) query_timeout: Duration,
    pub(crate) throttle: Duration,
    pub(crate) isolation: IsolationLevel,
    pub(crate) auto_commit: bool,
    pub(crate) root: bool,
    pub(crate) replication_name: Option<String>,
    pub(crate) transaction: Option<Transaction>,
    pub(crate) locks: Vec<Arc<DbObjectLock>>,
    pub(crate) variables: Option<HashMap<String, Value>>,
    pub(crate) resources: ResourceRegistry,
    pub(crate) nested_sessions: Option<HashMap<String, Arc<RemoteSession>>>,
    pub(crate) current: Option<CurrentStatement>,
    pub(crate) yieldable: Option<Box<dyn YieldableCommand>>,
    pub(crate) commit_rollback_disabled: bool,
    pub(crate) last_statement_was_ddl: bool,
    pub(crate) last_statement_was_database: bool,
    pub(crate) wait_lock: Option<(Arc<DbObjectLock>, Instant)>,
    pub(crate) wait_row: Option<RowWait>,
    pub(crate) replication_conflict: Option<ReplicationConflict>,
    pub(crate) ack_version: i32,
    pub(crate) engine_hints: Option<HashMap<&'static str, String>>,
    pub(crate) modification_counter: u64,
    pub(crate) savepoint_counter: i64,
}

/// One client connection's server-side state. A session is driven by a
/// single handler at a time; the status is the only field other handlers
/// observe, so it lives outside the core mutex.
pub struct Session {
    id: u64,
    database: Arc<Database>,
    user: User,
    status: AtomicU8,
    closed: AtomicBool,
    cancel_at: Mutex<Option<Instant>>,
    handler_index: AtomicUsize,
    pub(crate) core: Mutex<SessionCore>,
}

impl Session {
    pub(crate) fn new(database: Arc<Database>, user: User, id: u64) -> Arc<Session> {
        let config = database.config();
        Arc::new(Session {
            id,
            database: database.clone(),
            user,
            status: AtomicU8::new(SessionStatus::TransactionNotStart as u8),
            closed: AtomicBool::new(false),
            cancel_at: Mutex::new(None),
            handler_index: AtomicUsize::new(0),
            core: Mutex::new(SessionCore {
                schema: "public".to_string(),
                schema_search_path: None,
                lock_timeout: config.default_lock_timeout,
                query_timeout: Duration::ZERO,
                throttle: Duration::ZERO,
                isolation: IsolationLevel::default(),
                auto_commit: true,
                root: true,
                replication_name: None,
                transaction: None,
                locks: Vec::new(),
                variables: None,
                resources: ResourceRegistry::default(),
                nested_sessions: None,
                current: None,
                yieldable: None,
                commit_rollback_disabled: false,
                last_statement_was_ddl: false,
                last_statement_was_database: false,
                wait_lock: None,
                wait_row: None,
                replication_conflict: None,
                ack_version: 0,
                engine_hints: None,
                modification_counter: 0,
                savepoint_counter: 0,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_root(&self) -> bool {
        self.core.lock().root
    }

    /// Marks this session a distributed-transaction participant rather than
    /// the coordinating root.
    pub fn set_root(&self, root: bool) {
        self.core.lock().root = root;
    }

    pub fn is_auto_commit(&self) -> bool {
        self.core.lock().auto_commit
    }

    pub fn set_auto_commit(&self, auto_commit: bool) {
        self.core.lock().auto_commit = auto_commit;
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.core.lock().isolation
    }

    pub fn replication_name(&self) -> Option<String> {
        self.core.lock().replication_name.clone()
    }

    /// Tags the session with the replicated write attempt it is applying.
    pub fn set_replication_name(&self, name: Option<String>) {
        self.core.lock().replication_name = name;
    }

    pub fn schema(&self) -> String {
        self.core.lock().schema.clone()
    }

    pub fn schema_search_path(&self) -> Option<Vec<String>> {
        self.core.lock().schema_search_path.clone()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.core.lock().lock_timeout
    }

    pub fn modification_counter(&self) -> u64 {
        self.core.lock().modification_counter
    }

    pub(crate) fn handler_index(&self) -> usize {
        self.handler_index.load(Ordering::SeqCst)
    }

    pub(crate) fn set_handler_index(&self, index: usize) {
        self.handler_index.store(index, Ordering::SeqCst);
    }

    /// Nudges the owning handler to re-examine this session.
    pub(crate) fn wake(&self) {
        self.database.scheduler().wake(self.handler_index());
    }

    // ---------------------------------------------------------------- settings

    /// Applies a session setting. Unknown names and unparsable values fail
    /// with `INVALID_VALUE`; factory-name passthroughs are checked against
    /// the process registry policy.
    pub fn set_setting(&self, name: &str, value: &str) -> Result<(), DbError> {
        let setting = SessionSetting::parse(name)
            .ok_or_else(|| DbError::InvalidValue(format!("unknown setting: {name}")))?;
        let mut core = self.core.lock();
        match setting {
            SessionSetting::LockTimeout => {
                core.lock_timeout = Duration::from_millis(parse_millis(name, value)?);
            }
            SessionSetting::QueryTimeout => {
                let mut timeout = Duration::from_millis(parse_millis(name, value)?);
                let max = self.database.config().max_query_timeout;
                if !max.is_zero() && (timeout.is_zero() || timeout > max) {
                    timeout = max;
                }
                core.query_timeout = timeout;
            }
            SessionSetting::Schema => {
                core.schema = value.to_string();
            }
            SessionSetting::SchemaSearchPath => {
                core.schema_search_path =
                    Some(value.split(',').map(|s| s.trim().to_string()).collect());
            }
            SessionSetting::Throttle => {
                core.throttle = Duration::from_millis(parse_millis(name, value)?);
            }
            SessionSetting::TransactionIsolationLevel => {
                core.isolation = IsolationLevel::parse(value)
                    .ok_or_else(|| DbError::InvalidValue(format!("isolation level: {value}")))?;
            }
            SessionSetting::ValueVectorFactoryName
            | SessionSetting::OlapOperatorFactoryName => {
                process_registry().check_factory(value)?;
                core.engine_hints
                    .get_or_insert_with(HashMap::new)
                    .insert(setting.name(), value.to_string());
            }
            SessionSetting::ExpressionCompileThreshold | SessionSetting::OlapThreshold => {
                value
                    .parse::<u64>()
                    .map_err(|_| DbError::InvalidValue(format!("{name}: {value}")))?;
                core.engine_hints
                    .get_or_insert_with(HashMap::new)
                    .insert(setting.name(), value.to_string());
            }
        }
        core.modification_counter += 1;
        Ok(())
    }

    pub fn engine_hint(&self, setting: SessionSetting) -> Option<String> {
        self.core
            .lock()
            .engine_hints
            .as_ref()
            .and_then(|hints| hints.get(setting.name()).cloned())
    }

    // --------------------------------------------------------------- variables

    /// Sets (or with NULL removes) a session variable. An evicted LOB value
    /// is unlinked and closed; a stored LOB value is linked.
    pub fn set_variable(&self, name: &str, value: Value) {
        let mut core = self.core.lock();
        let variables = core.variables.get_or_insert_with(HashMap::new);
        let old = if value.is_null() {
            variables.remove(name)
        } else {
            if let Some(lob) = value.as_lob() {
                lob.link();
            }
            variables.insert(name.to_string(), value)
        };
        if let Some(old) = old {
            if let Some(lob) = old.as_lob() {
                lob.unlink();
                lob.close();
            }
        }
        core.modification_counter += 1;
    }

    pub fn get_variable(&self, name: &str) -> Value {
        self.core
            .lock()
            .variables
            .as_ref()
            .and_then(|v| v.get(name).cloned())
            .unwrap_or(Value::Null)
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.core
            .lock()
            .variables
            .as_ref()
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stores a variable arriving in its wire form, via the process-wide
    /// serializer.
    pub fn set_variable_encoded(&self, name: &str, bytes: &[u8]) -> Result<(), DbError> {
        let value = process_registry().serializer().deserialize(bytes)?;
        self.set_variable(name, value);
        Ok(())
    }

    pub fn encode_variable(&self, name: &str) -> Result<Vec<u8>, DbError> {
        process_registry().serializer().serialize(&self.get_variable(name))
    }

    // ------------------------------------------------------------ temp objects

    /// Registers a session-scoped table. Fails on a duplicate name.
    pub fn add_temp_table(&self, table: crate::resource::TempTable) -> Result<(), DbError> {
        self.core.lock().resources.add_temp_table(table)
    }

    pub fn find_temp_table_map(&self, name: &str) -> Option<basalt_engine::TransactionMap> {
        self.core
            .lock()
            .resources
            .find_temp_table(name)
            .map(|t| t.map.clone())
    }

    pub fn add_temp_index(&self, index: crate::resource::TempIndex) -> Result<(), DbError> {
        self.core.lock().resources.add_temp_index(index)
    }

    pub fn add_temp_constraint(
        &self,
        constraint: crate::resource::TempConstraint,
    ) -> Result<(), DbError> {
        self.core.lock().resources.add_temp_constraint(constraint)
    }

    pub fn add_temp_result(&self, result: Box<dyn crate::resource::TemporaryResult>) {
        self.core.lock().resources.add_temp_result(result);
    }

    /// Schedules a linked LOB for unlink after the next commit-log flush.
    pub fn add_lob_to_unlink(&self, lob: Arc<basalt_engine::Lob>) {
        self.core.lock().resources.add_lob_to_unlink(lob);
    }

    /// Holds a prepared statement for the wire layer under its id.
    pub fn cache_cursor(&self, statement: Arc<dyn PreparedStatement>) {
        self.core.lock().resources.cursor_cache_put(statement);
    }

    pub fn cached_cursor(&self, id: StatementId) -> Option<Arc<dyn PreparedStatement>> {
        self.core.lock().resources.cursor_cache_get(id)
    }

    pub fn close_cursor(&self, id: StatementId) {
        if let Some(statement) = self.core.lock().resources.cursor_cache_remove(id) {
            statement.close();
        }
    }

    pub fn expire_cursors(&self, ttl: Duration) {
        self.core.lock().resources.cursor_cache_expire(ttl);
    }

    // ----------------------------------------------------------------- prepare

    /// Parses and prepares `sql`, consulting the query cache when enabled.
    pub fn prepare(self: &Arc<Self>, sql: &str, fetch_size: usize) -> Result<Arc<dyn PreparedStatement>, DbError> {
        if self.is_closed() {
            return Err(DbError::ConnectionBroken(format!("session {}", self.id)));
        }
        let cache_size = self.database.config().query_cache_size;
        let meta_id = self.database.modification_meta_id();

        if cache_size > 0 {
            let mut core = self.core.lock();
            if let Some(cached) = core.resources.query_cache_get(sql, meta_id) {
                if cached.can_reuse() {
                    cached.reuse();
                    tracing::trace!(session = self.id, sql, "query cache hit");
                    return Ok(cached);
                }
            }
        }

        let mut parser = self.database.create_parser();
        let statement = parser.parse(self, sql)?.prepare()?;
        if fetch_size > 0 {
            statement.set_fetch_size(fetch_size);
        }
        if cache_size > 0 && statement.is_cacheable() {
            let mut core = self.core.lock();
            core.resources
                .query_cache_put(sql.to_string(), statement.clone(), meta_id, cache_size);
        }
        Ok(statement)
    }

    // -------------------------------------------------------------- locks

    /// Records a lock this session now holds. Idempotent per lock: the
    /// entry appears in the list exactly once.
    pub(crate) fn add_lock(&self, lock: Arc<DbObjectLock>) {
        let mut core = self.core.lock();
        if !core.locks.iter().any(|l| Arc::ptr_eq(l, &lock)) {
            core.locks.push(lock);
        }
    }

    pub fn held_locks_count(&self) -> usize {
        self.core.lock().locks.len()
    }

    /// Applies a negotiated retry list to every lock this session holds and
    /// to its transaction. Pre-existing lists are overwritten, even on locks
    /// unrelated to the conflict.
    pub(crate) fn set_retry_replication_names(&self, names: Vec<String>) {
        let locks = {
            let mut core = self.core.lock();
            if let Some(tx) = core.transaction.as_mut() {
                tx.retry_replication_names = names.clone();
            }
            core.locks.clone()
        };
        for lock in locks {
            lock.set_retry_replication_names(names.clone());
        }
    }

    pub fn set_commit_rollback_disabled(&self, disabled: bool) {
        self.core.lock().commit_rollback_disabled = disabled;
    }

    pub(crate) fn check_commit_rollback_allowed(&self) -> Result<(), DbError> {
        let core = self.core.lock();
        if core.commit_rollback_disabled && !core.locks.is_empty() {
            return Err(DbError::CommitRollbackNotAllowed(format!(
                "session {} holds {} locks",
                self.id,
                core.locks.len()
            )));
        }
        Ok(())
    }

    /// Blocks this session on `lock`: queues it as a waiter and arms the
    /// lock-timeout deadline.
    pub(crate) fn wait_for_object_lock(self: &Arc<Self>, lock: Arc<DbObjectLock>) {
        let listener: Arc<dyn TransactionListener> = Arc::new(SessionWaker {
            session: Arc::downgrade(self),
        });
        lock.add_waiter(self, listener);
        let deadline = Instant::now() + self.lock_timeout();
        {
            let mut core = self.core.lock();
            core.wait_lock = Some((lock, deadline));
            if let Some(tx) = core.transaction.as_mut() {
                tx.set_status(crate::transaction::TransactionStatus::Waiting);
            }
        }
        self.set_status(SessionStatus::Waiting);
    }

    /// Blocks this session on a row lock: queues it in the holding
    /// transaction's per-key waiting index.
    pub(crate) fn wait_for_row_lock(self: &Arc<Self>, map: &str, key: i64, holder_tx: u64) {
        let listener: Arc<dyn TransactionListener> = Arc::new(SessionWaker {
            session: Arc::downgrade(self),
        });
        if let Some(holder) = self.database.find_session_by_tx(holder_tx) {
            holder.add_row_waiter(key, Arc::downgrade(self), listener);
        }
        let deadline = Instant::now() + self.lock_timeout();
        {
            let mut core = self.core.lock();
            core.wait_row = Some(RowWait {
                map: map.to_string(),
                key,
                deadline,
            });
            if let Some(tx) = core.transaction.as_mut() {
                tx.set_status(crate::transaction::TransactionStatus::Waiting);
            }
        }
        self.set_status(SessionStatus::Waiting);
    }

    pub(crate) fn add_row_waiter(
        &self,
        key: i64,
        session: Weak<Session>,
        listener: Arc<dyn TransactionListener>,
    ) {
        let mut core = self.core.lock();
        if let Some(tx) = core.transaction.as_mut() {
            tx.add_row_waiter(key, session, listener);
        } else {
            // Holder already finished; wake immediately.
            drop(core);
            listener.on_granted();
        }
    }

    pub(crate) fn clear_waits(&self) {
        let mut core = self.core.lock();
        core.wait_lock = None;
        core.wait_row = None;
        if let Some(tx) = core.transaction.as_mut() {
            if tx.status() == crate::transaction::TransactionStatus::Waiting {
                tx.set_status(crate::transaction::TransactionStatus::Open);
            }
        }
    }

    /// Rolls the holder back to the savepoint at which it locked the row
    /// and re-queues it as a waiter on `new_owner`, keyed by the row key.
    /// The row lock itself frees in the savepoint rollback and is re-taken
    /// by `new_owner` when its statement re-runs.
    pub(crate) fn yield_row_lock_to(self: &Arc<Self>, map: &str, key: i64, new_owner: &Arc<Session>) {
        {
            let mut core = self.core.lock();
            if let Some(tx) = core.transaction.as_mut() {
                if let Some(savepoint) = tx.engine().locked_row_savepoint(map, key) {
                    tx.engine_mut().rollback_to_savepoint(savepoint);
                }
            }
        }
        let listener: Arc<dyn TransactionListener> = Arc::new(SessionWaker {
            session: Arc::downgrade(self),
        });
        new_owner.add_row_waiter(key, Arc::downgrade(self), listener);
        let deadline = Instant::now() + self.lock_timeout();
        self.core.lock().wait_row = Some(RowWait {
            map: map.to_string(),
            key,
            deadline,
        });
        self.set_status(SessionStatus::Waiting);
    }

    // ------------------------------------------------------------- replication

    /// Records the conflict a replicated statement ran into; the next ack
    /// reports it and the retry negotiation consumes it.
    pub fn record_replication_conflict(&self, conflict: ReplicationConflict) {
        self.core.lock().replication_conflict = Some(conflict);
    }

    pub(crate) fn take_replication_conflict(&self) -> Option<ReplicationConflict> {
        self.core.lock().replication_conflict.take()
    }

    pub fn pending_conflict_type(&self) -> ConflictType {
        self.core
            .lock()
            .replication_conflict
            .as_ref()
            .map(ReplicationConflict::conflict_type)
            .unwrap_or_default()
    }

    /// Builds the ack describing the state of the current replicated
    /// statement. Each call bumps the per-statement ack version.
    pub fn emit_replication_ack(&self, update_count: i32, final_result: bool) -> ReplicationAckPacket {
        let (ack, root, auto_commit) = self.build_replication_ack(update_count, final_result);
        ReplicationAckPacket::update(root, auto_commit, ack)
    }

    /// Ack for one step of a two-phase replicated commit; the participant
    /// emits `PHASE_PREPARE` when its commit-ready record is durable and
    /// `PHASE_COMMIT` once the coordinator's decision was applied.
    pub fn emit_prepared_ack(&self, phase: u8, final_result: bool) -> ReplicationAckPacket {
        let (ack, root, auto_commit) = self.build_replication_ack(0, final_result);
        ReplicationAckPacket::prepared(root, auto_commit, ack, phase)
    }

    fn build_replication_ack(
        &self,
        update_count: i32,
        final_result: bool,
    ) -> (ReplicationUpdateAck, bool, bool) {
        let mut core = self.core.lock();
        let if_ddl = core
            .current
            .as_ref()
            .is_some_and(|c| c.statement.is_if_ddl());
        let (conflict_type, first, uncommitted) = match core.replication_conflict.as_ref() {
            None => (ConflictType::None, -1, None),
            Some(ReplicationConflict::RowLock { holder_session, .. }) => {
                let name = self
                    .database
                    .find_session(*holder_session)
                    .and_then(|s| s.replication_name());
                (ConflictType::RowLock, -1, name)
            }
            Some(ReplicationConflict::DbObjectLock { lock }) => {
                let name = lock.holder().and_then(|s| s.replication_name());
                (ConflictType::DbObjectLock, -1, name)
            }
            Some(ReplicationConflict::Append {
                start_key, count, ..
            }) => (ConflictType::Append, *start_key, Some(format!("{count}"))),
        };
        let (update_count, uncommitted) = match conflict_type {
            ConflictType::Append => {
                let count = uncommitted
                    .as_deref()
                    .and_then(|c| c.parse::<i32>().ok())
                    .unwrap_or(update_count);
                (count, core.replication_name.clone())
            }
            _ => (update_count, uncommitted),
        };
        let ack = ReplicationUpdateAck {
            update_count,
            first,
            uncommitted_replication_name: uncommitted,
            conflict_type,
            ack_version: core.ack_version,
            if_ddl,
            final_result,
        };
        core.ack_version += 1;
        (ack, core.root, core.auto_commit)
    }

    /// Transition into `RETRYING_RETURN_RESULT`. Idempotent: once any ack
    /// was emitted, a second transition is suppressed for APPEND conflicts
    /// and IF-DDL statements.
    pub(crate) fn set_retry_return_result(&self) {
        {
            let core = self.core.lock();
            if self.status() == SessionStatus::RetryingReturnResult && core.ack_version > 0 {
                let append = matches!(
                    core.replication_conflict,
                    Some(ReplicationConflict::Append { .. })
                );
                let if_ddl = core
                    .current
                    .as_ref()
                    .is_some_and(|c| c.statement.is_if_ddl());
                if append || if_ddl {
                    return;
                }
            }
        }
        self.set_status(SessionStatus::RetryingReturnResult);
        self.wake();
    }

    // ------------------------------------------------------------ cancellation

    /// Requests cancellation; the next `check_canceled` raises. A
    /// committing transaction cannot be canceled.
    pub fn cancel(&self) {
        if self.status() == SessionStatus::TransactionCommitting {
            tracing::debug!(session = self.id, "cancel ignored while committing");
            return;
        }
        *self.cancel_at.lock() = Some(Instant::now());
    }

    pub(crate) fn arm_cancel_deadline(&self, deadline: Instant) {
        *self.cancel_at.lock() = Some(deadline);
    }

    pub(crate) fn disarm_cancel(&self) {
        *self.cancel_at.lock() = None;
    }

    pub fn check_canceled(&self) -> Result<(), DbError> {
        let due = {
            let cancel_at = self.cancel_at.lock();
            cancel_at.is_some_and(|at| Instant::now() >= at)
        };
        if due {
            *self.cancel_at.lock() = None;
            return Err(DbError::StatementWasCanceled(format!(
                "session {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Cancels the currently running statement iff its id matches.
    pub fn cancel_statement(&self, statement_id: StatementId) {
        let matched = {
            let core = self.core.lock();
            core.current
                .as_ref()
                .is_some_and(|c| c.statement.id() == statement_id)
        };
        if matched {
            let statement = self.core.lock().current.as_ref().map(|c| c.statement.clone());
            if let Some(statement) = statement {
                statement.cancel();
            }
            self.cancel();
        }
    }

    // ------------------------------------------------- statement lifecycle

    /// Records the statement window: current savepoint, index into `locks`,
    /// and the query-timeout deadline when armed.
    pub(crate) fn start_current_command(self: &Arc<Self>, statement: Arc<dyn PreparedStatement>) {
        let mut core = self.core.lock();
        let savepoint_id = core
            .transaction
            .as_ref()
            .map(|tx| tx.engine().savepoint())
            .unwrap_or(0);
        let locks_index = core.locks.len();
        core.current = Some(CurrentStatement {
            statement,
            savepoint_id,
            locks_index,
        });
        core.ack_version = 0;
        let query_timeout = core.query_timeout;
        drop(core);
        if !query_timeout.is_zero() {
            self.arm_cancel_deadline(Instant::now() + query_timeout);
        }
    }

    /// Completes the current statement: closes it, flushes temporary
    /// results, then commits or hands the result back per session mode.
    pub(crate) async fn stop_current_command(
        self: &Arc<Self>,
        on_result: Option<ResultCallback>,
        result: Result<StatementResult, DbError>,
    ) {
        let (auto_commit, replicated, retrying) = {
            let mut core = self.core.lock();
            core.resources.close_temp_results();
            if let Some(current) = core.current.as_ref() {
                let is_ddl = current.statement.is_ddl();
                let is_database_statement = current.statement.is_database_statement();
                core.last_statement_was_ddl = is_ddl;
                core.last_statement_was_database = is_database_statement;
            }
            let status = self.status();
            let retrying = status == SessionStatus::Retrying;
            let replicated = core.replication_name.is_some();
            if !replicated {
                // Replicated statements keep their window open until the
                // write attempt is confirmed or renegotiated.
                core.current = None;
            }
            (core.auto_commit, replicated, retrying)
        };
        self.disarm_cancel();
        self.set_status(SessionStatus::StatementCompleted);

        if retrying {
            // Suppress the callback; the retried statement already reported.
            if auto_commit && !replicated {
                if let Err(e) = self.commit().await {
                    tracing::error!(session = self.id, error = %e, "silent commit failed");
                }
            }
            return;
        }

        if auto_commit && !replicated && result.is_ok() {
            if self.database.config().async_commit {
                let callback: CommitCallback = Box::new(move |commit_result| {
                    if let Some(on_result) = on_result {
                        match commit_result {
                            Ok(()) => on_result(result),
                            Err(e) => on_result(Err(e)),
                        }
                    }
                });
                self.async_commit(callback);
            } else {
                let commit_result = self.commit().await;
                if let Some(on_result) = on_result {
                    match commit_result {
                        Ok(()) => on_result(result),
                        Err(e) => on_result(Err(e)),
                    }
                }
            }
        } else if let Some(on_result) = on_result {
            on_result(result);
        }
        self.wake();
    }

    /// Rolls back only the current statement: the transaction rewinds to
    /// the statement savepoint and the lock-list suffix taken by this
    /// statement is released. `new_owner` transfers those locks instead of
    /// freeing them (replication conflict takeover).
    pub fn rollback_current_command(self: &Arc<Self>, new_owner: Option<&Arc<Session>>) {
        let released = {
            let mut core = self.core.lock();
            let Some(current) = core.current.take() else {
                return;
            };
            if let Some(tx) = core.transaction.as_mut() {
                tx.engine_mut().rollback_to_savepoint(current.savepoint_id);
            }
            let released: Vec<Arc<DbObjectLock>> = core.locks.split_off(current.locks_index);
            core.yieldable = None;
            released
        };
        for lock in &released {
            lock.unlock(self, false, new_owner);
        }
        self.set_status(SessionStatus::StatementCompleted);
        self.wake();
    }

    // ------------------------------------------------------------ dispatching

    pub fn can_execute_next_command(&self) -> bool {
        let status = self.status();
        self.core.lock().yieldable.is_none()
            || status == SessionStatus::Retrying
            || status == SessionStatus::RetryingReturnResult
    }

    /// Submits a prepared statement for cooperative execution. The callback
    /// fires from the handler (or commit) context.
    pub fn submit_command(
        self: &Arc<Self>,
        packet_id: i32,
        statement: Arc<dyn PreparedStatement>,
        on_result: ResultCallback,
    ) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::ConnectionBroken(format!("session {}", self.id)));
        }
        if !self.can_execute_next_command() {
            return Err(DbError::General(format!(
                "session {} already has a command in flight",
                self.id
            )));
        }
        self.start_current_command(statement.clone());
        let command = ExecuteStatementCommand {
            packet_id,
            session: self.clone(),
            statement,
            outcome: None,
            callback: Some(on_result),
            stopped: false,
        };
        {
            let mut core = self.core.lock();
            if let Some(mut old) = core.yieldable.take() {
                old.stop();
            }
            core.yieldable = Some(Box::new(command));
        }
        self.wake();
        Ok(())
    }

    /// The dispatch gate. Returns work only when the status allows it; for
    /// `WAITING` sessions this is also where cooperative lock and
    /// transaction timeouts fire.
    pub(crate) fn poll_dispatch(self: &Arc<Self>) -> Dispatch {
        if let Some(exclusive) = self.database.exclusive_session_id() {
            if exclusive != self.id {
                if self.core.lock().yieldable.is_some() {
                    self.set_status(SessionStatus::ExclusiveMode);
                }
                return Dispatch::Idle;
            }
        }
        match self.status() {
            SessionStatus::Waiting => self.poll_waiting(),
            SessionStatus::TransactionCommitting
            | SessionStatus::ExclusiveMode
            | SessionStatus::StatementRunning => Dispatch::Idle,
            _ => {
                let mut core = self.core.lock();
                match core.yieldable.take() {
                    Some(command) => Dispatch::Run(command),
                    None => Dispatch::Idle,
                }
            }
        }
    }

    fn poll_waiting(self: &Arc<Self>) -> Dispatch {
        let now = Instant::now();
        let mut core = self.core.lock();
        if core.yieldable.is_none() {
            return Dispatch::Idle;
        }

        if let Some((lock, deadline)) = core.wait_lock.clone() {
            if now >= deadline {
                core.wait_lock = None;
                let command = core.yieldable.take().unwrap();
                drop(core);
                lock.remove_waiter(self.id);
                return Dispatch::Fail(
                    command,
                    DbError::LockTimeout(lock.object().name.clone()),
                );
            }
        }
        let row_wait_expired = core.wait_row.as_ref().is_some_and(|w| now >= w.deadline);
        if row_wait_expired {
            let wait = core.wait_row.take().unwrap();
            let command = core.yieldable.take().unwrap();
            drop(core);
            return Dispatch::Fail(
                command,
                DbError::LockTimeout(format!("{}[{}]", wait.map, wait.key)),
            );
        }

        // Transaction timeout is only checked cooperatively here, and never
        // under replication.
        if core.replication_name.is_none() {
            let timeout = self.database.config().transaction_timeout;
            let timed_out = core
                .transaction
                .as_ref()
                .is_some_and(|tx| tx.engine().is_timed_out(timeout));
            if timed_out {
                let command = core.yieldable.take().unwrap();
                core.wait_lock = None;
                core.wait_row = None;
                drop(core);
                self.rollback_local();
                return Dispatch::Fail(
                    command,
                    DbError::General(format!("transaction of session {} timed out", self.id)),
                );
            }
        }
        Dispatch::Idle
    }

    pub(crate) fn return_yieldable(&self, command: Box<dyn YieldableCommand>) {
        self.core.lock().yieldable = Some(command);
    }

    // ------------------------------------------------------------ execution

    /// Runs `sql` as an update and resolves once the statement (and, in
    /// auto-commit mode, its commit) finished.
    pub async fn execute_update_async(self: &Arc<Self>, sql: &str) -> Result<i32, DbError> {
        let statement = self.prepare(sql, 0)?;
        let result = self.execute_async(statement).await?;
        Ok(result.update_count)
    }

    pub async fn execute_query_async(self: &Arc<Self>, sql: &str) -> Result<Vec<Vec<Value>>, DbError> {
        let statement = self.prepare(sql, 0)?;
        let result = self.execute_async(statement).await?;
        Ok(result.rows)
    }

    pub async fn execute_async(
        self: &Arc<Self>,
        statement: Arc<dyn PreparedStatement>,
    ) -> Result<StatementResult, DbError> {
        let throttle = self.core.lock().throttle;
        if !throttle.is_zero() {
            tokio::time::sleep(throttle).await;
        }
        let (tx, rx) = oneshot::channel();
        let callback: ResultCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.submit_command(next_packet_id(), statement, callback)?;
        rx.await
            .map_err(|_| DbError::ConnectionBroken(format!("session {}", self.id)))?
    }

    // ----------------------------------------------------------------- close

    /// Idempotent. Releases nested sessions to the pool, rolls back any
    /// open transaction, drops session-scoped temp objects, closes caches,
    /// and deregisters from the database. Errors are swallowed.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(session = self.id, "closing session");

        self.rollback_local();

        let (nested, temp_tables) = {
            let mut core = self.core.lock();
            let nested: Vec<Arc<RemoteSession>> = core
                .nested_sessions
                .take()
                .map(|m| m.into_values().collect())
                .unwrap_or_default();
            core.resources.close();
            let temp_tables = core.resources.take_temp_tables();
            core.yieldable = None;
            (nested, temp_tables)
        };
        for session in nested {
            session.sever_parent();
            self.database.session_pool().recycle(session);
        }
        for table in temp_tables {
            self.database.engine().drop_map(table.map.name());
        }
        self.database.release_exclusive(self);
        self.database.remove_session(self.id);
        self.wake();
    }
}

/// Decision of one dispatch-gate poll.
pub(crate) enum Dispatch {
    Idle,
    Run(Box<dyn YieldableCommand>),
    Fail(Box<dyn YieldableCommand>, DbError),
}

/// Wakes a session blocked on a lock. Granting re-dispatches the session in
/// retry state so its statement re-runs.
pub(crate) struct SessionWaker {
    pub(crate) session: Weak<Session>,
}

impl TransactionListener for SessionWaker {
    fn on_granted(&self) {
        if let Some(session) = self.session.upgrade() {
            session.clear_waits();
            session.set_status(SessionStatus::Retrying);
            session.wake();
        }
    }

    fn on_timeout(&self) {
        if let Some(session) = self.session.upgrade() {
            session.clear_waits();
            session.set_status(SessionStatus::Retrying);
            session.wake();
        }
    }
}

static PACKET_ID: AtomicUsize = AtomicUsize::new(1);

fn next_packet_id() -> i32 {
    PACKET_ID.fetch_add(1, Ordering::Relaxed) as i32
}

fn parse_millis(name: &str, value: &str) -> Result<u64, DbError> {
    value
        .parse::<u64>()
        .map_err(|_| DbError::InvalidValue(format!("{name}: {value}")))
}

/// The single in-flight unit of work of a session: one prepared statement
/// driven to completion across as many cooperative steps as it needs.
struct ExecuteStatementCommand {
    packet_id: i32,
    session: Arc<Session>,
    statement: Arc<dyn PreparedStatement>,
    outcome: Option<Result<StatementResult, DbError>>,
    callback: Option<ResultCallback>,
    stopped: bool,
}

#[async_trait]
impl YieldableCommand for ExecuteStatementCommand {
    fn packet_id(&self) -> i32 {
        self.packet_id
    }

    fn session_id(&self) -> u64 {
        self.session.id()
    }

    fn run(&mut self) -> YieldStep {
        if self.stopped {
            self.outcome = Some(Err(DbError::StatementWasCanceled(format!(
                "session {}",
                self.session.id()
            ))));
            return YieldStep::Done;
        }
        if let Err(e) = self.session.check_canceled() {
            self.outcome = Some(Err(e));
            return YieldStep::Done;
        }
        self.session.set_status(SessionStatus::StatementRunning);
        match self.statement.execute(&self.session) {
            Ok(StatementOutcome::Finished(result)) => {
                self.outcome = Some(Ok(result));
                YieldStep::Done
            }
            Ok(StatementOutcome::Yield) => {
                // Voluntary quantum yield: stay dispatchable.
                let status = if self.session.core.lock().transaction.is_some() {
                    SessionStatus::TransactionNotCommit
                } else {
                    SessionStatus::TransactionNotStart
                };
                self.session.set_status(status);
                YieldStep::Yielded
            }
            Ok(StatementOutcome::WaitObjectLock(lock)) => {
                if self.session.replication_name().is_some() {
                    self.session
                        .record_replication_conflict(ReplicationConflict::DbObjectLock {
                            lock: lock.clone(),
                        });
                }
                self.session.wait_for_object_lock(lock);
                YieldStep::Yielded
            }
            Ok(StatementOutcome::WaitRowLock {
                map,
                key,
                holder_tx,
            }) => {
                if self.session.replication_name().is_some() {
                    let holder_session = self
                        .session
                        .database()
                        .find_session_by_tx(holder_tx)
                        .map(|s| s.id())
                        .unwrap_or(0);
                    self.session
                        .record_replication_conflict(ReplicationConflict::RowLock {
                            map: map.clone(),
                            key,
                            holder_session,
                        });
                }
                self.session.wait_for_row_lock(&map, key, holder_tx);
                YieldStep::Yielded
            }
            Err(e) => {
                self.outcome = Some(Err(e));
                YieldStep::Done
            }
        }
    }

    fn fail(&mut self, error: DbError) {
        self.outcome = Some(Err(error));
    }

    fn back(&mut self) {
        // Rewind the statement's effects; the next run re-executes it.
        let mut core = self.session.core.lock();
        if let Some(savepoint) = core.current.as_ref().map(|c| c.savepoint_id) {
            if let Some(tx) = core.transaction.as_mut() {
                tx.engine_mut().rollback_to_savepoint(savepoint);
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.statement.cancel();
    }

    async fn finish(mut self: Box<Self>) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Err(DbError::General("command produced no outcome".to_string())));
        let callback = self.callback.take();
        let session = self.session.clone();
        match outcome {
            Ok(result) => session.stop_current_command(callback, Ok(result)).await,
            Err(e) => {
                tracing::debug!(session = session.id(), error = %e, "statement failed");
                session.rollback_current_command(None);
                if let Some(callback) = callback {
                    callback(Err(e));
                }
            }
        }
    }
}
