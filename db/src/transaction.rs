use std::collections::HashMap;
use std::sync::{Arc, Weak};

use basalt_engine::{EngineTransaction, IsolationLevel, TransactionOptions};

use crate::database::TableMeta;
use crate::error::DbError;
use crate::lock::TransactionListener;
use crate::replication::{ReplicationAckPacket, PHASE_COMMIT, PHASE_PREPARE};
use crate::session::{CommitCallback, Session, SessionCore, SessionStatus};
use crate::session_pool::RemoteSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Open,
    Committing,
    Committed,
    RolledBack,
    Waiting,
}

/// The transaction a root session owns: the engine transaction plus the
/// distributed-commit state. Participant handles come from the nested
/// session pool and only hold weak links back, so the session ↔ transaction
/// ↔ participant cycle stays lookup-only.
pub struct Transaction {
    engine_tx: EngineTransaction,
    global_name: Option<String>,
    isolation: IsolationLevel,
    status: TransactionStatus,
    named_savepoints: HashMap<String, i64>,
    participants: Vec<Arc<RemoteSession>>,
    replication_name: Option<String>,
    pub(crate) retry_replication_names: Vec<String>,
    /// Sessions blocked on a row this transaction has locked, keyed by row
    /// key. Drained and woken when the transaction ends.
    waiting: HashMap<i64, Vec<(Weak<Session>, Arc<dyn TransactionListener>)>>,
    catalog_snapshot: Option<HashMap<String, TableMeta>>,
}

impl Transaction {
    fn new(engine_tx: EngineTransaction, replication_name: Option<String>) -> Transaction {
        let isolation = engine_tx.isolation();
        Transaction {
            engine_tx,
            global_name: None,
            isolation,
            status: TransactionStatus::Open,
            named_savepoints: HashMap::new(),
            participants: Vec::new(),
            replication_name,
            retry_replication_names: Vec::new(),
            waiting: HashMap::new(),
            catalog_snapshot: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.engine_tx.id()
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: TransactionStatus) {
        self.status = status;
    }

    pub fn global_name(&self) -> Option<&str> {
        self.global_name.as_deref()
    }

    pub fn replication_name(&self) -> Option<&str> {
        self.replication_name.as_deref()
    }

    pub fn engine(&self) -> &EngineTransaction {
        &self.engine_tx
    }

    pub fn engine_mut(&mut self) -> &mut EngineTransaction {
        &mut self.engine_tx
    }

    /// Joins a participant exactly once, by peer URL.
    pub(crate) fn join_participant(&mut self, session: Arc<RemoteSession>) {
        if !self.participants.iter().any(|p| p.url() == session.url()) {
            self.participants.push(session);
        }
    }

    pub fn participant_urls(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.url().to_string()).collect()
    }

    fn participants(&self) -> Vec<Arc<RemoteSession>> {
        self.participants.clone()
    }

    pub(crate) fn add_row_waiter(
        &mut self,
        key: i64,
        session: Weak<Session>,
        listener: Arc<dyn TransactionListener>,
    ) {
        self.waiting.entry(key).or_default().push((session, listener));
    }

    fn drain_row_waiters(&mut self) -> Vec<Arc<dyn TransactionListener>> {
        self.waiting
            .drain()
            .flat_map(|(_, waiters)| waiters)
            .filter(|(session, _)| session.upgrade().is_some())
            .map(|(_, listener)| listener)
            .collect()
    }

    pub fn row_waiter_count(&self, key: i64) -> usize {
        self.waiting.get(&key).map_or(0, Vec::len)
    }

    /// Remembers the catalog as it was before the first DDL of this
    /// transaction; rollback restores from it.
    pub fn snapshot_catalog_once(&mut self, snapshot: HashMap<String, TableMeta>) {
        if self.catalog_snapshot.is_none() {
            self.catalog_snapshot = Some(snapshot);
        }
    }
}

impl Session {
    pub(crate) fn ensure_transaction<'a>(&self, core: &'a mut SessionCore) -> &'a mut Transaction {
        if core.transaction.is_none() {
            let engine_tx = self.database().engine().begin(TransactionOptions {
                auto_commit: core.auto_commit,
                isolation: core.isolation,
                replication_name: core.replication_name.clone(),
            });
            tracing::debug!(
                session = self.id(),
                tx = engine_tx.id(),
                "transaction started"
            );
            core.transaction = Some(Transaction::new(engine_tx, core.replication_name.clone()));
            self.set_status(SessionStatus::TransactionNotCommit);
        }
        core.transaction.as_mut().unwrap()
    }

    /// Runs `f` under the session's transaction, starting one lazily.
    pub fn with_transaction<R>(self: &Arc<Self>, f: impl FnOnce(&mut Transaction) -> R) -> R {
        let mut core = self.core.lock();
        let tx = self.ensure_transaction(&mut core);
        f(tx)
    }

    pub fn transaction_id(&self) -> Option<u64> {
        self.core.lock().transaction.as_ref().map(Transaction::id)
    }

    pub fn has_transaction(&self) -> bool {
        self.core.lock().transaction.is_some()
    }

    /// Starts an explicit multi-statement transaction; auto-commit is off
    /// until the client commits or rolls back.
    pub fn begin(self: &Arc<Self>) {
        let mut core = self.core.lock();
        core.auto_commit = false;
        self.ensure_transaction(&mut core);
    }

    // --------------------------------------------------------------- savepoints

    pub fn add_savepoint(self: &Arc<Self>, name: &str) -> Result<(), DbError> {
        self.check_commit_rollback_allowed()?;
        let mut core = self.core.lock();
        core.savepoint_counter += 1;
        let tx = self.ensure_transaction(&mut core);
        let savepoint = tx.engine().savepoint();
        tx.named_savepoints.insert(name.to_string(), savepoint);
        tracing::trace!(session = self.id(), name, savepoint, "savepoint added");
        Ok(())
    }

    pub fn rollback_to_savepoint(self: &Arc<Self>, name: &str) -> Result<(), DbError> {
        self.check_commit_rollback_allowed()?;
        let mut core = self.core.lock();
        let tx = core
            .transaction
            .as_mut()
            .ok_or_else(|| DbError::General("no active transaction".to_string()))?;
        let savepoint = *tx
            .named_savepoints
            .get(name)
            .ok_or_else(|| DbError::General(format!("savepoint not found: {name}")))?;
        tx.engine_mut().rollback_to_savepoint(savepoint);
        tx.named_savepoints.retain(|_, sp| *sp <= savepoint);
        Ok(())
    }

    pub fn rollback_to(self: &Arc<Self>, savepoint_id: i64) -> Result<(), DbError> {
        self.check_commit_rollback_allowed()?;
        let mut core = self.core.lock();
        let tx = core
            .transaction
            .as_mut()
            .ok_or_else(|| DbError::General("no active transaction".to_string()))?;
        tx.engine_mut().rollback_to_savepoint(savepoint_id);
        tx.named_savepoints.retain(|_, sp| *sp <= savepoint_id);
        Ok(())
    }

    pub fn current_savepoint(&self) -> i64 {
        self.core
            .lock()
            .transaction
            .as_ref()
            .map(|tx| tx.engine().savepoint())
            .unwrap_or(0)
    }

    // ----------------------------------------------------------- nested sessions

    /// Opens (or reuses) the nested session for `url` and joins it to the
    /// current transaction's participant list exactly once.
    pub async fn join_nested_session(self: &Arc<Self>, url: &str) -> Result<Arc<RemoteSession>, DbError> {
        if !self.is_root() {
            return Err(DbError::General(format!(
                "session {} is not a distributed-transaction root",
                self.id()
            )));
        }
        if let Some(existing) = self
            .core
            .lock()
            .nested_sessions
            .as_ref()
            .and_then(|m| m.get(url).cloned())
        {
            return Ok(existing);
        }
        let remote = self.database().session_pool().acquire(url).await?;
        remote.set_parent(self);
        {
            let mut core = self.core.lock();
            core.nested_sessions
                .get_or_insert_with(HashMap::new)
                .insert(url.to_string(), remote.clone());
            let tx = self.ensure_transaction(&mut core);
            tx.join_participant(remote.clone());
        }
        Ok(remote)
    }

    pub fn nested_session_count(&self) -> usize {
        self.core
            .lock()
            .nested_sessions
            .as_ref()
            .map_or(0, HashMap::len)
    }

    // ----------------------------------------------------------------- commit

    pub async fn commit(self: &Arc<Self>) -> Result<(), DbError> {
        self.commit_with_global_name(None).await
    }

    /// Commits the current transaction. Participants drive phase one and
    /// two of the distributed protocol; a participant session receives the
    /// coordinator's `global_name` instead of building one.
    pub async fn commit_with_global_name(
        self: &Arc<Self>,
        global_name: Option<&str>,
    ) -> Result<(), DbError> {
        self.check_commit_rollback_allowed()?;
        let (tx_id, participants) = {
            let mut core = self.core.lock();
            let Some(tx) = core.transaction.as_mut() else {
                self.set_status(SessionStatus::TransactionNotStart);
                return Ok(());
            };
            tx.set_status(TransactionStatus::Committing);
            (tx.id(), tx.participants())
        };
        self.set_status(SessionStatus::TransactionCommitting);

        if participants.is_empty() {
            {
                let mut core = self.core.lock();
                if let Some(tx) = core.transaction.as_mut() {
                    tx.engine_mut().commit();
                    tx.set_status(TransactionStatus::Committed);
                }
            }
            self.commit_final(true);
            return Ok(());
        }

        // Only a root session builds the global transaction name.
        let global_name = match global_name {
            Some(name) => name.to_string(),
            None => {
                let mut name = format!("{}:{}", self.database().name(), tx_id);
                for participant in &participants {
                    name.push(',');
                    name.push_str(participant.url());
                }
                name
            }
        };
        tracing::debug!(session = self.id(), global = %global_name, "distributed commit");

        // Phase one: everyone logs a commit-ready record.
        {
            let mut core = self.core.lock();
            if let Some(tx) = core.transaction.as_mut() {
                tx.engine_mut().prepare_commit(&global_name);
                tx.global_name = Some(global_name.clone());
            }
        }
        for participant in &participants {
            if let Err(e) = participant.prepare_commit(&global_name).await {
                tracing::warn!(
                    session = self.id(),
                    peer = participant.url(),
                    error = %e,
                    "prepare failed, rolling back all participants"
                );
                for other in &participants {
                    let _ = other.rollback().await;
                }
                {
                    let mut core = self.core.lock();
                    if let Some(tx) = core.transaction.as_mut() {
                        tx.engine_mut().rollback();
                        tx.set_status(TransactionStatus::RolledBack);
                    }
                }
                self.commit_final(false);
                return Err(e);
            }
        }

        // Phase two: the decision record, then participant finalization.
        {
            let mut core = self.core.lock();
            if let Some(tx) = core.transaction.as_mut() {
                tx.engine_mut().commit_decided(&global_name);
                tx.set_status(TransactionStatus::Committed);
            }
        }
        for participant in &participants {
            if let Err(e) = participant.commit(&global_name).await {
                // The decision is durable; the peer recovers from its log.
                tracing::error!(
                    session = self.id(),
                    peer = participant.url(),
                    error = %e,
                    "participant finalization failed"
                );
            }
        }
        self.commit_final(true);
        Ok(())
    }

    /// Commit that returns immediately; the flush and the participant
    /// round-trips happen on a spawned task and `on_done` fires after the
    /// post-commit phase.
    pub fn async_commit(self: &Arc<Self>, on_done: CommitCallback) {
        self.set_status(SessionStatus::TransactionCommitting);
        let session = self.clone();
        tokio::spawn(async move {
            let result = session.commit().await;
            on_done(result);
        });
    }

    /// Participant side of phase one. Returns the phase-tagged ack the wire
    /// layer sends back to the coordinator once the commit-ready record is
    /// durable.
    pub async fn prepare_commit(self: &Arc<Self>, global_name: &str) -> Result<ReplicationAckPacket, DbError> {
        {
            let mut core = self.core.lock();
            if let Some(tx) = core.transaction.as_mut() {
                tx.engine_mut().prepare_commit(global_name);
                tx.global_name = Some(global_name.to_string());
                tx.set_status(TransactionStatus::Committing);
            }
        }
        self.set_status(SessionStatus::TransactionCommitting);
        Ok(self.emit_prepared_ack(PHASE_PREPARE, false))
    }

    /// Participant side of phase two: finalize only after the coordinator
    /// confirmed the decision, then report the final phase.
    pub async fn commit_participant(
        self: &Arc<Self>,
        global_name: &str,
    ) -> Result<ReplicationAckPacket, DbError> {
        {
            let mut core = self.core.lock();
            if let Some(tx) = core.transaction.as_mut() {
                tx.engine_mut().commit_decided(global_name);
                tx.set_status(TransactionStatus::Committed);
            }
        }
        self.commit_final(true);
        Ok(self.emit_prepared_ack(PHASE_COMMIT, true))
    }

    /// The post-commit (or post-rollback) phase: end the transaction, run
    /// the on-commit temp-table actions unless the last statement was DDL,
    /// unlink scheduled LOBs (strictly after the log flush), release every
    /// lock, clear the yieldable slot, recycle nested sessions, and reset
    /// the status.
    pub(crate) fn commit_final(self: &Arc<Self>, succeeded: bool) {
        let engine = self.database().engine().clone();
        let (waiters, locks, nested, dropped, truncated, lobs) = {
            let mut core = self.core.lock();
            let waiters = match core.transaction.take() {
                Some(mut tx) => tx.drain_row_waiters(),
                None => Vec::new(),
            };
            core.current = None;
            core.commit_rollback_disabled = false;
            core.replication_conflict = None;
            core.yieldable = None;
            core.wait_lock = None;
            core.wait_row = None;
            core.resources.close_temp_results();

            let (dropped, truncated) = if succeeded && !core.last_statement_was_ddl {
                core.resources.take_on_commit_actions()
            } else {
                (Vec::new(), Vec::new())
            };
            let lobs = if succeeded {
                core.resources.take_lobs_to_unlink()
            } else {
                Vec::new()
            };
            let locks: Vec<_> = core.locks.drain(..).collect();
            let nested: Vec<Arc<RemoteSession>> = core
                .nested_sessions
                .take()
                .map(|m| m.into_values().collect())
                .unwrap_or_default();
            (waiters, locks, nested, dropped, truncated, lobs)
        };

        for table in dropped {
            engine.drop_map(table.map.name());
        }
        for map in truncated {
            map.truncate();
        }
        for lob in lobs {
            lob.unlink();
            lob.close();
        }
        for lock in locks {
            lock.unlock(self, succeeded, None);
        }
        for session in nested {
            self.database().session_pool().recycle(session);
        }
        for listener in waiters {
            listener.on_granted();
        }
        self.set_status(SessionStatus::TransactionNotStart);
        self.wake();
    }

    // ---------------------------------------------------------------- rollback

    pub async fn rollback(self: &Arc<Self>) -> Result<(), DbError> {
        self.check_commit_rollback_allowed()?;
        let (had_tx, participants, snapshot, restore_catalog) = {
            let mut core = self.core.lock();
            let restore_catalog = core.last_statement_was_ddl || core.last_statement_was_database;
            match core.transaction.as_mut() {
                None => (false, Vec::new(), None, false),
                Some(tx) => {
                    tx.engine_mut().rollback();
                    tx.set_status(TransactionStatus::RolledBack);
                    (
                        true,
                        tx.participants(),
                        tx.catalog_snapshot.take(),
                        restore_catalog,
                    )
                }
            }
        };
        if !had_tx {
            self.set_status(SessionStatus::TransactionNotStart);
            return Ok(());
        }
        if restore_catalog {
            if let Some(snapshot) = snapshot {
                self.database().restore_catalog(snapshot);
            }
        }
        for participant in &participants {
            if let Err(e) = participant.rollback().await {
                tracing::warn!(peer = participant.url(), error = %e, "participant rollback failed");
            }
        }
        self.commit_final(false);
        Ok(())
    }

    /// Synchronous local rollback used by close and by the cooperative
    /// transaction-timeout path. Remote participants are not contacted;
    /// they expire on their own nodes.
    pub(crate) fn rollback_local(self: &Arc<Self>) {
        let (had_tx, snapshot, restore_catalog) = {
            let mut core = self.core.lock();
            let restore_catalog = core.last_statement_was_ddl || core.last_statement_was_database;
            match core.transaction.as_mut() {
                None => (false, None, false),
                Some(tx) => {
                    tx.engine_mut().rollback();
                    tx.set_status(TransactionStatus::RolledBack);
                    (true, tx.catalog_snapshot.take(), restore_catalog)
                }
            }
        };
        if !had_tx {
            return;
        }
        if restore_catalog {
            if let Some(snapshot) = snapshot {
                self.database().restore_catalog(snapshot);
            }
        }
        self.commit_final(false);
    }
}
