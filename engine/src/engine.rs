use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::map::{MapData, TransactionMap, UndoEntry};

/// Transaction isolation level, named as the session setting accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn parse(name: &str) -> Option<IsolationLevel> {
        match name.trim().to_ascii_uppercase().as_str() {
            "READ_UNCOMMITTED" => Some(IsolationLevel::ReadUncommitted),
            "READ_COMMITTED" => Some(IsolationLevel::ReadCommitted),
            "REPEATABLE_READ" => Some(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ_UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ_COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE_READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options a transaction is begun with.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    pub auto_commit: bool,
    pub isolation: IsolationLevel,
    /// Set when the transaction applies a replicated write attempt.
    pub replication_name: Option<String>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions {
            auto_commit: true,
            isolation: IsolationLevel::default(),
            replication_name: None,
        }
    }
}

/// Redo-log records. `CommitReady` and `CommitDecision` carry the global
/// transaction name of the distributed protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Commit { tx: u64 },
    CommitReady { tx: u64, global: String },
    CommitDecision { tx: u64, global: String },
    Rollback { tx: u64 },
}

#[derive(Default)]
struct RedoLog {
    records: Mutex<Vec<LogRecord>>,
}

impl RedoLog {
    fn flush(&self, record: LogRecord) {
        tracing::trace!(?record, "redo log flush");
        self.records.lock().push(record);
    }
}

/// The transaction engine: a registry of named transactional maps plus the
/// redo log. Cheap to share; the session layer holds it behind an `Arc`.
pub struct TransactionEngine {
    maps: RwLock<HashMap<String, Arc<MapData>>>,
    next_tx_id: AtomicU64,
    log: RedoLog,
}

impl TransactionEngine {
    pub fn new() -> Arc<TransactionEngine> {
        Arc::new(TransactionEngine {
            maps: RwLock::new(HashMap::new()),
            next_tx_id: AtomicU64::new(1),
            log: RedoLog::default(),
        })
    }

    /// Opens a map, creating it on first use.
    pub fn open_map(self: &Arc<Self>, name: &str) -> TransactionMap {
        if let Some(data) = self.maps.read().get(name) {
            return TransactionMap { data: data.clone() };
        }
        let mut maps = self.maps.write();
        let data = maps
            .entry(name.to_string())
            .or_insert_with(|| MapData::new(name));
        TransactionMap { data: data.clone() }
    }

    pub fn map_exists(&self, name: &str) -> bool {
        self.maps.read().contains_key(name)
    }

    pub fn drop_map(&self, name: &str) -> bool {
        self.maps.write().remove(name).is_some()
    }

    pub fn begin(self: &Arc<Self>, opts: TransactionOptions) -> EngineTransaction {
        let id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx = id, auto_commit = opts.auto_commit, "begin transaction");
        EngineTransaction {
            id,
            engine: self.clone(),
            opts,
            undo: Vec::new(),
            started_at: Instant::now(),
            finished: false,
        }
    }

    /// Snapshot of the redo log, oldest first.
    pub fn log_records(&self) -> Vec<LogRecord> {
        self.log.records.lock().clone()
    }
}

/// A storage-level transaction: an undo log over the engine's maps. A
/// savepoint is an undo-log position; rolling back to one reverts the
/// suffix and releases the row locks that suffix acquired.
pub struct EngineTransaction {
    id: u64,
    engine: Arc<TransactionEngine>,
    opts: TransactionOptions,
    undo: Vec<UndoEntry>,
    started_at: Instant,
    finished: bool,
}

impl EngineTransaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.opts.isolation
    }

    pub fn auto_commit(&self) -> bool {
        self.opts.auto_commit
    }

    pub fn replication_name(&self) -> Option<&str> {
        self.opts.replication_name.as_deref()
    }

    pub(crate) fn push_undo(&mut self, entry: UndoEntry) {
        self.undo.push(entry);
    }

    /// The current savepoint: the undo-log position.
    pub fn savepoint(&self) -> i64 {
        self.undo.len() as i64
    }

    /// Position of the undo entry that acquired the lock on `key` in `map`,
    /// usable as the savepoint to roll the lock itself back.
    pub fn locked_row_savepoint(&self, map: &str, key: i64) -> Option<i64> {
        self.undo
            .iter()
            .position(|e| e.map_name() == map && e.key() == key && e.acquired_lock())
            .map(|p| p as i64)
    }

    /// Reverts every step taken after `savepoint`.
    pub fn rollback_to_savepoint(&mut self, savepoint: i64) {
        let savepoint = savepoint.max(0) as usize;
        while self.undo.len() > savepoint {
            if let Some(entry) = self.undo.pop() {
                entry.undo();
            }
        }
    }

    /// Phase one of a distributed commit: persist the commit-ready record.
    /// The transaction stays open until the coordinator's decision arrives.
    pub fn prepare_commit(&mut self, global_name: &str) {
        self.engine.log.flush(LogRecord::CommitReady {
            tx: self.id,
            global: global_name.to_string(),
        });
    }

    /// Phase two of a distributed commit: persist the decision and apply.
    pub fn commit_decided(&mut self, global_name: &str) {
        if self.finished {
            return;
        }
        self.engine.log.flush(LogRecord::CommitDecision {
            tx: self.id,
            global: global_name.to_string(),
        });
        self.apply_commit();
    }

    /// Local commit: flush the commit record, then publish the changes.
    pub fn commit(&mut self) {
        if self.finished {
            return;
        }
        self.engine.log.flush(LogRecord::Commit { tx: self.id });
        self.apply_commit();
    }

    fn apply_commit(&mut self) {
        self.finished = true;
        for entry in self.undo.drain(..) {
            entry.apply(self.id);
        }
        tracing::debug!(tx = self.id, "committed");
    }

    pub fn rollback(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.rollback_to_savepoint(0);
        self.engine.log.flush(LogRecord::Rollback { tx: self.id });
        tracing::debug!(tx = self.id, "rolled back");
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        !timeout.is_zero() && self.started_at.elapsed() >= timeout
    }
}

impl Drop for EngineTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(tx = self.id, "dropping open transaction, rolling back");
            self.finished = true;
            self.rollback_to_savepoint(0);
            self.engine.log.flush(LogRecord::Rollback { tx: self.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(v: i32) -> Vec<Value> {
        vec![Value::Int(v)]
    }

    #[test]
    fn savepoint_rollback_reverts_suffix_only() {
        let engine = TransactionEngine::new();
        let map = engine.open_map("t");
        let mut tx = engine.begin(TransactionOptions::default());

        map.try_put(&mut tx, 1, row(1)).unwrap();
        let sp = tx.savepoint();
        map.try_put(&mut tx, 2, row(2)).unwrap();
        map.try_put(&mut tx, 3, row(3)).unwrap();

        tx.rollback_to_savepoint(sp);
        assert_eq!(map.get(&tx, 1), Some(row(1)));
        assert_eq!(map.get(&tx, 2), None);
        assert_eq!(map.get(&tx, 3), None);

        tx.commit();
        assert_eq!(map.committed_len(), 1);
    }

    #[test]
    fn savepoint_rollback_releases_locks_taken_after() {
        let engine = TransactionEngine::new();
        let map = engine.open_map("t");
        let mut tx1 = engine.begin(TransactionOptions::default());
        let mut tx2 = engine.begin(TransactionOptions::default());

        let sp = tx1.savepoint();
        map.try_put(&mut tx1, 1, row(1)).unwrap();
        assert!(map.try_put(&mut tx2, 1, row(2)).is_err());

        tx1.rollback_to_savepoint(sp);
        map.try_put(&mut tx2, 1, row(2)).unwrap();
        tx2.commit();
        tx1.commit();

        let check = engine.begin(TransactionOptions::default());
        assert_eq!(map.get(&check, 1), Some(row(2)));
    }

    #[test]
    fn locked_row_savepoint_points_at_acquisition() {
        let engine = TransactionEngine::new();
        let map = engine.open_map("t");
        let mut tx = engine.begin(TransactionOptions::default());

        map.try_put(&mut tx, 7, row(1)).unwrap();
        map.try_put(&mut tx, 8, row(2)).unwrap();
        map.try_put(&mut tx, 7, row(3)).unwrap();

        assert_eq!(tx.locked_row_savepoint("t", 7), Some(0));
        assert_eq!(tx.locked_row_savepoint("t", 8), Some(1));
        assert_eq!(tx.locked_row_savepoint("t", 9), None);
        tx.rollback();
    }

    #[test]
    fn two_phase_records_are_ordered() {
        let engine = TransactionEngine::new();
        let map = engine.open_map("t");
        let mut tx = engine.begin(TransactionOptions::default());
        map.try_put(&mut tx, 1, row(1)).unwrap();

        tx.prepare_commit("g1,peer:9000");
        tx.commit_decided("g1,peer:9000");

        let records = engine.log_records();
        assert_eq!(
            records,
            vec![
                LogRecord::CommitReady {
                    tx: tx.id(),
                    global: "g1,peer:9000".to_string()
                },
                LogRecord::CommitDecision {
                    tx: tx.id(),
                    global: "g1,peer:9000".to_string()
                },
            ]
        );
        assert_eq!(map.committed_len(), 1);
    }

    #[test]
    fn dropping_an_open_transaction_rolls_back() {
        let engine = TransactionEngine::new();
        let map = engine.open_map("t");
        {
            let mut tx = engine.begin(TransactionOptions::default());
            map.try_put(&mut tx, 1, row(1)).unwrap();
        }
        let check = engine.begin(TransactionOptions::default());
        assert_eq!(map.get(&check, 1), None);
        assert!(matches!(
            engine.log_records().last(),
            Some(LogRecord::Rollback { .. })
        ));
    }

    #[test]
    fn isolation_level_names_roundtrip() {
        for level in [
            IsolationLevel::ReadUncommitted,
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            assert_eq!(IsolationLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(IsolationLevel::parse("SNAPSHOT"), None);
    }
}
