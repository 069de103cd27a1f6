use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::engine::{EngineTransaction, IsolationLevel};
use crate::value::Value;

pub type Row = Vec<Value>;

/// Returned when a row-level write hits a lock held by another transaction.
/// The session layer turns this into a lock wait or a replication conflict.
#[derive(thiserror::Error, Debug, Clone)]
#[error("row {key} of {map} is locked by transaction {holder}")]
pub struct RowLockConflict {
    pub map: String,
    pub key: i64,
    pub holder: u64,
}

#[derive(Debug, Default)]
struct RowState {
    committed: Option<Row>,
    /// Pending change of the locking transaction: `Some(row)` is a put,
    /// `None` is a delete.
    uncommitted: Option<(u64, Option<Row>)>,
    lock_owner: Option<u64>,
}

impl RowState {
    fn is_vacant(&self) -> bool {
        self.committed.is_none() && self.uncommitted.is_none() && self.lock_owner.is_none()
    }
}

/// Allocator for synthetic keys of primary-key-less appends. Replication
/// conflict resolution rewrites `next`/`max_key` and publishes the
/// per-replication-name start keys every replica must agree on.
#[derive(Debug)]
pub struct AppendAllocator {
    next: AtomicI64,
    max_key: AtomicI64,
    assignments: Mutex<HashMap<String, i64>>,
}

impl AppendAllocator {
    fn new() -> Self {
        AppendAllocator {
            next: AtomicI64::new(1),
            max_key: AtomicI64::new(i64::MAX),
            assignments: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves `count` consecutive keys and returns the first one.
    pub fn reserve(&self, count: i64) -> i64 {
        self.next.fetch_add(count, Ordering::SeqCst)
    }

    pub fn next_key(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }

    pub fn set_next_key(&self, key: i64) {
        self.next.store(key, Ordering::SeqCst);
    }

    pub fn max_key(&self) -> i64 {
        self.max_key.load(Ordering::SeqCst)
    }

    pub fn set_max_key(&self, key: i64) {
        self.max_key.store(key, Ordering::SeqCst);
    }

    /// Publishes the negotiated replication-name to start-key table.
    pub fn publish_assignments(&self, assignments: HashMap<String, i64>) {
        *self.assignments.lock() = assignments;
    }

    pub fn assignment(&self, replication_name: &str) -> Option<i64> {
        self.assignments.lock().get(replication_name).copied()
    }
}

pub(crate) struct MapData {
    name: String,
    rows: RwLock<BTreeMap<i64, RowState>>,
    append: AppendAllocator,
}

impl MapData {
    pub(crate) fn new(name: &str) -> Arc<MapData> {
        Arc::new(MapData {
            name: name.to_string(),
            rows: RwLock::new(BTreeMap::new()),
            append: AppendAllocator::new(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// One reverted step of a transaction. The savepoint of a row lock is the
/// undo-log position of the entry that acquired it.
pub(crate) struct UndoEntry {
    map: Arc<MapData>,
    key: i64,
    prev_uncommitted: Option<(u64, Option<Row>)>,
    acquired_lock: bool,
}

impl UndoEntry {
    pub(crate) fn key(&self) -> i64 {
        self.key
    }

    pub(crate) fn map_name(&self) -> &str {
        self.map.name()
    }

    pub(crate) fn acquired_lock(&self) -> bool {
        self.acquired_lock
    }

    /// Reverts this step, releasing the row lock if this step took it.
    pub(crate) fn undo(self) {
        let mut rows = self.map.rows.write();
        if let Some(state) = rows.get_mut(&self.key) {
            state.uncommitted = self.prev_uncommitted;
            if self.acquired_lock {
                state.lock_owner = None;
            }
            if state.is_vacant() {
                rows.remove(&self.key);
            }
        }
    }

    /// Promotes the pending change of `tx_id` to the committed image and
    /// releases the row lock. Later entries for the same key are no-ops.
    pub(crate) fn apply(self, tx_id: u64) {
        let mut rows = self.map.rows.write();
        if let Some(state) = rows.get_mut(&self.key) {
            if let Some((owner, value)) = state.uncommitted.take() {
                if owner == tx_id {
                    state.committed = value;
                } else {
                    state.uncommitted = Some((owner, value));
                }
            }
            if state.lock_owner == Some(tx_id) {
                state.lock_owner = None;
            }
            if state.is_vacant() {
                rows.remove(&self.key);
            }
        }
    }
}

/// A transactional key/row map. All access goes through an owning
/// [`EngineTransaction`]; writes take the row lock and stay invisible to
/// other transactions until commit.
#[derive(Clone)]
pub struct TransactionMap {
    pub(crate) data: Arc<MapData>,
}

impl TransactionMap {
    pub fn name(&self) -> &str {
        self.data.name()
    }

    pub fn append_allocator(&self) -> &AppendAllocator {
        &self.data.append
    }

    pub fn get(&self, tx: &EngineTransaction, key: i64) -> Option<Row> {
        let rows = self.data.rows.read();
        let state = rows.get(&key)?;
        Self::visible(tx, state)
    }

    fn visible(tx: &EngineTransaction, state: &RowState) -> Option<Row> {
        match &state.uncommitted {
            Some((owner, value)) if *owner == tx.id() => value.clone(),
            Some((_, value)) if tx.isolation() == IsolationLevel::ReadUncommitted => {
                value.clone().or_else(|| state.committed.clone())
            }
            _ => state.committed.clone(),
        }
    }

    pub fn try_put(
        &self,
        tx: &mut EngineTransaction,
        key: i64,
        row: Row,
    ) -> Result<(), RowLockConflict> {
        self.write(tx, key, Some(row)).map(|_| ())
    }

    /// Returns whether a visible row existed.
    pub fn try_remove(&self, tx: &mut EngineTransaction, key: i64) -> Result<bool, RowLockConflict> {
        self.write(tx, key, None)
    }

    fn write(
        &self,
        tx: &mut EngineTransaction,
        key: i64,
        row: Option<Row>,
    ) -> Result<bool, RowLockConflict> {
        let entry = {
            let mut rows = self.data.rows.write();
            let state = rows.entry(key).or_default();
            if let Some(holder) = state.lock_owner {
                if holder != tx.id() {
                    return Err(RowLockConflict {
                        map: self.data.name().to_string(),
                        key,
                        holder,
                    });
                }
            }
            let existed = Self::visible(tx, state).is_some();
            let acquired_lock = state.lock_owner.is_none();
            let prev_uncommitted = state.uncommitted.take();
            state.lock_owner = Some(tx.id());
            state.uncommitted = Some((tx.id(), row));
            (
                UndoEntry {
                    map: self.data.clone(),
                    key,
                    prev_uncommitted,
                    acquired_lock,
                },
                existed,
            )
        };
        let (undo, existed) = entry;
        tx.push_undo(undo);
        Ok(existed)
    }

    /// Appends a row under a fresh synthetic key.
    pub fn append(&self, tx: &mut EngineTransaction, row: Row) -> Result<i64, RowLockConflict> {
        let key = self.data.append.reserve(1);
        self.try_put(tx, key, row)?;
        Ok(key)
    }

    /// All rows visible to `tx`, in key order.
    pub fn scan(&self, tx: &EngineTransaction) -> Vec<(i64, Row)> {
        let rows = self.data.rows.read();
        rows.iter()
            .filter_map(|(key, state)| Self::visible(tx, state).map(|row| (*key, row)))
            .collect()
    }

    pub fn committed_len(&self) -> usize {
        let rows = self.data.rows.read();
        rows.values().filter(|s| s.committed.is_some()).count()
    }

    /// Owner of the row lock, if any. Used by the session layer to route a
    /// conflict to the holding transaction.
    pub fn row_lock_owner(&self, key: i64) -> Option<u64> {
        self.data.rows.read().get(&key).and_then(|s| s.lock_owner)
    }

    /// Drops every committed row. Only sound for session-scoped maps where
    /// no other transaction can hold row locks.
    pub fn truncate(&self) {
        self.data.rows.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{TransactionEngine, TransactionOptions};
    use crate::value::Value;

    fn row(v: i32) -> Row {
        vec![Value::Int(v)]
    }

    #[test]
    fn uncommitted_rows_are_private() {
        let engine = TransactionEngine::new();
        let map = engine.open_map("t");
        let mut tx1 = engine.begin(TransactionOptions::default());
        let tx2 = engine.begin(TransactionOptions::default());

        map.try_put(&mut tx1, 1, row(10)).unwrap();
        assert_eq!(map.get(&tx1, 1), Some(row(10)));
        assert_eq!(map.get(&tx2, 1), None);

        tx1.commit();
        assert_eq!(map.get(&tx2, 1), Some(row(10)));
    }

    #[test]
    fn writer_blocks_other_writers() {
        let engine = TransactionEngine::new();
        let map = engine.open_map("t");
        let mut tx1 = engine.begin(TransactionOptions::default());
        let mut tx2 = engine.begin(TransactionOptions::default());

        map.try_put(&mut tx1, 1, row(1)).unwrap();
        let conflict = map.try_put(&mut tx2, 1, row(2)).unwrap_err();
        assert_eq!(conflict.holder, tx1.id());
        assert_eq!(conflict.key, 1);

        tx1.rollback();
        map.try_put(&mut tx2, 1, row(2)).unwrap();
        tx2.commit();

        let check = engine.begin(TransactionOptions::default());
        assert_eq!(map.get(&check, 1), Some(row(2)));
    }

    #[test]
    fn append_reserves_consecutive_keys() {
        let engine = TransactionEngine::new();
        let map = engine.open_map("t");
        let mut tx = engine.begin(TransactionOptions::default());
        let k1 = map.append(&mut tx, row(1)).unwrap();
        let k2 = map.append(&mut tx, row(2)).unwrap();
        assert_eq!(k2, k1 + 1);
        tx.commit();
        assert_eq!(map.committed_len(), 2);
    }

    #[test]
    fn allocator_assignments_roundtrip() {
        let allocator = AppendAllocator::new();
        let mut table = HashMap::new();
        table.insert("r1".to_string(), 5i64);
        table.insert("r2".to_string(), 9i64);
        allocator.publish_assignments(table);
        assert_eq!(allocator.assignment("r1"), Some(5));
        assert_eq!(allocator.assignment("r2"), Some(9));
        assert_eq!(allocator.assignment("r3"), None);
    }
}
