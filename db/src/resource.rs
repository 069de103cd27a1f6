use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use basalt_engine::{Lob, TransactionMap};
use lru::LruCache;

use crate::error::DbError;
use crate::statement::{PreparedStatement, StatementId};

/// Temporary results a session may keep open at once; later adds are
/// silently ignored.
pub const MAX_TEMP_RESULTS: usize = 100;

/// What happens to a session-scoped table when the transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnCommitAction {
    #[default]
    Preserve,
    Drop,
    Truncate,
}

pub struct TempTable {
    pub name: String,
    pub map: TransactionMap,
    pub on_commit: OnCommitAction,
    pub columns: Vec<String>,
}

pub struct TempIndex {
    pub name: String,
    pub table: String,
}

pub struct TempConstraint {
    pub name: String,
    pub table: String,
}

/// A cursor-like handle flushed at commit.
pub trait TemporaryResult: Send {
    fn close(&self);
}

struct QueryCache {
    cache: LruCache<String, Arc<dyn PreparedStatement>>,
    /// Database modification-meta-id the cached statements were parsed
    /// under; the whole cache is dropped when it moves.
    snapshot_meta_id: i64,
}

struct CachedStatement {
    statement: Arc<dyn PreparedStatement>,
    last_used: Instant,
}

/// Per-session resource registry. Collections allocate on first write;
/// most short-lived sessions never touch them.
#[derive(Default)]
pub struct ResourceRegistry {
    temp_tables: Option<HashMap<String, TempTable>>,
    temp_indexes: Option<HashMap<String, TempIndex>>,
    temp_constraints: Option<HashMap<String, TempConstraint>>,
    temp_results: Option<Vec<Box<dyn TemporaryResult>>>,
    lobs_to_unlink: Option<HashMap<String, Arc<Lob>>>,
    query_cache: Option<QueryCache>,
    cursor_cache: Option<HashMap<StatementId, CachedStatement>>,
}

impl ResourceRegistry {
    pub fn add_temp_table(&mut self, table: TempTable) -> Result<(), DbError> {
        let tables = self.temp_tables.get_or_insert_with(HashMap::new);
        if tables.contains_key(&table.name) {
            return Err(DbError::TableOrViewAlreadyExists(table.name));
        }
        tables.insert(table.name.clone(), table);
        Ok(())
    }

    pub fn find_temp_table(&self, name: &str) -> Option<&TempTable> {
        self.temp_tables.as_ref()?.get(name)
    }

    pub fn remove_temp_table(&mut self, name: &str) -> Option<TempTable> {
        self.temp_tables.as_mut()?.remove(name)
    }

    pub fn add_temp_index(&mut self, index: TempIndex) -> Result<(), DbError> {
        let indexes = self.temp_indexes.get_or_insert_with(HashMap::new);
        if indexes.contains_key(&index.name) {
            return Err(DbError::IndexAlreadyExists(index.name));
        }
        indexes.insert(index.name.clone(), index);
        Ok(())
    }

    pub fn remove_temp_index(&mut self, name: &str) -> Option<TempIndex> {
        self.temp_indexes.as_mut()?.remove(name)
    }

    pub fn add_temp_constraint(&mut self, constraint: TempConstraint) -> Result<(), DbError> {
        let constraints = self.temp_constraints.get_or_insert_with(HashMap::new);
        if constraints.contains_key(&constraint.name) {
            return Err(DbError::ConstraintAlreadyExists(constraint.name));
        }
        constraints.insert(constraint.name.clone(), constraint);
        Ok(())
    }

    pub fn remove_temp_constraint(&mut self, name: &str) -> Option<TempConstraint> {
        self.temp_constraints.as_mut()?.remove(name)
    }

    /// Registers a temporary result to be flushed at commit. Beyond
    /// [`MAX_TEMP_RESULTS`] the handle is dropped unregistered.
    pub fn add_temp_result(&mut self, result: Box<dyn TemporaryResult>) {
        let results = self.temp_results.get_or_insert_with(Vec::new);
        if results.len() < MAX_TEMP_RESULTS {
            results.push(result);
        }
    }

    pub fn close_temp_results(&mut self) {
        if let Some(results) = self.temp_results.as_mut() {
            for result in results.drain(..) {
                result.close();
            }
        }
    }

    /// Schedules `lob` for unlink after the next commit-log flush. The LOB
    /// must already be linked.
    pub fn add_lob_to_unlink(&mut self, lob: Arc<Lob>) {
        debug_assert!(lob.is_linked());
        self.lobs_to_unlink
            .get_or_insert_with(HashMap::new)
            .insert(lob.identity(), lob);
    }

    pub fn take_lobs_to_unlink(&mut self) -> Vec<Arc<Lob>> {
        match self.lobs_to_unlink.as_mut() {
            Some(lobs) => lobs.drain().map(|(_, lob)| lob).collect(),
            None => Vec::new(),
        }
    }

    /// Looks `sql` up in the query cache. A meta-id different from the
    /// cached snapshot invalidates the whole cache first.
    pub fn query_cache_get(
        &mut self,
        sql: &str,
        meta_id: i64,
    ) -> Option<Arc<dyn PreparedStatement>> {
        let cache = self.query_cache.as_mut()?;
        if cache.snapshot_meta_id != meta_id {
            cache.cache.clear();
            cache.snapshot_meta_id = meta_id;
            return None;
        }
        cache.cache.get(sql).cloned()
    }

    pub fn query_cache_put(
        &mut self,
        sql: String,
        statement: Arc<dyn PreparedStatement>,
        meta_id: i64,
        capacity: usize,
    ) {
        let capacity = match NonZeroUsize::new(capacity) {
            Some(capacity) => capacity,
            None => return,
        };
        let cache = self.query_cache.get_or_insert_with(|| QueryCache {
            cache: LruCache::new(capacity),
            snapshot_meta_id: meta_id,
        });
        if cache.snapshot_meta_id != meta_id {
            cache.cache.clear();
            cache.snapshot_meta_id = meta_id;
        }
        cache.cache.put(sql, statement);
    }

    /// Holds a statement for the wire layer under its integer id.
    pub fn cursor_cache_put(&mut self, statement: Arc<dyn PreparedStatement>) {
        self.cursor_cache
            .get_or_insert_with(HashMap::new)
            .insert(
                statement.id(),
                CachedStatement {
                    statement,
                    last_used: Instant::now(),
                },
            );
    }

    pub fn cursor_cache_get(&mut self, id: StatementId) -> Option<Arc<dyn PreparedStatement>> {
        let cached = self.cursor_cache.as_mut()?.get_mut(&id)?;
        cached.last_used = Instant::now();
        Some(cached.statement.clone())
    }

    /// Removal on close is mandatory; expiry only reaps what the wire
    /// layer forgot.
    pub fn cursor_cache_remove(&mut self, id: StatementId) -> Option<Arc<dyn PreparedStatement>> {
        let cached = self.cursor_cache.as_mut()?.remove(&id)?;
        Some(cached.statement)
    }

    pub fn cursor_cache_expire(&mut self, ttl: Duration) {
        if let Some(cache) = self.cursor_cache.as_mut() {
            let now = Instant::now();
            cache.retain(|id, cached| {
                let keep = now.duration_since(cached.last_used) < ttl;
                if !keep {
                    tracing::trace!(statement = *id, "expiring cached cursor");
                    cached.statement.close();
                }
                keep
            });
        }
    }

    /// Tables to drop and maps to truncate for this commit.
    pub fn take_on_commit_actions(&mut self) -> (Vec<TempTable>, Vec<TransactionMap>) {
        let mut to_drop = Vec::new();
        let mut to_truncate = Vec::new();
        if let Some(tables) = self.temp_tables.as_mut() {
            let drop_names: Vec<String> = tables
                .values()
                .filter(|t| t.on_commit == OnCommitAction::Drop)
                .map(|t| t.name.clone())
                .collect();
            for name in drop_names {
                if let Some(table) = tables.remove(&name) {
                    to_drop.push(table);
                }
            }
            for table in tables.values() {
                if table.on_commit == OnCommitAction::Truncate {
                    to_truncate.push(table.map.clone());
                }
            }
        }
        (to_drop, to_truncate)
    }

    /// Every remaining temp table, for session close.
    pub fn take_temp_tables(&mut self) -> Vec<TempTable> {
        match self.temp_tables.as_mut() {
            Some(tables) => tables.drain().map(|(_, t)| t).collect(),
            None => Vec::new(),
        }
    }

    /// Closes caches and temporary results. Temp tables are handed back to
    /// the caller via [`ResourceRegistry::take_temp_tables`].
    pub fn close(&mut self) {
        self.close_temp_results();
        if let Some(cache) = self.cursor_cache.as_mut() {
            for (_, cached) in cache.drain() {
                cached.statement.close();
            }
        }
        if let Some(cache) = self.query_cache.as_mut() {
            cache.cache.clear();
        }
        self.temp_indexes = None;
        self.temp_constraints = None;
    }
}
