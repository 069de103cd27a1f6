use std::sync::Arc;

use basalt_engine::Value;

use crate::database::Database;
use crate::error::DbError;
use crate::lock::DbObjectLock;
use crate::session::Session;

pub type StatementId = i32;

/// The materialized outcome of one statement.
#[derive(Debug, Clone, Default)]
pub struct StatementResult {
    pub update_count: i32,
    pub rows: Vec<Vec<Value>>,
}

impl StatementResult {
    pub fn update(update_count: i32) -> StatementResult {
        StatementResult {
            update_count,
            rows: Vec::new(),
        }
    }

    pub fn query(rows: Vec<Vec<Value>>) -> StatementResult {
        StatementResult {
            update_count: -1,
            rows,
        }
    }
}

/// What one `execute` step produced. For the `Wait*` variants the session
/// layer queues the session behind the contested lock and re-dispatches it
/// once the lock moves; `Yield` hands the handler back voluntarily after a
/// work quantum.
pub enum StatementOutcome {
    Finished(StatementResult),
    Yield,
    WaitObjectLock(Arc<DbObjectLock>),
    WaitRowLock {
        map: String,
        key: i64,
        holder_tx: u64,
    },
}

/// Creates parsers bound to a database. Injected at startup; the SQL
/// dialect itself lives behind this seam.
pub trait ParserFactory: Send + Sync {
    fn create_parser(&self, database: &Arc<Database>) -> Box<dyn Parser>;
}

pub trait Parser: Send {
    fn parse(&mut self, session: &Arc<Session>, sql: &str) -> Result<Box<dyn ParsedStatement>, DbError>;
}

pub trait ParsedStatement: Send {
    fn prepare(self: Box<Self>) -> Result<Arc<dyn PreparedStatement>, DbError>;
}

/// A prepared statement as the session core sees it. Implementations keep
/// their own interior state; the session only drives the lifecycle.
pub trait PreparedStatement: Send + Sync + std::fmt::Debug {
    fn id(&self) -> StatementId;

    fn sql(&self) -> &str;

    fn execute(&self, session: &Arc<Session>) -> Result<StatementOutcome, DbError>;

    fn set_local(&self, _local: bool) {}

    fn set_fetch_size(&self, _fetch_size: usize) {}

    fn is_ddl(&self) -> bool {
        false
    }

    fn is_database_statement(&self) -> bool {
        false
    }

    /// DDL guarded by `IF [NOT] EXISTS`; replication retries of these are
    /// idempotent.
    fn is_if_ddl(&self) -> bool {
        false
    }

    fn is_cacheable(&self) -> bool {
        true
    }

    fn can_reuse(&self) -> bool {
        true
    }

    /// Resets reusable state after a query-cache hit.
    fn reuse(&self) {}

    fn cancel(&self) {}

    fn close(&self) {}
}
