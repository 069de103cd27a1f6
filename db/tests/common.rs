//! Shared test support: a miniature SQL front implementing the parser
//! contract, and a loopback peer transport that connects databases living
//! in the same process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use basalt_db::database::{Database, TableMeta};
use basalt_db::error::DbError;
use basalt_db::lock::{DbObjectId, DbObjectLock};
use basalt_db::replication::ReplicationConflict;
use basalt_db::session::{Session, User};
use basalt_db::session_pool::{PeerTransport, RemoteConnection};
use basalt_db::statement::{
    ParsedStatement, Parser, ParserFactory, PreparedStatement, StatementOutcome, StatementResult,
};
use basalt_engine::Value;

#[ctor::ctor]
fn init() {
    let filter = tracing_subscriber::filter::EnvFilter::from_default_env()
        .add_directive("basalt_db=trace".parse().unwrap());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

static STATEMENT_ID: AtomicI32 = AtomicI32::new(1);

/// Parser factory for the test dialect. Also owns the per-database object
/// locks so DDL and `LOCK TABLE` contend on the same handles.
pub struct TestSqlFactory {
    locks: Mutex<HashMap<String, Arc<DbObjectLock>>>,
}

impl TestSqlFactory {
    pub fn new() -> Arc<TestSqlFactory> {
        Arc::new(TestSqlFactory {
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn table_lock(&self, table: &str) -> Arc<DbObjectLock> {
        self.locks
            .lock()
            .entry(table.to_string())
            .or_insert_with(|| DbObjectLock::new(DbObjectId::table(table)))
            .clone()
    }
}

pub struct TestParser {
    factory: Arc<TestSqlFactory>,
}

impl Parser for TestParser {
    fn parse(
        &mut self,
        _session: &Arc<Session>,
        sql: &str,
    ) -> Result<Box<dyn ParsedStatement>, DbError> {
        let kind = parse_kind(sql)?;
        Ok(Box::new(TestStatement {
            id: STATEMENT_ID.fetch_add(1, Ordering::Relaxed),
            sql: sql.to_string(),
            kind,
            factory: self.factory.clone(),
            canceled: AtomicBool::new(false),
            fetch_size: AtomicUsize::new(0),
            reuse_count: AtomicUsize::new(0),
            sleep_deadline: Mutex::new(None),
        }))
    }
}

pub struct TestParserHook {
    factory: Arc<TestSqlFactory>,
}

impl ParserFactory for TestParserHook {
    fn create_parser(&self, _database: &Arc<Database>) -> Box<dyn Parser> {
        Box::new(TestParser {
            factory: self.factory.clone(),
        })
    }
}

/// Opens a database wired to the test dialect.
pub fn open_database(name: &str) -> (Arc<Database>, Arc<TestSqlFactory>) {
    let factory = TestSqlFactory::new();
    let config = basalt_db::DatabaseConfig {
        name: name.to_string(),
        ..Default::default()
    };
    let db = Database::open(
        config,
        Arc::new(TestParserHook {
            factory: factory.clone(),
        }),
        None,
    );
    (db, factory)
}

pub fn open_database_with_peers(
    name: &str,
    peers: HashMap<String, Arc<Database>>,
) -> (Arc<Database>, Arc<TestSqlFactory>) {
    open_database_with_transport(name, Arc::new(LoopbackTransport { nodes: peers }))
}

pub fn open_database_with_transport(
    name: &str,
    transport: Arc<dyn PeerTransport>,
) -> (Arc<Database>, Arc<TestSqlFactory>) {
    let factory = TestSqlFactory::new();
    let config = basalt_db::DatabaseConfig {
        name: name.to_string(),
        ..Default::default()
    };
    let db = Database::open(
        config,
        Arc::new(TestParserHook {
            factory: factory.clone(),
        }),
        Some(transport),
    );
    (db, factory)
}

#[derive(Debug, Clone)]
enum Kind {
    CreateTable { table: String, columns: Vec<String> },
    AlterTableAdd { table: String, column: String },
    DropTable { table: String },
    Insert { table: String, with_keys: bool, tuples: Vec<Vec<Value>> },
    Select { table: String, columns: Vec<String> },
    DeleteAll { table: String },
    LockTable { table: String },
    Sleep { millis: u64 },
}

pub struct TestStatement {
    id: i32,
    sql: String,
    kind: Kind,
    factory: Arc<TestSqlFactory>,
    canceled: AtomicBool,
    fetch_size: AtomicUsize,
    reuse_count: AtomicUsize,
    sleep_deadline: Mutex<Option<Instant>>,
}

impl ParsedStatement for TestStatement {
    fn prepare(self: Box<Self>) -> Result<Arc<dyn PreparedStatement>, DbError> {
        Ok(Arc::new(*self))
    }
}

impl std::fmt::Debug for TestStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStatement")
            .field("id", &self.id)
            .field("sql", &self.sql)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PreparedStatement for TestStatement {
    fn id(&self) -> i32 {
        self.id
    }

    fn sql(&self) -> &str {
        &self.sql
    }

    fn set_fetch_size(&self, fetch_size: usize) {
        self.fetch_size.store(fetch_size, Ordering::Relaxed);
    }

    fn is_ddl(&self) -> bool {
        matches!(
            self.kind,
            Kind::CreateTable { .. } | Kind::AlterTableAdd { .. } | Kind::DropTable { .. }
        )
    }

    fn is_cacheable(&self) -> bool {
        // Writes keep per-attempt key state; only reads are worth caching.
        matches!(self.kind, Kind::Select { .. })
    }

    fn reuse(&self) {
        self.reuse_count.fetch_add(1, Ordering::Relaxed);
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn execute(&self, session: &Arc<Session>) -> Result<StatementOutcome, DbError> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(DbError::StatementWasCanceled(self.sql.clone()));
        }
        let db = session.database().clone();
        match &self.kind {
            Kind::CreateTable { table, columns } => {
                let lock = self.factory.table_lock(table);
                if !lock.try_lock(session) {
                    return Ok(StatementOutcome::WaitObjectLock(lock));
                }
                let snapshot = db.snapshot_catalog();
                session.with_transaction(|tx| tx.snapshot_catalog_once(snapshot));
                let map_name = format!("tbl_{table}");
                db.add_table(TableMeta {
                    name: table.clone(),
                    columns: columns.clone(),
                    map_name: map_name.clone(),
                })?;
                db.engine().open_map(&map_name);
                db.bump_modification_meta_id();
                Ok(StatementOutcome::Finished(StatementResult::update(0)))
            }
            Kind::AlterTableAdd { table, column } => {
                let lock = self.factory.table_lock(table);
                if !lock.try_lock(session) {
                    return Ok(StatementOutcome::WaitObjectLock(lock));
                }
                let snapshot = db.snapshot_catalog();
                session.with_transaction(|tx| tx.snapshot_catalog_once(snapshot));
                let mut meta = db
                    .find_table(table)
                    .ok_or_else(|| DbError::General(format!("table not found: {table}")))?;
                meta.columns.push(column.clone());
                db.drop_table(table);
                db.add_table(meta)?;
                db.bump_modification_meta_id();
                Ok(StatementOutcome::Finished(StatementResult::update(0)))
            }
            Kind::DropTable { table } => {
                let lock = self.factory.table_lock(table);
                if !lock.try_lock(session) {
                    return Ok(StatementOutcome::WaitObjectLock(lock));
                }
                let snapshot = db.snapshot_catalog();
                session.with_transaction(|tx| tx.snapshot_catalog_once(snapshot));
                if let Some(meta) = db.find_table(table) {
                    db.drop_table(table);
                    db.engine().drop_map(&meta.map_name);
                }
                db.bump_modification_meta_id();
                Ok(StatementOutcome::Finished(StatementResult::update(0)))
            }
            Kind::Insert {
                table,
                with_keys,
                tuples,
            } => {
                let meta = db
                    .find_table(table)
                    .ok_or_else(|| DbError::General(format!("table not found: {table}")))?;
                let map = db.engine().open_map(&meta.map_name);
                let replication_name = session.replication_name();
                let assigned = replication_name
                    .as_deref()
                    .and_then(|name| map.append_allocator().assignment(name));

                let mut append_start = None;
                let outcome = session.with_transaction(|tx| -> Result<StatementOutcome, DbError> {
                    if *with_keys {
                        for tuple in tuples {
                            let key = key_of(tuple)?;
                            if let Err(conflict) = map.try_put(tx.engine_mut(), key, tuple.clone())
                            {
                                return Ok(StatementOutcome::WaitRowLock {
                                    map: conflict.map,
                                    key: conflict.key,
                                    holder_tx: conflict.holder,
                                });
                            }
                        }
                    } else {
                        let start = match assigned {
                            Some(start) => start,
                            None => map.append_allocator().reserve(tuples.len() as i64),
                        };
                        for (i, tuple) in tuples.iter().enumerate() {
                            let key = start + i as i64;
                            if let Err(conflict) = map.try_put(tx.engine_mut(), key, tuple.clone())
                            {
                                return Ok(StatementOutcome::WaitRowLock {
                                    map: conflict.map,
                                    key: conflict.key,
                                    holder_tx: conflict.holder,
                                });
                            }
                        }
                        append_start = Some(start);
                    }
                    Ok(StatementOutcome::Finished(StatementResult::update(
                        tuples.len() as i32,
                    )))
                })?;
                // Replicated appends report their key range for the
                // cross-replica negotiation.
                if let (Some(start), Some(_), None) = (append_start, replication_name, assigned) {
                    session.record_replication_conflict(ReplicationConflict::Append {
                        map: meta.map_name.clone(),
                        start_key: start,
                        count: tuples.len() as i64,
                        holder_session: None,
                    });
                }
                Ok(outcome)
            }
            Kind::Select { table, columns } => {
                let meta = db
                    .find_table(table)
                    .ok_or_else(|| DbError::General(format!("table not found: {table}")))?;
                let map = db.engine().open_map(&meta.map_name);
                let rows = session.with_transaction(|tx| map.scan(tx.engine()));
                let projection: Vec<usize> = if columns.len() == 1 && columns[0] == "*" {
                    (0..meta.columns.len()).collect()
                } else {
                    columns
                        .iter()
                        .map(|c| {
                            meta.columns
                                .iter()
                                .position(|mc| mc.eq_ignore_ascii_case(c))
                                .ok_or_else(|| {
                                    DbError::General(format!("column not found: {c}"))
                                })
                        })
                        .collect::<Result<_, _>>()?
                };
                let rows = rows
                    .into_iter()
                    .map(|(_, row)| {
                        projection
                            .iter()
                            .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                            .collect()
                    })
                    .collect();
                Ok(StatementOutcome::Finished(StatementResult::query(rows)))
            }
            Kind::DeleteAll { table } => {
                let meta = db
                    .find_table(table)
                    .ok_or_else(|| DbError::General(format!("table not found: {table}")))?;
                let map = db.engine().open_map(&meta.map_name);
                session.with_transaction(|tx| {
                    let keys: Vec<i64> =
                        map.scan(tx.engine()).into_iter().map(|(k, _)| k).collect();
                    let mut removed = 0;
                    for key in keys {
                        match map.try_remove(tx.engine_mut(), key) {
                            Ok(true) => removed += 1,
                            Ok(false) => {}
                            Err(conflict) => {
                                return Ok(StatementOutcome::WaitRowLock {
                                    map: conflict.map,
                                    key: conflict.key,
                                    holder_tx: conflict.holder,
                                })
                            }
                        }
                    }
                    Ok(StatementOutcome::Finished(StatementResult::update(removed)))
                })
            }
            Kind::LockTable { table } => {
                let lock = self.factory.table_lock(table);
                session.with_transaction(|_| {});
                if lock.try_lock(session) {
                    Ok(StatementOutcome::Finished(StatementResult::update(0)))
                } else {
                    Ok(StatementOutcome::WaitObjectLock(lock))
                }
            }
            Kind::Sleep { millis } => {
                let mut deadline = self.sleep_deadline.lock();
                let due = deadline.get_or_insert_with(|| {
                    Instant::now() + Duration::from_millis(*millis)
                });
                if Instant::now() < *due {
                    Ok(StatementOutcome::Yield)
                } else {
                    Ok(StatementOutcome::Finished(StatementResult::update(0)))
                }
            }
        }
    }
}

fn key_of(tuple: &[Value]) -> Result<i64, DbError> {
    match tuple.first() {
        Some(Value::Int(v)) => Ok(*v as i64),
        Some(Value::Bigint(v)) => Ok(*v),
        other => Err(DbError::General(format!("unusable key: {other:?}"))),
    }
}

// ------------------------------------------------------------- SQL parsing

fn parse_kind(sql: &str) -> Result<Kind, DbError> {
    let s = sql.trim().trim_end_matches(';').trim();
    let upper = s.to_ascii_uppercase();
    if let Some(rest) = upper.strip_prefix("CREATE TABLE") {
        let rest = &s[s.len() - rest.len()..];
        let open = rest
            .find('(')
            .ok_or_else(|| syntax(s))?;
        let table = rest[..open].trim().to_string();
        let inner = rest[open + 1..].trim_end_matches(')');
        let columns = inner
            .split(',')
            .map(|c| {
                c.trim()
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
            .filter(|c| !c.is_empty())
            .collect();
        Ok(Kind::CreateTable { table, columns })
    } else if upper.starts_with("ALTER TABLE") {
        let rest = s["ALTER TABLE".len()..].trim();
        let add = rest
            .to_ascii_uppercase()
            .find(" ADD ")
            .ok_or_else(|| syntax(s))?;
        let table = rest[..add].trim().to_string();
        let column = rest[add + 5..]
            .trim()
            .split_whitespace()
            .next()
            .ok_or_else(|| syntax(s))?
            .to_string();
        Ok(Kind::AlterTableAdd { table, column })
    } else if upper.starts_with("DROP TABLE") {
        Ok(Kind::DropTable {
            table: s["DROP TABLE".len()..].trim().to_string(),
        })
    } else if upper.starts_with("INSERT INTO") {
        let rest = s["INSERT INTO".len()..].trim();
        let values_at = rest
            .to_ascii_uppercase()
            .find("VALUES")
            .ok_or_else(|| syntax(s))?;
        let head = rest[..values_at].trim();
        let (table, with_keys) = match head.find('(') {
            Some(p) => (head[..p].trim().to_string(), true),
            None => (head.to_string(), false),
        };
        let tuples = parse_tuples(rest[values_at + "VALUES".len()..].trim())?;
        if tuples.is_empty() {
            return Err(syntax(s));
        }
        Ok(Kind::Insert {
            table,
            with_keys,
            tuples,
        })
    } else if upper.starts_with("SELECT") {
        let from = upper.find(" FROM ").ok_or_else(|| syntax(s))?;
        let columns = s["SELECT".len()..from]
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let table = s[from + " FROM ".len()..].trim().to_string();
        Ok(Kind::Select { table, columns })
    } else if upper.starts_with("DELETE FROM") {
        Ok(Kind::DeleteAll {
            table: s["DELETE FROM".len()..].trim().to_string(),
        })
    } else if upper.starts_with("LOCK TABLE") {
        Ok(Kind::LockTable {
            table: s["LOCK TABLE".len()..].trim().to_string(),
        })
    } else if upper.starts_with("SLEEP") {
        let millis = s["SLEEP".len()..]
            .trim()
            .parse::<u64>()
            .map_err(|_| syntax(s))?;
        Ok(Kind::Sleep { millis })
    } else {
        Err(syntax(s))
    }
}

fn syntax(sql: &str) -> DbError {
    DbError::General(format!("syntax error: {sql}"))
}

fn parse_tuples(s: &str) -> Result<Vec<Vec<Value>>, DbError> {
    let mut tuples = Vec::new();
    let mut rest = s.trim();
    while let Some(open) = rest.find('(') {
        let close = rest[open..]
            .find(')')
            .ok_or_else(|| syntax(s))?
            + open;
        tuples.push(parse_tuple(&rest[open + 1..close])?);
        rest = &rest[close + 1..];
    }
    Ok(tuples)
}

fn parse_tuple(s: &str) -> Result<Vec<Value>, DbError> {
    s.split(',')
        .map(|v| {
            let v = v.trim();
            if v.eq_ignore_ascii_case("NULL") {
                Ok(Value::Null)
            } else if let Some(text) = v.strip_prefix('\'') {
                Ok(Value::Text(text.trim_end_matches('\'').to_string()))
            } else if let Ok(n) = v.parse::<i64>() {
                if let Ok(small) = i32::try_from(n) {
                    Ok(Value::Int(small))
                } else {
                    Ok(Value::Bigint(n))
                }
            } else {
                Err(syntax(v))
            }
        })
        .collect()
}

// ------------------------------------------------------- loopback transport

/// Connects "peers" that are just other databases in this process. The
/// remote side of each connection is a real session on the peer database,
/// flagged as a non-root participant.
pub struct LoopbackTransport {
    pub nodes: HashMap<String, Arc<Database>>,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn RemoteConnection>, DbError> {
        let db = self
            .nodes
            .get(url)
            .ok_or_else(|| DbError::General(format!("unknown peer: {url}")))?;
        let session = db.create_session(User::new("sa"))?;
        session.set_root(false);
        session.set_auto_commit(false);
        Ok(Box::new(LoopbackConnection { session }))
    }
}

pub struct LoopbackConnection {
    session: Arc<Session>,
}

#[async_trait]
impl RemoteConnection for LoopbackConnection {
    async fn execute_update(&self, sql: &str) -> Result<i32, DbError> {
        self.session.execute_update_async(sql).await
    }

    async fn prepare_commit(&self, global_name: &str) -> Result<(), DbError> {
        // The ack is the wire reply; the in-process loopback has no wire.
        self.session.prepare_commit(global_name).await.map(|_| ())
    }

    async fn commit(&self, global_name: &str) -> Result<(), DbError> {
        self.session.commit_participant(global_name).await.map(|_| ())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.session.rollback().await
    }

    async fn close(&self) {
        self.session.close().await;
    }
}

/// A transport whose sessions refuse to prepare; used to drive the
/// all-or-nothing path of the distributed commit.
pub struct FailingPrepareTransport;

#[async_trait]
impl PeerTransport for FailingPrepareTransport {
    async fn open(&self, _url: &str) -> Result<Box<dyn RemoteConnection>, DbError> {
        Ok(Box::new(FailingPrepareConnection))
    }
}

struct FailingPrepareConnection;

#[async_trait]
impl RemoteConnection for FailingPrepareConnection {
    async fn execute_update(&self, _sql: &str) -> Result<i32, DbError> {
        Ok(1)
    }

    async fn prepare_commit(&self, _global_name: &str) -> Result<(), DbError> {
        Err(DbError::General("peer cannot prepare".to_string()))
    }

    async fn commit(&self, _global_name: &str) -> Result<(), DbError> {
        Err(DbError::General("peer cannot commit".to_string()))
    }

    async fn rollback(&self) -> Result<(), DbError> {
        Ok(())
    }

    async fn close(&self) {}
}
