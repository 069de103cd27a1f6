//! # basalt-db
//!
//! Session and transaction coordination core of the basalt distributed SQL
//! engine. For every client connection it owns a [`session::Session`]: the
//! transaction context, prepared statements, object locks, nested sessions
//! on peer nodes for distributed commits, and the negotiation that resolves
//! replication write conflicts.
//!
//! The SQL dialect, storage format and wire protocol live behind seams:
//! statements arrive through the [`statement::ParserFactory`] contract,
//! rows through [`basalt_engine::TransactionMap`], and peers through
//! [`session_pool::PeerTransport`].
//!
//! ## Quickstart
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use basalt_db::database::{Database, DatabaseConfig};
//! use basalt_db::session::User;
//!
//! async fn run(parser_factory: Arc<dyn basalt_db::statement::ParserFactory>) {
//!     let db = Database::open(DatabaseConfig::default(), parser_factory, None);
//!     let session = db.create_session(User::new("sa")).unwrap();
//!
//!     session
//!         .execute_update_async("CREATE TABLE t(f1 INT, f2 BIGINT)")
//!         .await
//!         .unwrap();
//!     session
//!         .execute_update_async("INSERT INTO t(f1,f2) VALUES(1,2)")
//!         .await
//!         .unwrap();
//!     let rows = session.execute_query_async("SELECT f1,f2 FROM t").await.unwrap();
//!     assert_eq!(rows.len(), 1);
//!
//!     session.close().await;
//!     db.close().await;
//! }
//! ```
//!
//! Remember to close sessions after use; closing releases nested sessions
//! back to the pool and drops session-scoped temporary objects.

pub mod connection;
pub mod database;
pub mod error;
pub mod lock;
pub mod process;
pub mod replication;
pub mod resource;
pub mod scheduler;
pub mod session;
pub mod session_pool;
pub mod statement;
pub mod transaction;

pub use crate::database::{Database, DatabaseConfig};
pub use crate::error::{DbError, ErrorKind};
pub use crate::session::{Session, SessionStatus, User};
