//! # basalt-engine
//!
//! The storage collaborator of the basalt session core: in-memory
//! transactional maps with per-row locks, undo-log transactions whose
//! savepoints are log positions, and a redo log carrying the records the
//! distributed commit protocol needs (`commit-ready`, `commit-decision`).
//!
//! The session layer never touches rows directly; everything goes through
//! [`TransactionMap`] under an owning [`EngineTransaction`]:
//!
//! ```
//! use basalt_engine::{TransactionEngine, TransactionOptions, Value};
//!
//! let engine = TransactionEngine::new();
//! let map = engine.open_map("t");
//! let mut tx = engine.begin(TransactionOptions::default());
//! map.try_put(&mut tx, 1, vec![Value::Int(1), Value::Bigint(2)]).unwrap();
//! tx.commit();
//! ```

mod engine;
mod map;
mod value;

pub use crate::engine::{
    EngineTransaction, IsolationLevel, LogRecord, TransactionEngine, TransactionOptions,
};
pub use crate::map::{AppendAllocator, Row, RowLockConflict, TransactionMap};
pub use crate::value::{Lob, Value};
