use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A large object handle. The session layer links a LOB when a value
/// referencing it becomes reachable and schedules the unlink for the commit
/// phase; both transitions are one-shot.
#[derive(Debug)]
pub struct Lob {
    id: u64,
    linked: AtomicBool,
    closed: AtomicBool,
}

impl Lob {
    pub fn new(id: u64) -> Arc<Lob> {
        Arc::new(Lob {
            id,
            linked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stable identity string used as the key of unlink sets.
    pub fn identity(&self) -> String {
        format!("lob-{}", self.id)
    }

    /// Returns false if the LOB was already linked.
    pub fn link(&self) -> bool {
        !self.linked.swap(true, Ordering::SeqCst)
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }

    /// Returns true iff this call performed the unlink.
    pub fn unlink(&self) -> bool {
        self.linked.swap(false, Ordering::SeqCst)
    }

    /// Returns true iff this call performed the close.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PartialEq for Lob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Lob {}

/// A column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Bigint(i64),
    Text(String),
    Bytes(Vec<u8>),
    Lob(Arc<Lob>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Int(_) => "INT",
            Value::Bigint(_) => "BIGINT",
            Value::Text(_) => "VARCHAR",
            Value::Bytes(_) => "VARBINARY",
            Value::Lob(_) => "BLOB",
        }
    }

    /// The LOB behind this value, if it is one.
    pub fn as_lob(&self) -> Option<&Arc<Lob>> {
        match self {
            Value::Lob(lob) => Some(lob),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Bigint(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Bytes(v) => write!(f, "X'{}'", hex(v)),
            Value::Lob(lob) => write!(f, "{}", lob.identity()),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Bigint(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
