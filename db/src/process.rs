use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use basalt_engine::Value;

use crate::error::DbError;
use crate::session::Session;

/// Process-wide strategy for moving values in and out of their stored
/// byte form (session variables, cached cursors crossing the wire layer).
pub trait ValueSerializer: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, DbError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value, DbError>;
}

/// Builds internal connections for triggers and user-defined functions.
/// Injected at startup instead of being resolved from a class name.
pub trait ConnectionFactory: Send + Sync {
    fn connect(
        &self,
        session: &Arc<Session>,
        user: &str,
        url: &str,
    ) -> Result<InternalConnection, DbError>;
}

/// A connection handed to engine-internal callers. It borrows the session
/// of whoever triggered it; closing the connection never closes the session.
pub struct InternalConnection {
    session: Arc<Session>,
    user: String,
    url: String,
}

impl InternalConnection {
    pub fn new(session: Arc<Session>, user: &str, url: &str) -> InternalConnection {
        InternalConnection {
            session,
            user: user.to_string(),
            url: url.to_string(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

struct SameProcessConnectionFactory;

impl ConnectionFactory for SameProcessConnectionFactory {
    fn connect(
        &self,
        session: &Arc<Session>,
        user: &str,
        url: &str,
    ) -> Result<InternalConnection, DbError> {
        Ok(InternalConnection::new(session.clone(), user, url))
    }
}

struct TaggedSerializer;

const TAG_NULL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_BIGINT: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BYTES: u8 = 5;

impl ValueSerializer for TaggedSerializer {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, DbError> {
        let mut out = Vec::new();
        match value {
            Value::Null => out.push(TAG_NULL),
            Value::Boolean(v) => {
                out.push(TAG_BOOLEAN);
                out.push(u8::from(*v));
            }
            Value::Int(v) => {
                out.push(TAG_INT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::Bigint(v) => {
                out.push(TAG_BIGINT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::Text(v) => {
                out.push(TAG_TEXT);
                out.extend_from_slice(v.as_bytes());
            }
            Value::Bytes(v) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(v);
            }
            Value::Lob(lob) => {
                return Err(DbError::SerializationFailed(format!(
                    "large object {} cannot be inlined",
                    lob.identity()
                )))
            }
        }
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, DbError> {
        let (tag, payload) = bytes
            .split_first()
            .ok_or_else(|| DbError::DeserializationFailed("empty payload".to_string()))?;
        match *tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOLEAN => match payload {
                [0] => Ok(Value::Boolean(false)),
                [1] => Ok(Value::Boolean(true)),
                _ => Err(DbError::DeserializationFailed("boolean payload".to_string())),
            },
            TAG_INT => payload
                .try_into()
                .map(|b| Value::Int(i32::from_be_bytes(b)))
                .map_err(|_| DbError::DeserializationFailed("int payload".to_string())),
            TAG_BIGINT => payload
                .try_into()
                .map(|b| Value::Bigint(i64::from_be_bytes(b)))
                .map_err(|_| DbError::DeserializationFailed("bigint payload".to_string())),
            TAG_TEXT => String::from_utf8(payload.to_vec())
                .map(Value::Text)
                .map_err(|e| DbError::DeserializationFailed(e.to_string())),
            TAG_BYTES => Ok(Value::Bytes(payload.to_vec())),
            other => Err(DbError::DeserializationFailed(format!("value tag {other}"))),
        }
    }
}

/// Process-wide registry: the serializer strategy, the internal-connection
/// factory, and the user-factory allow policy. One per process, initialized
/// explicitly at startup; the accessor falls back to defaults so embedded
/// callers need no boilerplate.
pub struct ProcessRegistry {
    serializer: Box<dyn ValueSerializer>,
    connection_factory: Box<dyn ConnectionFactory>,
    allowed_patterns: Vec<String>,
    registered: RwLock<HashSet<String>>,
}

impl ProcessRegistry {
    pub fn builder() -> ProcessRegistryBuilder {
        ProcessRegistryBuilder::default()
    }

    pub fn serializer(&self) -> &dyn ValueSerializer {
        self.serializer.as_ref()
    }

    pub fn connect(
        &self,
        session: &Arc<Session>,
        user: &str,
        url: &str,
    ) -> Result<InternalConnection, DbError> {
        self.connection_factory.connect(session, user, url)
    }

    pub fn register_factory(&self, name: &str) {
        self.registered.write().insert(name.to_string());
    }

    /// Policy gate for factory names arriving from sessions. Patterns are
    /// exact names or `prefix.*`; an empty policy allows everything.
    pub fn check_factory(&self, name: &str) -> Result<(), DbError> {
        let allowed = self.allowed_patterns.is_empty()
            || self.allowed_patterns.iter().any(|p| {
                p == "*"
                    || p == name
                    || p
                        .strip_suffix(".*")
                        .is_some_and(|prefix| name.starts_with(prefix))
            });
        if !allowed {
            return Err(DbError::AccessDeniedToClass(name.to_string()));
        }
        if !self.registered.read().contains(name) {
            return Err(DbError::ClassNotFound(name.to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ProcessRegistryBuilder {
    serializer: Option<Box<dyn ValueSerializer>>,
    connection_factory: Option<Box<dyn ConnectionFactory>>,
    allowed_patterns: Vec<String>,
    registered: HashSet<String>,
}

impl ProcessRegistryBuilder {
    pub fn serializer(mut self, serializer: Box<dyn ValueSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn connection_factory(mut self, factory: Box<dyn ConnectionFactory>) -> Self {
        self.connection_factory = Some(factory);
        self
    }

    pub fn allow(mut self, pattern: &str) -> Self {
        self.allowed_patterns.push(pattern.to_string());
        self
    }

    pub fn register(mut self, name: &str) -> Self {
        self.registered.insert(name.to_string());
        self
    }

    pub fn build(self) -> ProcessRegistry {
        ProcessRegistry {
            serializer: self.serializer.unwrap_or_else(|| Box::new(TaggedSerializer)),
            connection_factory: self
                .connection_factory
                .unwrap_or_else(|| Box::new(SameProcessConnectionFactory)),
            allowed_patterns: self.allowed_patterns,
            registered: RwLock::new(self.registered),
        }
    }

    /// Installs the registry process-wide. Returns false when another init
    /// already won; the first registry stays in place.
    pub fn init(self) -> bool {
        REGISTRY.set(self.build()).is_ok()
    }
}

static REGISTRY: OnceLock<ProcessRegistry> = OnceLock::new();

pub fn process_registry() -> &'static ProcessRegistry {
    REGISTRY.get_or_init(|| ProcessRegistry::builder().build())
}
