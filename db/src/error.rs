use basalt_engine::RowLockConflict;

/// Classifies a [`DbError`] independently of its message. Mirrors the error
/// codes the wire layer reports to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectionBroken,
    TableOrViewAlreadyExists,
    IndexAlreadyExists,
    ConstraintAlreadyExists,
    CommitRollbackNotAllowed,
    StatementWasCanceled,
    LockTimeout,
    AccessDeniedToClass,
    ClassNotFound,
    DeserializationFailed,
    SerializationFailed,
    InvalidValue,
    RowLockConflict,
    General,
}

#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("connection broken: {0}")]
    ConnectionBroken(String),

    #[error("table or view already exists: {0}")]
    TableOrViewAlreadyExists(String),

    #[error("index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("constraint already exists: {0}")]
    ConstraintAlreadyExists(String),

    #[error("commit or rollback is not allowed: {0}")]
    CommitRollbackNotAllowed(String),

    #[error("statement was canceled: {0}")]
    StatementWasCanceled(String),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("access denied to class: {0}")]
    AccessDeniedToClass(String),

    #[error("class not found: {0}")]
    ClassNotFound(String),

    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    RowLockConflict(#[from] RowLockConflict),

    #[error("{0}")]
    General(String),
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::ConnectionBroken(_) => ErrorKind::ConnectionBroken,
            DbError::TableOrViewAlreadyExists(_) => ErrorKind::TableOrViewAlreadyExists,
            DbError::IndexAlreadyExists(_) => ErrorKind::IndexAlreadyExists,
            DbError::ConstraintAlreadyExists(_) => ErrorKind::ConstraintAlreadyExists,
            DbError::CommitRollbackNotAllowed(_) => ErrorKind::CommitRollbackNotAllowed,
            DbError::StatementWasCanceled(_) => ErrorKind::StatementWasCanceled,
            DbError::LockTimeout(_) => ErrorKind::LockTimeout,
            DbError::AccessDeniedToClass(_) => ErrorKind::AccessDeniedToClass,
            DbError::ClassNotFound(_) => ErrorKind::ClassNotFound,
            DbError::DeserializationFailed(_) => ErrorKind::DeserializationFailed,
            DbError::SerializationFailed(_) => ErrorKind::SerializationFailed,
            DbError::InvalidValue(_) => ErrorKind::InvalidValue,
            DbError::RowLockConflict(_) => ErrorKind::RowLockConflict,
            DbError::General(_) => ErrorKind::General,
        }
    }
}
