use rusqlite::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Machine-checkable classification shared by both adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    DuplicateKey,
    ForeignKey,
    InvalidQuery,
    Serialization,
    Connection,
    Backend,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::DuplicateKey(_) => ErrorKind::DuplicateKey,
            StoreError::ForeignKey(_) => ErrorKind::ForeignKey,
            StoreError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            StoreError::Serialization(_) => ErrorKind::Serialization,
            StoreError::Connection(_) => ErrorKind::Connection,
            StoreError::Sqlite(_) | StoreError::Sled(_) | StoreError::Backend(_) => ErrorKind::Backend,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.kind() == ErrorKind::DuplicateKey
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound(what.into())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, msg) = &err {
            if e.code == ErrorCode::ConstraintViolation {
                let detail = msg.clone().unwrap_or_else(|| e.to_string());
                match e.extended_code {
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        return StoreError::DuplicateKey(detail);
                    }
                    rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return StoreError::ForeignKey(detail),
                    _ => {}
                }
            }
            if matches!(e.code, ErrorCode::CannotOpen | ErrorCode::NotADatabase) {
                return StoreError::Connection(err.to_string());
            }
        }

        match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("no matching row".into()),
            other => StoreError::Sqlite(other),
        }
    }
}
