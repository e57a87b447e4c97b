use higgstv_db::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrateError>;

/// Failures that abort a migration run. Per-row problems are recorded in
/// the report instead.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("{side} store unreachable: {message}")]
    Connection { side: &'static str, message: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    pub fn connection(side: &'static str, message: impl Into<String>) -> Self {
        MigrateError::Connection {
            side,
            message: message.into(),
        }
    }
}
