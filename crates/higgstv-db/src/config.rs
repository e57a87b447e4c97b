use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::document::DocumentStore;
use crate::error::Result;
use crate::sqlite::{SqliteOptions, SqliteStore};
use crate::store::{Store, StoreKind};

pub const DEFAULT_DATABASE: &str = "higgstv";
pub const DEFAULT_SQLITE_PATH: &str = "./data/higgstv.db";
pub const DEFAULT_DOCUMENT_PATH: &str = "./data/higgstv_docs";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported database type: {0}")]
    UnsupportedType(String),

    #[error("database uri must not be empty")]
    EmptyUri,

    #[error("database name must not be empty")]
    EmptyDatabase,

    #[error("invalid value for {name}: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Filesystem path of the store. A `file:` prefix is accepted.
    pub uri: String,
    pub database: String,
    pub connect_timeout: Duration,
    pub pool_size: usize,
}

impl StoreConfig {
    pub fn new(kind: StoreKind, uri: impl Into<String>) -> Self {
        Self {
            kind,
            uri: uri.into(),
            database: DEFAULT_DATABASE.to_string(),
            connect_timeout: Duration::from_secs(10),
            pool_size: 4,
        }
    }

    /// Read `HIGGSTV_DATABASE_*` from the environment.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> std::result::Result<Self, ConfigError> {
        let kind = parse_store_kind(&get("HIGGSTV_DATABASE_TYPE").unwrap_or_else(|| "sqlite".into()))?;
        let uri = get("HIGGSTV_DATABASE_URI").unwrap_or_else(|| match kind {
            StoreKind::Relational => DEFAULT_SQLITE_PATH.into(),
            StoreKind::Document => DEFAULT_DOCUMENT_PATH.into(),
        });
        let database = get("HIGGSTV_DATABASE_DATABASE").unwrap_or_else(|| DEFAULT_DATABASE.into());
        let timeout_secs: u64 = parse_number(&get, "HIGGSTV_DATABASE_CONNECT_TIMEOUT", 10)?;
        let pool_size: usize = parse_number(&get, "HIGGSTV_DATABASE_POOL_SIZE", 4)?;

        let config = Self {
            kind,
            uri,
            database,
            connect_timeout: Duration::from_secs(timeout_secs),
            pool_size: pool_size.max(1),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.uri.trim().is_empty() {
            return Err(ConfigError::EmptyUri);
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::EmptyDatabase);
        }
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        let uri = self.uri.trim();
        PathBuf::from(uri.strip_prefix("file:").unwrap_or(uri))
    }
}

fn parse_number<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> std::result::Result<T, ConfigError> {
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
        None => Ok(default),
    }
}

pub fn parse_store_kind(raw: &str) -> std::result::Result<StoreKind, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "sled" | "document" | "mongodb" | "mongo" => Ok(StoreKind::Document),
        "sqlite" | "sqlite3" => Ok(StoreKind::Relational),
        other => Err(ConfigError::UnsupportedType(other.to_string())),
    }
}

/// Open the configured backend. Parent directories are created.
pub fn open_store(config: &StoreConfig) -> Result<Box<dyn Store>> {
    let path = config.path();
    ensure_parent(&path)?;
    let store: Box<dyn Store> = match config.kind {
        StoreKind::Relational => {
            let opts = SqliteOptions {
                pool_size: config.pool_size,
                busy_timeout: config.connect_timeout,
            };
            Box::new(SqliteStore::open_with(&path, &opts)?)
        }
        StoreKind::Document => Box::new(DocumentStore::open(&path)?),
    };
    info!("Opened {} store {} at {}", config.kind.as_str(), config.database, path.display());
    Ok(store)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| crate::error::StoreError::Connection(format!("{}: {}", parent.display(), e)))?;
    }
    Ok(())
}
