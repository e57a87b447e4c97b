//! Storage layer: a document-shaped store contract with a sled document
//! backend and a normalized SQLite backend, plus the repositories, counters
//! and structural migrations built on top of it.

pub mod config;
pub mod document;
pub mod dsl;
pub mod error;
pub mod indexes;
pub mod migrations;
pub mod repository;
pub mod sequence;
pub mod sqlite;
pub mod stats;
pub mod store;

pub use config::{StoreConfig, open_store};
pub use document::DocumentStore;
pub use dsl::{Document, Filter, FindOptions, Sort, Update};
pub use error::{ErrorKind, Result, StoreError};
pub use sequence::SequenceService;
pub use sqlite::SqliteStore;
pub use stats::StoreStats;
pub use store::{Collection, CollectionExt, CollectionSource, Store, StoreKind, Tx, with_transaction};
