//! The storage contract every backend implements.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::dsl::{
    Document, Filter, FindOneAndUpdateOptions, FindOptions, IndexInfo, IndexKeys, IndexOptions, Update,
    UpdateResult,
};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Document,
    Relational,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Document => "document",
            StoreKind::Relational => "relational",
        }
    }
}

/// Anything that hands out collections: a store, or a transaction on it.
pub trait CollectionSource {
    fn collection(&self, name: &str) -> Result<Box<dyn Collection + '_>>;
}

pub trait Store: CollectionSource + Send + Sync {
    fn kind(&self) -> StoreKind;
    fn begin_tx(&self) -> Result<Box<dyn Tx + '_>>;
    fn ping(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// Collections obtained from a transaction operate inside it. Dropping an
/// unfinished transaction rolls it back.
pub trait Tx: CollectionSource {
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>) -> Result<()>;
}

pub trait Collection {
    fn name(&self) -> &str;

    /// Fails with [`StoreError::NotFound`] when nothing matches.
    fn find_one(&self, filter: &Filter) -> Result<Document>;
    fn find(&self, filter: &Filter, opts: &FindOptions) -> Result<Vec<Document>>;
    fn insert_one(&self, doc: Document) -> Result<()>;
    fn update_one(&self, filter: &Filter, update: &Update) -> Result<UpdateResult>;
    fn delete_one(&self, filter: &Filter) -> Result<u64>;
    fn delete_many(&self, filter: &Filter) -> Result<u64>;
    fn count_documents(&self, filter: &Filter) -> Result<i64>;
    fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        opts: FindOneAndUpdateOptions,
    ) -> Result<Document>;
    fn create_index(&self, keys: &IndexKeys, opts: &IndexOptions) -> Result<()>;
    fn list_indexes(&self) -> Result<Vec<IndexInfo>>;
}

/// Typed convenience layer over [`Collection`].
pub trait CollectionExt: Collection {
    fn find_one_as<T: DeserializeOwned>(&self, filter: &Filter) -> Result<T> {
        from_document(self.find_one(filter)?)
    }

    fn find_as<T: DeserializeOwned>(&self, filter: &Filter, opts: &FindOptions) -> Result<Vec<T>> {
        self.find(filter, opts)?.into_iter().map(from_document).collect()
    }

    fn insert_as<T: Serialize>(&self, value: &T) -> Result<()> {
        self.insert_one(to_document(value)?)
    }

    /// `Ok(None)` instead of a not-found error.
    fn find_optional(&self, filter: &Filter) -> Result<Option<Document>> {
        match self.find_one(filter) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<C: Collection + ?Sized> CollectionExt for C {}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidQuery(format!("expected an object, got {}", other))),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

/// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
pub fn with_transaction<S, T, F>(store: &S, f: F) -> Result<T>
where
    S: Store + ?Sized,
    F: FnOnce(&dyn Tx) -> Result<T>,
{
    let tx = store.begin_tx()?;
    match f(tx.as_ref()) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                warn!("Rollback failed after {}: {}", err, rollback_err);
            }
            Err(err)
        }
    }
}
