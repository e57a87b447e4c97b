//! Embedded document store on sled.
//!
//! One sled tree per collection; each document is stored as JSON bytes
//! under the JSON encoding of its `_id`. Filters and updates are evaluated
//! natively on the decoded documents.
//!
//! Single-document writes are atomic (compare-and-swap on the stored bytes,
//! retried on contention). There is no cross-document transaction: `begin_tx`
//! hands out a transaction whose commit and rollback do nothing, so callers
//! must express multi-document work as independent idempotent steps.
//! Each unique secondary index keeps its own tree of index value to document
//! key, written in the same sled transaction as the document itself.

pub mod import;
pub mod matcher;
pub mod update;

use std::path::Path;

use serde_json::Value;
use sled::IVec;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
};
use tracing::{debug, info};

use higgstv_types::ident;

use crate::dsl::{
    Clause, Document, Filter, FindOneAndUpdateOptions, FindOptions, IndexInfo, IndexKeys, IndexOptions, Update,
    UpdateResult,
};
use crate::error::{Result, StoreError};
use crate::store::{Collection, CollectionSource, Store, StoreKind, Tx};

const INDEX_TREE: &str = "__indexes";
const ENTRY_TREE_PREFIX: &str = "__idx:";
const DEFAULT_TREE: &[u8] = b"__sled__default";

pub struct DocumentStore {
    db: sled::Db,
}

impl DocumentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| StoreError::Connection(format!("{}: {}", path.display(), e)))?;
        info!("Document store opened at {}", path.display());
        Ok(Self { db })
    }

    /// A store that lives only as long as this handle.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter(|name| {
                name.as_ref() != DEFAULT_TREE
                    && name.as_ref() != INDEX_TREE.as_bytes()
                    && !name.starts_with(ENTRY_TREE_PREFIX.as_bytes())
            })
            .map(|name| String::from_utf8_lossy(&name).into_owned())
            .collect()
    }

    fn index_tree(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree(INDEX_TREE)?)
    }

    /// Entries of one unique index: encoded index values to document key.
    fn entry_tree(&self, collection: &str, index: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(format!("{}{}:{}", ENTRY_TREE_PREFIX, collection, index))?)
    }
}

impl CollectionSource for DocumentStore {
    fn collection(&self, name: &str) -> Result<Box<dyn Collection + '_>> {
        Ok(Box::new(DocCollection {
            store: self,
            name: name.to_string(),
            tree: self.db.open_tree(name)?,
        }))
    }
}

impl Store for DocumentStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Document
    }

    fn begin_tx(&self) -> Result<Box<dyn Tx + '_>> {
        Ok(Box::new(DocumentTx { store: self }))
    }

    fn ping(&self) -> Result<()> {
        self.db
            .size_on_disk()
            .map(|_| ())
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn close(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub struct DocumentTx<'a> {
    store: &'a DocumentStore,
}

impl CollectionSource for DocumentTx<'_> {
    fn collection(&self, name: &str) -> Result<Box<dyn Collection + '_>> {
        self.store.collection(name)
    }
}

impl Tx for DocumentTx<'_> {
    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        debug!("Document store rollback requested; writes already applied stay in place");
        Ok(())
    }
}

struct Stored {
    key: IVec,
    raw: IVec,
    doc: Document,
}

pub struct DocCollection<'a> {
    store: &'a DocumentStore,
    name: String,
    tree: sled::Tree,
}

impl DocCollection<'_> {
    fn scan(&self, clauses: &[Clause]) -> Result<Vec<Stored>> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (key, raw) = entry?;
            let doc = decode(&raw)?;
            if matcher::matches(&doc, clauses) {
                out.push(Stored { key, raw, doc });
            }
        }
        Ok(out)
    }

    fn first_match(&self, filter: &Filter, clauses: &[Clause]) -> Result<Option<Stored>> {
        // Direct lookup when the filter pins a literal _id
        if let Some(id) = filter.get("_id").filter(|v| v.is_string() || v.is_number()) {
            let key = id_key(id)?;
            return match self.tree.get(&key)? {
                Some(raw) => {
                    let doc = decode(&raw)?;
                    Ok(matcher::matches(&doc, clauses).then(|| Stored { key: key.into(), raw, doc }))
                }
                None => Ok(None),
            };
        }

        for entry in self.tree.iter() {
            let (key, raw) = entry?;
            let doc = decode(&raw)?;
            if matcher::matches(&doc, clauses) {
                return Ok(Some(Stored { key, raw, doc }));
            }
        }
        Ok(None)
    }

    fn indexes(&self) -> Result<Vec<IndexInfo>> {
        let prefix = format!("{}\u{0}", self.name);
        let mut out = Vec::new();
        for entry in self.store.index_tree()?.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = entry?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    fn unique_indexes(&self) -> Result<Vec<(IndexInfo, sled::Tree)>> {
        self.indexes()?
            .into_iter()
            .filter(|i| i.unique)
            .map(|i| {
                let tree = self.store.entry_tree(&self.name, &i.name)?;
                Ok((i, tree))
            })
            .collect()
    }

    /// Replace the document stored at `key`, expected to hold `before`, with
    /// `after` (`None` removes it). Unique index entries move with it.
    /// Returns false when `before` is stale.
    fn replace(&self, key: &[u8], before: Option<(&IVec, &Document)>, after: Option<&Document>) -> Result<bool> {
        let encoded = after.map(encode).transpose()?;
        let unique = self.unique_indexes()?;
        if unique.is_empty() {
            let swapped = self
                .tree
                .compare_and_swap(key, before.map(|(raw, _)| raw), encoded)?;
            return Ok(swapped.is_ok());
        }

        let mut moves = Vec::with_capacity(unique.len());
        for (index, _) in &unique {
            let old = match before {
                Some((_, doc)) => entry_key(doc, index)?,
                None => None,
            };
            let new = match after {
                Some(doc) => entry_key(doc, index)?,
                None => None,
            };
            moves.push((index.name.as_str(), old, new));
        }
        let expected = before.map(|(raw, _)| raw.clone());

        let mut trees = vec![self.tree.clone()];
        trees.extend(unique.iter().map(|(_, tree)| tree.clone()));
        let outcome = trees.as_slice().transaction(|views| -> ConflictableTransactionResult<(), WriteConflict> {
            let docs = &views[0];
            if docs.get(key)? != expected {
                return Err(ConflictableTransactionError::Abort(WriteConflict::Stale));
            }
            for (view, (name, old, new)) in views[1..].iter().zip(&moves) {
                if old == new {
                    continue;
                }
                if let Some(new) = new {
                    if view.get(new.as_slice())?.is_some_and(|owner| &*owner != key) {
                        return Err(ConflictableTransactionError::Abort(WriteConflict::Duplicate(name.to_string())));
                    }
                }
                if let Some(old) = old {
                    view.remove(old.as_slice())?;
                }
                if let Some(new) = new {
                    view.insert(new.as_slice(), key)?;
                }
            }
            match &encoded {
                Some(bytes) => docs.insert(key, bytes.as_slice())?,
                None => docs.remove(key)?,
            };
            Ok(())
        });

        match outcome {
            Ok(()) => Ok(true),
            Err(TransactionError::Abort(WriteConflict::Stale)) => Ok(false),
            Err(TransactionError::Abort(WriteConflict::Duplicate(index))) => Err(StoreError::DuplicateKey(format!(
                "{} index {} already holds {:?}",
                self.name,
                index,
                after.map(|doc| unique_values(doc, &unique, &index))
            ))),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Remove the document at `key` and its index entries.
    fn remove(&self, key: &IVec) -> Result<bool> {
        loop {
            let Some(raw) = self.tree.get(key)? else {
                return Ok(false);
            };
            let doc = decode(&raw)?;
            if self.replace(key, Some((&raw, &doc)), None)? {
                return Ok(true);
            }
            debug!("Concurrent write on {}, retrying delete", self.name);
        }
    }

    fn not_found(&self, filter: &Filter) -> StoreError {
        StoreError::not_found(format!("{} matching {}", self.name, Value::Object(filter.as_document().clone())))
    }
}

impl Collection for DocCollection<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_one(&self, filter: &Filter) -> Result<Document> {
        let clauses = filter.clauses()?;
        self.first_match(filter, &clauses)?
            .map(|s| s.doc)
            .ok_or_else(|| self.not_found(filter))
    }

    fn find(&self, filter: &Filter, opts: &FindOptions) -> Result<Vec<Document>> {
        let clauses = filter.clauses()?;
        let mut docs: Vec<Document> = self.scan(&clauses)?.into_iter().map(|s| s.doc).collect();
        matcher::sort_documents(&mut docs, &opts.sort);

        let skip = opts.skip.unwrap_or(0);
        let limit = opts.limit.unwrap_or(usize::MAX);
        Ok(docs.into_iter().skip(skip).take(limit).collect())
    }

    fn insert_one(&self, mut doc: Document) -> Result<()> {
        let id = doc
            .entry("_id".to_string())
            .or_insert_with(|| Value::String(ident::new_id()))
            .clone();
        let key = id_key(&id)?;
        if self.replace(&key, None, Some(&doc))? {
            Ok(())
        } else {
            Err(StoreError::DuplicateKey(format!("{} _id {}", self.name, id)))
        }
    }

    fn update_one(&self, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        let clauses = filter.clauses()?;
        loop {
            let Some(stored) = self.first_match(filter, &clauses)? else {
                return Ok(UpdateResult::default());
            };
            let mut after = stored.doc.clone();
            let changed = update::apply(&mut after, update, &clauses)?;
            if !changed {
                return Ok(UpdateResult { matched: 1, modified: 0 });
            }
            if self.replace(&stored.key, Some((&stored.raw, &stored.doc)), Some(&after))? {
                return Ok(UpdateResult { matched: 1, modified: 1 });
            }
            debug!("Concurrent write on {}, retrying update", self.name);
        }
    }

    fn delete_one(&self, filter: &Filter) -> Result<u64> {
        let clauses = filter.clauses()?;
        match self.first_match(filter, &clauses)? {
            Some(stored) => Ok(u64::from(self.remove(&stored.key)?)),
            None => Ok(0),
        }
    }

    fn delete_many(&self, filter: &Filter) -> Result<u64> {
        let clauses = filter.clauses()?;
        let mut deleted = 0;
        for stored in self.scan(&clauses)? {
            if self.remove(&stored.key)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn count_documents(&self, filter: &Filter) -> Result<i64> {
        if filter.is_empty() {
            return Ok(self.tree.len() as i64);
        }
        Ok(self.scan(&filter.clauses()?)?.len() as i64)
    }

    fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        opts: FindOneAndUpdateOptions,
    ) -> Result<Document> {
        let clauses = filter.clauses()?;
        loop {
            match self.first_match(filter, &clauses)? {
                Some(stored) => {
                    let mut after = stored.doc.clone();
                    update::apply(&mut after, update, &clauses)?;
                    if self.replace(&stored.key, Some((&stored.raw, &stored.doc)), Some(&after))? {
                        return Ok(if opts.return_after { after } else { stored.doc });
                    }
                }
                None if opts.upsert => {
                    let mut doc = update::upsert_seed(filter)?;
                    update::apply(&mut doc, update, &clauses)?;
                    let id = doc
                        .entry("_id".to_string())
                        .or_insert_with(|| Value::String(ident::new_id()))
                        .clone();
                    let key = id_key(&id)?;
                    if self.replace(&key, None, Some(&doc))? {
                        // No pre-image exists for an inserted document
                        return if opts.return_after { Ok(doc) } else { Err(self.not_found(filter)) };
                    }
                }
                None => return Err(self.not_found(filter)),
            }
            debug!("Concurrent write on {}, retrying find-and-modify", self.name);
        }
    }

    fn create_index(&self, keys: &IndexKeys, opts: &IndexOptions) -> Result<()> {
        let info = IndexInfo {
            name: opts.name.clone().unwrap_or_else(|| keys.default_name()),
            keys: keys.0.iter().map(|(f, o)| (f.clone(), o.as_i32())).collect(),
            unique: opts.unique,
            sparse: opts.sparse,
        };

        if info.unique {
            let entries = self.store.entry_tree(&self.name, &info.name)?;
            entries.clear()?;
            for stored in self.scan(&[])? {
                let Some(entry) = entry_key(&stored.doc, &info)? else {
                    continue;
                };
                if entries.insert(entry, stored.key)?.is_some() {
                    entries.clear()?;
                    return Err(StoreError::DuplicateKey(format!(
                        "cannot build unique index {} on {}: duplicate {:?}",
                        info.name,
                        self.name,
                        index_values(&stored.doc, &info)
                    )));
                }
            }
        }

        let key = format!("{}\u{0}{}", self.name, info.name);
        self.store
            .index_tree()?
            .insert(key.as_bytes(), serde_json::to_vec(&info)?)?;
        debug!("Index {} ready on {}", info.name, self.name);
        Ok(())
    }

    fn list_indexes(&self) -> Result<Vec<IndexInfo>> {
        let mut out = vec![IndexInfo {
            name: "_id_".to_string(),
            keys: vec![("_id".to_string(), 1)],
            unique: true,
            sparse: false,
        }];
        out.extend(self.indexes()?);
        Ok(out)
    }
}

fn index_values(doc: &Document, index: &IndexInfo) -> Vec<Option<Value>> {
    index
        .keys
        .iter()
        .map(|(field, _)| matcher::resolve(doc, field).first().map(|v| (*v).clone()))
        .collect()
}

/// Key of `doc` in the entry tree of a unique index; `None` when a sparse
/// index skips it.
fn entry_key(doc: &Document, index: &IndexInfo) -> Result<Option<Vec<u8>>> {
    let values = index_values(doc, index);
    if index.sparse && values.iter().all(Option::is_none) {
        return Ok(None);
    }
    Ok(Some(serde_json::to_vec(&values)?))
}

fn unique_values(doc: &Document, unique: &[(IndexInfo, sled::Tree)], name: &str) -> Vec<Option<Value>> {
    unique
        .iter()
        .find(|(index, _)| index.name == name)
        .map(|(index, _)| index_values(doc, index))
        .unwrap_or_default()
}

enum WriteConflict {
    Stale,
    Duplicate(String),
}

fn id_key(id: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(id)?)
}

fn encode(doc: &Document) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(doc)?)
}

fn decode(raw: &[u8]) -> Result<Document> {
    Ok(serde_json::from_slice(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CollectionExt;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_and_find_one() {
        let store = DocumentStore::temporary().unwrap();
        let users = store.collection("users").unwrap();
        users.insert_one(doc(json!({"_id": "U1", "username": "alice"}))).unwrap();

        let found = users.find_one(&Filter::new().eq("username", "alice")).unwrap();
        assert_eq!(found["_id"], "U1");

        let err = users.find_one(&Filter::by_id("U2")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_duplicate_id_and_unique_index() {
        let store = DocumentStore::temporary().unwrap();
        let users = store.collection("users").unwrap();
        users
            .create_index(&IndexKeys::asc("username"), &IndexOptions { unique: true, ..Default::default() })
            .unwrap();
        users.insert_one(doc(json!({"_id": "U1", "username": "alice"}))).unwrap();

        let dup_id = users.insert_one(doc(json!({"_id": "U1", "username": "bob"}))).unwrap_err();
        assert!(dup_id.is_duplicate_key());
        let dup_name = users.insert_one(doc(json!({"_id": "U2", "username": "alice"}))).unwrap_err();
        assert!(dup_name.is_duplicate_key());

        let names: Vec<String> = users.list_indexes().unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["_id_", "username_1"]);
    }

    #[test]
    fn test_sparse_unique_index_skips_missing() {
        let store = DocumentStore::temporary().unwrap();
        let users = store.collection("users").unwrap();
        users
            .create_index(
                &IndexKeys::asc("access_key"),
                &IndexOptions { unique: true, sparse: true, ..Default::default() },
            )
            .unwrap();
        users.insert_one(doc(json!({"_id": "U1"}))).unwrap();
        users.insert_one(doc(json!({"_id": "U2"}))).unwrap();
        assert_eq!(users.count_documents(&Filter::new()).unwrap(), 2);
    }

    #[test]
    fn test_unique_index_entries_follow_writes() {
        let store = DocumentStore::temporary().unwrap();
        let users = store.collection("users").unwrap();
        for i in 0..200 {
            users.insert_one(doc(json!({"_id": format!("U{}", i), "username": format!("user{}", i)}))).unwrap();
        }
        users
            .create_index(&IndexKeys::asc("username"), &IndexOptions { unique: true, ..Default::default() })
            .unwrap();
        let entries = store.entry_tree("users", "username_1").unwrap();
        assert_eq!(entries.len(), 200);

        let err = users.insert_one(doc(json!({"_id": "U900", "username": "user199"}))).unwrap_err();
        assert!(err.is_duplicate_key());

        // renaming frees the old value and claims the new one
        users
            .update_one(&Filter::by_id("U0"), &Update::new().set("username", "renamed"))
            .unwrap();
        users.insert_one(doc(json!({"_id": "U900", "username": "user0"}))).unwrap();
        let err = users
            .update_one(&Filter::by_id("U1"), &Update::new().set("username", "renamed"))
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(users.find_one(&Filter::by_id("U1")).unwrap()["username"], "user1");

        assert_eq!(users.delete_one(&Filter::by_id("U2")).unwrap(), 1);
        users.insert_one(doc(json!({"_id": "U901", "username": "user2"}))).unwrap();
        assert_eq!(entries.len(), 202);
    }

    #[test]
    fn test_unique_index_rejects_existing_duplicates() {
        let store = DocumentStore::temporary().unwrap();
        let users = store.collection("users").unwrap();
        users.insert_one(doc(json!({"_id": "U1", "email": "a@example.com"}))).unwrap();
        users.insert_one(doc(json!({"_id": "U2", "email": "a@example.com"}))).unwrap();

        let err = users
            .create_index(&IndexKeys::asc("email"), &IndexOptions { unique: true, ..Default::default() })
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(users.list_indexes().unwrap().len(), 1);
        assert!(store.entry_tree("users", "email_1").unwrap().is_empty());
        assert_eq!(store.collection_names(), vec!["users".to_string()]);
    }

    #[test]
    fn test_find_sort_skip_limit() {
        let store = DocumentStore::temporary().unwrap();
        let channels = store.collection("channels").unwrap();
        for (id, name) in [("A", "c"), ("B", "a"), ("C", "b")] {
            channels.insert_one(doc(json!({"_id": id, "name": name}))).unwrap();
        }
        let opts = FindOptions {
            sort: crate::dsl::Sort::default().asc("name"),
            limit: Some(2),
            skip: Some(1),
        };
        let names: Vec<String> = channels
            .find(&Filter::new(), &opts)
            .unwrap()
            .into_iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_find_one_and_update_upserts() {
        let store = DocumentStore::temporary().unwrap();
        let counters = store.collection("counters").unwrap();
        let filter = Filter::by_id("program_id");
        let update = Update::new().inc("seq", 1);

        let first = counters
            .find_one_and_update(&filter, &update, FindOneAndUpdateOptions::default())
            .unwrap();
        assert_eq!(first["seq"], 1);
        let before = counters
            .find_one_and_update(&filter, &update, FindOneAndUpdateOptions { return_after: false, upsert: true })
            .unwrap();
        assert_eq!(before["seq"], 1);
        assert_eq!(counters.find_one(&filter).unwrap()["seq"], 2);

        let missing = counters.find_one_and_update(
            &Filter::by_id("other"),
            &update,
            FindOneAndUpdateOptions { return_after: true, upsert: false },
        );
        assert!(missing.unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_and_delete() {
        let store = DocumentStore::temporary().unwrap();
        let channels = store.collection("channels").unwrap();
        channels
            .insert_one(doc(json!({"_id": "C1", "owners": ["U1"], "contents": []})))
            .unwrap();

        let res = channels
            .update_one(&Filter::by_id("C1"), &Update::new().add_to_set("owners", "U2"))
            .unwrap();
        assert_eq!(res, UpdateResult { matched: 1, modified: 1 });
        let res = channels
            .update_one(&Filter::by_id("C1"), &Update::new().add_to_set("owners", "U2"))
            .unwrap();
        assert_eq!(res.modified, 0);
        let res = channels
            .update_one(&Filter::by_id("C9"), &Update::new().set("name", "x"))
            .unwrap();
        assert_eq!(res.matched, 0);

        assert_eq!(channels.delete_one(&Filter::new().eq("owners", "U2")).unwrap(), 1);
        assert_eq!(channels.count_documents(&Filter::new()).unwrap(), 0);
    }

    #[test]
    fn test_typed_helpers_and_tx() {
        let store = DocumentStore::temporary().unwrap();
        crate::store::with_transaction(&store, |tx| {
            tx.collection("migrations")?
                .insert_one(doc(json!({"_id": "001", "description": "init"})))
        })
        .unwrap();
        let found: Option<Document> = store
            .collection("migrations")
            .unwrap()
            .find_optional(&Filter::by_id("001"))
            .unwrap();
        assert!(found.is_some());
        assert!(store.collection_names().contains(&"migrations".to_string()));
    }
}
