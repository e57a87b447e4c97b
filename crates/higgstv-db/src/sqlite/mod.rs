//! Relational store on SQLite.
//!
//! Collections are presented as documents but kept normalized: each one is
//! an aggregate root table plus child tables (see [`mapping`]). Filters are
//! translated to SQL; updates are decomposed into statements on the parent
//! row and its children.
//!
//! Connections come from a small pool. Every write runs in its own
//! `BEGIN IMMEDIATE` transaction, or in a savepoint when issued through a
//! [`Tx`]. Do not issue calls through the store while holding a
//! transaction on the same thread: with every connection taken, the call
//! waits for `busy_timeout` and then fails with a connection error.

pub mod channels;
pub mod counters;
pub mod mapping;
pub mod models;
pub mod programs;
pub mod schema;
pub mod translate;
pub mod users;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, TransactionBehavior, params_from_iter};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::document::update as doc_update;
use crate::dsl::{
    Document, Filter, FindOneAndUpdateOptions, FindOptions, IndexInfo, IndexKeys, IndexOptions, Update,
    UpdateResult,
};
use crate::error::{Result, StoreError};
use crate::store::{Collection, CollectionSource, Store, StoreKind, Tx};
use mapping::{Aggregate, aggregate_for, apply_update, to_sql};
use translate::{build_where, limit_offset, order_by};

#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub pool_size: usize,
    /// How long a connection waits on a locked database. Also the bound
    /// used for opening.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            busy_timeout: Duration::from_secs(10),
        }
    }
}

pub struct SqliteStore {
    path: Option<PathBuf>,
    conns: Vec<Mutex<Connection>>,
    next: AtomicUsize,
    busy_timeout: Duration,
}

const ACQUIRE_POLL: Duration = Duration::from_millis(2);

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &SqliteOptions::default())
    }

    pub fn open_with(path: &Path, opts: &SqliteOptions) -> Result<Self> {
        let size = opts.pool_size.max(1);
        let mut conns = Vec::with_capacity(size);
        for i in 0..size {
            let conn = Connection::open(path)
                .map_err(|e| StoreError::Connection(format!("{}: {}", path.display(), e)))?;
            configure(&conn, opts.busy_timeout)?;
            if i == 0 {
                schema::bootstrap(&conn)?;
            }
            conns.push(Mutex::new(conn));
        }

        info!("SQLite store opened at {} ({} connections)", path.display(), size);
        Ok(Self {
            path: Some(path.to_path_buf()),
            conns,
            next: AtomicUsize::new(0),
            busy_timeout: opts.busy_timeout,
        })
    }

    /// A private in-memory database. The pool holds a single connection
    /// since each in-memory connection is its own database.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(&SqliteOptions::default())
    }

    /// Like [`open_in_memory`](Self::open_in_memory); `pool_size` is ignored.
    pub fn open_in_memory_with(opts: &SqliteOptions) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn, opts.busy_timeout)?;
        schema::bootstrap(&conn)?;
        Ok(Self {
            path: None,
            conns: vec![Mutex::new(conn)],
            next: AtomicUsize::new(0),
            busy_timeout: opts.busy_timeout,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The first idle connection, polling until `busy_timeout` runs out.
    fn acquire(&self) -> Result<MutexGuard<'_, Connection>> {
        let n = self.conns.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.busy_timeout;
        loop {
            for offset in 0..n {
                if let Some(guard) = try_slot(&self.conns[(start + offset) % n])? {
                    return Ok(guard);
                }
            }
            if Instant::now() >= deadline {
                return Err(self.exhausted());
            }
            std::thread::sleep(ACQUIRE_POLL);
        }
    }

    /// One specific connection, polling until `deadline`.
    fn lock_slot<'a>(&self, slot: &'a Mutex<Connection>, deadline: Instant) -> Result<MutexGuard<'a, Connection>> {
        loop {
            if let Some(guard) = try_slot(slot)? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(self.exhausted());
            }
            std::thread::sleep(ACQUIRE_POLL);
        }
    }

    fn exhausted(&self) -> StoreError {
        StoreError::Connection(format!(
            "no pooled connection became free within {:?}; a transaction may still be open on this thread",
            self.busy_timeout
        ))
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.acquire()?;
        f(&conn)
    }

    /// Run `f` in its own `BEGIN IMMEDIATE` transaction.
    pub fn with_write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.acquire()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&*tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Toggle `PRAGMA foreign_keys` on every pooled connection. Fails when
    /// one of them stays busy past `busy_timeout`.
    pub fn set_foreign_keys(&self, enabled: bool) -> Result<()> {
        let deadline = Instant::now() + self.busy_timeout;
        for slot in &self.conns {
            let conn = self.lock_slot(slot, deadline)?;
            conn.pragma_update(None, "foreign_keys", enabled)?;
        }
        debug!("Foreign key enforcement {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Disable foreign keys until the returned guard is dropped.
    pub fn suspend_foreign_keys(&self) -> Result<ForeignKeyGuard<'_>> {
        self.set_foreign_keys(false)?;
        Ok(ForeignKeyGuard { store: self })
    }

    pub fn foreign_key_violations(&self) -> Result<Vec<ForeignKeyViolation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ForeignKeyViolation {
                        table: row.get(0)?,
                        rowid: row.get(1)?,
                        parent: row.get(2)?,
                        constraint: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn lookup(&self, name: &str) -> Result<&'static dyn Aggregate> {
        aggregate_for(name).ok_or_else(|| StoreError::InvalidQuery(format!("unknown collection {}", name)))
    }
}

fn try_slot(slot: &Mutex<Connection>) -> Result<Option<MutexGuard<'_, Connection>>> {
    match slot.try_lock() {
        Ok(guard) => Ok(Some(guard)),
        Err(TryLockError::WouldBlock) => Ok(None),
        Err(TryLockError::Poisoned(e)) => Err(StoreError::Backend(format!("connection lock poisoned: {}", e))),
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    // WAL mode for concurrent reads
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Re-enables foreign keys when dropped.
pub struct ForeignKeyGuard<'a> {
    store: &'a SqliteStore,
}

impl Drop for ForeignKeyGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.set_foreign_keys(true) {
            warn!("Failed to re-enable foreign keys: {}", e);
        }
    }
}

/// One row of `PRAGMA foreign_key_check`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub constraint: i64,
}

impl fmt::Display for ForeignKeyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rowid {
            Some(rowid) => write!(f, "{} row {} references missing {}", self.table, rowid, self.parent),
            None => write!(f, "{} references missing {}", self.table, self.parent),
        }
    }
}

impl CollectionSource for SqliteStore {
    fn collection(&self, name: &str) -> Result<Box<dyn Collection + '_>> {
        Ok(Box::new(SqlCollection {
            source: Source::Pool(self),
            agg: self.lookup(name)?,
            name: name.to_string(),
        }))
    }
}

impl Store for SqliteStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn begin_tx(&self) -> Result<Box<dyn Tx + '_>> {
        let conn = self.acquire()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTx {
            store: self,
            conn,
            finished: false,
        }))
    }

    fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

pub struct SqliteTx<'a> {
    store: &'a SqliteStore,
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl CollectionSource for SqliteTx<'_> {
    fn collection(&self, name: &str) -> Result<Box<dyn Collection + '_>> {
        Ok(Box::new(SqlCollection {
            source: Source::Tx(&*self.conn),
            agg: self.store.lookup(name)?,
            name: name.to_string(),
        }))
    }
}

impl Tx for SqliteTx<'_> {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Rolling back unfinished transaction");
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Rollback on drop failed: {}", e);
            }
        }
    }
}

enum Source<'a> {
    Pool(&'a SqliteStore),
    Tx(&'a Connection),
}

impl Source<'_> {
    fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        match self {
            Source::Pool(store) => store.with_conn(f),
            Source::Tx(conn) => f(conn),
        }
    }

    fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        match self {
            Source::Pool(store) => store.with_write(f),
            Source::Tx(conn) => {
                conn.execute_batch("SAVEPOINT store_op")?;
                match f(conn) {
                    Ok(out) => {
                        conn.execute_batch("RELEASE store_op")?;
                        Ok(out)
                    }
                    Err(e) => {
                        if let Err(undo) = conn.execute_batch("ROLLBACK TO store_op; RELEASE store_op") {
                            warn!("Savepoint rollback failed after {}: {}", e, undo);
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}

pub struct SqlCollection<'a> {
    source: Source<'a>,
    agg: &'static dyn Aggregate,
    name: String,
}

impl SqlCollection<'_> {
    fn matching_ids(&self, conn: &Connection, filter: &Filter, opts: &FindOptions) -> Result<Vec<SqlValue>> {
        let clauses = filter.clauses()?;
        let w = build_where(self.agg, &clauses)?;
        let sql = format!(
            "SELECT r.id FROM {} r WHERE {} {} {}",
            self.agg.table(),
            w.sql,
            order_by(self.agg, &opts.sort)?,
            limit_offset(opts.limit, opts.skip)
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(w.params.iter()), |row| row.get::<_, SqlValue>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn first_id(&self, conn: &Connection, filter: &Filter) -> Result<Option<SqlValue>> {
        let opts = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        Ok(self.matching_ids(conn, filter, &opts)?.into_iter().next())
    }

    fn load(&self, conn: &Connection, id: &SqlValue) -> Result<Document> {
        self.agg
            .load(conn, id)?
            .ok_or_else(|| StoreError::not_found(format!("{} {:?}", self.name, id)))
    }

    fn writable(&self) -> Result<()> {
        if self.agg.read_only() {
            return Err(StoreError::InvalidQuery(format!("{} is read-only", self.name)));
        }
        Ok(())
    }

    fn not_found(&self, filter: &Filter) -> StoreError {
        StoreError::not_found(format!("{} matching {}", self.name, Value::Object(filter.as_document().clone())))
    }

    fn insert_in(&self, conn: &Connection, mut doc: Document) -> Result<Document> {
        if doc.get("_id").is_none_or(Value::is_null) {
            let id = self
                .agg
                .mint_id()
                .ok_or_else(|| StoreError::InvalidQuery(format!("{} documents need an explicit _id", self.name)))?;
            doc.insert("_id".to_string(), id);
        }
        self.agg.insert(conn, &doc)?;
        Ok(doc)
    }
}

impl Collection for SqlCollection<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_one(&self, filter: &Filter) -> Result<Document> {
        self.source.read(|conn| match self.first_id(conn, filter)? {
            Some(id) => self.load(conn, &id),
            None => Err(self.not_found(filter)),
        })
    }

    fn find(&self, filter: &Filter, opts: &FindOptions) -> Result<Vec<Document>> {
        self.source.read(|conn| {
            self.matching_ids(conn, filter, opts)?
                .iter()
                .map(|id| self.load(conn, id))
                .collect()
        })
    }

    fn insert_one(&self, doc: Document) -> Result<()> {
        self.writable()?;
        self.source.write(|conn| self.insert_in(conn, doc).map(|_| ()))
    }

    fn update_one(&self, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        self.writable()?;
        let clauses = filter.clauses()?;
        self.source.write(|conn| {
            let Some(id) = self.first_id(conn, filter)? else {
                return Ok(UpdateResult::default());
            };
            let changed = apply_update(self.agg, conn, &id, update, &clauses)?;
            Ok(UpdateResult {
                matched: 1,
                modified: u64::from(changed > 0),
            })
        })
    }

    fn delete_one(&self, filter: &Filter) -> Result<u64> {
        self.writable()?;
        self.source.write(|conn| match self.first_id(conn, filter)? {
            Some(id) => {
                let sql = format!("DELETE FROM {} WHERE id = ?1", self.agg.table());
                Ok(conn.execute(&sql, [&id])? as u64)
            }
            None => Ok(0),
        })
    }

    fn delete_many(&self, filter: &Filter) -> Result<u64> {
        self.writable()?;
        let clauses = filter.clauses()?;
        let w = build_where(self.agg, &clauses)?;
        let table = self.agg.table();
        let sql = format!(
            "DELETE FROM {} WHERE id IN (SELECT r.id FROM {} r WHERE {})",
            table, table, w.sql
        );
        self.source
            .write(|conn| Ok(conn.execute(&sql, params_from_iter(w.params.iter()))? as u64))
    }

    fn count_documents(&self, filter: &Filter) -> Result<i64> {
        let clauses = filter.clauses()?;
        let w = build_where(self.agg, &clauses)?;
        let sql = format!("SELECT COUNT(*) FROM {} r WHERE {}", self.agg.table(), w.sql);
        self.source.read(|conn| {
            Ok(conn.query_row(&sql, params_from_iter(w.params.iter()), |row| row.get(0))?)
        })
    }

    fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        opts: FindOneAndUpdateOptions,
    ) -> Result<Document> {
        self.writable()?;
        let clauses = filter.clauses()?;
        self.source.write(|conn| match self.first_id(conn, filter)? {
            Some(id) if opts.return_after => {
                apply_update(self.agg, conn, &id, update, &clauses)?;
                self.load(conn, &id)
            }
            Some(id) => {
                let before = self.load(conn, &id)?;
                apply_update(self.agg, conn, &id, update, &clauses)?;
                Ok(before)
            }
            None if opts.upsert => {
                let mut seed = doc_update::upsert_seed(filter)?;
                doc_update::apply(&mut seed, update, &clauses)?;
                let inserted = self.insert_in(conn, seed)?;
                if !opts.return_after {
                    // No pre-image exists for an inserted document
                    return Err(self.not_found(filter));
                }
                let id = to_sql(inserted.get("_id").unwrap_or(&Value::Null))?;
                self.load(conn, &id)
            }
            None => Err(self.not_found(filter)),
        })
    }

    fn create_index(&self, keys: &IndexKeys, opts: &IndexOptions) -> Result<()> {
        // Indexes are part of the schema
        debug!(
            "Index {} on {} is provided by the SQLite schema",
            opts.name.clone().unwrap_or_else(|| keys.default_name()),
            self.name
        );
        Ok(())
    }

    fn list_indexes(&self) -> Result<Vec<IndexInfo>> {
        self.source.read(|conn| schema::list_indexes(conn, self.agg.table()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CollectionExt, with_transaction};
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn user(id: &str, name: &str) -> Document {
        doc(json!({
            "_id": id,
            "username": name,
            "email": format!("{}@example.com", name),
            "password": "hash",
            "own_channels": [],
            "created": "2024-01-01T00:00:00Z",
            "last_modified": "2024-01-01T00:00:00Z",
        }))
    }

    fn channel(id: &str, owner: &str) -> Document {
        doc(json!({
            "_id": id,
            "type": "default",
            "name": format!("channel {}", id),
            "desc": "",
            "tags": [1, 2],
            "contents_seq": "",
            "contents": [
                {"_id": 5, "name": "a", "duration": 60, "type": "youtube", "youtube_id": "y5", "tags": [7],
                 "created": "2024-01-01T00:00:00Z", "last_modified": "2024-01-01T00:00:00Z"},
            ],
            "contents_order": [5],
            "owners": [owner],
            "permission": [{"user_id": owner, "admin": true, "read": true, "write": true}],
            "created": "2024-01-01T00:00:00Z",
            "last_modified": "2024-01-01T00:00:00Z",
        }))
    }

    #[test]
    fn test_channel_aggregate_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.collection("users").unwrap().insert_one(user("U1", "alice")).unwrap();
        let channels = store.collection("channels").unwrap();
        channels.insert_one(channel("C1", "U1")).unwrap();

        let loaded = channels.find_one(&Filter::by_id("C1")).unwrap();
        assert_eq!(loaded["tags"], json!([1, 2]));
        assert_eq!(loaded["owners"], json!(["U1"]));
        assert_eq!(loaded["contents"][0]["tags"], json!([7]));
        assert_eq!(loaded["contents_order"], json!([5]));
        assert_eq!(loaded["permission"][0]["admin"], json!(true));
        assert!(loaded.get("cover").is_none());
    }

    #[test]
    fn test_failed_insert_leaves_no_partial_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.collection("users").unwrap().insert_one(user("U1", "alice")).unwrap();
        let channels = store.collection("channels").unwrap();

        let mut bad = channel("C1", "U1");
        // Second program lacks an id
        bad["contents"].as_array_mut().unwrap().push(json!({"name": "no id"}));
        assert!(channels.insert_one(bad).is_err());

        assert_eq!(channels.count_documents(&Filter::new()).unwrap(), 0);
        let tags: i64 = store
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM channel_tags", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(tags, 0);
    }

    #[test]
    fn test_duplicate_and_foreign_key_errors() {
        let store = SqliteStore::open_in_memory().unwrap();
        let users = store.collection("users").unwrap();
        users.insert_one(user("U1", "alice")).unwrap();
        assert!(users.insert_one(user("U2", "alice")).unwrap_err().is_duplicate_key());

        let err = store.collection("channels").unwrap().insert_one(channel("C1", "ghost")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ForeignKey);
    }

    #[test]
    fn test_updates_decompose() {
        let store = SqliteStore::open_in_memory().unwrap();
        let users = store.collection("users").unwrap();
        users.insert_one(user("U1", "alice")).unwrap();
        users.insert_one(user("U2", "bob")).unwrap();
        let channels = store.collection("channels").unwrap();
        channels.insert_one(channel("C1", "U1")).unwrap();
        let by_id = Filter::by_id("C1");

        let res = channels
            .update_one(&by_id, &Update::new().add_each_to_set("owners", ["U1", "U2"]))
            .unwrap();
        assert_eq!(res, UpdateResult { matched: 1, modified: 1 });
        let res = channels.update_one(&by_id, &Update::new().add_to_set("owners", "U2")).unwrap();
        assert_eq!(res.modified, 0);

        channels
            .update_one(&by_id, &Update::new().set("tags", json!([9])).set("cover", json!({"default": "c.png"})))
            .unwrap();
        channels
            .update_one(
                &by_id,
                &Update::new().push(
                    "contents",
                    json!({"_id": 6, "name": "b", "type": "youtube", "tags": [1, 2]}),
                ),
            )
            .unwrap();
        channels
            .update_one(
                &Filter::by_id("C1").eq("contents._id", 6),
                &Update::new().set("contents.$.name", "renamed"),
            )
            .unwrap();

        let loaded = channels.find_one(&by_id).unwrap();
        assert_eq!(loaded["owners"], json!(["U1", "U2"]));
        assert_eq!(loaded["tags"], json!([9]));
        assert_eq!(loaded["cover"]["default"], "c.png");
        assert_eq!(loaded["contents"][1]["name"], "renamed");
        assert_eq!(loaded["contents"][1]["tags"], json!([1, 2]));

        channels
            .update_one(&by_id, &Update::new().pull_where_in("contents", "_id", [5, 6]))
            .unwrap();
        let loaded = channels.find_one(&by_id).unwrap();
        assert_eq!(loaded["contents"], json!([]));
        // Order entries went with their programs
        assert_eq!(loaded["contents_order"], json!([]));
    }

    #[test]
    fn test_modified_counts_only_real_changes() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.collection("users").unwrap().insert_one(user("U1", "alice")).unwrap();
        let channels = store.collection("channels").unwrap();
        channels.insert_one(channel("C1", "U1")).unwrap();
        let by_id = Filter::by_id("C1");
        let modified = |update: Update| channels.update_one(&by_id, &update).unwrap().modified;

        assert_eq!(modified(Update::new().set("name", "channel C1")), 0);
        assert_eq!(modified(Update::new().set("name", "renamed")), 1);
        assert_eq!(modified(Update::new().set("tags", json!([1, 2]))), 0);
        assert_eq!(modified(Update::new().set("tags", json!([2, 1]))), 1);
        assert_eq!(modified(Update::new().unset("cover")), 0);
        assert_eq!(modified(Update::new().set("cover", json!({"default": "c.png"}))), 1);
        assert_eq!(modified(Update::new().set("cover", json!({"default": "c.png"}))), 0);
        assert_eq!(modified(Update::new().pull("owners", "nobody")), 0);

        let counters = store.collection("counters").unwrap();
        counters.insert_one(doc(json!({"_id": "program_id", "seq": 5}))).unwrap();
        let seq = Filter::by_id("program_id");
        assert_eq!(counters.update_one(&seq, &Update::new().max("seq", 3)).unwrap().modified, 0);
        assert_eq!(counters.update_one(&seq, &Update::new().inc("seq", 0)).unwrap().modified, 0);
        assert_eq!(counters.update_one(&seq, &Update::new().max("seq", 8)).unwrap().modified, 1);
        assert_eq!(counters.find_one(&seq).unwrap()["seq"], 8);
    }

    #[test]
    fn test_update_cost_does_not_grow_with_channel_size() {
        fn time_pushes(size: i64) -> Duration {
            let store = SqliteStore::open_in_memory().unwrap();
            store.collection("users").unwrap().insert_one(user("U1", "alice")).unwrap();
            let channels = store.collection("channels").unwrap();
            let mut big = channel("C1", "U1");
            big["contents"] = (0..size)
                .map(|id| json!({"_id": id, "name": "p", "type": "youtube", "youtube_id": "y", "tags": [1, 2]}))
                .collect();
            big["contents_order"] = json!([]);
            channels.insert_one(big).unwrap();

            let by_id = Filter::by_id("C1");
            let started = Instant::now();
            for id in size..size + 100 {
                channels
                    .update_one(&by_id, &Update::new().push("contents", json!({"_id": id, "type": "youtube"})))
                    .unwrap();
            }
            started.elapsed()
        }

        time_pushes(10);
        let small = time_pushes(30);
        let large = time_pushes(3000);
        assert!(
            large < small * 5 + Duration::from_millis(50),
            "100 pushes took {:?} on 3000 programs vs {:?} on 30",
            large,
            small
        );
    }

    #[test]
    fn test_repeated_permission_records_merge() {
        let store = SqliteStore::open_in_memory().unwrap();
        let users = store.collection("users").unwrap();
        users.insert_one(user("U1", "alice")).unwrap();
        users.insert_one(user("U2", "bob")).unwrap();
        let channels = store.collection("channels").unwrap();
        channels.insert_one(channel("C1", "U1")).unwrap();
        let by_id = Filter::by_id("C1");
        let grant = |record: Value| channels.update_one(&by_id, &Update::new().add_to_set("permission", record)).unwrap();

        assert_eq!(grant(json!({"user_id": "U2", "read": true})).modified, 1);
        assert_eq!(grant(json!({"user_id": "U2", "write": true})).modified, 1);
        // Nothing new in this one
        assert_eq!(grant(json!({"user_id": "U2", "read": true, "write": false})).modified, 0);

        let loaded = channels.find_one(&by_id).unwrap();
        let bob: Vec<&Value> = loaded["permission"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|p| p["user_id"] == "U2")
            .collect();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0]["read"], json!(true));
        assert_eq!(bob[0]["write"], json!(true));
        assert_eq!(bob[0]["admin"], json!(false));

        channels
            .update_one(
                &by_id,
                &Update::new().set(
                    "permission",
                    json!([{"user_id": "U1", "admin": true}, {"user_id": "U1", "read": true}]),
                ),
            )
            .unwrap();
        let loaded = channels.find_one(&by_id).unwrap();
        assert_eq!(loaded["permission"], json!([{"user_id": "U1", "admin": true, "read": true, "write": false}]));
    }

    #[test]
    fn test_busy_pool_fails_instead_of_blocking() {
        let opts = SqliteOptions {
            pool_size: 1,
            busy_timeout: Duration::from_millis(50),
        };
        let store = SqliteStore::open_in_memory_with(&opts).unwrap();
        let tx = store.begin_tx().unwrap();

        let err = store.ping().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
        let err = store.suspend_foreign_keys().err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);

        tx.rollback().unwrap();
        store.ping().unwrap();
    }

    #[test]
    fn test_cascade_on_channel_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.collection("users").unwrap().insert_one(user("U1", "alice")).unwrap();
        let channels = store.collection("channels").unwrap();
        channels.insert_one(channel("C1", "U1")).unwrap();

        assert_eq!(channels.delete_one(&Filter::by_id("C1")).unwrap(), 1);
        let orphans: i64 = store
            .with_conn(|c| {
                Ok(c.query_row(
                    "SELECT (SELECT COUNT(*) FROM channel_tags) + (SELECT COUNT(*) FROM channel_owners)
                          + (SELECT COUNT(*) FROM channel_permissions) + (SELECT COUNT(*) FROM programs)
                          + (SELECT COUNT(*) FROM program_tags) + (SELECT COUNT(*) FROM channel_program_order)",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_counter_upsert_inc_and_max() {
        let store = SqliteStore::open_in_memory().unwrap();
        let counters = store.collection("counters").unwrap();
        let filter = Filter::by_id("program_id");

        let first = counters
            .find_one_and_update(&filter, &Update::new().inc("seq", 1), FindOneAndUpdateOptions::default())
            .unwrap();
        assert_eq!(first["seq"], 1);
        counters
            .find_one_and_update(&filter, &Update::new().max("seq", 9), FindOneAndUpdateOptions::default())
            .unwrap();
        let lower = counters
            .find_one_and_update(&filter, &Update::new().max("seq", 3), FindOneAndUpdateOptions::default())
            .unwrap();
        assert_eq!(lower["seq"], 9);

        let missing = counters.find_one_and_update(
            &Filter::by_id("other"),
            &Update::new().inc("seq", 1),
            FindOneAndUpdateOptions { return_after: true, upsert: false },
        );
        assert!(missing.unwrap_err().is_not_found());
    }

    #[test]
    fn test_tx_rollback_and_savepoint() {
        let store = SqliteStore::open_in_memory().unwrap();

        let result: Result<()> = with_transaction(&store, |tx| {
            let users = tx.collection("users")?;
            users.insert_one(user("U1", "alice"))?;
            // Fails inside its own savepoint; the outer transaction survives it
            assert!(users.insert_one(user("U2", "alice")).is_err());
            assert_eq!(users.count_documents(&Filter::new())?, 1);
            Err(StoreError::Backend("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.collection("users").unwrap().count_documents(&Filter::new()).unwrap(), 0);

        with_transaction(&store, |tx| tx.collection("users")?.insert_one(user("U1", "alice"))).unwrap();
        let found: Option<Document> = store.collection("users").unwrap().find_optional(&Filter::by_id("U1")).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_programs_view_is_read_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.collection("users").unwrap().insert_one(user("U1", "alice")).unwrap();
        store.collection("channels").unwrap().insert_one(channel("C1", "U1")).unwrap();

        let programs = store.collection("programs").unwrap();
        let p = programs.find_one(&Filter::by_id(5)).unwrap();
        assert_eq!(p["channel_id"], "C1");
        assert_eq!(p["tags"], json!([7]));
        assert!(programs.insert_one(doc(json!({"_id": 8}))).is_err());
        assert!(store.collection("nope").is_err());
    }

    #[test]
    fn test_foreign_key_suspension_and_check() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open_with(&dir.path().join("fk.db"), &SqliteOptions::default()).unwrap();
        {
            let _guard = store.suspend_foreign_keys().unwrap();
            store.collection("channels").unwrap().insert_one(channel("C1", "ghost")).unwrap();
        }
        let violations = store.foreign_key_violations().unwrap();
        assert!(violations.iter().any(|v| v.table == "channel_owners" && v.parent == "users"));

        let err = store.collection("channels").unwrap().insert_one(channel("C2", "ghost")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ForeignKey);
        store.close().unwrap();
    }

    #[test]
    fn test_list_indexes_from_schema() {
        let store = SqliteStore::open_in_memory().unwrap();
        let users = store.collection("users").unwrap();
        users
            .create_index(&IndexKeys::asc("username"), &IndexOptions { unique: true, ..Default::default() })
            .unwrap();
        let names: Vec<String> = users.list_indexes().unwrap().into_iter().map(|i| i.name).collect();
        assert!(names.contains(&"idx_users_email".to_string()));
    }
}
