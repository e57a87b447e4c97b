//! Row types for the aggregate tables, and their conversion to and from
//! the document layout callers see.
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row};
use serde_json::{Map, Value};

use super::mapping::{optional_str, put_optional, required_str, timestamp};
use crate::dsl::Document;
use crate::error::{Result, StoreError};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub access_key: Option<String>,
    pub unclassified_channel: Option<String>,
    pub created: String,
    pub last_modified: String,
}

impl UserRow {
    pub const COLUMNS: &'static str =
        "id, username, email, password, access_key, unclassified_channel, created, last_modified";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            password: row.get(3)?,
            access_key: row.get(4)?,
            unclassified_channel: row.get(5)?,
            created: row.get(6)?,
            last_modified: row.get(7)?,
        })
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(Self {
            id: required_str(doc, "_id")?,
            username: required_str(doc, "username")?,
            email: required_str(doc, "email")?,
            password: required_str(doc, "password")?,
            access_key: optional_str(doc, "access_key"),
            unclassified_channel: optional_str(doc, "unclassified_channel"),
            created: timestamp(doc, "created"),
            last_modified: timestamp(doc, "last_modified"),
        })
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO users (id, username, email, password, access_key, unclassified_channel, created, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                self.id,
                self.username,
                self.email,
                self.password,
                self.access_key,
                self.unclassified_channel,
                self.created,
                self.last_modified,
            ],
        )?;
        Ok(())
    }

    pub fn into_document(self, own_channels: Vec<Value>) -> Document {
        let mut doc = Map::new();
        doc.insert("_id".into(), Value::String(self.id));
        doc.insert("username".into(), Value::String(self.username));
        doc.insert("email".into(), Value::String(self.email));
        doc.insert("password".into(), Value::String(self.password));
        doc.insert("own_channels".into(), Value::Array(own_channels));
        put_optional(&mut doc, "access_key", self.access_key);
        put_optional(&mut doc, "unclassified_channel", self.unclassified_channel);
        doc.insert("created".into(), Value::String(self.created));
        doc.insert("last_modified".into(), Value::String(self.last_modified));
        doc
    }
}

pub struct ChannelRow {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub desc: Option<String>,
    pub contents_seq: Option<String>,
    pub cover_default: Option<String>,
    pub created: String,
    pub last_modified: String,
}

/// Children of a channel, already in document form.
pub struct ChannelChildren {
    pub tags: Vec<Value>,
    pub owners: Vec<Value>,
    pub permission: Vec<Value>,
    pub contents: Vec<Value>,
    pub contents_order: Vec<Value>,
}

impl ChannelRow {
    pub const COLUMNS: &'static str =
        "id, type, name, \"desc\", contents_seq, cover_default, created, last_modified";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            name: row.get(2)?,
            desc: row.get(3)?,
            contents_seq: row.get(4)?,
            cover_default: row.get(5)?,
            created: row.get(6)?,
            last_modified: row.get(7)?,
        })
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(Self {
            id: required_str(doc, "_id")?,
            kind: optional_str(doc, "type").unwrap_or_else(|| "default".to_string()),
            name: required_str(doc, "name")?,
            desc: optional_str(doc, "desc"),
            contents_seq: optional_str(doc, "contents_seq"),
            cover_default: doc
                .get("cover")
                .and_then(|c| c.get("default"))
                .and_then(Value::as_str)
                .map(str::to_string),
            created: timestamp(doc, "created"),
            last_modified: timestamp(doc, "last_modified"),
        })
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO channels (id, type, name, \"desc\", contents_seq, cover_default, created, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                self.id,
                self.kind,
                self.name,
                self.desc,
                self.contents_seq,
                self.cover_default,
                self.created,
                self.last_modified,
            ],
        )?;
        Ok(())
    }

    pub fn into_document(self, children: ChannelChildren) -> Document {
        let mut doc = Map::new();
        doc.insert("_id".into(), Value::String(self.id));
        doc.insert("type".into(), Value::String(self.kind));
        doc.insert("name".into(), Value::String(self.name));
        doc.insert("desc".into(), Value::String(self.desc.unwrap_or_default()));
        doc.insert("tags".into(), Value::Array(children.tags));
        if let Some(default) = self.cover_default {
            let mut cover = Map::new();
            cover.insert("default".into(), Value::String(default));
            doc.insert("cover".into(), Value::Object(cover));
        }
        doc.insert("contents_seq".into(), Value::String(self.contents_seq.unwrap_or_default()));
        doc.insert("contents".into(), Value::Array(children.contents));
        doc.insert("contents_order".into(), Value::Array(children.contents_order));
        doc.insert("owners".into(), Value::Array(children.owners));
        doc.insert("permission".into(), Value::Array(children.permission));
        doc.insert("created".into(), Value::String(self.created));
        doc.insert("last_modified".into(), Value::String(self.last_modified));
        doc
    }
}

pub struct PermissionRow {
    pub user_id: String,
    pub admin: bool,
    pub read: bool,
    pub write: bool,
}

impl PermissionRow {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            admin: row.get(1)?,
            read: row.get(2)?,
            write: row.get(3)?,
        })
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(record) = value else {
            return Err(StoreError::InvalidQuery(format!("permission entry must be an object, got {}", value)));
        };
        let flag = |key: &str| match record.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|i| i != 0),
            _ => false,
        };
        Ok(Self {
            user_id: required_str(record, "user_id")?,
            admin: flag("admin"),
            read: flag("read"),
            write: flag("write"),
        })
    }

    pub fn into_value(self) -> Value {
        serde_json::json!({
            "user_id": self.user_id,
            "admin": self.admin,
            "read": self.read,
            "write": self.write,
        })
    }
}

pub struct ProgramRow {
    pub id: i64,
    pub channel_id: String,
    pub name: String,
    pub desc: Option<String>,
    pub duration: Option<i64>,
    pub kind: String,
    pub youtube_id: Option<String>,
    pub created: String,
    pub last_modified: String,
}

impl ProgramRow {
    pub const COLUMNS: &'static str =
        "id, channel_id, name, \"desc\", duration, type, youtube_id, created, last_modified";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            channel_id: row.get(1)?,
            name: row.get(2)?,
            desc: row.get(3)?,
            duration: row.get(4)?,
            kind: row.get(5)?,
            youtube_id: row.get(6)?,
            created: row.get(7)?,
            last_modified: row.get(8)?,
        })
    }

    pub fn from_document(doc: &Document, channel_id: &str) -> Result<Self> {
        let id = doc
            .get("_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| StoreError::InvalidQuery("program needs an explicit integer _id".into()))?;
        let duration = doc.get("duration").and_then(|d| d.as_i64().or_else(|| d.as_f64().map(|f| f as i64)));
        Ok(Self {
            id,
            channel_id: channel_id.to_string(),
            name: optional_str(doc, "name").unwrap_or_default(),
            desc: optional_str(doc, "desc"),
            duration,
            kind: optional_str(doc, "type").unwrap_or_else(|| "youtube".to_string()),
            youtube_id: optional_str(doc, "youtube_id"),
            created: timestamp(doc, "created"),
            last_modified: timestamp(doc, "last_modified"),
        })
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO programs (id, channel_id, name, \"desc\", duration, type, youtube_id, created, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                self.id,
                self.channel_id,
                self.name,
                self.desc,
                self.duration,
                self.kind,
                self.youtube_id,
                self.created,
                self.last_modified,
            ],
        )?;
        Ok(())
    }

    pub fn key(&self) -> SqlValue {
        SqlValue::Integer(self.id)
    }

    /// Embedded form; the flat `programs` collection also carries `channel_id`.
    pub fn into_document(self, tags: Vec<Value>, with_channel: bool) -> Document {
        let mut doc = Map::new();
        doc.insert("_id".into(), Value::from(self.id));
        if with_channel {
            doc.insert("channel_id".into(), Value::String(self.channel_id));
        }
        doc.insert("name".into(), Value::String(self.name));
        doc.insert("desc".into(), Value::String(self.desc.unwrap_or_default()));
        doc.insert("duration".into(), Value::from(self.duration.unwrap_or(0)));
        doc.insert("type".into(), Value::String(self.kind));
        doc.insert("youtube_id".into(), Value::String(self.youtube_id.unwrap_or_default()));
        doc.insert("tags".into(), Value::Array(tags));
        doc.insert("created".into(), Value::String(self.created));
        doc.insert("last_modified".into(), Value::String(self.last_modified));
        doc
    }
}
