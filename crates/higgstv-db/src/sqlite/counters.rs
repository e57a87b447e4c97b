//! Single-table collections: named counters and applied-migration records.

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};

use super::mapping::{Aggregate, Field, optional_str, required_str, timestamp};
use crate::dsl::Document;
use crate::error::Result;

pub struct CountersTable;

impl Aggregate for CountersTable {
    fn table(&self) -> &'static str {
        "counters"
    }

    fn field(&self, path: &str) -> Option<Field> {
        match path {
            "_id" => Some(Field::Column("id")),
            "seq" => Some(Field::Column("seq")),
            _ => None,
        }
    }

    fn load(&self, conn: &Connection, id: &SqlValue) -> Result<Option<Document>> {
        let row = conn
            .query_row("SELECT id, seq FROM counters WHERE id = ?1", [id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        Ok(row.map(|(id, seq)| {
            let mut doc = Map::new();
            doc.insert("_id".into(), Value::String(id));
            doc.insert("seq".into(), Value::from(seq));
            doc
        }))
    }

    fn insert(&self, conn: &Connection, doc: &Document) -> Result<()> {
        let seq = doc.get("seq").and_then(Value::as_i64).unwrap_or(0);
        conn.execute(
            "INSERT INTO counters (id, seq) VALUES (?1, ?2)",
            rusqlite::params![required_str(doc, "_id")?, seq],
        )?;
        Ok(())
    }
}

pub struct MigrationsTable;

impl Aggregate for MigrationsTable {
    fn table(&self) -> &'static str {
        "migrations"
    }

    fn field(&self, path: &str) -> Option<Field> {
        match path {
            "_id" => Some(Field::Column("id")),
            "description" => Some(Field::Column("description")),
            "executed_at" => Some(Field::Column("executed_at")),
            _ => None,
        }
    }

    fn load(&self, conn: &Connection, id: &SqlValue) -> Result<Option<Document>> {
        let row = conn
            .query_row(
                "SELECT id, description, executed_at FROM migrations WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(id, description, executed_at)| {
            let mut doc = Map::new();
            doc.insert("_id".into(), Value::String(id));
            doc.insert("description".into(), Value::String(description.unwrap_or_default()));
            doc.insert("executed_at".into(), Value::String(executed_at));
            doc
        }))
    }

    fn insert(&self, conn: &Connection, doc: &Document) -> Result<()> {
        conn.execute(
            "INSERT INTO migrations (id, description, executed_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                required_str(doc, "_id")?,
                optional_str(doc, "description"),
                timestamp(doc, "executed_at"),
            ],
        )?;
        Ok(())
    }
}
