use std::collections::HashMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use serde_json::Value;

use super::mapping::{Aggregate, Field, ValueTable, insert_values, placeholders, replace_values, to_sql};
use super::models::ProgramRow;
use crate::dsl::Document;
use crate::error::{Result, StoreError};

pub const PROGRAM_TAGS: ValueTable = ValueTable {
    table: "program_tags",
    fk: "program_id",
    column: "tag",
    order: None,
};

const FIELDS: &[(&str, &str)] = &[
    ("_id", "id"),
    ("name", "name"),
    ("desc", "desc"),
    ("duration", "duration"),
    ("type", "type"),
    ("youtube_id", "youtube_id"),
    ("created", "created"),
    ("last_modified", "last_modified"),
];

/// Column holding a program document field.
pub fn column_for(path: &str) -> Option<&'static str> {
    FIELDS.iter().find(|(p, _)| *p == path).map(|(_, c)| *c)
}

/// Flat, read-only view of every program with its `channel_id`. Programs
/// are written through the `contents` array of their channel.
pub struct ProgramsView;

impl Aggregate for ProgramsView {
    fn table(&self) -> &'static str {
        "programs"
    }

    fn field(&self, path: &str) -> Option<Field> {
        match path {
            "channel_id" => Some(Field::Column("channel_id")),
            "tags" => Some(Field::Values(PROGRAM_TAGS)),
            other => column_for(other).map(Field::Column),
        }
    }

    fn load(&self, conn: &Connection, id: &SqlValue) -> Result<Option<Document>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM programs WHERE id = ?1", ProgramRow::COLUMNS),
                [id],
                ProgramRow::from_row,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut tags = load_tags(conn, &[row.id])?;
        let own = tags.remove(&row.id).unwrap_or_default();
        Ok(Some(row.into_document(own, true)))
    }

    fn insert(&self, _conn: &Connection, _doc: &Document) -> Result<()> {
        Err(StoreError::InvalidQuery("programs are written through their channel".into()))
    }

    fn read_only(&self) -> bool {
        true
    }

    fn mint_id(&self) -> Option<Value> {
        None
    }
}

/// Insert one embedded program under `channel_id`, keeping its id.
pub fn insert(conn: &Connection, channel_id: &str, program: &Value) -> Result<()> {
    let Value::Object(doc) = program else {
        return Err(StoreError::InvalidQuery(format!("program must be an object, got {}", program)));
    };
    let row = ProgramRow::from_document(doc, channel_id)?;
    row.insert(conn)?;
    let tags = doc.get("tags").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
    insert_values(conn, &row.key(), &PROGRAM_TAGS, tags)?;
    Ok(())
}

/// Programs of a channel in id order, with their tags fetched in one query.
pub fn load_for_channel(conn: &Connection, channel_id: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM programs WHERE channel_id = ?1 ORDER BY id",
        ProgramRow::COLUMNS
    ))?;
    let rows = stmt
        .query_map([channel_id], ProgramRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let mut tags = load_tags(conn, &ids)?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let own = tags.remove(&row.id).unwrap_or_default();
            Value::Object(row.into_document(own, false))
        })
        .collect())
}

fn load_tags(conn: &Connection, program_ids: &[i64]) -> Result<HashMap<i64, Vec<Value>>> {
    let sql = format!(
        "SELECT program_id, tag FROM program_tags WHERE program_id IN ({}) ORDER BY rowid",
        placeholders(1, program_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(program_ids.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out: HashMap<i64, Vec<Value>> = HashMap::new();
    for (program_id, tag) in rows {
        out.entry(program_id).or_default().push(Value::from(tag));
    }
    Ok(out)
}

/// Set one field of a channel's program, returning the rows changed.
/// Nothing happens when the program is not in that channel.
pub fn update_field(conn: &Connection, channel_id: &str, program_id: i64, field: &str, value: &Value) -> Result<usize> {
    if field == "tags" {
        let owned: Option<i64> = conn
            .query_row(
                "SELECT id FROM programs WHERE id = ?1 AND channel_id = ?2",
                rusqlite::params![program_id, channel_id],
                |row| row.get(0),
            )
            .optional()?;
        if owned.is_none() {
            return Ok(0);
        }
        let items = value
            .as_array()
            .ok_or_else(|| StoreError::InvalidQuery("program tags must be an array".into()))?;
        return replace_values(conn, &SqlValue::Integer(program_id), &PROGRAM_TAGS, items);
    }

    let column = column_for(field)
        .filter(|c| *c != "id")
        .ok_or_else(|| StoreError::InvalidQuery(format!("programs have no settable field {}", field)))?;
    Ok(conn.execute(
        &format!(
            "UPDATE programs SET \"{c}\" = ?1 WHERE id = ?2 AND channel_id = ?3 AND \"{c}\" IS NOT ?1",
            c = column
        ),
        rusqlite::params![to_sql(value)?, program_id, channel_id],
    )?)
}

/// Delete a channel's programs by id; tags and order entries cascade.
pub fn delete_from_channel(conn: &Connection, channel_id: &str, ids: &[Value]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut params = vec![SqlValue::Text(channel_id.to_string())];
    for id in ids {
        params.push(to_sql(id)?);
    }
    let sql = format!(
        "DELETE FROM programs WHERE channel_id = ?1 AND id IN ({})",
        placeholders(2, ids.len())
    );
    Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
}
