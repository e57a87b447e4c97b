use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};

use super::mapping::{Aggregate, Field, ValueTable, array, insert_values, load_values};
use super::models::UserRow;
use crate::dsl::Document;
use crate::error::Result;

pub const OWN_CHANNELS: ValueTable = ValueTable {
    table: "user_channels",
    fk: "user_id",
    column: "channel_id",
    order: None,
};

const COLUMNS: &[(&str, &str)] = &[
    ("_id", "id"),
    ("username", "username"),
    ("email", "email"),
    ("password", "password"),
    ("access_key", "access_key"),
    ("unclassified_channel", "unclassified_channel"),
    ("created", "created"),
    ("last_modified", "last_modified"),
];

/// `users` with `own_channels` kept in `user_channels`.
pub struct UsersTable;

impl Aggregate for UsersTable {
    fn table(&self) -> &'static str {
        "users"
    }

    fn field(&self, path: &str) -> Option<Field> {
        if path == "own_channels" {
            return Some(Field::Values(OWN_CHANNELS));
        }
        COLUMNS.iter().find(|(p, _)| *p == path).map(|(_, c)| Field::Column(*c))
    }

    fn load(&self, conn: &Connection, id: &SqlValue) -> Result<Option<Document>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", UserRow::COLUMNS),
                [id],
                UserRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => {
                let own_channels = load_values(conn, id, &OWN_CHANNELS)?;
                Ok(Some(row.into_document(own_channels)))
            }
            None => Ok(None),
        }
    }

    fn insert(&self, conn: &Connection, doc: &Document) -> Result<()> {
        let row = UserRow::from_document(doc)?;
        row.insert(conn)?;
        insert_values(conn, &SqlValue::Text(row.id), &OWN_CHANNELS, array(doc, "own_channels"))?;
        Ok(())
    }
}
