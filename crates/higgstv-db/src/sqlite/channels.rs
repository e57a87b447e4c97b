//! The channel aggregate: `channels` plus tags, owners, permissions,
//! embedded programs and the custom program order.

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use serde_json::Value;

use super::mapping::{
    Aggregate, Field, UpdateOp, ValueTable, array, insert_values, load_values, placeholders, to_sql,
};
use super::models::{ChannelChildren, ChannelRow, PermissionRow};
use super::programs;
use crate::dsl::{Clause, Condition, Document, Filter, each_values};
use crate::error::{Result, StoreError};

pub const TAGS: ValueTable = ValueTable {
    table: "channel_tags",
    fk: "channel_id",
    column: "tag",
    order: None,
};

pub const OWNERS: ValueTable = ValueTable {
    table: "channel_owners",
    fk: "channel_id",
    column: "user_id",
    order: None,
};

pub const CONTENTS_ORDER: ValueTable = ValueTable {
    table: "channel_program_order",
    fk: "channel_id",
    column: "program_id",
    order: Some("order_index"),
};

const COLUMNS: &[(&str, &str)] = &[
    ("_id", "id"),
    ("type", "type"),
    ("name", "name"),
    ("desc", "desc"),
    ("contents_seq", "contents_seq"),
    ("cover.default", "cover_default"),
    ("created", "created"),
    ("last_modified", "last_modified"),
];

pub struct ChannelsTable;

impl Aggregate for ChannelsTable {
    fn table(&self) -> &'static str {
        "channels"
    }

    fn field(&self, path: &str) -> Option<Field> {
        if let Some((_, column)) = COLUMNS.iter().find(|(p, _)| *p == path) {
            return Some(Field::Column(*column));
        }
        match path {
            "tags" => return Some(Field::Values(TAGS)),
            "owners" => return Some(Field::Values(OWNERS)),
            "contents_order" => return Some(Field::Values(CONTENTS_ORDER)),
            _ => {}
        }

        if let Some(member) = path.strip_prefix("permission.") {
            let column = match member {
                "user_id" => "user_id",
                "admin" => "admin",
                "read" => "read",
                "write" => "write",
                _ => return None,
            };
            return Some(Field::Elements {
                table: "channel_permissions",
                fk: "channel_id",
                column,
            });
        }

        if let Some(member) = path.strip_prefix("contents.") {
            if let Ok(index) = member.parse::<usize>() {
                return Some(Field::Position {
                    table: "programs",
                    fk: "channel_id",
                    index,
                });
            }
            return programs::column_for(member).map(|column| Field::Elements {
                table: "programs",
                fk: "channel_id",
                column,
            });
        }
        None
    }

    fn load(&self, conn: &Connection, id: &SqlValue) -> Result<Option<Document>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM channels WHERE id = ?1", ChannelRow::COLUMNS),
                [id],
                ChannelRow::from_row,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };

        let children = ChannelChildren {
            tags: load_values(conn, id, &TAGS)?,
            owners: load_values(conn, id, &OWNERS)?,
            permission: load_permissions(conn, id)?,
            contents: programs::load_for_channel(conn, &row.id)?,
            contents_order: load_values(conn, id, &CONTENTS_ORDER)?,
        };
        Ok(Some(row.into_document(children)))
    }

    fn insert(&self, conn: &Connection, doc: &Document) -> Result<()> {
        let row = ChannelRow::from_document(doc)?;
        row.insert(conn)?;

        let id = SqlValue::Text(row.id.clone());
        insert_values(conn, &id, &TAGS, array(doc, "tags"))?;
        insert_values(conn, &id, &OWNERS, array(doc, "owners"))?;
        insert_permissions(conn, &id, array(doc, "permission"))?;
        for program in array(doc, "contents") {
            programs::insert(conn, &row.id, program)?;
        }
        insert_values(conn, &id, &CONTENTS_ORDER, array(doc, "contents_order"))?;
        Ok(())
    }

    fn update_embedded(
        &self,
        conn: &Connection,
        id: &SqlValue,
        op: UpdateOp,
        path: &str,
        value: &Value,
        clauses: &[Clause],
    ) -> Result<Option<usize>> {
        let channel_id = match id {
            SqlValue::Text(s) => s.as_str(),
            _ => return Err(StoreError::InvalidQuery("channel ids are strings".into())),
        };

        let changed = match (op, path) {
            (UpdateOp::Set, "cover") => {
                let default = value.get("default").and_then(Value::as_str);
                conn.execute(
                    "UPDATE channels SET cover_default = ?1 WHERE id = ?2 AND cover_default IS NOT ?1",
                    rusqlite::params![default, id],
                )?
            }
            (UpdateOp::Unset, "cover") => conn.execute(
                "UPDATE channels SET cover_default = NULL WHERE id = ?1 AND cover_default IS NOT NULL",
                [id],
            )?,

            (UpdateOp::Set, "permission") => {
                let records = value
                    .as_array()
                    .ok_or_else(|| StoreError::InvalidQuery("$set on permission expects an array".into()))?;
                let removed = conn.execute("DELETE FROM channel_permissions WHERE channel_id = ?1", [id])?;
                removed + insert_permissions(conn, id, records)?
            }
            (UpdateOp::AddToSet | UpdateOp::Push, "permission") => insert_permissions(conn, id, &each_values(value))?,
            (UpdateOp::Pull, "permission") => {
                let users = element_keys(value, "user_id")?;
                delete_where_in(conn, "channel_permissions", "user_id", id, &users)?
            }
            (UpdateOp::Unset, "permission") => {
                conn.execute("DELETE FROM channel_permissions WHERE channel_id = ?1", [id])?
            }

            (UpdateOp::Set, "contents") => {
                let items = value
                    .as_array()
                    .ok_or_else(|| StoreError::InvalidQuery("$set on contents expects an array".into()))?;
                let removed = conn.execute("DELETE FROM programs WHERE channel_id = ?1", [id])?;
                for program in items {
                    programs::insert(conn, channel_id, program)?;
                }
                removed + items.len()
            }
            (UpdateOp::AddToSet | UpdateOp::Push, "contents") => {
                let items = each_values(value);
                for program in &items {
                    programs::insert(conn, channel_id, program)?;
                }
                items.len()
            }
            (UpdateOp::Pull, "contents") => {
                let ids = element_keys(value, "_id")?;
                programs::delete_from_channel(conn, channel_id, &ids)?
            }
            (UpdateOp::Unset, "contents") => conn.execute("DELETE FROM programs WHERE channel_id = ?1", [id])?,

            (UpdateOp::Set, positional) if positional.starts_with("contents.$.") => {
                let field = &positional["contents.$.".len()..];
                let program_id = positional_program(clauses)?;
                programs::update_field(conn, channel_id, program_id, field, value)?
            }

            _ => return Ok(None),
        };
        Ok(Some(changed))
    }
}

fn load_permissions(conn: &Connection, id: &SqlValue) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, admin, read, write FROM channel_permissions WHERE channel_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([id], PermissionRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(PermissionRow::into_value).collect())
}

/// One permission row per user. A second record for the same user merges
/// into the row: a flag granted by either record stays granted. Returns the
/// rows added or widened.
fn insert_permissions(conn: &Connection, id: &SqlValue, records: &[Value]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO channel_permissions (channel_id, user_id, admin, read, write)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (channel_id, user_id) DO UPDATE SET
             admin = MAX(admin, excluded.admin),
             read = MAX(read, excluded.read),
             write = MAX(write, excluded.write)
         WHERE excluded.admin > admin OR excluded.read > read OR excluded.write > write",
    )?;
    let mut changed = 0;
    for record in records {
        let p = PermissionRow::from_value(record)?;
        changed += stmt.execute(rusqlite::params![id, p.user_id, p.admin, p.read, p.write])?;
    }
    Ok(changed)
}

fn delete_where_in(conn: &Connection, table: &str, column: &str, id: &SqlValue, keys: &[Value]) -> Result<usize> {
    if keys.is_empty() {
        return Ok(0);
    }
    let mut params = vec![id.clone()];
    for key in keys {
        params.push(to_sql(key)?);
    }
    let sql = format!(
        "DELETE FROM {} WHERE channel_id = ?1 AND {} IN ({})",
        table,
        column,
        placeholders(2, keys.len())
    );
    Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
}

/// Keys named by a `$pull` on embedded records: `{key: v}` or
/// `{key: {$in: [..]}}`.
fn element_keys(value: &Value, key: &str) -> Result<Vec<Value>> {
    let clauses = Filter::from_json(value.clone())?.clauses()?;
    let mut out = Vec::new();
    for clause in clauses {
        match clause {
            Clause::Field { path, conditions } if path == key => {
                for cond in conditions {
                    match cond {
                        Condition::Eq(v) => out.push(v),
                        Condition::In(list) => out.extend(list),
                        other => {
                            return Err(StoreError::InvalidQuery(format!("$pull cannot use {:?} on {}", other, key)));
                        }
                    }
                }
            }
            _ => return Err(StoreError::InvalidQuery(format!("$pull on embedded records must select by {}", key))),
        }
    }
    Ok(out)
}

/// The program a positional `contents.$` path refers to, taken from the
/// filter's `contents._id` equality.
fn positional_program(clauses: &[Clause]) -> Result<i64> {
    clauses
        .iter()
        .find_map(|clause| match clause {
            Clause::Field { path, conditions } if path == "contents._id" => conditions.iter().find_map(|c| match c {
                Condition::Eq(v) => v.as_i64(),
                _ => None,
            }),
            _ => None,
        })
        .ok_or_else(|| StoreError::InvalidQuery("positional update needs a contents._id equality filter".into()))
}
