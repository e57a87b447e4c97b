//! How document-shaped collections map onto tables.
//!
//! Each collection is an aggregate: one parent row plus child tables. Field
//! paths resolve to a [`Field`], which tells the filter translator and the
//! update decomposer where the data lives.

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use serde_json::Value;

use higgstv_types::collections;

use super::channels::ChannelsTable;
use super::counters::{CountersTable, MigrationsTable};
use super::programs::ProgramsView;
use super::users::UsersTable;
use crate::document::import::format_timestamp;
use crate::dsl::{Clause, Document, Update, each_values, is_operator_object};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// A column of the parent row.
    Column(&'static str),
    /// An array of scalars stored one per child row.
    Values(ValueTable),
    /// A member of embedded records stored as child rows.
    Elements {
        table: &'static str,
        fk: &'static str,
        column: &'static str,
    },
    /// `contents.<n>`: the n-th embedded record.
    Position {
        table: &'static str,
        fk: &'static str,
        index: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueTable {
    pub table: &'static str,
    pub fk: &'static str,
    pub column: &'static str,
    /// Explicit position column; without one, rowid order is kept.
    pub order: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Set,
    AddToSet,
    Pull,
    Push,
    Inc,
    Max,
    Unset,
}

impl UpdateOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOp::Set => "$set",
            UpdateOp::AddToSet => "$addToSet",
            UpdateOp::Pull => "$pull",
            UpdateOp::Push => "$push",
            UpdateOp::Inc => "$inc",
            UpdateOp::Max => "$max",
            UpdateOp::Unset => "$unset",
        }
    }
}

/// Every operation in `update`, in the order the document adapter applies them.
pub fn operations(update: &Update) -> impl Iterator<Item = (UpdateOp, &str, &Value)> {
    let groups = [
        (UpdateOp::Set, &update.set),
        (UpdateOp::AddToSet, &update.add_to_set),
        (UpdateOp::Pull, &update.pull),
        (UpdateOp::Push, &update.push),
        (UpdateOp::Inc, &update.inc),
        (UpdateOp::Max, &update.max),
        (UpdateOp::Unset, &update.unset),
    ];
    groups
        .into_iter()
        .flat_map(|(op, fields)| fields.iter().map(move |(path, value)| (op, path.as_str(), value)))
}

pub trait Aggregate: Sync {
    fn table(&self) -> &'static str;

    fn field(&self, path: &str) -> Option<Field>;

    fn load(&self, conn: &Connection, id: &SqlValue) -> Result<Option<Document>>;

    fn insert(&self, conn: &Connection, doc: &Document) -> Result<()>;

    /// Handle an update path that is neither a column nor a value table.
    /// Returns the number of rows changed, or `None` when the path is not
    /// understood.
    fn update_embedded(
        &self,
        _conn: &Connection,
        _id: &SqlValue,
        _op: UpdateOp,
        _path: &str,
        _value: &Value,
        _clauses: &[Clause],
    ) -> Result<Option<usize>> {
        Ok(None)
    }

    fn read_only(&self) -> bool {
        false
    }

    /// Identifier to assign when an inserted document has none.
    fn mint_id(&self) -> Option<Value> {
        Some(Value::String(higgstv_types::ident::new_id()))
    }
}

pub fn aggregate_for(name: &str) -> Option<&'static dyn Aggregate> {
    match name {
        collections::USERS => Some(&UsersTable),
        collections::CHANNELS => Some(&ChannelsTable),
        collections::PROGRAMS => Some(&ProgramsView),
        collections::COUNTERS => Some(&CountersTable),
        collections::MIGRATIONS => Some(&MigrationsTable),
        _ => None,
    }
}

/// Decompose `update` into statements against the aggregate rooted at `id`.
/// Returns how many rows actually changed; statements are guarded so that
/// writing a value already in place counts as no change.
pub fn apply_update(
    agg: &dyn Aggregate,
    conn: &Connection,
    id: &SqlValue,
    update: &Update,
    clauses: &[Clause],
) -> Result<usize> {
    let mut changed = 0;
    for (op, path, value) in operations(update) {
        if path == "_id" {
            return Err(StoreError::InvalidQuery(format!("{} cannot change _id", op.as_str())));
        }
        changed += match agg.field(path) {
            Some(Field::Column(column)) => update_column(conn, agg.table(), id, column, op, value)?,
            Some(Field::Values(values)) => update_values(conn, id, &values, op, value)?,
            _ => agg.update_embedded(conn, id, op, path, value, clauses)?.ok_or_else(|| {
                StoreError::InvalidQuery(format!("{} on {} is not supported for {}", op.as_str(), path, agg.table()))
            })?,
        };
    }
    Ok(changed)
}

fn update_column(
    conn: &Connection,
    table: &str,
    id: &SqlValue,
    column: &str,
    op: UpdateOp,
    value: &Value,
) -> Result<usize> {
    let sql = match op {
        UpdateOp::Set | UpdateOp::Unset => format!(
            "UPDATE {t} SET \"{c}\" = ?1 WHERE id = ?2 AND \"{c}\" IS NOT ?1",
            t = table,
            c = column
        ),
        UpdateOp::Inc => format!(
            "UPDATE {t} SET \"{c}\" = COALESCE(\"{c}\", 0) + ?1 WHERE id = ?2 AND (?1 <> 0 OR \"{c}\" IS NULL)",
            t = table,
            c = column
        ),
        UpdateOp::Max => format!(
            "UPDATE {t} SET \"{c}\" = ?1 WHERE id = ?2 AND (\"{c}\" IS NULL OR \"{c}\" < ?1)",
            t = table,
            c = column
        ),
        other => {
            return Err(StoreError::InvalidQuery(format!("{} needs an array field, {} is scalar", other.as_str(), column)));
        }
    };
    let arg = if op == UpdateOp::Unset { SqlValue::Null } else { to_sql(value)? };
    Ok(conn.execute(&sql, rusqlite::params![arg, id])?)
}

fn update_values(conn: &Connection, id: &SqlValue, values: &ValueTable, op: UpdateOp, value: &Value) -> Result<usize> {
    match op {
        UpdateOp::Set => {
            let items = value
                .as_array()
                .ok_or_else(|| StoreError::InvalidQuery(format!("$set on {} expects an array", values.column)))?;
            replace_values(conn, id, values, items)
        }
        UpdateOp::AddToSet | UpdateOp::Push => insert_values(conn, id, values, &each_values(value)),
        UpdateOp::Pull => {
            let targets = match value {
                Value::Object(map) if is_operator_object(value) => match map.get("$in") {
                    Some(Value::Array(list)) => list.clone(),
                    _ => return Err(StoreError::InvalidQuery(format!("$pull on {} supports only $in", values.column))),
                },
                other => vec![other.clone()],
            };
            if targets.is_empty() {
                return Ok(0);
            }
            let mut params = vec![id.clone()];
            for target in &targets {
                params.push(to_sql(target)?);
            }
            let sql = format!(
                "DELETE FROM {} WHERE {} = ?1 AND \"{}\" IN ({})",
                values.table,
                values.fk,
                values.column,
                placeholders(2, targets.len())
            );
            Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
        }
        UpdateOp::Unset => clear_values(conn, id, values),
        UpdateOp::Inc | UpdateOp::Max => Err(StoreError::InvalidQuery(format!(
            "{} needs a numeric field, {} is an array",
            op.as_str(),
            values.column
        ))),
    }
}

fn clear_values(conn: &Connection, id: &SqlValue, values: &ValueTable) -> Result<usize> {
    Ok(conn.execute(&format!("DELETE FROM {} WHERE {} = ?1", values.table, values.fk), [id])?)
}

/// Make a value table hold exactly `items`. Leaves the rows alone, and
/// returns 0, when they already match.
pub fn replace_values(conn: &Connection, id: &SqlValue, values: &ValueTable, items: &[Value]) -> Result<usize> {
    let wanted = items.iter().map(|v| to_sql(v).map(from_sql)).collect::<Result<Vec<_>>>()?;
    if load_values(conn, id, values)? == wanted {
        return Ok(0);
    }
    let removed = clear_values(conn, id, values)?;
    Ok(removed + insert_values(conn, id, values, items)?)
}

/// Append `items` to a value table, skipping ones already present.
/// Returns how many were added.
pub fn insert_values(conn: &Connection, id: &SqlValue, values: &ValueTable, items: &[Value]) -> Result<usize> {
    let mut added = 0;
    match values.order {
        Some(order) => {
            let mut next: i64 = conn.query_row(
                &format!("SELECT COALESCE(MAX({}), -1) + 1 FROM {} WHERE {} = ?1", order, values.table, values.fk),
                [id],
                |row| row.get(0),
            )?;
            let sql = format!(
                "INSERT OR IGNORE INTO {} ({}, \"{}\", {}) VALUES (?1, ?2, ?3)",
                values.table, values.fk, values.column, order
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            for item in items {
                if stmt.execute(rusqlite::params![id, to_sql(item)?, next])? > 0 {
                    next += 1;
                    added += 1;
                }
            }
        }
        None => {
            let sql = format!(
                "INSERT OR IGNORE INTO {} ({}, \"{}\") VALUES (?1, ?2)",
                values.table, values.fk, values.column
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            for item in items {
                added += stmt.execute(rusqlite::params![id, to_sql(item)?])?;
            }
        }
    }
    Ok(added)
}

pub fn load_values(conn: &Connection, id: &SqlValue, values: &ValueTable) -> Result<Vec<Value>> {
    let sql = format!(
        "SELECT \"{}\" FROM {} WHERE {} = ?1 ORDER BY {}",
        values.column,
        values.table,
        values.fk,
        values.order.unwrap_or("rowid")
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map([id], |row| row.get::<_, SqlValue>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(from_sql).collect())
}

// -- Value conversion --

pub fn to_sql(value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        composite => {
            return Err(StoreError::InvalidQuery(format!("cannot store composite value {} in a column", composite)));
        }
    })
}

pub fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Value::from(f),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(hex::encode_upper(b)),
    }
}

/// `?2, ?3, ?4` for `start = 2, count = 3`.
pub fn placeholders(start: usize, count: usize) -> String {
    (start..start + count).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

// -- Reading fields out of documents --

pub fn required_str(doc: &Document, key: &str) -> Result<String> {
    doc.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidQuery(format!("document is missing string field {}", key)))
}

pub fn optional_str(doc: &Document, key: &str) -> Option<String> {
    doc.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Timestamps are stored as the RFC 3339 text they serialize to. A missing
/// one is filled with the current time since the columns are NOT NULL.
pub fn timestamp(doc: &Document, key: &str) -> String {
    optional_str(doc, key).unwrap_or_else(|| format_timestamp(Utc::now()))
}

pub fn id_value(doc: &Document) -> Result<SqlValue> {
    match doc.get("_id") {
        Some(id) if !id.is_null() => to_sql(id),
        _ => Err(StoreError::InvalidQuery("document has no _id".into())),
    }
}

pub fn array<'a>(doc: &'a Document, key: &str) -> &'a [Value] {
    doc.get(key).and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

/// Insert `value` under `key` unless it is NULL.
pub fn put_optional(doc: &mut Document, key: &str, value: Option<String>) {
    if let Some(v) = value {
        doc.insert(key.to_string(), Value::String(v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_conversion() {
        assert_eq!(to_sql(&json!(true)).unwrap(), SqlValue::Integer(1));
        assert_eq!(to_sql(&json!(7)).unwrap(), SqlValue::Integer(7));
        assert_eq!(to_sql(&json!("x")).unwrap(), SqlValue::Text("x".into()));
        assert!(to_sql(&json!([1])).is_err());
        assert_eq!(from_sql(SqlValue::Integer(3)), json!(3));
        assert_eq!(from_sql(SqlValue::Null), Value::Null);
    }

    #[test]
    fn test_operations_order() {
        let update = Update::new().max("seq", 3).set("name", "a").inc("seq", 1);
        let ops: Vec<UpdateOp> = operations(&update).map(|(op, _, _)| op).collect();
        assert_eq!(ops, vec![UpdateOp::Set, UpdateOp::Inc, UpdateOp::Max]);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(2, 3), "?2, ?3, ?4");
        assert_eq!(placeholders(1, 0), "");
    }
}
