//! Filter and sort translation to SQL.
//!
//! The parent row is always aliased `r` and child rows `c`. Membership in a
//! child table becomes a correlated `EXISTS`, so an array field matches when
//! any element does, the same as on the document store.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use super::mapping::{Aggregate, Field, ValueTable, to_sql};
use crate::dsl::{Clause, Condition, Pattern, Sort, SortOrder};
use crate::error::{Result, StoreError};

#[derive(Debug, Default)]
pub struct SqlWhere {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

pub fn build_where(agg: &dyn Aggregate, clauses: &[Clause]) -> Result<SqlWhere> {
    let mut params = Vec::new();
    let sql = conjunction(agg, clauses, &mut params)?;
    Ok(SqlWhere { sql, params })
}

fn conjunction(agg: &dyn Aggregate, clauses: &[Clause], params: &mut Vec<SqlValue>) -> Result<String> {
    if clauses.is_empty() {
        return Ok("1".to_string());
    }
    let parts = clauses
        .iter()
        .map(|clause| clause_sql(agg, clause, params))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join(" AND "))
}

fn clause_sql(agg: &dyn Aggregate, clause: &Clause, params: &mut Vec<SqlValue>) -> Result<String> {
    match clause {
        Clause::Field { path, conditions } => {
            let field = agg
                .field(path)
                .ok_or_else(|| StoreError::InvalidQuery(format!("{} has no field {}", agg.table(), path)))?;
            let parts = conditions
                .iter()
                .map(|cond| condition_sql(&field, path, cond, params))
                .collect::<Result<Vec<_>>>()?;
            Ok(if parts.is_empty() { "1".to_string() } else { parts.join(" AND ") })
        }
        Clause::Or(branches) => combine(agg, branches, " OR ", "0", params),
        Clause::And(branches) => combine(agg, branches, " AND ", "1", params),
    }
}

fn combine(
    agg: &dyn Aggregate,
    branches: &[Vec<Clause>],
    joiner: &str,
    empty: &str,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    if branches.is_empty() {
        return Ok(empty.to_string());
    }
    let parts = branches
        .iter()
        .map(|b| conjunction(agg, b, params).map(|sql| format!("({})", sql)))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", parts.join(joiner)))
}

fn condition_sql(field: &Field, path: &str, cond: &Condition, params: &mut Vec<SqlValue>) -> Result<String> {
    match field {
        Field::Column(column) => column_condition(&format!("r.\"{}\"", column), cond, params),
        Field::Values(ValueTable { table, fk, column, .. }) => {
            if let Condition::Exists(present) = cond {
                // The array itself is always present on a loaded document
                return Ok(if *present { "1" } else { "0" }.to_string());
            }
            child_condition(table, fk, column, false, cond, params)
        }
        Field::Elements { table, fk, column } => {
            if let Condition::Exists(present) = cond {
                let any = format!("EXISTS (SELECT 1 FROM {} c WHERE c.{} = r.id)", table, fk);
                return Ok(if *present { any } else { format!("NOT {}", any) });
            }
            child_condition(table, fk, column, true, cond, params)
        }
        Field::Position { table, fk, index } => match cond {
            Condition::Exists(present) => {
                let count = format!("(SELECT COUNT(*) FROM {} c WHERE c.{} = r.id)", table, fk);
                Ok(if *present { format!("{} > {}", count, index) } else { format!("{} <= {}", count, index) })
            }
            _ => Err(StoreError::InvalidQuery(format!("only $exists is supported on {}", path))),
        },
    }
}

fn column_condition(column: &str, cond: &Condition, params: &mut Vec<SqlValue>) -> Result<String> {
    Ok(match cond {
        Condition::Eq(Value::Null) => format!("{} IS NULL", column),
        Condition::Eq(v) => {
            params.push(to_sql(v)?);
            format!("{} = ?{}", column, params.len())
        }
        Condition::Ne(Value::Null) => format!("{} IS NOT NULL", column),
        Condition::Ne(v) => {
            params.push(to_sql(v)?);
            format!("({} IS NULL OR {} <> ?{})", column, column, params.len())
        }
        Condition::In(list) => {
            let (list_sql, has_null) = value_list(list, params)?;
            match (list_sql, has_null) {
                (Some(l), true) => format!("({} IN ({}) OR {} IS NULL)", column, l, column),
                (Some(l), false) => format!("{} IN ({})", column, l),
                (None, true) => format!("{} IS NULL", column),
                (None, false) => "0".to_string(),
            }
        }
        Condition::Nin(list) => {
            let (list_sql, has_null) = value_list(list, params)?;
            match (list_sql, has_null) {
                (Some(l), true) => format!("({} IS NOT NULL AND {} NOT IN ({}))", column, column, l),
                (Some(l), false) => format!("({} IS NULL OR {} NOT IN ({}))", column, column, l),
                (None, true) => format!("{} IS NOT NULL", column),
                (None, false) => "1".to_string(),
            }
        }
        Condition::Exists(true) => format!("{} IS NOT NULL", column),
        Condition::Exists(false) => format!("{} IS NULL", column),
        Condition::Regex(pattern) => pattern_sql(column, pattern, params),
    })
}

/// A condition on the rows of a child table.
///
/// Equality with null follows the document semantics. A value array is
/// never null, even when empty. A member of embedded records is null when
/// no record carries a non-null value for it, which includes having no
/// records at all.
fn child_condition(
    table: &str,
    fk: &str,
    column: &str,
    elements: bool,
    cond: &Condition,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    let member = |predicate: &str| format!("EXISTS (SELECT 1 FROM {} c WHERE c.{} = r.id AND {})", table, fk, predicate);
    let target = format!("c.\"{}\"", column);
    let null = if elements { format!("NOT {}", member(&format!("{} IS NOT NULL", target))) } else { "0".to_string() };
    let not_null = if elements { member(&format!("{} IS NOT NULL", target)) } else { "1".to_string() };

    Ok(match cond {
        Condition::Eq(Value::Null) => null,
        Condition::Eq(v) => {
            params.push(to_sql(v)?);
            member(&format!("{} = ?{}", target, params.len()))
        }
        Condition::Ne(Value::Null) => not_null,
        Condition::Ne(v) => {
            params.push(to_sql(v)?);
            format!("NOT {}", member(&format!("{} = ?{}", target, params.len())))
        }
        Condition::In(list) => match value_list(list, params)? {
            (Some(l), true) if elements => format!("({} OR {})", member(&format!("{} IN ({})", target, l)), null),
            (Some(l), _) => member(&format!("{} IN ({})", target, l)),
            (None, true) => null,
            (None, false) => "0".to_string(),
        },
        Condition::Nin(list) => match value_list(list, params)? {
            (Some(l), true) if elements => format!("(NOT {} AND {})", member(&format!("{} IN ({})", target, l)), not_null),
            (Some(l), _) => format!("NOT {}", member(&format!("{} IN ({})", target, l))),
            (None, true) => not_null,
            (None, false) => "1".to_string(),
        },
        Condition::Regex(pattern) => member(&pattern_sql(&target, pattern, params)),
        Condition::Exists(_) => {
            return Err(StoreError::InvalidQuery(format!("$exists is not supported on {}.{}", table, column)));
        }
    })
}

/// Placeholders for the non-null members of `list`, plus whether a null
/// was present.
fn value_list(list: &[Value], params: &mut Vec<SqlValue>) -> Result<(Option<String>, bool)> {
    let mut slots = Vec::with_capacity(list.len());
    let mut has_null = false;
    for v in list {
        if v.is_null() {
            has_null = true;
            continue;
        }
        params.push(to_sql(v)?);
        slots.push(format!("?{}", params.len()));
    }
    Ok(((!slots.is_empty()).then(|| slots.join(", ")), has_null))
}

fn pattern_sql(column: &str, pattern: &Pattern, params: &mut Vec<SqlValue>) -> String {
    if pattern.case_insensitive {
        params.push(SqlValue::Text(pattern.to_like()));
        format!("{} LIKE ?{} ESCAPE '\\'", column, params.len())
    } else {
        params.push(SqlValue::Text(pattern.to_glob()));
        format!("{} GLOB ?{}", column, params.len())
    }
}

pub fn order_by(agg: &dyn Aggregate, sort: &Sort) -> Result<String> {
    if sort.is_empty() {
        return Ok("ORDER BY r.id".to_string());
    }
    let keys = sort
        .0
        .iter()
        .map(|(path, order)| match agg.field(path) {
            Some(Field::Column(column)) => Ok(format!(
                "r.\"{}\" {}",
                column,
                if *order == SortOrder::Ascending { "ASC" } else { "DESC" }
            )),
            _ => Err(StoreError::InvalidQuery(format!("cannot sort {} by {}", agg.table(), path))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("ORDER BY {}, r.id", keys.join(", ")))
}

/// `LIMIT ? OFFSET ?` with `-1` for no limit.
pub fn limit_offset(limit: Option<usize>, skip: Option<usize>) -> String {
    let limit = limit.map_or(-1, |l| l as i64);
    format!("LIMIT {} OFFSET {}", limit, skip.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::Filter;
    use crate::sqlite::channels::ChannelsTable;
    use serde_json::json;

    fn translate(filter: Value) -> SqlWhere {
        let clauses = Filter::from_json(filter).unwrap().clauses().unwrap();
        build_where(&ChannelsTable, &clauses).unwrap()
    }

    #[test]
    fn test_scalar_and_membership() {
        let w = translate(json!({"_id": "C1", "owners": "U1"}));
        assert_eq!(
            w.sql,
            "r.\"id\" = ?1 AND EXISTS (SELECT 1 FROM channel_owners c WHERE c.channel_id = r.id AND c.\"user_id\" = ?2)"
        );
        assert_eq!(w.params, vec![SqlValue::Text("C1".into()), SqlValue::Text("U1".into())]);
    }

    #[test]
    fn test_null_on_child_tables() {
        // tags is a value array: present even when empty
        assert_eq!(translate(json!({"tags": null})).sql, "0");
        assert_eq!(translate(json!({"tags": {"$ne": null}})).sql, "1");
        assert_eq!(translate(json!({"tags": {"$in": [null]}})).sql, "0");

        let w = translate(json!({"contents.youtube_id": null}));
        assert_eq!(
            w.sql,
            "NOT EXISTS (SELECT 1 FROM programs c WHERE c.channel_id = r.id AND c.\"youtube_id\" IS NOT NULL)"
        );
        let w = translate(json!({"contents.youtube_id": {"$in": ["y5", null]}}));
        assert!(w.sql.starts_with("(EXISTS"));
        assert!(w.sql.contains(" OR NOT EXISTS"));
        assert_eq!(w.params, vec![SqlValue::Text("y5".into())]);
    }

    #[test]
    fn test_nin_binds_each_element() {
        let w = translate(json!({"type": {"$nin": ["unclassified", "other"]}}));
        assert_eq!(w.sql, "(r.\"type\" IS NULL OR r.\"type\" NOT IN (?1, ?2))");
        assert_eq!(w.params.len(), 2);
    }

    #[test]
    fn test_regex_and_contents_position() {
        let w = translate(json!({"name": {"$regex": "news", "$options": "i"}, "contents.0": {"$exists": true}}));
        assert!(w.sql.contains("(SELECT COUNT(*) FROM programs c WHERE c.channel_id = r.id) > 0"));
        assert!(w.sql.contains("r.\"name\" LIKE ?1 ESCAPE '\\'"));
        assert_eq!(w.params, vec![SqlValue::Text("%news%".into())]);
    }

    #[test]
    fn test_or_of_permission_elements() {
        let w = translate(json!({"$or": [{"owners": "U1"}, {"permission.user_id": "U1", "permission.admin": true}]}));
        assert!(w.sql.starts_with("(("));
        assert!(w.sql.contains(" OR "));
        assert!(w.sql.contains("FROM channel_permissions c"));
        // Keys are visited in sorted order: owners, permission.admin, permission.user_id
        assert_eq!(w.params[1], SqlValue::Integer(1));
    }

    #[test]
    fn test_unknown_field_and_composite_rejected() {
        let clauses = Filter::new().eq("nope", 1).clauses().unwrap();
        assert!(build_where(&ChannelsTable, &clauses).is_err());

        let clauses = Filter::new().eq("name", json!(["a"])).clauses().unwrap();
        assert!(build_where(&ChannelsTable, &clauses).is_err());
    }

    #[test]
    fn test_order_by() {
        let sort = Sort::default().desc("last_modified");
        assert_eq!(order_by(&ChannelsTable, &sort).unwrap(), "ORDER BY r.\"last_modified\" DESC, r.id");
        assert!(order_by(&ChannelsTable, &Sort::default().asc("owners")).is_err());
        assert_eq!(limit_offset(None, Some(2)), "LIMIT -1 OFFSET 2");
    }
}
